//! Rebalancing configuration

use crate::error::{Result, RouteError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Rebalancing configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RebalanceConfig {
    /// Number of downstream partitions (P). Fixed for the lifetime of a planner.
    pub parallelism: u32,

    /// Affinity factor (alpha) used to derive the skew tolerance theta
    pub affinity_factor: f64,

    /// Virtual nodes per partition on the consistent hash ring
    pub virtual_nodes: usize,

    /// Maximum number of key moves applied in one migration batch
    pub migration_batch_size: usize,

    /// Abandon a metric-collection round that has not completed within this time
    pub round_timeout: Option<Duration>,

    /// Interval at which the driver applies migration batches
    pub drain_interval: Duration,
}

impl Default for RebalanceConfig {
    fn default() -> Self {
        Self {
            parallelism: 4,
            affinity_factor: 2.0,
            virtual_nodes: 150,
            migration_batch_size: 32,
            round_timeout: Some(Duration::from_secs(30)),
            drain_interval: Duration::from_millis(100),
        }
    }
}

impl RebalanceConfig {
    /// Create a configuration builder
    pub fn builder() -> RebalanceConfigBuilder {
        RebalanceConfigBuilder::new()
    }

    /// Skew tolerance: `theta = (alpha * P) / (alpha + P - 1) - 1`
    pub fn theta(&self) -> f64 {
        let p = f64::from(self.parallelism);
        let alpha = self.affinity_factor;
        (alpha * p) / (alpha + p - 1.0) - 1.0
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.parallelism == 0 {
            return Err(RouteError::InvalidConfig(
                "parallelism must be at least 1".to_string(),
            ));
        }
        // theta > 0 iff (alpha - 1)(P - 1) > 0, so alpha must exceed 1
        if !self.affinity_factor.is_finite() || self.affinity_factor <= 1.0 {
            return Err(RouteError::InvalidConfig(format!(
                "affinity factor must be a finite value > 1, got {}",
                self.affinity_factor
            )));
        }
        if self.virtual_nodes == 0 {
            return Err(RouteError::InvalidConfig(
                "virtual_nodes must be at least 1".to_string(),
            ));
        }
        if self.migration_batch_size == 0 {
            return Err(RouteError::InvalidConfig(
                "migration_batch_size must be at least 1".to_string(),
            ));
        }
        if self.round_timeout == Some(Duration::ZERO) {
            return Err(RouteError::InvalidConfig(
                "round_timeout must be positive (use none to disable)".to_string(),
            ));
        }
        if self.drain_interval.is_zero() {
            return Err(RouteError::InvalidConfig(
                "drain_interval must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Builder for rebalancing configuration
#[derive(Debug, Default)]
pub struct RebalanceConfigBuilder {
    parallelism: Option<u32>,
    affinity_factor: Option<f64>,
    virtual_nodes: Option<usize>,
    migration_batch_size: Option<usize>,
    round_timeout: Option<Option<Duration>>,
    drain_interval: Option<Duration>,
}

impl RebalanceConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parallelism(mut self, parallelism: u32) -> Self {
        self.parallelism = Some(parallelism);
        self
    }

    pub fn affinity_factor(mut self, alpha: f64) -> Self {
        self.affinity_factor = Some(alpha);
        self
    }

    pub fn virtual_nodes(mut self, count: usize) -> Self {
        self.virtual_nodes = Some(count);
        self
    }

    pub fn migration_batch_size(mut self, size: usize) -> Self {
        self.migration_batch_size = Some(size);
        self
    }

    pub fn round_timeout(mut self, timeout: Duration) -> Self {
        self.round_timeout = Some(Some(timeout));
        self
    }

    /// Never abandon a stalled round
    pub fn no_round_timeout(mut self) -> Self {
        self.round_timeout = Some(None);
        self
    }

    pub fn drain_interval(mut self, interval: Duration) -> Self {
        self.drain_interval = Some(interval);
        self
    }

    /// Build and validate the configuration
    pub fn build(self) -> Result<RebalanceConfig> {
        let defaults = RebalanceConfig::default();
        let config = RebalanceConfig {
            parallelism: self.parallelism.unwrap_or(defaults.parallelism),
            affinity_factor: self.affinity_factor.unwrap_or(defaults.affinity_factor),
            virtual_nodes: self.virtual_nodes.unwrap_or(defaults.virtual_nodes),
            migration_batch_size: self
                .migration_batch_size
                .unwrap_or(defaults.migration_batch_size),
            round_timeout: self.round_timeout.unwrap_or(defaults.round_timeout),
            drain_interval: self.drain_interval.unwrap_or(defaults.drain_interval),
        };
        config.validate()?;
        Ok(config)
    }
}

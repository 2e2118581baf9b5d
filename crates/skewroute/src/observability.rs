//! Metrics for the rebalancing planner and the routing table
//!
//! Thin static facades over the `metrics` crate with Prometheus export.
//! With the `metrics-prometheus` feature disabled every call compiles to
//! nothing.
//!
//! # Usage
//!
//! ```rust,ignore
//! use skewroute::observability::{init_metrics, RebalanceMetrics};
//!
//! init_metrics(Some("0.0.0.0:9090".parse()?))?;
//! RebalanceMetrics::increment_rounds_completed();
//! ```

use std::sync::OnceLock;
use std::time::Duration;

// ============================================================================
// Rebalance Metrics
// ============================================================================

/// Metric-collection and planning metrics
pub struct RebalanceMetrics;

impl RebalanceMetrics {
    // ---- Counters ----

    /// Instance reports accepted into a round
    pub fn increment_reports() {
        #[cfg(feature = "metrics-prometheus")]
        metrics::counter!("skewroute_reports_total").increment(1);
    }

    /// Reports rejected because the round was closed
    pub fn increment_reports_discarded() {
        #[cfg(feature = "metrics-prometheus")]
        metrics::counter!("skewroute_reports_discarded_total").increment(1);
    }

    /// Rounds that reached the barrier and were planned
    pub fn increment_rounds_completed() {
        #[cfg(feature = "metrics-prometheus")]
        metrics::counter!("skewroute_rounds_completed_total").increment(1);
    }

    /// Rounds abandoned by the round timeout
    pub fn increment_rounds_abandoned() {
        #[cfg(feature = "metrics-prometheus")]
        metrics::counter!("skewroute_rounds_abandoned_total").increment(1);
    }

    /// Planning passes discarded after an invariant violation
    pub fn increment_rounds_failed() {
        #[cfg(feature = "metrics-prometheus")]
        metrics::counter!("skewroute_rounds_failed_total").increment(1);
    }

    /// Migration steps emitted by planning
    pub fn add_migration_steps(count: u64) {
        #[cfg(feature = "metrics-prometheus")]
        metrics::counter!("skewroute_migration_steps_total").increment(count);
    }

    // ---- Gauges ----

    /// Number of keys in the current hot-key set
    pub fn set_hot_keys(count: usize) {
        #[cfg(feature = "metrics-prometheus")]
        metrics::gauge!("skewroute_hot_keys").set(count as f64);
    }

    /// Fraction of the round's load that was migrated (m / mCeil)
    pub fn set_migrated_load_ratio(ratio: f64) {
        #[cfg(feature = "metrics-prometheus")]
        metrics::gauge!("skewroute_migrated_load_ratio").set(ratio);
    }

    /// Max minus min of per-partition hot-key load after planning
    pub fn set_load_spread(spread: f64) {
        #[cfg(feature = "metrics-prometheus")]
        metrics::gauge!("skewroute_load_spread").set(spread);
    }

    /// Planner state (0 = idle, 1 = collecting, 2 = migrating)
    pub fn set_state(state: u8) {
        #[cfg(feature = "metrics-prometheus")]
        metrics::gauge!("skewroute_planner_state").set(f64::from(state));
    }

    // ---- Histograms ----

    /// Time spent in one planning pass
    pub fn record_planning_duration(duration: Duration) {
        #[cfg(feature = "metrics-prometheus")]
        metrics::histogram!("skewroute_planning_duration_seconds").record(duration.as_secs_f64());
    }

    /// Time from the first report of a round to the barrier
    pub fn record_round_duration(duration: Duration) {
        #[cfg(feature = "metrics-prometheus")]
        metrics::histogram!("skewroute_round_duration_seconds").record(duration.as_secs_f64());
    }
}

// ============================================================================
// Routing Metrics
// ============================================================================

/// Routing table metrics
pub struct RoutingMetrics;

impl RoutingMetrics {
    /// Migration batches merged into the override table
    pub fn increment_batches_applied() {
        #[cfg(feature = "metrics-prometheus")]
        metrics::counter!("skewroute_batches_applied_total").increment(1);
    }

    /// Keys rerouted by migration batches
    pub fn add_keys_moved(count: u64) {
        #[cfg(feature = "metrics-prometheus")]
        metrics::counter!("skewroute_keys_moved_total").increment(count);
    }

    /// Size of the override table
    pub fn set_override_count(count: usize) {
        #[cfg(feature = "metrics-prometheus")]
        metrics::gauge!("skewroute_override_count").set(count as f64);
    }

    /// Version of the live routing table
    pub fn set_table_version(version: u64) {
        #[cfg(feature = "metrics-prometheus")]
        metrics::gauge!("skewroute_routing_table_version").set(version as f64);
    }
}

// ============================================================================
// Prometheus Backend (when enabled)
// ============================================================================

#[cfg(feature = "metrics-prometheus")]
mod prom {
    use metrics_exporter_prometheus::PrometheusBuilder;
    use std::net::SocketAddr;

    /// Start an HTTP listener serving `/metrics`
    pub fn init_prometheus_exporter(
        addr: SocketAddr,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        PrometheusBuilder::new().with_http_listener(addr).install()?;

        tracing::info!("Prometheus metrics exporter listening on http://{}/metrics", addr);
        Ok(())
    }
}

#[cfg(feature = "metrics-prometheus")]
pub use prom::init_prometheus_exporter;

// ============================================================================
// Unified Initialization
// ============================================================================

static METRICS_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Initialize the metrics subsystem. Safe to call more than once.
pub fn init_metrics(
    prometheus_addr: Option<std::net::SocketAddr>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    METRICS_INITIALIZED.get_or_init(|| {
        #[cfg(feature = "metrics-prometheus")]
        if let Some(addr) = prometheus_addr {
            if let Err(e) = init_prometheus_exporter(addr) {
                tracing::error!("Failed to start Prometheus exporter: {}", e);
            }
        }
        #[cfg(not(feature = "metrics-prometheus"))]
        let _ = prometheus_addr;

        tracing::info!(
            prometheus = cfg!(feature = "metrics-prometheus"),
            "Metrics subsystem initialized"
        );
    });

    Ok(())
}

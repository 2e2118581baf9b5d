//! CLI argument parsing and the pipeline configuration file
//!
//! Settings come from an optional YAML file; command-line flags and
//! `SKEWROUTE_*` environment variables override individual fields.

use clap::Parser;
use serde::{Deserialize, Serialize};
use skewroute::RebalanceConfig;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Read from stdin / write to stdout
pub const STDIO: &str = "-";

/// Skewroute daemon - skew-aware key routing over a record stream
///
/// Reads one record per line, detects hot keys every detection epoch,
/// rebalances them across partitions and writes each record's partition.
#[derive(Parser, Debug)]
#[command(name = "skewrouted")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// YAML configuration file
    #[arg(short, long, env = "SKEWROUTE_CONFIG")]
    pub config: Option<PathBuf>,

    // ============ Routing ============
    /// Number of downstream partitions
    #[arg(short, long, env = "SKEWROUTE_PARALLELISM")]
    pub parallelism: Option<u32>,

    /// Affinity factor (alpha), must be greater than 1
    #[arg(long, env = "SKEWROUTE_AFFINITY_FACTOR")]
    pub affinity_factor: Option<f64>,

    /// Maximum key moves per migration batch
    #[arg(long, env = "SKEWROUTE_MIGRATION_BATCH_SIZE")]
    pub migration_batch_size: Option<usize>,

    /// Metric round timeout in milliseconds (0 disables it)
    #[arg(long, env = "SKEWROUTE_ROUND_TIMEOUT_MS")]
    pub round_timeout_ms: Option<u64>,

    // ============ Detection ============
    /// Records per detection epoch
    #[arg(short = 'w', long, env = "SKEWROUTE_METRIC_WINDOW_SIZE")]
    pub metric_window_size: Option<usize>,

    /// Fraction of an instance's epoch a key must reach to be reported hot
    #[arg(long, env = "SKEWROUTE_HOT_KEY_THRESHOLD")]
    pub hot_key_threshold: Option<f64>,

    /// Whitespace-separated field holding the record key
    #[arg(long, env = "SKEWROUTE_KEY_FIELD")]
    pub key_field: Option<usize>,

    // ============ I/O ============
    /// Input file, or "-" for stdin
    #[arg(short, long, env = "SKEWROUTE_INPUT")]
    pub input: Option<String>,

    /// Output file, or "-" for stdout
    #[arg(short, long, env = "SKEWROUTE_OUTPUT")]
    pub output: Option<String>,

    // ============ Observability ============
    /// Prometheus metrics listen address
    #[arg(long, env = "SKEWROUTE_METRICS_ADDR")]
    pub metrics_addr: Option<SocketAddr>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info", env = "RUST_LOG")]
    pub log_level: String,
}

impl Cli {
    /// Load the configuration file (if any) and apply flag overrides
    pub fn pipeline_config(&self) -> anyhow::Result<PipelineConfig> {
        let mut config = match &self.config {
            Some(path) => PipelineConfig::from_file(path)?,
            None => PipelineConfig::default(),
        };

        if let Some(parallelism) = self.parallelism {
            config.rebalance.parallelism = parallelism;
        }
        if let Some(alpha) = self.affinity_factor {
            config.rebalance.affinity_factor = alpha;
        }
        if let Some(size) = self.migration_batch_size {
            config.rebalance.migration_batch_size = size;
        }
        if let Some(ms) = self.round_timeout_ms {
            config.rebalance.round_timeout = (ms > 0).then(|| Duration::from_millis(ms));
        }
        if let Some(window) = self.metric_window_size {
            config.metric_window_size = window;
        }
        if let Some(threshold) = self.hot_key_threshold {
            config.hot_key_threshold = threshold;
        }
        if let Some(field) = self.key_field {
            config.key_field = field;
        }
        if let Some(input) = &self.input {
            config.input_source = input.clone();
        }
        if let Some(output) = &self.output {
            config.output_sink = output.clone();
        }
        if self.metrics_addr.is_some() {
            config.metrics_addr = self.metrics_addr;
        }

        config.validate()?;
        Ok(config)
    }
}

/// Pipeline configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Planner settings
    pub rebalance: RebalanceConfig,

    /// Records per detection epoch
    pub metric_window_size: usize,

    /// Input path, or "-" for stdin
    pub input_source: String,

    /// Output path, or "-" for stdout
    pub output_sink: String,

    /// Fraction of an instance's epoch a key must reach to be reported hot
    pub hot_key_threshold: f64,

    /// Whitespace-separated field holding the record key
    pub key_field: usize,

    /// Prometheus listener
    pub metrics_addr: Option<SocketAddr>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            rebalance: RebalanceConfig::default(),
            metric_window_size: 1000,
            input_source: STDIO.to_string(),
            output_sink: STDIO.to_string(),
            hot_key_threshold: 0.01,
            key_field: 0,
            metrics_addr: None,
        }
    }
}

impl PipelineConfig {
    /// Load and validate a YAML configuration file
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file {}: {}", path.display(), e))?;

        let config: Self = serde_yaml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Failed to parse config: {}", e))?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.rebalance.validate()?;

        if self.metric_window_size == 0 {
            anyhow::bail!("metric_window_size must be at least 1");
        }
        if !(self.hot_key_threshold > 0.0 && self.hot_key_threshold <= 1.0) {
            anyhow::bail!(
                "hot_key_threshold must be in (0, 1], got {}",
                self.hot_key_threshold
            );
        }
        if self.input_source.is_empty() || self.output_sink.is_empty() {
            anyhow::bail!("input_source and output_sink must not be empty (use \"-\" for stdio)");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("skewrouted").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_defaults() {
        let config = parse(&[]).pipeline_config().unwrap();
        assert_eq!(config, PipelineConfig::default());
        assert_eq!(config.input_source, "-");
        assert_eq!(config.metric_window_size, 1000);
    }

    #[test]
    fn test_flags_override_defaults() {
        let cli = parse(&[
            "--parallelism",
            "8",
            "--affinity-factor",
            "3.5",
            "-w",
            "500",
            "--round-timeout-ms",
            "0",
            "-i",
            "records.txt",
        ]);
        let config = cli.pipeline_config().unwrap();

        assert_eq!(config.rebalance.parallelism, 8);
        assert_eq!(config.rebalance.affinity_factor, 3.5);
        assert_eq!(config.rebalance.round_timeout, None);
        assert_eq!(config.metric_window_size, 500);
        assert_eq!(config.input_source, "records.txt");
    }

    #[test]
    fn test_yaml_file_with_override() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "rebalance:\n  parallelism: 6\n  affinity_factor: 1.5\nmetric_window_size: 200\nhot_key_threshold: 0.05\n"
        )
        .unwrap();

        let path = file.path().to_str().unwrap().to_string();
        let config = parse(&["--config", &path, "--parallelism", "3"])
            .pipeline_config()
            .unwrap();

        assert_eq!(config.rebalance.parallelism, 3);
        assert_eq!(config.rebalance.affinity_factor, 1.5);
        assert_eq!(config.rebalance.virtual_nodes, 150);
        assert_eq!(config.metric_window_size, 200);
        assert_eq!(config.hot_key_threshold, 0.05);
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(parse(&["--affinity-factor", "1.0"]).pipeline_config().is_err());
        assert!(parse(&["-w", "0"]).pipeline_config().is_err());
        assert!(parse(&["--hot-key-threshold", "0"]).pipeline_config().is_err());
        assert!(parse(&["--hot-key-threshold", "1.5"]).pipeline_config().is_err());
    }
}

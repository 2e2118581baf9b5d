//! Skewroute daemon (skewrouted)
//!
//! Runs hot-key detection over a line-oriented record stream and routes
//! every record through a [`skewroute::RebalancePlanner`].
//!
//! ## Quick Start
//!
//! ```bash
//! # Route stdin to stdout over 8 partitions
//! skewrouted --parallelism 8 < records.txt
//!
//! # With a config file and Prometheus metrics
//! skewrouted --config skewroute.yaml --metrics-addr 0.0.0.0:9090
//! ```

pub mod cli;
pub mod detector;
pub mod pipeline;

pub use cli::{Cli, PipelineConfig};
pub use detector::{CountingDetector, DetectorGroup, SkewnessDetector};
pub use pipeline::{open_input, open_output, Pipeline, PipelineStats};

//! # Skewroute
//!
//! Skew-aware key routing for parallel stream processing:
//! - **Consistent hashing**: default key to partition placement
//! - **Override table**: explicit routes for hot keys, swapped atomically
//! - **Rebalance planner**: greedy reassignment trading balance against migration
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────┐  report(instance, keys)  ┌──────────────────────────────┐
//! │   Detector    │─────────────────────────▶│       RebalancePlanner       │
//! │ (P instances) │  set_hot_key_set(loads)  │  barrier ─▶ compute_rebalance│
//! └───────────────┘                          │           ─▶ MigrationPlan   │
//!                                            └──────────────┬───────────────┘
//!                                                           │ advance()
//!                                                           ▼
//! ┌───────────────┐     partition(key)       ┌──────────────────────────────┐
//! │  Per-record   │─────────────────────────▶│      PartitionFunction       │
//! │  partitioner  │                          │   overrides ─▶ hash ring     │
//! └───────────────┘                          └──────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust,ignore
//! use skewroute::{RebalanceConfig, RebalanceDriver, RebalancePlanner};
//! use std::sync::Arc;
//!
//! let config = RebalanceConfig::builder()
//!     .parallelism(8)
//!     .affinity_factor(2.0)
//!     .build()?;
//! let planner = Arc::new(RebalancePlanner::<String>::new(config)?);
//! let driver = RebalanceDriver::spawn(planner.clone());
//!
//! // Per epoch
//! planner.set_hot_key_set(loads)?;
//! planner.report(instance, hot_candidates)?;
//!
//! // Per record
//! let partition = planner.partition(&key);
//! ```

pub mod collector;
pub mod config;
pub mod driver;
pub mod error;
pub mod migration;
pub mod observability;
pub mod partition;
pub mod planner;
pub mod ring;

// Re-export main types
pub use collector::MetricCollector;
pub use config::{RebalanceConfig, RebalanceConfigBuilder};
pub use driver::{DriverHandle, DriverStats, RebalanceDriver};
pub use error::{Result, RouteError};
pub use migration::{Assignment, MigrationBatch, MigrationPlan, MigrationStep};
pub use observability::{init_metrics, RebalanceMetrics, RoutingMetrics};
pub use partition::{PartitionFunction, RoutingTable};
pub use planner::{
    compute_rebalance, HotKeySet, PlannerState, RebalanceInput, RebalanceOutcome,
    RebalancePlanner, RoundSummary,
};
pub use ring::ConsistentHashRing;

/// Re-export common types
pub mod prelude {
    pub use crate::config::*;
    pub use crate::error::*;
    pub use crate::migration::{Assignment, MigrationPlan};
    pub use crate::partition::PartitionFunction;
    pub use crate::planner::{HotKeySet, PlannerState, RebalancePlanner};
}

//! Background control loop for a [`RebalancePlanner`]
//!
//! Every `drain_interval` the driver expires a stalled metric round and,
//! while a plan is in flight, applies one migration batch. Spacing batches
//! out gives workers time to hand over per-key state between route changes.

use crate::error::{Result, RouteError};
use crate::planner::{PlannerState, RebalancePlanner};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Handle to a running driver task
pub struct DriverHandle {
    shutdown_tx: broadcast::Sender<()>,
    task: JoinHandle<DriverStats>,
}

/// Work done by a driver over its lifetime
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DriverStats {
    pub ticks: u64,
    pub batches_applied: u64,
    pub rounds_expired: u64,
}

impl DriverHandle {
    /// Signal the driver to stop after its current tick
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Stop the driver and wait for it
    pub async fn stop(self) -> Result<DriverStats> {
        self.shutdown();
        self.join().await
    }

    /// Wait for the driver to exit
    ///
    /// A panicked or cancelled task surfaces as [`RouteError::DriverFailed`].
    pub async fn join(self) -> Result<DriverStats> {
        self.task
            .await
            .map_err(|e| RouteError::DriverFailed(e.to_string()))
    }
}

/// Drives plan draining and round expiry on a tokio runtime
pub struct RebalanceDriver;

impl RebalanceDriver {
    /// Spawn a driver ticking at the planner's configured drain interval
    pub fn spawn<K>(planner: Arc<RebalancePlanner<K>>) -> DriverHandle
    where
        K: Clone + Eq + Hash + Ord + Debug + Send + Sync + 'static,
    {
        let interval = planner.config().drain_interval;
        Self::spawn_with_interval(planner, interval)
    }

    /// Spawn a driver with an explicit tick interval
    pub fn spawn_with_interval<K>(planner: Arc<RebalancePlanner<K>>, interval: Duration) -> DriverHandle
    where
        K: Clone + Eq + Hash + Ord + Debug + Send + Sync + 'static,
    {
        let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut stats = DriverStats::default();

            info!(interval = ?interval, "Rebalance driver started");
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        break;
                    }
                    _ = ticker.tick() => {
                        stats.ticks += 1;
                        if planner.expire_stalled_round() {
                            stats.rounds_expired += 1;
                        }
                        if planner.state() == PlannerState::Migrating && planner.advance() {
                            stats.batches_applied += 1;
                            debug!(remaining = planner.pending_batches(), "Driver applied batch");
                        }
                    }
                }
            }
            info!(
                ticks = stats.ticks,
                batches = stats.batches_applied,
                expired = stats.rounds_expired,
                "Rebalance driver stopped"
            );
            stats
        });

        DriverHandle { shutdown_tx, task }
    }
}

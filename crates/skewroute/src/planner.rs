//! Rebalance planner - the single coordinator for hot-key routing
//!
//! The planner owns the metric-collection barrier, the previous hot-key set,
//! the in-flight migration plan and the [`PartitionFunction`] the stream
//! runtime routes records through. It moves through three states:
//!
//! ```text
//!            first report              P-th report + planning
//!   Idle ─────────────────▶ Collecting ───────────────────────▶ Migrating
//!    ▲                          │                                   │
//!    │     round timeout        │          last batch applied       │
//!    └──────────────────────────┴───────────────────────────────────┘
//! ```
//!
//! A round that yields no migration steps goes straight back to Idle.
//!
//! ## Algorithm
//!
//! Given the previous hot-key set `hk`, the new one `newhk` and the routing
//! table in force, one planning pass:
//!
//! 1. reverts cooled keys (in `hk`, not in `newhk`) to their ring default,
//!    emitting a step only when the default differs from where they are now
//! 2. places the new hot keys heaviest first, choosing for each the partition
//!    with the lowest `balance + migration` penalty
//!
//! The balance penalty is the spread (max - min) of per-partition hot load
//! after a tentative placement, divided by `theta` times the average load
//! per key placed so far. The migration penalty is the load moved this round
//! (including the candidate move) over the total load under consideration.

use crate::collector::MetricCollector;
use crate::config::RebalanceConfig;
use crate::error::{Result, RouteError};
use crate::migration::{Assignment, MigrationPlan, MigrationStep};
use crate::observability::RebalanceMetrics;
use crate::partition::{PartitionFunction, RoutingTable};
use crate::ring::ConsistentHashRing;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};
use std::fmt::{self, Debug};
use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Estimated load per hot key for one detection epoch
pub type HotKeySet<K> = HashMap<K, f64>;

/// Planner state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlannerState {
    /// Waiting for the first report of a round
    Idle,
    /// Reports are being aggregated
    CollectingMetrics,
    /// A migration plan is being drained
    Migrating,
}

impl PlannerState {
    fn gauge(self) -> u8 {
        match self {
            PlannerState::Idle => 0,
            PlannerState::CollectingMetrics => 1,
            PlannerState::Migrating => 2,
        }
    }
}

impl fmt::Display for PlannerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlannerState::Idle => write!(f, "idle"),
            PlannerState::CollectingMetrics => write!(f, "collecting_metrics"),
            PlannerState::Migrating => write!(f, "migrating"),
        }
    }
}

/// Inputs of one planning pass
pub struct RebalanceInput<'a, K> {
    /// Hot-key set of the previous round (`hk`)
    pub previous: &'a HotKeySet<K>,
    /// Hot-key set of this round (`newhk`)
    pub current: &'a HotKeySet<K>,
    /// Routing in force before this round
    pub routing: &'a RoutingTable<K>,
    /// Ring adopted at the end of this round
    pub ring: &'a ConsistentHashRing,
    /// Skew tolerance
    pub theta: f64,
}

/// Result of one planning pass
#[derive(Debug, Clone)]
pub struct RebalanceOutcome<K> {
    /// Moves, cooled keys first, then hot keys in placement order
    pub steps: Vec<MigrationStep<K>>,
    /// Partition of every key in the new hot-key set
    pub assignment: Assignment<K>,
    /// Hot-key load placed on each partition
    pub operator_load: Vec<f64>,
    /// Load moved this round (`m`)
    pub migrated_load: f64,
    /// Total load under consideration (`mCeil`)
    pub migration_ceiling: f64,
}

impl<K> RebalanceOutcome<K> {
    /// Max minus min of per-partition hot load
    pub fn load_spread(&self) -> f64 {
        spread(&self.operator_load).0
    }

    /// Fraction of the considered load that moved
    pub fn migrated_ratio(&self) -> f64 {
        if self.migration_ceiling > 0.0 {
            self.migrated_load / self.migration_ceiling
        } else {
            0.0
        }
    }
}

/// Returned to the caller that completed a round
#[derive(Debug, Clone)]
pub struct RoundSummary<K> {
    /// Planning epoch, starting at 1
    pub epoch: u64,
    pub outcome: RebalanceOutcome<K>,
    /// Number of migration batches queued
    pub batches: usize,
    pub planning_time: Duration,
}

/// (max - min, sum) of a load vector
fn spread(loads: &[f64]) -> (f64, f64) {
    let mut max = f64::MIN;
    let mut min = f64::MAX;
    let mut sum = 0.0;
    for &load in loads {
        max = max.max(load);
        min = min.min(load);
        sum += load;
    }
    if loads.is_empty() {
        (0.0, 0.0)
    } else {
        (max - min, sum)
    }
}

fn balance_penalty(operator_load: &mut [f64], load: f64, l: usize, placed: usize, theta: f64) -> f64 {
    if operator_load.len() <= 1 {
        return 0.0;
    }
    operator_load[l] += load;
    let (gap, sum) = spread(operator_load);
    operator_load[l] -= load;

    // No key placed yet: the average is the raw sum
    let avg = sum / placed.max(1) as f64;
    let denominator = theta * avg;
    if denominator > 0.0 {
        gap / denominator
    } else {
        0.0
    }
}

fn migration_penalty(migrated: f64, load: f64, l: u32, h: u32, ceiling: f64) -> f64 {
    if ceiling <= 0.0 {
        return 0.0;
    }
    let moved = if l != h { migrated + load } else { migrated };
    moved / ceiling
}

fn check_partition(partition: u32, parallelism: u32) -> Result<u32> {
    if partition < parallelism {
        Ok(partition)
    } else {
        Err(RouteError::InvalidPartitionIndex {
            partition,
            parallelism,
        })
    }
}

/// Run one planning pass
///
/// Pure: reads the previous routing and both hot-key sets, returns the moves
/// and the new hot-key assignment without touching any shared state.
///
/// On an exact utility tie a key stays on its current partition; among the
/// other partitions the lowest index wins.
pub fn compute_rebalance<K>(input: &RebalanceInput<'_, K>) -> Result<RebalanceOutcome<K>>
where
    K: Clone + Eq + Hash + Ord + Debug,
{
    let parallelism = input.ring.parallelism();
    let previous = input.previous;
    let current = input.current;

    // Cooled keys revert to the ring default. Overrides outside `hk` (left
    // by an aborted migration) are cooled too, so they move through a step.
    let cooled: BTreeSet<&K> = previous
        .keys()
        .chain(input.routing.overrides().keys())
        .filter(|k| !current.contains_key(*k))
        .collect();

    let mut steps = Vec::new();
    let mut migrated = 0.0;
    let mut ceiling: f64 = current.values().sum();

    for key in cooled {
        let load = previous.get(key).copied().unwrap_or(0.0);
        ceiling += load;

        let from = check_partition(input.routing.route(key), parallelism)?;
        let to = input.ring.partition(key);
        if from != to {
            migrated += load;
            steps.push(MigrationStep::new(key.clone(), from, to, load));
        }
    }

    // Heaviest first; key order breaks ties
    let mut hot: Vec<(&K, f64)> = current.iter().map(|(k, v)| (k, *v)).collect();
    hot.sort_by(|a, b| match b.1.total_cmp(&a.1) {
        Ordering::Equal => a.0.cmp(b.0),
        other => other,
    });

    let mut operator_load = vec![0.0; parallelism as usize];
    let mut assignment = HashMap::with_capacity(hot.len());

    for (key, load) in hot {
        let h = check_partition(input.routing.route(key), parallelism)?;
        let placed = assignment.len();

        // The current partition wins exact ties; otherwise the first minimum
        let mut j = h;
        let mut best = balance_penalty(&mut operator_load, load, h as usize, placed, input.theta)
            + migration_penalty(migrated, load, h, h, ceiling);
        for l in 0..parallelism {
            let utility = balance_penalty(&mut operator_load, load, l as usize, placed, input.theta)
                + migration_penalty(migrated, load, l, h, ceiling);
            if utility < best {
                j = l;
                best = utility;
            }
        }
        let j = check_partition(j, parallelism)?;

        if j != h {
            migrated += load;
            steps.push(MigrationStep::new(key.clone(), h, j, load));
        }
        assignment.insert(key.clone(), j);
        operator_load[j as usize] += load;
    }

    Ok(RebalanceOutcome {
        steps,
        assignment,
        operator_load,
        migrated_load: migrated,
        migration_ceiling: ceiling,
    })
}

/// Mutable planner state, guarded by a single lock
struct PlannerInner<K> {
    state: PlannerState,
    collector: MetricCollector<K>,
    /// Hot-key set of the last completed round
    hot_keys: HotKeySet<K>,
    /// Hot-key set submitted for the open round
    pending: Option<HotKeySet<K>>,
    plan: Option<MigrationPlan<K>>,
    epoch: u64,
}

impl<K> PlannerInner<K> {
    fn set_state(&mut self, state: PlannerState) {
        self.state = state;
        RebalanceMetrics::set_state(state.gauge());
    }
}

/// Coordinator deciding which partition owns each hot key
pub struct RebalancePlanner<K> {
    config: RebalanceConfig,
    theta: f64,
    routing: Arc<PartitionFunction<K>>,
    inner: Mutex<PlannerInner<K>>,
}

impl<K> RebalancePlanner<K>
where
    K: Clone + Eq + Hash + Ord + Debug + Send + Sync + 'static,
{
    /// Create a planner routing everything by the ring until the first round
    pub fn new(config: RebalanceConfig) -> Result<Self> {
        config.validate()?;

        let ring = Arc::new(ConsistentHashRing::from_config(&config));
        let routing = Arc::new(PartitionFunction::new(ring));
        let theta = config.theta();

        info!(
            parallelism = config.parallelism,
            affinity_factor = config.affinity_factor,
            theta,
            "Rebalance planner created"
        );

        Ok(Self {
            inner: Mutex::new(PlannerInner {
                state: PlannerState::Idle,
                collector: MetricCollector::new(config.parallelism),
                hot_keys: HashMap::new(),
                pending: None,
                plan: None,
                epoch: 0,
            }),
            config,
            theta,
            routing,
        })
    }

    /// Partition function the stream runtime routes records through
    pub fn partition_function(&self) -> Arc<PartitionFunction<K>> {
        self.routing.clone()
    }

    /// Route a key. Never takes the planner lock.
    #[inline]
    pub fn partition(&self, key: &K) -> u32 {
        self.routing.partition(key)
    }

    pub fn config(&self) -> &RebalanceConfig {
        &self.config
    }

    pub fn theta(&self) -> f64 {
        self.theta
    }

    pub fn state(&self) -> PlannerState {
        self.inner.lock().state
    }

    /// Whether a report submitted now would be accepted
    pub fn accepts_reports(&self) -> bool {
        let inner = self.inner.lock();
        inner.state != PlannerState::Migrating && !inner.collector.is_complete()
    }

    /// Completed planning rounds
    pub fn epoch(&self) -> u64 {
        self.inner.lock().epoch
    }

    /// Hot-key set of the last completed round
    pub fn hot_keys(&self) -> HotKeySet<K> {
        self.inner.lock().hot_keys.clone()
    }

    /// Batches of the in-flight plan not yet applied
    pub fn pending_batches(&self) -> usize {
        self.inner
            .lock()
            .plan
            .as_ref()
            .map(|p| p.remaining())
            .unwrap_or(0)
    }

    /// Submit the hot-key set for the open round
    ///
    /// Called once per epoch after detection completes, before the barrier
    /// triggers planning. A later submission in the same round replaces it.
    pub fn set_hot_key_set(&self, hot_keys: HotKeySet<K>) -> Result<()> {
        for (key, load) in &hot_keys {
            if !load.is_finite() || *load < 0.0 {
                return Err(RouteError::InvalidLoad {
                    key: format!("{:?}", key),
                    load: *load,
                });
            }
        }

        let mut inner = self.inner.lock();
        Self::admit(&inner)?;
        debug!(hot_keys = hot_keys.len(), "Hot-key set submitted");
        inner.pending = Some(hot_keys);
        Ok(())
    }

    /// Merge an instance's report; true for the caller that completes the round
    ///
    /// That caller is expected to call [`rebalance`](Self::rebalance) next.
    /// [`report`](Self::report) does both under one lock.
    pub fn add_metric<I>(&self, instance: usize, keys: I) -> Result<bool>
    where
        I: IntoIterator<Item = K>,
    {
        let mut inner = self.inner.lock();
        self.add_locked(&mut inner, instance, keys, Instant::now())
    }

    /// Plan the completed round
    pub fn rebalance(&self) -> Result<RoundSummary<K>> {
        let mut inner = self.inner.lock();
        self.rebalance_locked(&mut inner)
    }

    /// Merge a report and, if it completes the round, plan it synchronously
    pub fn report<I>(&self, instance: usize, keys: I) -> Result<Option<RoundSummary<K>>>
    where
        I: IntoIterator<Item = K>,
    {
        let mut inner = self.inner.lock();
        if self.add_locked(&mut inner, instance, keys, Instant::now())? {
            self.rebalance_locked(&mut inner).map(Some)
        } else {
            Ok(None)
        }
    }

    /// Apply the next migration batch; false when nothing remains
    pub fn advance(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.state != PlannerState::Migrating {
            return false;
        }

        let (applied, drained) = match inner.plan.as_mut() {
            Some(plan) => {
                let applied = self.routing.advance(plan);
                (applied, !plan.has_next())
            }
            None => (false, true),
        };

        if drained {
            inner.plan = None;
            inner.set_state(PlannerState::Idle);
            info!(epoch = inner.epoch, "Migration complete");
        }
        applied
    }

    /// Abandon the open round if it outlived the round timeout
    ///
    /// The previous assignment stays in force. Returns true if a round was
    /// abandoned.
    pub fn expire_stalled_round(&self) -> bool {
        let mut inner = self.inner.lock();
        self.expire_locked(&mut inner, Instant::now())
    }

    /// Drop the unapplied batches of the in-flight plan
    ///
    /// Batches already applied stay in force; keys whose moves were dropped
    /// keep their current route until a later round moves them with a step.
    /// Returns the number of batches dropped.
    pub fn abort_migration(&self) -> Result<usize> {
        let mut inner = self.inner.lock();
        let Some(plan) = inner.plan.take() else {
            return Err(RouteError::NoActivePlan);
        };
        let dropped = plan.remaining();
        inner.set_state(PlannerState::Idle);
        warn!(epoch = inner.epoch, dropped, "Migration aborted");
        Ok(dropped)
    }

    fn admit(inner: &PlannerInner<K>) -> Result<()> {
        if inner.state == PlannerState::Migrating || inner.collector.is_complete() {
            return Err(RouteError::IncompleteRound { state: inner.state });
        }
        Ok(())
    }

    fn add_locked<I>(
        &self,
        inner: &mut PlannerInner<K>,
        instance: usize,
        keys: I,
        now: Instant,
    ) -> Result<bool>
    where
        I: IntoIterator<Item = K>,
    {
        self.expire_locked(inner, now);

        if let Err(e) = Self::admit(inner) {
            warn!(instance, state = %inner.state, "Discarding report for closed round");
            RebalanceMetrics::increment_reports_discarded();
            return Err(e);
        }

        let complete = inner.collector.add_at(instance, keys, now)?;
        RebalanceMetrics::increment_reports();
        if inner.state == PlannerState::Idle {
            inner.set_state(PlannerState::CollectingMetrics);
            debug!(round = inner.collector.round(), "Metric collection started");
        }

        if complete {
            if let Some(elapsed) = inner.collector.elapsed(now) {
                RebalanceMetrics::record_round_duration(elapsed);
            }
            debug!(instance, "Metric barrier reached");
        }
        Ok(complete)
    }

    fn expire_locked(&self, inner: &mut PlannerInner<K>, now: Instant) -> bool {
        let Some(timeout) = self.config.round_timeout else {
            return false;
        };
        if inner.state != PlannerState::CollectingMetrics
            || !inner.collector.is_expired(timeout, now)
        {
            return false;
        }

        warn!(
            reported = inner.collector.reported(),
            required = inner.collector.required(),
            timeout = ?timeout,
            "Metric round timed out, keeping previous assignment"
        );
        inner.collector.reset();
        inner.pending = None;
        inner.set_state(PlannerState::Idle);
        RebalanceMetrics::increment_rounds_abandoned();
        true
    }

    fn rebalance_locked(&self, inner: &mut PlannerInner<K>) -> Result<RoundSummary<K>> {
        if inner.state != PlannerState::CollectingMetrics || !inner.collector.is_complete() {
            return Err(RouteError::RoundNotComplete {
                reported: inner.collector.reported(),
                required: inner.collector.required(),
            });
        }
        let started = Instant::now();

        let mut current = inner.pending.take().unwrap_or_default();
        let mut unestimated = 0usize;
        for key in inner.collector.reported_keys() {
            current.entry(key).or_insert_with(|| {
                unestimated += 1;
                0.0
            });
        }
        if unestimated > 0 {
            debug!(keys = unestimated, "Reported keys without load estimate, using zero load");
        }

        let ring = Arc::new(ConsistentHashRing::from_config(&self.config));
        let routing = self.routing.snapshot();
        let input = RebalanceInput {
            previous: &inner.hot_keys,
            current: &current,
            routing: routing.as_ref(),
            ring: ring.as_ref(),
            theta: self.theta,
        };

        let outcome = match compute_rebalance(&input) {
            Ok(outcome) => outcome,
            Err(e) => {
                debug_assert!(false, "planning invariant violated: {}", e);
                error!(error = %e, "Planning failed, keeping previous assignment");
                RebalanceMetrics::increment_rounds_failed();
                inner.collector.reset();
                inner.set_state(PlannerState::Idle);
                return Err(e);
            }
        };

        let mut plan = MigrationPlan::new(
            outcome.steps.clone(),
            outcome.assignment.clone(),
            self.config.migration_batch_size,
        );
        plan.prepare();
        let batches = plan.len();

        inner.epoch += 1;
        inner.hot_keys = current;
        inner.collector.reset();

        if plan.is_empty() {
            // Nothing moves; adopt the ring and compact overrides right away
            self.routing.install(ring, outcome.assignment.clone());
            inner.set_state(PlannerState::Idle);
        } else {
            self.routing.set_ring(ring);
            inner.plan = Some(plan);
            inner.set_state(PlannerState::Migrating);
        }

        let planning_time = started.elapsed();
        RebalanceMetrics::increment_rounds_completed();
        RebalanceMetrics::add_migration_steps(outcome.steps.len() as u64);
        RebalanceMetrics::set_hot_keys(inner.hot_keys.len());
        RebalanceMetrics::set_migrated_load_ratio(outcome.migrated_ratio());
        RebalanceMetrics::set_load_spread(outcome.load_spread());
        RebalanceMetrics::record_planning_duration(planning_time);

        info!(
            epoch = inner.epoch,
            hot_keys = inner.hot_keys.len(),
            steps = outcome.steps.len(),
            batches,
            migrated_ratio = outcome.migrated_ratio(),
            spread = outcome.load_spread(),
            "Rebalance planned"
        );

        Ok(RoundSummary {
            epoch: inner.epoch,
            outcome,
            batches,
            planning_time,
        })
    }
}

impl<K> Debug for RebalancePlanner<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RebalancePlanner")
            .field("parallelism", &self.config.parallelism)
            .field("theta", &self.theta)
            .field("state", &self.inner.lock().state)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(parallelism: u32) -> RebalanceConfig {
        RebalanceConfig::builder()
            .parallelism(parallelism)
            .affinity_factor(2.0)
            .virtual_nodes(50)
            .build()
            .unwrap()
    }

    fn hot(entries: &[(&str, f64)]) -> HotKeySet<String> {
        entries.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    /// Submit `hot_keys` and have every instance report them
    fn run_round(
        planner: &RebalancePlanner<String>,
        hot_keys: HotKeySet<String>,
    ) -> RoundSummary<String> {
        let keys: Vec<String> = hot_keys.keys().cloned().collect();
        planner.set_hot_key_set(hot_keys).unwrap();
        let parallelism = planner.config().parallelism as usize;
        let mut summary = None;
        for instance in 0..parallelism {
            let result = planner.report(instance, keys.clone()).unwrap();
            assert_eq!(result.is_some(), instance + 1 == parallelism);
            summary = result.or(summary);
        }
        summary.unwrap()
    }

    /// Route `keys` to `partition` through explicit overrides
    fn pin(planner: &RebalancePlanner<String>, keys: &[&str], partition: u32) {
        planner.partition_function().set_overrides(
            keys.iter()
                .map(|k| (k.to_string(), partition))
                .collect(),
        );
    }

    fn drain(planner: &RebalancePlanner<String>) -> usize {
        let mut applied = 0;
        while planner.advance() {
            applied += 1;
        }
        applied
    }

    #[test]
    fn test_greedy_balances_two_partitions() {
        let planner = RebalancePlanner::new(config(2)).unwrap();
        let summary = run_round(&planner, hot(&[("a", 10.0), ("b", 5.0), ("c", 5.0)]));
        let assignment = &summary.outcome.assignment;

        assert_ne!(assignment["a"], assignment["b"]);
        assert_eq!(assignment["b"], assignment["c"]);

        let mut loads = summary.outcome.operator_load.clone();
        loads.sort_by(f64::total_cmp);
        assert_eq!(loads, vec![10.0, 10.0]);
        assert_eq!(summary.outcome.load_spread(), 0.0);
    }

    #[test]
    fn test_state_machine_walk() {
        let planner = RebalancePlanner::new(config(2)).unwrap();
        assert_eq!(planner.state(), PlannerState::Idle);
        pin(&planner, &["a", "b", "c"], 0);

        planner.set_hot_key_set(hot(&[("a", 10.0), ("b", 5.0), ("c", 5.0)])).unwrap();
        assert!(!planner.add_metric(0, vec!["a".to_string()]).unwrap());
        assert_eq!(planner.state(), PlannerState::CollectingMetrics);

        assert!(planner.add_metric(1, vec!["b".to_string()]).unwrap());
        assert!(!planner.accepts_reports());

        let summary = planner.rebalance().unwrap();
        assert_eq!(summary.epoch, 1);

        // b and c leave partition 0 to balance a
        assert_eq!(summary.outcome.steps.len(), 2);
        assert_eq!(planner.state(), PlannerState::Migrating);
        assert_eq!(drain(&planner), summary.batches);
        assert_eq!(planner.state(), PlannerState::Idle);
        assert!(planner.accepts_reports());

        for (key, partition) in &summary.outcome.assignment {
            assert_eq!(planner.partition(key), *partition);
        }
    }

    #[test]
    fn test_rebalance_before_barrier_fails() {
        let planner: RebalancePlanner<String> = RebalancePlanner::new(config(3)).unwrap();
        planner.add_metric(0, vec![]).unwrap();

        assert_eq!(
            planner.rebalance().unwrap_err(),
            RouteError::RoundNotComplete {
                reported: 1,
                required: 3
            }
        );
    }

    #[test]
    fn test_report_after_barrier_is_rejected() {
        let planner: RebalancePlanner<String> = RebalancePlanner::new(config(1)).unwrap();
        assert!(planner.add_metric(0, vec!["a".to_string()]).unwrap());

        let err = planner.add_metric(0, vec!["b".to_string()]).unwrap_err();
        assert!(matches!(err, RouteError::IncompleteRound { .. }));
    }

    #[test]
    fn test_report_while_migrating_is_rejected() {
        let planner = RebalancePlanner::new(config(2)).unwrap();
        // All four keys start on partition 0, so balancing has to move some
        pin(&planner, &["w", "x", "y", "z"], 0);
        let summary = run_round(&planner, hot(&[("x", 10.0), ("y", 10.0), ("z", 10.0), ("w", 10.0)]));

        assert!(!summary.outcome.steps.is_empty());
        assert_eq!(planner.state(), PlannerState::Migrating);
        assert!(!planner.accepts_reports());

        let err = planner.report(0, vec!["x".to_string()]).unwrap_err();
        assert_eq!(
            err,
            RouteError::IncompleteRound {
                state: PlannerState::Migrating
            }
        );
        assert!(matches!(
            planner.set_hot_key_set(HashMap::new()),
            Err(RouteError::IncompleteRound { .. })
        ));
        // The rejected report did not open a round
        assert_eq!(planner.state(), PlannerState::Migrating);

        drain(&planner);
        assert!(planner.report(0, vec![]).is_ok());
        assert_eq!(planner.state(), PlannerState::CollectingMetrics);
    }

    #[test]
    fn test_invalid_load_rejected() {
        let planner: RebalancePlanner<String> = RebalancePlanner::new(config(2)).unwrap();
        for load in [-1.0, f64::NAN, f64::INFINITY] {
            let err = planner.set_hot_key_set(hot(&[("a", load)])).unwrap_err();
            assert!(matches!(err, RouteError::InvalidLoad { .. }));
        }
    }

    #[test]
    fn test_identical_round_moves_nothing() {
        let planner = RebalancePlanner::new(config(4)).unwrap();
        let keys = hot(&[
            ("a", 40.0),
            ("b", 25.0),
            ("c", 17.0),
            ("d", 11.0),
            ("e", 9.0),
            ("f", 3.0),
        ]);

        let first = run_round(&planner, keys.clone());
        drain(&planner);

        let second = run_round(&planner, keys);
        assert!(second.outcome.steps.is_empty());
        assert_eq!(second.outcome.assignment, first.outcome.assignment);
        assert_eq!(planner.state(), PlannerState::Idle);
    }

    #[test]
    fn test_cooled_key_reverts_to_ring_default() {
        let planner = RebalancePlanner::new(config(2)).unwrap();
        run_round(&planner, hot(&[("a", 10.0), ("b", 5.0), ("c", 5.0)]));
        drain(&planner);

        let ring = planner.partition_function().ring();
        let before: HashMap<String, u32> = ["a", "b", "c"]
            .iter()
            .map(|k| (k.to_string(), planner.partition(&k.to_string())))
            .collect();

        // Only "a" stays hot
        let summary = run_round(&planner, hot(&[("a", 10.0)]));
        for key in ["b", "c"] {
            let key = key.to_string();
            let moved = summary.outcome.steps.iter().find(|s| s.key == key);
            let default = ring.partition(&key);
            if before[&key] == default {
                assert!(moved.is_none(), "{} needlessly migrated", key);
            } else {
                let step = moved.unwrap();
                assert_eq!(step.from, before[&key]);
                assert_eq!(step.to, default);
            }
        }
        drain(&planner);

        for key in ["b", "c"] {
            let key = key.to_string();
            assert_eq!(planner.partition(&key), ring.partition(&key));
        }
        assert!(planner.hot_keys().contains_key("a"));
        assert_eq!(planner.hot_keys().len(), 1);
    }

    #[test]
    fn test_reported_keys_without_estimate_stay_put() {
        let planner: RebalancePlanner<String> = RebalancePlanner::new(config(3)).unwrap();
        let key = "unestimated".to_string();
        let before = planner.partition(&key);

        for instance in 0..3 {
            planner.report(instance, vec![key.clone()]).unwrap();
        }

        assert_eq!(planner.hot_keys().get(&key), Some(&0.0));
        assert_eq!(planner.partition(&key), before);
        assert_eq!(planner.state(), PlannerState::Idle);
    }

    #[test]
    fn test_stalled_round_expires() {
        let planner: RebalancePlanner<String> = RebalancePlanner::new(
            RebalanceConfig::builder()
                .parallelism(2)
                .round_timeout(Duration::from_secs(5))
                .build()
                .unwrap(),
        )
        .unwrap();

        let start = Instant::now();
        {
            let mut inner = planner.inner.lock();
            planner
                .add_locked(&mut inner, 0, vec!["a".to_string()], start)
                .unwrap();
            assert!(!planner.expire_locked(&mut inner, start + Duration::from_secs(1)));
            assert!(planner.expire_locked(&mut inner, start + Duration::from_secs(6)));
            assert_eq!(inner.state, PlannerState::Idle);
            assert!(inner.collector.is_empty());
        }

        // The next round starts from scratch
        assert!(!planner.add_metric(1, vec![]).unwrap());
        assert!(planner.add_metric(0, vec![]).unwrap());
    }

    #[test]
    fn test_abort_migration_keeps_applied_batches() {
        let planner = RebalancePlanner::new(
            RebalanceConfig::builder()
                .parallelism(4)
                .migration_batch_size(1)
                .virtual_nodes(50)
                .build()
                .unwrap(),
        )
        .unwrap();
        let keys: Vec<(String, f64)> = (0..12)
            .map(|i| (format!("k{}", i), f64::from(100 - i)))
            .collect();
        let names: Vec<&str> = keys.iter().map(|(k, _)| k.as_str()).collect();
        pin(&planner, &names, 0);
        let summary = run_round(&planner, keys.iter().cloned().collect());

        assert!(summary.batches >= 2);
        assert!(planner.advance());
        let dropped = planner.abort_migration().unwrap();
        assert_eq!(dropped, summary.batches - 1);
        assert_eq!(planner.state(), PlannerState::Idle);
        assert!(!planner.advance());
        assert_eq!(planner.abort_migration(), Err(RouteError::NoActivePlan));
    }

    #[test]
    fn test_stale_overrides_revert_through_steps() {
        let planner = RebalancePlanner::new(config(4)).unwrap();
        let ring = planner.partition_function().ring();

        // Overrides no hot-key set accounts for, as an aborted plan leaves them
        let stale: HashMap<String, u32> = (0..6)
            .map(|i| {
                let key = format!("stale-{}", i);
                let partition = (ring.partition(&key) + 1) % 4;
                (key, partition)
            })
            .collect();
        planner.partition_function().set_overrides(stale.clone());

        let summary = run_round(&planner, hot(&[("z", 1.0)]));
        for (key, from) in &stale {
            let step = summary
                .outcome
                .steps
                .iter()
                .find(|s| &s.key == key)
                .unwrap();
            assert_eq!(step.from, *from);
            assert_eq!(step.to, ring.partition(key));
        }

        drain(&planner);
        for key in stale.keys() {
            assert_eq!(planner.partition(key), ring.partition(key));
        }
        assert_eq!(planner.partition_function().override_count(), 1);
    }

    #[test]
    fn test_abort_then_next_round_moves_only_through_steps() {
        let planner = RebalancePlanner::new(
            RebalanceConfig::builder()
                .parallelism(4)
                .migration_batch_size(1)
                .virtual_nodes(50)
                .build()
                .unwrap(),
        )
        .unwrap();
        let ring = planner.partition_function().ring();
        let keys: Vec<String> = (0..12).map(|i| format!("k{}", i)).collect();

        // Every key sits one partition past its ring default, so cooling
        // them all down produces one revert step per key
        let off_default: HashMap<String, u32> = keys
            .iter()
            .map(|k| (k.clone(), (ring.partition(k) + 1) % 4))
            .collect();
        planner.partition_function().set_overrides(off_default);
        {
            let mut inner = planner.inner.lock();
            inner.hot_keys = keys.iter().map(|k| (k.clone(), 1.0)).collect();
        }

        let cooling = run_round(&planner, HashMap::new());
        assert_eq!(cooling.outcome.steps.len(), keys.len());
        assert!(planner.advance());
        planner.abort_migration().unwrap();

        let before: HashMap<String, u32> = keys
            .iter()
            .map(|k| (k.clone(), planner.partition(k)))
            .collect();
        let next = run_round(&planner, hot(&[("z", 1.0)]));
        drain(&planner);

        for key in &keys {
            let after = planner.partition(key);
            assert_eq!(after, ring.partition(key));
            if after != before[key] {
                let step = next.outcome.steps.iter().find(|s| &s.key == key);
                let step = step.unwrap_or_else(|| panic!("{} rerouted without a step", key));
                assert_eq!(step.from, before[key]);
                assert_eq!(step.to, after);
            }
        }
    }

    #[test]
    fn test_single_partition_never_migrates() {
        let planner = RebalancePlanner::new(config(1)).unwrap();
        let summary = run_round(&planner, hot(&[("a", 3.0), ("b", 2.0)]));
        assert!(summary.outcome.steps.is_empty());
        assert!(summary.outcome.assignment.values().all(|p| *p == 0));
    }

    #[test]
    fn test_compute_rebalance_zero_load_guards() {
        let ring = ConsistentHashRing::new(3, 20);
        let pf: PartitionFunction<String> = PartitionFunction::new(Arc::new(ConsistentHashRing::new(3, 20)));
        let routing = pf.snapshot();
        let previous = HashMap::new();
        let current = hot(&[("a", 0.0), ("b", 0.0)]);

        let outcome = compute_rebalance(&RebalanceInput {
            previous: &previous,
            current: &current,
            routing: routing.as_ref(),
            ring: &ring,
            theta: 0.5,
        })
        .unwrap();

        assert_eq!(outcome.migration_ceiling, 0.0);
        assert_eq!(outcome.migrated_ratio(), 0.0);
        assert!(outcome.steps.is_empty());
    }

    #[test]
    fn test_compute_rebalance_rejects_out_of_range_routing() {
        let ring = ConsistentHashRing::new(2, 20);
        let pf: PartitionFunction<String> = PartitionFunction::new(Arc::new(ConsistentHashRing::new(2, 20)));
        pf.set_overrides(HashMap::from([("a".to_string(), 5)]));
        let routing = pf.snapshot();
        let previous = HashMap::new();
        let current = hot(&[("a", 1.0)]);

        let err = compute_rebalance(&RebalanceInput {
            previous: &previous,
            current: &current,
            routing: routing.as_ref(),
            ring: &ring,
            theta: 0.5,
        })
        .unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_state_display() {
        assert_eq!(PlannerState::Idle.to_string(), "idle");
        assert_eq!(
            serde_json::to_string(&PlannerState::CollectingMetrics).unwrap(),
            "\"collecting_metrics\""
        );
    }
}

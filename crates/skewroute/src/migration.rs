//! Migration planning
//!
//! A rebalancing round produces a set of [`MigrationStep`]s and a target
//! assignment for the hot keys. [`MigrationPlan`] splits the steps into
//! batches that are applied to the routing table one at a time:
//!
//! - a key's move lives in exactly one batch, so a partially drained plan
//!   never routes a key to two different partitions
//! - inside one batch no partition is both a source and a destination, so
//!   a worker never hands off and receives state in the same window
//! - a batch holds at most `max_batch_size` moves
//!
//! Steps keep the order the planner emitted them in (cooled keys first,
//! then hot keys heaviest first).

use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::hash::Hash;
use tracing::{debug, warn};

/// Explicit key to partition mapping
pub type Assignment<K> = HashMap<K, u32>;

/// One directed reassignment of a key
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MigrationStep<K> {
    /// The key being moved
    pub key: K,
    /// Partition owning the key under the previous assignment
    pub from: u32,
    /// Partition owning the key under the new assignment
    pub to: u32,
    /// Load carried by the key
    pub load: f64,
}

impl<K> MigrationStep<K> {
    pub fn new(key: K, from: u32, to: u32, load: f64) -> Self {
        Self {
            key,
            from,
            to,
            load,
        }
    }
}

/// A group of independent key moves applied atomically
#[derive(Debug, Clone, PartialEq)]
pub struct MigrationBatch<K> {
    steps: Vec<MigrationStep<K>>,
    sources: HashSet<u32>,
    destinations: HashSet<u32>,
}

impl<K: Clone + Eq + Hash> MigrationBatch<K> {
    fn new() -> Self {
        Self {
            steps: Vec::new(),
            sources: HashSet::new(),
            destinations: HashSet::new(),
        }
    }

    /// Check whether a step can join this batch without mixing roles
    fn admits(&self, step: &MigrationStep<K>, max_batch_size: usize) -> bool {
        self.steps.len() < max_batch_size
            && !self.destinations.contains(&step.from)
            && !self.sources.contains(&step.to)
    }

    fn push(&mut self, step: MigrationStep<K>) {
        self.sources.insert(step.from);
        self.destinations.insert(step.to);
        self.steps.push(step);
    }

    /// Moves in this batch
    pub fn steps(&self) -> &[MigrationStep<K>] {
        &self.steps
    }

    /// Total load moved by this batch
    pub fn load(&self) -> f64 {
        self.steps.iter().map(|s| s.load).sum()
    }

    /// The partial assignment this batch installs
    pub fn assignment(&self) -> Assignment<K> {
        self.steps
            .iter()
            .map(|s| (s.key.clone(), s.to))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// Ordered, restartable sequence of migration batches
#[derive(Debug, Clone)]
pub struct MigrationPlan<K> {
    steps: Vec<MigrationStep<K>>,
    target: Assignment<K>,
    max_batch_size: usize,
    batches: Vec<MigrationBatch<K>>,
    cursor: usize,
    prepared: bool,
}

impl<K> MigrationPlan<K>
where
    K: Clone + Eq + Hash + Debug,
{
    /// Create an unprepared plan
    pub fn new(steps: Vec<MigrationStep<K>>, target: Assignment<K>, max_batch_size: usize) -> Self {
        Self {
            steps,
            target,
            max_batch_size: max_batch_size.max(1),
            batches: Vec::new(),
            cursor: 0,
            prepared: false,
        }
    }

    /// Partition the steps into batches. Calling it again is a no-op.
    pub fn prepare(&mut self) {
        if self.prepared {
            return;
        }

        // A key may only be moved once per plan; keep its last step
        let mut last_index: HashMap<&K, usize> = HashMap::with_capacity(self.steps.len());
        for (i, step) in self.steps.iter().enumerate() {
            if let Some(prev) = last_index.insert(&step.key, i) {
                warn!(key = ?step.key, dropped = prev, "Duplicate migration step, keeping the last");
            }
        }
        let keep: HashSet<usize> = last_index.into_values().collect();

        let mut batches: Vec<MigrationBatch<K>> = Vec::new();
        let mut current = MigrationBatch::new();
        for (i, step) in self.steps.iter().enumerate() {
            if !keep.contains(&i) {
                continue;
            }
            if !current.admits(step, self.max_batch_size) {
                batches.push(std::mem::replace(&mut current, MigrationBatch::new()));
            }
            current.push(step.clone());
        }
        if !current.is_empty() {
            batches.push(current);
        }

        debug!(
            steps = keep.len(),
            batches = batches.len(),
            max_batch_size = self.max_batch_size,
            "Prepared migration plan"
        );

        self.batches = batches;
        self.cursor = 0;
        self.prepared = true;
    }

    /// Check if another batch is waiting to be applied
    pub fn has_next(&self) -> bool {
        if self.prepared {
            self.cursor < self.batches.len()
        } else {
            !self.steps.is_empty()
        }
    }

    /// Take the next batch as a partial assignment
    pub fn next_batch(&mut self) -> Option<Assignment<K>> {
        self.prepare();
        let batch = self.batches.get(self.cursor)?;
        self.cursor += 1;
        Some(batch.assignment())
    }

    /// Restart iteration from the first batch
    pub fn rewind(&mut self) {
        self.cursor = 0;
    }

    /// Prepared batches (empty until [`prepare`](Self::prepare) runs)
    pub fn batches(&self) -> &[MigrationBatch<K>] {
        &self.batches
    }

    /// Batches not yet handed out
    pub fn remaining(&self) -> usize {
        if self.prepared {
            self.batches.len() - self.cursor
        } else if self.steps.is_empty() {
            0
        } else {
            // Not yet split; report an upper bound of one step per batch
            self.steps.len()
        }
    }

    /// All moves in the plan, in emission order
    pub fn steps(&self) -> &[MigrationStep<K>] {
        &self.steps
    }

    /// The full hot-key assignment this plan converges to
    pub fn target(&self) -> &Assignment<K> {
        &self.target
    }

    /// Sum of the load moved by the plan
    pub fn migrated_load(&self) -> f64 {
        self.steps.iter().map(|s| s.load).sum()
    }

    /// Number of prepared batches
    pub fn len(&self) -> usize {
        self.batches.len()
    }

    /// True when the plan moves nothing
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

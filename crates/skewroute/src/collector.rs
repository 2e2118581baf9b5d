//! Metric-collection barrier
//!
//! Each of the P reporting instances delivers its hot-key candidates once
//! per round. The collector merges them into per-instance accumulators and
//! counts *distinct* reporters, so the barrier completes exactly once, on
//! the report that brings the count from P-1 to P. A repeated report from
//! the same instance merges its keys but does not move the barrier.
//!
//! The collector is not synchronized; its owner serializes access.

use crate::error::{Result, RouteError};
use std::collections::{BTreeSet, HashSet};
use std::hash::Hash;
use std::time::{Duration, Instant};

/// Per-instance key accumulators and the round counter
#[derive(Debug)]
pub struct MetricCollector<K> {
    parallelism: u32,
    reports: Vec<HashSet<K>>,
    reported: Vec<bool>,
    count: usize,
    round: u64,
    opened_at: Option<Instant>,
}

impl<K: Eq + Hash + Clone + Ord> MetricCollector<K> {
    pub fn new(parallelism: u32) -> Self {
        let slots = parallelism as usize;
        Self {
            parallelism,
            reports: (0..slots).map(|_| HashSet::new()).collect(),
            reported: vec![false; slots],
            count: 0,
            round: 0,
            opened_at: None,
        }
    }

    /// Merge a report; true iff this report completed the round
    pub fn add<I>(&mut self, instance: usize, keys: I) -> Result<bool>
    where
        I: IntoIterator<Item = K>,
    {
        self.add_at(instance, keys, Instant::now())
    }

    pub(crate) fn add_at<I>(&mut self, instance: usize, keys: I, now: Instant) -> Result<bool>
    where
        I: IntoIterator<Item = K>,
    {
        if instance >= self.reports.len() {
            return Err(RouteError::InvalidInstance {
                index: instance,
                parallelism: self.parallelism,
            });
        }

        if self.opened_at.is_none() {
            self.opened_at = Some(now);
        }
        self.reports[instance].extend(keys);

        if self.reported[instance] {
            return Ok(false);
        }
        self.reported[instance] = true;
        self.count += 1;
        Ok(self.count == self.reports.len())
    }

    /// Every instance has reported this round
    pub fn is_complete(&self) -> bool {
        self.count == self.reports.len()
    }

    /// No instance has reported yet
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Number of distinct instances that reported this round
    pub fn reported(&self) -> usize {
        self.count
    }

    /// Number of instances the barrier waits for
    pub fn required(&self) -> usize {
        self.reports.len()
    }

    /// Whether a given instance has reported this round
    pub fn has_reported(&self, instance: usize) -> bool {
        self.reported.get(instance).copied().unwrap_or(false)
    }

    /// Keys reported by one instance
    pub fn instance_keys(&self, instance: usize) -> Option<&HashSet<K>> {
        self.reports.get(instance)
    }

    /// Union of all reported keys, in key order
    pub fn reported_keys(&self) -> BTreeSet<K> {
        self.reports
            .iter()
            .flat_map(|keys| keys.iter().cloned())
            .collect()
    }

    /// Rounds closed so far
    pub fn round(&self) -> u64 {
        self.round
    }

    /// Time since the first report of the open round
    pub fn elapsed(&self, now: Instant) -> Option<Duration> {
        self.opened_at.map(|t| now.saturating_duration_since(t))
    }

    /// The open round has been waiting longer than `timeout`
    pub fn is_expired(&self, timeout: Duration, now: Instant) -> bool {
        self.elapsed(now).is_some_and(|elapsed| elapsed >= timeout)
    }

    /// Clear accumulators; the next round starts at zero reports
    pub fn reset(&mut self) {
        for keys in &mut self.reports {
            keys.clear();
        }
        self.reported.iter_mut().for_each(|r| *r = false);
        self.count = 0;
        self.opened_at = None;
        self.round += 1;
    }
}

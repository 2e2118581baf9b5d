//! Frequency-counting skewness detector
//!
//! Stands in for the detector running in front of the partitioner. Each
//! parallel instance counts the keys it sees during a detection epoch and,
//! when the epoch closes, reports every key whose share of the instance's
//! records reaches the hot-key threshold. The count doubles as the load
//! estimate handed to the planner.

use skewroute::HotKeySet;
use std::collections::HashMap;
use std::hash::Hash;

/// Per-epoch hot-key detection
pub trait SkewnessDetector<K> {
    /// Account one record
    fn observe(&mut self, key: &K);

    /// Close the epoch: hot keys with their load, then start counting afresh
    fn end_epoch(&mut self) -> HotKeySet<K>;
}

/// Counts key frequencies within one epoch
#[derive(Debug, Clone)]
pub struct CountingDetector<K> {
    counts: HashMap<K, u64>,
    records: u64,
    threshold: f64,
}

impl<K: Clone + Eq + Hash> CountingDetector<K> {
    pub fn new(threshold: f64) -> Self {
        Self {
            counts: HashMap::new(),
            records: 0,
            threshold,
        }
    }

    /// Records observed in the open epoch
    pub fn records(&self) -> u64 {
        self.records
    }

    /// Minimum count for a key to be reported
    fn cutoff(&self) -> u64 {
        ((self.records as f64 * self.threshold).ceil() as u64).max(1)
    }
}

impl<K: Clone + Eq + Hash> SkewnessDetector<K> for CountingDetector<K> {
    fn observe(&mut self, key: &K) {
        self.records += 1;
        match self.counts.get_mut(key) {
            Some(count) => *count += 1,
            None => {
                self.counts.insert(key.clone(), 1);
            }
        }
    }

    fn end_epoch(&mut self) -> HotKeySet<K> {
        let cutoff = self.cutoff();
        let hot = self
            .counts
            .drain()
            .filter(|(_, count)| *count >= cutoff)
            .map(|(key, count)| (key, count as f64))
            .collect();
        self.records = 0;
        hot
    }
}

/// P detector instances fed round-robin, as the upstream operator's
/// parallel subtasks would be
#[derive(Debug)]
pub struct DetectorGroup<K, D = CountingDetector<K>> {
    instances: Vec<D>,
    next: usize,
    _key: std::marker::PhantomData<K>,
}

impl<K: Clone + Eq + Hash> DetectorGroup<K> {
    /// Counting detectors, one per partition
    pub fn counting(parallelism: u32, threshold: f64) -> Self {
        Self::new((0..parallelism).map(|_| CountingDetector::new(threshold)).collect())
    }
}

impl<K, D> DetectorGroup<K, D>
where
    K: Clone + Eq + Hash,
    D: SkewnessDetector<K>,
{
    pub fn new(instances: Vec<D>) -> Self {
        Self {
            instances,
            next: 0,
            _key: std::marker::PhantomData,
        }
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Hand a record to the next instance
    pub fn observe(&mut self, key: &K) {
        if self.instances.is_empty() {
            return;
        }
        self.instances[self.next].observe(key);
        self.next = (self.next + 1) % self.instances.len();
    }

    /// Close the epoch on every instance
    ///
    /// Returns each instance's report and the merged load estimate, summed
    /// over the instances that reported a key.
    pub fn end_epoch(&mut self) -> (Vec<HotKeySet<K>>, HotKeySet<K>) {
        let reports: Vec<HotKeySet<K>> = self.instances.iter_mut().map(|d| d.end_epoch()).collect();

        let mut merged: HotKeySet<K> = HashMap::new();
        for report in &reports {
            for (key, load) in report {
                *merged.entry(key.clone()).or_insert(0.0) += load;
            }
        }
        self.next = 0;
        (reports, merged)
    }
}

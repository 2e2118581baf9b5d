//! Per-record partition function
//!
//! The routing table is an immutable snapshot (ring + override table) held
//! behind `RwLock<Arc<..>>`. Lookups hold the read guard only for the hash
//! map lookup; writers build the next snapshot off to the side and swap the
//! pointer, so a reader sees either the old table or the new one in full.

use crate::migration::{Assignment, MigrationPlan};
use crate::observability::RoutingMetrics;
use crate::ring::ConsistentHashRing;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;
use tracing::{debug, trace};

/// Immutable routing snapshot
#[derive(Debug)]
pub struct RoutingTable<K> {
    ring: Arc<ConsistentHashRing>,
    overrides: Assignment<K>,
    version: u64,
}

impl<K: Eq + Hash> RoutingTable<K> {
    /// Route a key: explicit override first, ring default otherwise
    #[inline]
    pub fn route(&self, key: &K) -> u32 {
        match self.overrides.get(key) {
            Some(partition) => *partition,
            None => self.ring.partition(key),
        }
    }

    /// Explicit override for a key, if any
    pub fn override_for(&self, key: &K) -> Option<u32> {
        self.overrides.get(key).copied()
    }

    pub fn ring(&self) -> &Arc<ConsistentHashRing> {
        &self.ring
    }

    pub fn overrides(&self) -> &Assignment<K> {
        &self.overrides
    }

    /// Monotonic version, bumped on every swap
    pub fn version(&self) -> u64 {
        self.version
    }
}

/// Key to partition function consulted for every record
pub struct PartitionFunction<K> {
    table: RwLock<Arc<RoutingTable<K>>>,
    /// Serializes writers; never taken on the lookup path
    write_lock: Mutex<()>,
}

impl<K> PartitionFunction<K>
where
    K: Clone + Eq + Hash + Debug,
{
    /// Create a partition function with no overrides
    pub fn new(ring: Arc<ConsistentHashRing>) -> Self {
        Self {
            table: RwLock::new(Arc::new(RoutingTable {
                ring,
                overrides: HashMap::new(),
                version: 0,
            })),
            write_lock: Mutex::new(()),
        }
    }

    /// Partition for a key
    #[inline]
    pub fn partition(&self, key: &K) -> u32 {
        self.table.read().route(key)
    }

    /// Current routing snapshot
    pub fn snapshot(&self) -> Arc<RoutingTable<K>> {
        self.table.read().clone()
    }

    /// Current ring
    pub fn ring(&self) -> Arc<ConsistentHashRing> {
        self.table.read().ring.clone()
    }

    /// Number of partitions routed to
    pub fn parallelism(&self) -> u32 {
        self.table.read().ring.parallelism()
    }

    /// Version of the current snapshot
    pub fn version(&self) -> u64 {
        self.table.read().version
    }

    /// Number of explicit overrides
    pub fn override_count(&self) -> usize {
        self.table.read().overrides.len()
    }

    /// Replace the override table wholesale
    pub fn set_overrides(&self, overrides: Assignment<K>) {
        let _guard = self.write_lock.lock();
        let ring = self.table.read().ring.clone();
        self.swap(ring, overrides);
    }

    /// Replace ring and override table together
    pub fn install(&self, ring: Arc<ConsistentHashRing>, overrides: Assignment<K>) {
        let _guard = self.write_lock.lock();
        self.swap(ring, overrides);
    }

    /// Replace the ring, keeping the override table
    pub fn set_ring(&self, ring: Arc<ConsistentHashRing>) {
        let _guard = self.write_lock.lock();
        let overrides = self.table.read().overrides.clone();
        self.swap(ring, overrides);
    }

    /// Merge a partial assignment into the override table in one swap
    pub fn apply_batch(&self, batch: &Assignment<K>) {
        if batch.is_empty() {
            return;
        }
        let _guard = self.write_lock.lock();
        let current = self.snapshot();
        let mut overrides = current.overrides.clone();
        for (key, partition) in batch {
            overrides.insert(key.clone(), *partition);
        }
        self.swap(current.ring.clone(), overrides);
        RoutingMetrics::increment_batches_applied();
        RoutingMetrics::add_keys_moved(batch.len() as u64);
    }

    /// Apply the next batch of a plan
    ///
    /// Returns false once the plan has no batches left. When the last batch
    /// goes in, the override table is compacted to the plan's target, which
    /// drops overrides of cooled keys without changing where they route.
    pub fn advance(&self, plan: &mut MigrationPlan<K>) -> bool {
        let Some(batch) = plan.next_batch() else {
            return false;
        };
        self.apply_batch(&batch);
        trace!(keys = batch.len(), remaining = plan.remaining(), "Applied migration batch");

        if !plan.has_next() {
            self.set_overrides(plan.target().clone());
            debug!(
                overrides = plan.target().len(),
                "Migration plan drained, override table compacted"
            );
        }
        true
    }

    fn swap(&self, ring: Arc<ConsistentHashRing>, overrides: Assignment<K>) {
        let mut table = self.table.write();
        let next = RoutingTable {
            ring,
            overrides,
            version: table.version + 1,
        };
        RoutingMetrics::set_override_count(next.overrides.len());
        RoutingMetrics::set_table_version(next.version);
        *table = Arc::new(next);
    }
}

impl<K> Debug for PartitionFunction<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let table = self.table.read();
        f.debug_struct("PartitionFunction")
            .field("version", &table.version)
            .field("overrides", &table.overrides.len())
            .field("ring", &table.ring)
            .finish()
    }
}

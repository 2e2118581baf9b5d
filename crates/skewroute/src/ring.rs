//! Consistent hash ring used as the default key placement
//!
//! Every partition is inserted as `virtual_nodes` points on the ring so that
//! keys spread evenly and rebuilding the ring for a different parallelism
//! only moves about 1/P of the keys. The ring never changes after it is
//! built; a parallelism change means building a new one.

use crate::config::RebalanceConfig;
use hashring::HashRing;
use std::fmt;
use std::hash::Hash;

/// A virtual node: one of the ring points owned by a partition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct VirtualNode {
    partition: u32,
    replica: u32,
}

/// Immutable consistent hash ring mapping keys to partitions in `0..parallelism`
pub struct ConsistentHashRing {
    ring: HashRing<VirtualNode>,
    parallelism: u32,
    virtual_nodes: usize,
}

impl ConsistentHashRing {
    /// Build a ring with `virtual_nodes` points for each of `parallelism` partitions
    ///
    /// # Panics
    ///
    /// Panics if `parallelism` or `virtual_nodes` is zero.
    pub fn new(parallelism: u32, virtual_nodes: usize) -> Self {
        assert!(parallelism > 0, "ring must have at least one partition");
        assert!(virtual_nodes > 0, "ring must have at least one virtual node");

        let mut ring = HashRing::new();
        let replicas = virtual_nodes as u32;
        let nodes: Vec<_> = (0..parallelism)
            .flat_map(|partition| {
                (0..replicas).map(move |replica| VirtualNode { partition, replica })
            })
            .collect();
        ring.batch_add(nodes);

        Self {
            ring,
            parallelism,
            virtual_nodes,
        }
    }

    /// Build a ring from a validated configuration
    pub fn from_config(config: &RebalanceConfig) -> Self {
        Self::new(config.parallelism, config.virtual_nodes)
    }

    /// Default partition for a key
    #[inline]
    pub fn partition<K: Hash>(&self, key: &K) -> u32 {
        if self.parallelism == 1 {
            return 0;
        }
        // The ring is never empty, so a miss cannot happen
        self.ring
            .get(key)
            .map(|vnode| vnode.partition)
            .unwrap_or(0)
    }

    /// Number of partitions
    pub fn parallelism(&self) -> u32 {
        self.parallelism
    }

    /// Virtual nodes per partition
    pub fn virtual_nodes(&self) -> usize {
        self.virtual_nodes
    }

    /// Total number of points on the ring
    pub fn point_count(&self) -> usize {
        self.ring.len()
    }
}

impl fmt::Debug for ConsistentHashRing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsistentHashRing")
            .field("parallelism", &self.parallelism)
            .field("virtual_nodes", &self.virtual_nodes)
            .finish()
    }
}

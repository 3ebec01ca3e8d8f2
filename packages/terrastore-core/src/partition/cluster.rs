//! `ClusterPartitioner`: intra-cluster routing via a fixed-size slot ring (§4.2).

use std::collections::HashMap;
use std::sync::RwLock;

use crate::error::RouteError;
use crate::hash;
use crate::types::ClusterPartitionerConfig;

/// One cluster's routing state: its sorted member set and the slot ring
/// rebuilt from it.
#[derive(Debug, Clone, Default)]
struct Ring {
    /// Sorted by node name -- the canonical order the ring is built from.
    members: Vec<String>,
    /// Length `max_partitions`; `slots[i]` is the member owning slot `i`.
    slots: Vec<String>,
}

impl Ring {
    fn rebuild(&mut self, max_partitions: u32) {
        self.members.sort_unstable();
        if self.members.is_empty() {
            self.slots.clear();
            return;
        }
        self.slots = (0..max_partitions)
            .map(|i| {
                let idx = (i as usize) % self.members.len();
                self.members[idx].clone()
            })
            .collect();
    }
}

/// Maps `(cluster, bucket)` and `(cluster, bucket, key)` to one node of
/// `cluster`, using a fixed-size ring of slots (default 1024).
///
/// Writes (`add_node`/`remove_node`) rebuild the affected cluster's ring
/// under an exclusive lock; lookups take a shared lock over immutable ring
/// state, so concurrent reads never block each other.
pub struct ClusterPartitioner {
    config: ClusterPartitionerConfig,
    rings: RwLock<HashMap<String, Ring>>,
}

impl ClusterPartitioner {
    #[must_use]
    pub fn new(config: ClusterPartitionerConfig) -> Self {
        Self { config, rings: RwLock::new(HashMap::new()) }
    }

    /// Registers a cluster with an empty ring, if not already known.
    /// Idempotent. Called when the Router learns about a new cluster.
    pub fn register_cluster(&self, cluster: &str) {
        let mut rings = self.rings.write().unwrap_or_else(|e| e.into_inner());
        rings.entry(cluster.to_string()).or_default();
    }

    /// Adds a node to `cluster`'s member set and rebuilds its ring.
    ///
    /// # Errors
    /// [`RouteError::MissingRoute`] if `cluster` was never registered.
    pub fn add_node(&self, cluster: &str, node: impl Into<String>) -> Result<(), RouteError> {
        let mut rings = self.rings.write().unwrap_or_else(|e| e.into_inner());
        let ring = rings
            .get_mut(cluster)
            .ok_or_else(|| RouteError::MissingRoute(format!("unknown cluster '{cluster}'")))?;
        let node = node.into();
        if !ring.members.contains(&node) {
            ring.members.push(node);
        }
        ring.rebuild(self.config.max_partitions);
        Ok(())
    }

    /// Removes a node from `cluster`'s member set and rebuilds its ring.
    ///
    /// # Errors
    /// [`RouteError::MissingRoute`] if `cluster` was never registered.
    pub fn remove_node(&self, cluster: &str, node: &str) -> Result<(), RouteError> {
        let mut rings = self.rings.write().unwrap_or_else(|e| e.into_inner());
        let ring = rings
            .get_mut(cluster)
            .ok_or_else(|| RouteError::MissingRoute(format!("unknown cluster '{cluster}'")))?;
        ring.members.retain(|m| m != node);
        ring.rebuild(self.config.max_partitions);
        Ok(())
    }

    /// The current member set of `cluster` (not ring slots), sorted by name.
    ///
    /// # Errors
    /// [`RouteError::MissingRoute`] if `cluster` was never registered.
    pub fn nodes_for(&self, cluster: &str) -> Result<Vec<String>, RouteError> {
        let rings = self.rings.read().unwrap_or_else(|e| e.into_inner());
        let ring = rings
            .get(cluster)
            .ok_or_else(|| RouteError::MissingRoute(format!("unknown cluster '{cluster}'")))?;
        Ok(ring.members.clone())
    }

    /// `slot[ hash(bucket) mod maxPartitions ]`.
    ///
    /// # Errors
    /// [`RouteError::MissingRoute`] if `cluster` is unknown or its ring is empty.
    pub fn node_for_bucket(&self, cluster: &str, bucket: &str) -> Result<String, RouteError> {
        self.lookup(cluster, hash::hash(bucket.as_bytes()))
    }

    /// `slot[ combine(hash(bucket), hash(key)) mod maxPartitions ]`.
    ///
    /// # Errors
    /// [`RouteError::MissingRoute`] if `cluster` is unknown or its ring is empty.
    pub fn node_for_key(&self, cluster: &str, bucket: &str, key: &str) -> Result<String, RouteError> {
        let combined = hash::combine(bucket.as_bytes(), key.as_bytes());
        self.lookup(cluster, combined)
    }

    fn lookup(&self, cluster: &str, raw_hash: u32) -> Result<String, RouteError> {
        let rings = self.rings.read().unwrap_or_else(|e| e.into_inner());
        let ring = rings
            .get(cluster)
            .ok_or_else(|| RouteError::MissingRoute(format!("unknown cluster '{cluster}'")))?;
        if ring.slots.is_empty() {
            return Err(RouteError::MissingRoute(format!("cluster '{cluster}' has no members")));
        }
        let idx = (raw_hash as usize) % ring.slots.len();
        Ok(ring.slots[idx].clone())
    }

    /// Drops all routing state. Used by `Router::cleanup`.
    pub fn clear(&self) {
        self.rings.write().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

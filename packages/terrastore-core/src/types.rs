//! Shared data-model types (§3): clusters and the slot-ring configuration.

use serde::{Deserialize, Serialize};

/// A named group of nodes that jointly shard a subset of the bucket space.
///
/// `is_local` flags the one cluster this process belongs to; the set of
/// clusters is declared at startup and is immutable after `setup_clusters`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cluster {
    pub name: String,
    pub is_local: bool,
}

impl Cluster {
    #[must_use]
    pub fn new(name: impl Into<String>, is_local: bool) -> Self {
        Self { name: name.into(), is_local }
    }
}

/// Configuration for a [`crate::partition::ClusterPartitioner`]'s slot ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClusterPartitionerConfig {
    /// Fixed slot count per cluster ring. Default 1024 (§3, §6).
    pub max_partitions: u32,
}

impl Default for ClusterPartitionerConfig {
    fn default() -> Self {
        Self { max_partitions: 1024 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cluster_partitioner_config_default_matches_spec() {
        assert_eq!(ClusterPartitionerConfig::default().max_partitions, 1024);
    }

    #[test]
    fn cluster_new_sets_fields() {
        let c = Cluster::new("c1", true);
        assert_eq!(c.name, "c1");
        assert!(c.is_local);
    }
}

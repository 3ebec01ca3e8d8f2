//! Configuration surface (§6, §10.2): plain data, no flag/env/file parsing.
//!
//! Reading these values from flags/files/env and populating the structs is
//! the out-of-scope "configuration loading" collaborator (§1); this module
//! only defines the surface and its defaults.

use std::time::Duration;

use terrastore_core::ClusterPartitionerConfig;

/// `node.*` options (§6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeConfig {
    /// `node.id`: logical name of the local node.
    pub id: String,
    /// `node.concurrency`: local worker pool size.
    pub concurrency: usize,
    /// `node.timeout`: per-command remote timeout.
    pub timeout: Duration,
    /// Address the local [`crate::node::RpcListener`] binds to, so remote
    /// peers can reach this node. Not part of the §6 enumerated options
    /// (those describe request/retry/partition tuning); this is the
    /// deployment-specific counterpart of `node.id`, deliberately left
    /// loopback-and-ephemeral by default so tests never collide on a port.
    pub bind_addr: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self { id: "node-1".to_string(), concurrency: 8, timeout: Duration::from_secs(10), bind_addr: "127.0.0.1:0".to_string() }
    }
}

/// `failover.*` options, consumed by [`crate::failure_decorator::FailureDecorator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailoverConfig {
    /// `failover.retries`: number of retries after the first attempt.
    pub retries: u32,
    /// `failover.interval`: sleep between retries.
    pub interval: Duration,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self { retries: 3, interval: Duration::from_millis(500) }
    }
}

/// `ensemble.*` options, consumed by [`crate::ensemble_manager::EnsembleManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnsembleStrategy {
    /// Poll every `interval`.
    Fixed { interval: Duration },
    /// Poll on an interval adjusted by a fuzzy controller (§4.9, §9); bounded `[min,max]`.
    Adaptive { min_interval: Duration, max_interval: Duration },
}

impl Default for EnsembleStrategy {
    fn default() -> Self {
        Self::Fixed { interval: Duration::from_secs(5) }
    }
}

/// `ensemble.*` options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EnsembleConfig {
    pub strategy: EnsembleStrategy,
}

/// The full server configuration surface. Mirrors the corpus's
/// `ServerConfig` pattern: one struct aggregating the sub-configs, each
/// independently constructible and independently defaulted.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ServerConfig {
    pub node: NodeConfig,
    pub failover: FailoverConfig,
    pub cluster_partitioner: ClusterPartitionerConfig,
    pub ensemble: EnsembleConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let config = ServerConfig::default();
        assert_eq!(config.cluster_partitioner.max_partitions, 1024);
        assert_eq!(config.failover.retries, 3);
        assert_eq!(config.node.concurrency, 8);
        assert!(matches!(config.ensemble.strategy, EnsembleStrategy::Fixed { .. }));
    }
}

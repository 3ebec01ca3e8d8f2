//! Terrastore server: the routing/dispatch subsystem of a distributed,
//! document-oriented key-value store organized as an ensemble of clusters.
//!
//! Partitioning and the wire protocol live in `terrastore-core`; this crate
//! builds the node/router/dispatch/failover layer on top of it, plus the
//! ingress traits an (out-of-scope) HTTP binary would call into.

pub mod config;
pub mod coordinator;
pub mod dispatch;
pub mod ensemble_manager;
pub mod failure_decorator;
pub mod membership;
pub mod node;
pub mod router;
pub mod service;
pub mod shutdown;
pub mod storage;

pub use config::{EnsembleConfig, EnsembleStrategy, FailoverConfig, NodeConfig, ServerConfig};
pub use coordinator::{Coordinator, SharedAddressTable};
pub use ensemble_manager::EnsembleManager;
pub use failure_decorator::{decorate, NodeService, RetryPolicy};
pub use membership::{GroupMembership, StaticGroupMembership};
pub use node::{LocalNode, MembershipProvider, Node, RemoteNode, RpcListener};
pub use router::Router;
pub use service::{BackupService, DefaultIngress, QueryService, StatsService, UpdateService};
pub use shutdown::{LifecycleState, ShutdownController};
pub use storage::{InMemoryStorageEngine, StorageEngine, UpdateFn};


/// End-to-end wiring: a local cluster with two nodes, joined through the
/// [`Coordinator`], serving a write and a read through the ingress traits.
#[cfg(test)]
mod integration_tests {
    use std::sync::Arc;
    use std::time::Duration;

    use terrastore_core::{Cluster, ClusterPartitionerConfig};

    use crate::config::{FailoverConfig, NodeConfig};
    use crate::coordinator::{Coordinator, SharedAddressTable};
    use crate::router::Router;
    use crate::service::{DefaultIngress, QueryService, UpdateService};
    use crate::storage::InMemoryStorageEngine;

    #[tokio::test]
    async fn join_write_read_and_shutdown_round_trip() {
        let router = Arc::new(Router::new(ClusterPartitionerConfig::default()));
        router.setup_clusters(&[Cluster::new("local", true)]);

        let coordinator = Coordinator::new(
            Arc::clone(&router),
            Arc::new(InMemoryStorageEngine::new()),
            NodeConfig { id: "node-1".into(), concurrency: 4, timeout: Duration::from_secs(1), bind_addr: "127.0.0.1:0".into() },
            Arc::new(SharedAddressTable::new()),
            Duration::from_secs(1),
        );
        coordinator.join_local().await.unwrap();

        let ingress = DefaultIngress::new(Arc::clone(&router), FailoverConfig::default());
        ingress.put_value("docs", "alice", b"hello".to_vec(), None).await.unwrap();
        let value = ingress.get_value("docs", "alice", None).await.unwrap();
        assert_eq!(value, Some(b"hello".to_vec()));

        coordinator.shutdown().await;
        let err = ingress.get_value("docs", "alice", None).await.unwrap_err();
        assert!(matches!(err, terrastore_core::RouteError::MissingRoute(_)));
    }
}

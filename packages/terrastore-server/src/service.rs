//! Ingress seam (§6): the traits an (out-of-scope) HTTP binary would call
//! into. Each method resolves its target node(s) through the [`Router`],
//! dispatches through the [`crate::failure_decorator`] retry wrapper, and
//! merges partial results with [`crate::dispatch`] where more than one node
//! is involved.
//!
//! `QueryByPredicate` remains an unindexed per-key scan and `RemoveBucket`
//! remains a non-atomic multicast that picks one node per cluster (§9, both
//! preserved as-is).

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use terrastore_core::{Command, CommandResult, KeyRange, RouteError};
use tower::ServiceExt;

use crate::config::FailoverConfig;
use crate::dispatch;
use crate::node::Node;
use crate::router::Router;

async fn dispatch_retry(node: Arc<dyn Node>, config: FailoverConfig, command: Command) -> Result<CommandResult, RouteError> {
    crate::failure_decorator::decorate(node, config).oneshot(command).await
}

/// `putValue` / `removeValue` / `updateValue` / `removeBucket` (§6).
#[async_trait]
pub trait UpdateService: Send + Sync {
    async fn put_value(&self, bucket: &str, key: &str, value: Vec<u8>, predicate: Option<String>) -> Result<(), RouteError>;
    async fn remove_value(&self, bucket: &str, key: &str) -> Result<(), RouteError>;
    async fn update_value(&self, bucket: &str, key: &str, function: &str, params: Vec<u8>, timeout_ms: u64) -> Result<Vec<u8>, RouteError>;
    /// Drops `bucket` on one node per cluster (§4.5's `RemoveBucket` target),
    /// picked deterministically as the lowest-named member of each cluster.
    /// Not atomic cluster-wide: if the bucket's keys live on other nodes of
    /// that cluster, they are untouched, and a failure mid-multicast leaves
    /// the bucket dropped on some clusters' representatives and not others
    /// (§9).
    async fn remove_bucket(&self, bucket: &str) -> Result<(), RouteError>;
}

/// `getValue` / `queryByRange` / `queryByPredicate` / `getBuckets` (§6).
#[async_trait]
pub trait QueryService: Send + Sync {
    async fn get_value(&self, bucket: &str, key: &str, predicate: Option<String>) -> Result<Option<Vec<u8>>, RouteError>;
    async fn get_values(&self, bucket: &str, keys: &[String], predicate: Option<String>) -> Result<BTreeMap<String, Vec<u8>>, RouteError>;
    async fn query_by_range(&self, bucket: &str, range: KeyRange, comparator: String, limit: Option<u32>) -> Result<BTreeMap<String, Vec<u8>>, RouteError>;
    /// Unindexed scan: fetches every key in `bucket` and evaluates
    /// `predicate` one value at a time (§9, preserved as-is).
    async fn query_by_predicate(&self, bucket: &str, predicate: &str) -> Result<BTreeMap<String, Vec<u8>>, RouteError>;
    /// Union of `getBuckets` across every node in every cluster.
    async fn get_buckets(&self) -> Result<Vec<String>, RouteError>;
}

/// Export/restore of whole buckets, composed from [`QueryService`] and
/// [`UpdateService`] primitives -- there is no dedicated backup [`Command`]
/// kind (§1: the wire protocol's scope is routing, not an on-disk backup format).
#[async_trait]
pub trait BackupService: Send + Sync {
    async fn export_bucket(&self, bucket: &str) -> Result<BTreeMap<String, Vec<u8>>, RouteError>;
    async fn restore_bucket(&self, bucket: &str, entries: BTreeMap<String, Vec<u8>>) -> Result<(), RouteError>;
}

/// Read-only topology introspection, for an operator-facing status endpoint.
#[async_trait]
pub trait StatsService: Send + Sync {
    fn cluster_names(&self) -> Vec<String>;
    fn node_names_in_cluster(&self, cluster: &str) -> Result<Vec<String>, RouteError>;
}

/// The default implementation of all four ingress traits, built directly on
/// [`Router`] and [`FailoverConfig`]-bounded retry.
pub struct DefaultIngress {
    router: Arc<Router>,
    failover: FailoverConfig,
}

impl DefaultIngress {
    #[must_use]
    pub fn new(router: Arc<Router>, failover: FailoverConfig) -> Self {
        Self { router, failover }
    }
}

#[async_trait]
impl UpdateService for DefaultIngress {
    async fn put_value(&self, bucket: &str, key: &str, value: Vec<u8>, predicate: Option<String>) -> Result<(), RouteError> {
        let node = self.router.route_to_node_for_key(bucket, key)?;
        let command = Command::PutValue { bucket: bucket.to_string(), key: key.to_string(), value, predicate };
        dispatch_retry(node, self.failover, command).await.map(|_| ())
    }

    async fn remove_value(&self, bucket: &str, key: &str) -> Result<(), RouteError> {
        let node = self.router.route_to_node_for_key(bucket, key)?;
        let command = Command::RemoveValue { bucket: bucket.to_string(), key: key.to_string() };
        dispatch_retry(node, self.failover, command).await.map(|_| ())
    }

    async fn update_value(&self, bucket: &str, key: &str, function: &str, params: Vec<u8>, timeout_ms: u64) -> Result<Vec<u8>, RouteError> {
        let node = self.router.route_to_node_for_key(bucket, key)?;
        let command =
            Command::Update { bucket: bucket.to_string(), key: key.to_string(), function: function.to_string(), params, timeout_ms };
        match dispatch_retry(node, self.failover, command).await? {
            CommandResult::UpdatedValue(value) => Ok(value),
            other => Err(unexpected(&other)),
        }
    }

    async fn remove_bucket(&self, bucket: &str) -> Result<(), RouteError> {
        let broadcast = self.router.broadcast_route()?;
        let mut representatives = Vec::with_capacity(broadcast.len());
        for (cluster, mut nodes) in broadcast {
            nodes.sort_by(|a, b| a.name().cmp(b.name()));
            let node = nodes
                .into_iter()
                .next()
                .ok_or_else(|| RouteError::MissingRoute(format!("cluster '{cluster}' has no node to remove bucket on")))?;
            representatives.push(node);
        }
        let concurrency = representatives.len().max(1);
        let bucket = bucket.to_string();
        let failover = self.failover;
        dispatch::fan_out(representatives, concurrency, move |node| {
            let command = Command::RemoveBucket { bucket: bucket.clone() };
            async move { dispatch_retry(node, failover, command).await }
        })
        .await?;
        Ok(())
    }
}

#[async_trait]
impl QueryService for DefaultIngress {
    async fn get_value(&self, bucket: &str, key: &str, predicate: Option<String>) -> Result<Option<Vec<u8>>, RouteError> {
        let node = self.router.route_to_node_for_key(bucket, key)?;
        let command = Command::GetValue { bucket: bucket.to_string(), key: key.to_string(), predicate };
        match dispatch_retry(node, self.failover, command).await? {
            CommandResult::Value(value) => Ok(value),
            other => Err(unexpected(&other)),
        }
    }

    async fn get_values(&self, bucket: &str, keys: &[String], predicate: Option<String>) -> Result<BTreeMap<String, Vec<u8>>, RouteError> {
        let grouped = self.router.route_to_nodes_for(bucket, keys)?;
        let failover = self.failover;
        let bucket = bucket.to_string();

        let groups: Vec<(Arc<dyn Node>, Vec<String>)> =
            grouped.into_iter().map(|(name, keys)| Ok((self.router.node_by_name(&name)?, keys))).collect::<Result<_, RouteError>>()?;
        let len = groups.len().max(1);

        let partials = dispatch::fan_out(groups, len, move |(node, keys)| {
            let command = Command::GetValues { bucket: bucket.clone(), keys, predicate: predicate.clone() };
            async move {
                match dispatch_retry(node, failover, command).await? {
                    CommandResult::Values(values) => Ok(values),
                    other => Err(unexpected(&other)),
                }
            }
        })
        .await?;

        Ok(dispatch::union(partials))
    }

    async fn query_by_range(&self, bucket: &str, range: KeyRange, comparator: String, limit: Option<u32>) -> Result<BTreeMap<String, Vec<u8>>, RouteError> {
        let node = self.router.route_to_node_for_bucket(bucket)?;
        let keys_command = Command::KeysInRange { bucket: bucket.to_string(), range, comparator, limit, ttl_ms: None };
        let keys = match dispatch_retry(Arc::clone(&node), self.failover, keys_command).await? {
            CommandResult::KeysInRange(keys) => keys,
            other => return Err(unexpected(&other)),
        };
        let values_command = Command::GetValues { bucket: bucket.to_string(), keys, predicate: None };
        match dispatch_retry(node, self.failover, values_command).await? {
            CommandResult::Values(values) => Ok(values),
            other => Err(unexpected(&other)),
        }
    }

    async fn query_by_predicate(&self, bucket: &str, predicate: &str) -> Result<BTreeMap<String, Vec<u8>>, RouteError> {
        let node = self.router.route_to_node_for_bucket(bucket)?;
        let keys = match dispatch_retry(Arc::clone(&node), self.failover, Command::GetKeys { bucket: bucket.to_string() }).await? {
            CommandResult::Keys(keys) => keys,
            other => return Err(unexpected(&other)),
        };

        let mut matched = BTreeMap::new();
        for key in keys {
            let command = Command::GetValue { bucket: bucket.to_string(), key: key.clone(), predicate: Some(predicate.to_string()) };
            if let CommandResult::Value(Some(value)) = dispatch_retry(Arc::clone(&node), self.failover, command).await? {
                matched.insert(key, value);
            }
        }
        Ok(matched)
    }

    async fn get_buckets(&self) -> Result<Vec<String>, RouteError> {
        let broadcast = self.router.broadcast_route()?;
        let nodes: Vec<Arc<dyn Node>> = broadcast.into_values().flatten().collect();
        let len = nodes.len().max(1);
        let failover = self.failover;

        let partials = dispatch::fan_out(nodes, len, move |node| {
            let command = Command::GetBuckets;
            async move {
                match dispatch_retry(node, failover, command).await? {
                    CommandResult::Buckets(buckets) => Ok(buckets),
                    other => Err(unexpected(&other)),
                }
            }
        })
        .await?;

        let mut all: Vec<String> = partials.into_iter().flatten().collect();
        all.sort();
        all.dedup();
        Ok(all)
    }
}

#[async_trait]
impl BackupService for DefaultIngress {
    async fn export_bucket(&self, bucket: &str) -> Result<BTreeMap<String, Vec<u8>>, RouteError> {
        QueryService::query_by_range(self, bucket, KeyRange::default(), "lexicographic".to_string(), None).await
    }

    async fn restore_bucket(&self, bucket: &str, entries: BTreeMap<String, Vec<u8>>) -> Result<(), RouteError> {
        let entries: Vec<(String, Vec<u8>)> = entries.into_iter().collect();
        let len = entries.len().max(1);
        let bucket = bucket.to_string();
        let router = Arc::clone(&self.router);
        let failover = self.failover;

        dispatch::fan_out(entries, len, move |(key, value)| {
            let bucket = bucket.clone();
            let router = Arc::clone(&router);
            async move {
                let node = router.route_to_node_for_key(&bucket, &key)?;
                let command = Command::PutValue { bucket, key, value, predicate: None };
                dispatch_retry(node, failover, command).await
            }
        })
        .await?;
        Ok(())
    }
}

impl StatsService for DefaultIngress {
    fn cluster_names(&self) -> Vec<String> {
        self.router.broadcast_route().map(|map| map.into_keys().collect()).unwrap_or_default()
    }

    fn node_names_in_cluster(&self, cluster: &str) -> Result<Vec<String>, RouteError> {
        Ok(self.router.cluster_route(cluster)?.iter().map(|n| n.name().to_string()).collect())
    }
}

fn unexpected(result: &CommandResult) -> RouteError {
    RouteError::ProtocolError(format!("unexpected command result: {result:?}"))
}

//! `EnsemblePartitioner`: inter-cluster routing by bucket (§4.3).

use std::sync::RwLock;

use crate::hash;

/// Maps `(bucket)` and `(bucket,key)` to one cluster, by a stable hash
/// modulo the *sorted* list of cluster names. Ignores node counts: cluster
/// membership size never changes which cluster a bucket belongs to.
pub struct EnsemblePartitioner {
    clusters: RwLock<Vec<String>>,
}

impl EnsemblePartitioner {
    #[must_use]
    pub fn new() -> Self {
        Self { clusters: RwLock::new(Vec::new()) }
    }

    /// Replaces the cluster-name list. Idempotent for equal inputs: sorting
    /// happens here so two calls with the same set in different order
    /// produce identical routing.
    pub fn setup_clusters<I, S>(&self, names: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut sorted: Vec<String> = names.into_iter().map(Into::into).collect();
        sorted.sort_unstable();
        sorted.dedup();
        *self.clusters.write().unwrap_or_else(|e| e.into_inner()) = sorted;
    }

    /// `clusters[ hash(bucket) mod |clusters| ]`. `None` if no clusters are set up.
    #[must_use]
    pub fn cluster_for_bucket(&self, bucket: &str) -> Option<String> {
        let clusters = self.clusters.read().unwrap_or_else(|e| e.into_inner());
        if clusters.is_empty() {
            return None;
        }
        let idx = (hash::hash(bucket.as_bytes()) as usize) % clusters.len();
        Some(clusters[idx].clone())
    }

    /// Routing to a cluster is by bucket only (§4.3): key granularity applies
    /// inside the cluster, so this is exactly `cluster_for_bucket`.
    #[must_use]
    pub fn cluster_for_key(&self, bucket: &str, _key: &str) -> Option<String> {
        self.cluster_for_bucket(bucket)
    }

    /// The current sorted cluster-name list.
    #[must_use]
    pub fn clusters(&self) -> Vec<String> {
        self.clusters.read().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl Default for EnsemblePartitioner {
    fn default() -> Self {
        Self::new()
    }
}

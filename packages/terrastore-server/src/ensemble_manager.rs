//! EnsembleManager (§4.9): keeps remote clusters' membership fresh by
//! periodically polling a known contact per cluster and reconciling the
//! result into the [`Router`].

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use terrastore_core::{Command, CommandResult, MemberAddress, RouteError};

use crate::node::{Node, RemoteNode};
use crate::router::Router;

/// Polls each remote cluster's known contacts for `Membership` and
/// reconciles the result into `router`. One "tick" per call to [`EnsembleManager::tick`];
/// callers drive the cadence (fixed interval or adaptive, per [`crate::config::EnsembleStrategy`]).
pub struct EnsembleManager {
    router: Arc<Router>,
    contacts: RwLock<HashMap<String, Vec<MemberAddress>>>,
    node_timeout: Duration,
}

impl EnsembleManager {
    #[must_use]
    pub fn new(router: Arc<Router>, node_timeout: Duration) -> Self {
        Self { router, contacts: RwLock::new(HashMap::new()), node_timeout }
    }

    /// Registers (or replaces) the known contact addresses for `cluster`,
    /// used to bootstrap polling before any membership response has arrived.
    pub fn set_contacts(&self, cluster: &str, contacts: Vec<MemberAddress>) {
        self.contacts.write().unwrap_or_else(|e| e.into_inner()).insert(cluster.to_string(), contacts);
    }

    /// Runs one polling round over every known cluster. Clusters whose
    /// contacts are all unreachable this tick are left with their previous
    /// view and logged as unreachable (§4.9); this is not an error for the
    /// caller, since other clusters may still have succeeded.
    pub async fn tick(&self) {
        let snapshot: Vec<(String, Vec<MemberAddress>)> =
            self.contacts.read().unwrap_or_else(|e| e.into_inner()).iter().map(|(k, v)| (k.clone(), v.clone())).collect();

        for (cluster, contacts) in snapshot {
            match self.refresh_cluster(&cluster, &contacts).await {
                Ok(()) => tracing::debug!(cluster = %cluster, "ensemble tick: reachable"),
                Err(error) => tracing::warn!(cluster = %cluster, %error, "ensemble tick: unreachable"),
            }
        }
    }

    async fn refresh_cluster(&self, cluster: &str, contacts: &[MemberAddress]) -> Result<(), RouteError> {
        let mut last_error = RouteError::MissingRoute(format!("no known contacts for cluster '{cluster}'"));
        for contact in contacts {
            match self.query_membership(contact).await {
                Ok(members) => {
                    self.apply_membership(cluster, members).await;
                    return Ok(());
                }
                Err(error) => {
                    tracing::debug!(cluster = %cluster, contact = %contact.name, %error, "ensemble tick: contact failed, trying next");
                    last_error = error;
                }
            }
        }
        Err(last_error)
    }

    async fn query_membership(&self, contact: &MemberAddress) -> Result<Vec<MemberAddress>, RouteError> {
        let addr = format!("{}:{}", contact.host, contact.port);
        let node = RemoteNode::connect(contact.name.clone(), &addr, self.node_timeout).await?;
        let result = node.send(Command::Membership).await;
        node.shutdown().await;
        match result? {
            CommandResult::Members(members) => Ok(members),
            _ => Err(RouteError::ProtocolError("unexpected response to Membership".into())),
        }
    }

    async fn apply_membership(&self, cluster: &str, members: Vec<MemberAddress>) {
        let current_nodes = self.router.cluster_route(cluster).unwrap_or_default();
        let current_names: HashSet<String> = current_nodes.iter().map(|n| n.name().to_string()).collect();
        let new_names: HashSet<String> = members.iter().map(|m| m.name.clone()).collect();

        for departed in current_names.difference(&new_names) {
            if let Some(node) = current_nodes.iter().find(|n| n.name() == departed) {
                node.shutdown().await;
            }
            let _ = self.router.remove_route_to(cluster, departed);
        }

        for member in &members {
            if current_names.contains(&member.name) {
                continue;
            }
            let addr = format!("{}:{}", member.host, member.port);
            match RemoteNode::connect(member.name.clone(), &addr, self.node_timeout).await {
                Ok(node) => {
                    let _ = self.router.add_route_to(cluster, Arc::new(node));
                }
                Err(error) => tracing::warn!(cluster = %cluster, node = %member.name, %error, "ensemble tick: could not connect new member"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use futures_util::{SinkExt, StreamExt};
    use terrastore_core::command::wire::{RequestHeader, ResponseHeader, STATUS_OK};
    use terrastore_core::ClusterPartitionerConfig;
    use tokio::net::TcpListener;
    use tokio_util::codec::{Framed, LengthDelimitedCodec};

    /// A peer that answers every request with `Membership { members }`.
    async fn spawn_membership_server(members: Vec<MemberAddress>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut framed = Framed::new(stream, LengthDelimitedCodec::new());
            while let Some(Ok(frame)) = framed.next().await {
                let Some(header) = RequestHeader::decode(&frame) else { continue };
                let response = ResponseHeader { request_id: header.request_id, status: STATUS_OK };
                let body = rmp_serde::to_vec(&CommandResult::Members(members.clone())).unwrap();
                let mut out = BytesMut::with_capacity(ResponseHeader::LEN + body.len());
                out.extend_from_slice(&response.encode());
                out.extend_from_slice(&body);
                framed.send(out.freeze()).await.unwrap();
            }
        });
        addr
    }

    fn contact(addr: &str) -> MemberAddress {
        let (host, port) = addr.rsplit_once(':').unwrap();
        MemberAddress { name: "contact".into(), host: host.into(), port: port.parse().unwrap() }
    }

    /// A listener that just accepts connections, standing in for a member
    /// node that `EnsembleManager` only needs to reach (not talk to).
    async fn spawn_listener() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            loop {
                let Ok((_stream, _)) = listener.accept().await else { break };
            }
        });
        addr
    }

    #[tokio::test]
    async fn tick_adds_newly_reported_members() {
        let router = Arc::new(Router::new(ClusterPartitionerConfig::default()));
        router.setup_clusters(&[terrastore_core::Cluster::new("remote", false)]);

        let member_addr = spawn_listener().await;
        let member = contact(&member_addr);
        let members = vec![MemberAddress { name: "r1".into(), host: member.host.clone(), port: member.port }];
        let addr = spawn_membership_server(members).await;

        let manager = EnsembleManager::new(Arc::clone(&router), Duration::from_secs(1));
        manager.set_contacts("remote", vec![contact(&addr)]);
        manager.tick().await;

        let names: Vec<String> = router.cluster_route("remote").unwrap().iter().map(|n| n.name().to_string()).collect();
        assert!(names.contains(&"r1".to_string()));
    }

    #[tokio::test]
    async fn tick_leaves_view_unchanged_when_all_contacts_unreachable() {
        let router = Arc::new(Router::new(ClusterPartitionerConfig::default()));
        router.setup_clusters(&[terrastore_core::Cluster::new("remote", false)]);

        let manager = EnsembleManager::new(Arc::clone(&router), Duration::from_millis(100));
        manager.set_contacts("remote", vec![MemberAddress { name: "dead".into(), host: "127.0.0.1".into(), port: 1 }]);
        manager.tick().await;

        assert_eq!(router.cluster_route("remote").unwrap().len(), 0);
    }
}

//! Coordinator (§4.10): reacts to local-cluster join/leave events from a
//! [`GroupMembership`] collaborator, keeping the [`Router`] in sync with the
//! set of nodes actually present.
//!
//! - Local node join: create a [`LocalNode`] over the storage engine, add it
//!   to the local cluster.
//! - Remote node join (same local cluster): bounded-wait for the new
//!   member's address to appear in the [`SharedAddressTable`], connect,
//!   add it to the local cluster -- pausing and resuming the local node's
//!   command processor around the mutation (§5). Flushing in-flight state
//!   before resuming is the storage engine's responsibility; this stand-in
//!   has no flush hook to call.
//! - Node leave: disconnect and drop from the [`Router`], same pause/resume
//!   bracket.
//! - Shutdown: disconnect every node, clean up all routes, exit. Idempotent
//!   (§8).
//!
//! A transition that doesn't complete within `watchdog` is aborted with a
//! [`RouteError`] rather than left to hang indefinitely (§5).

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use terrastore_core::{MemberAddress, RouteError};
use tokio::sync::Mutex;

use crate::config::NodeConfig;
use crate::membership::GroupMembership;
use crate::node::{LocalNode, MembershipProvider, Node, RemoteNode, RpcListener};
use crate::router::Router;
use crate::shutdown::ShutdownController;
use crate::storage::StorageEngine;

/// A directory new cluster members publish their connectable address to,
/// standing in for whatever service-discovery mechanism a deployment uses
/// (DNS, a gossip protocol, a coordination service) -- out of scope here (§1).
#[derive(Default)]
pub struct SharedAddressTable {
    addresses: DashMap<String, MemberAddress>,
}

impl SharedAddressTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, address: MemberAddress) {
        self.addresses.insert(address.name.clone(), address);
    }

    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<MemberAddress> {
        self.addresses.get(name).map(|entry| entry.value().clone())
    }
}

/// Reacts to [`GroupMembership`] events, keeping `router` in sync (§4.10).
pub struct Coordinator {
    router: Arc<Router>,
    storage: Arc<dyn StorageEngine>,
    node_config: NodeConfig,
    addresses: Arc<SharedAddressTable>,
    shutdown: ShutdownController,
    watchdog: Duration,
    address_poll_interval: Duration,
    local_node: Mutex<Option<Arc<LocalNode>>>,
    listener: Mutex<Option<RpcListener>>,
}

impl Coordinator {
    #[must_use]
    pub fn new(router: Arc<Router>, storage: Arc<dyn StorageEngine>, node_config: NodeConfig, addresses: Arc<SharedAddressTable>, watchdog: Duration) -> Self {
        Self {
            router,
            storage,
            node_config,
            addresses,
            shutdown: ShutdownController::new(),
            watchdog,
            address_poll_interval: Duration::from_millis(20),
            local_node: Mutex::new(None),
            listener: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn shutdown_controller(&self) -> &ShutdownController {
        &self.shutdown
    }

    /// Registers this process's own node with the local cluster, binds its
    /// [`RpcListener`] so remote peers can reach it, and publishes its
    /// connectable address into the [`SharedAddressTable`] (§4.10).
    ///
    /// # Errors
    /// Whatever [`Router::add_route_to_local_node`] returns, or
    /// [`RouteError::CommunicationError`] if the listener fails to bind.
    pub async fn join_local(&self) -> Result<(), RouteError> {
        let node = Arc::new(LocalNode::new(self.node_config.id.clone(), Arc::clone(&self.storage), self.node_config.concurrency));
        self.router.add_route_to_local_node(Arc::clone(&node) as Arc<dyn Node>)?;
        *self.local_node.lock().await = Some(Arc::clone(&node));

        let provider = self.membership_provider();
        let listener = RpcListener::bind(&self.node_config.bind_addr, node as Arc<dyn Node>, Some(provider)).await?;
        let local_addr = listener.local_addr();
        self.addresses.publish(MemberAddress { name: self.node_config.id.clone(), host: local_addr.ip().to_string(), port: local_addr.port() });
        *self.listener.lock().await = Some(listener);

        self.shutdown.set_ready();
        tracing::info!(node = %self.node_config.id, addr = %local_addr, "coordinator: local node joined");
        Ok(())
    }

    /// Builds the closure an [`RpcListener`] answers `Membership` requests
    /// with: the local cluster's current node names, resolved to addresses
    /// via the [`SharedAddressTable`] (nodes never published there, i.e.
    /// still mid-join, are silently omitted rather than failing the whole
    /// response).
    fn membership_provider(&self) -> MembershipProvider {
        let router = Arc::clone(&self.router);
        let addresses = Arc::clone(&self.addresses);
        Arc::new(move || {
            let Ok(cluster) = router.local_cluster_name() else { return Vec::new() };
            let Ok(nodes) = router.cluster_route(&cluster) else { return Vec::new() };
            nodes.iter().filter_map(|node| addresses.lookup(node.name())).collect()
        })
    }

    /// Bootstraps from `membership`'s current snapshot (connecting every
    /// already-known peer) and registers `on_join`/`on_leave` callbacks that
    /// drive [`Self::remote_node_joined`]/[`Self::node_left`] as membership
    /// changes (§4.10). `self` must be wrapped in an `Arc` since the
    /// callbacks outlive the call and run on spawned tasks.
    pub fn watch_membership(self: &Arc<Self>, membership: &Arc<dyn GroupMembership>) {
        for member in membership.current_members() {
            if member.name == self.node_config.id {
                continue;
            }
            self.addresses.publish(member.clone());
            let coordinator = Arc::clone(self);
            tokio::spawn(async move {
                if let Err(error) = coordinator.remote_node_joined(&member.name).await {
                    tracing::warn!(member = %member.name, %error, "coordinator: bootstrap join failed");
                }
            });
        }

        let join_coordinator = Arc::clone(self);
        membership.on_join(Box::new(move |member| {
            join_coordinator.addresses.publish(member.clone());
            let coordinator = Arc::clone(&join_coordinator);
            tokio::spawn(async move {
                if let Err(error) = coordinator.remote_node_joined(&member.name).await {
                    tracing::warn!(member = %member.name, %error, "coordinator: join failed");
                }
            });
        }));

        let leave_coordinator = Arc::clone(self);
        membership.on_leave(Box::new(move |member| {
            let coordinator = Arc::clone(&leave_coordinator);
            tokio::spawn(async move {
                if let Err(error) = coordinator.node_left(&member.name).await {
                    tracing::warn!(member = %member.name, %error, "coordinator: leave failed");
                }
            });
        }));
    }

    /// Wires a remote peer into the local cluster. Bounded by `watchdog`:
    /// if the peer's address never appears in the shared table, or the
    /// connection attempt stalls, the transition is aborted with an error
    /// rather than left pending forever (§5).
    ///
    /// # Errors
    /// [`RouteError::CommunicationError`] if the watchdog trips; whatever
    /// [`RemoteNode::connect`] or [`Router::add_route_to_local_node`] return otherwise.
    pub async fn remote_node_joined(&self, member_name: &str) -> Result<(), RouteError> {
        let transition = async {
            let address = self.wait_for_address(member_name).await?;
            let addr = format!("{}:{}", address.host, address.port);
            let node = RemoteNode::connect(address.name.clone(), &addr, self.node_config.timeout).await?;

            self.pause_local().await;
            let result = self.router.add_route_to_local_node(Arc::new(node));
            self.resume_local().await;
            result
        };

        match tokio::time::timeout(self.watchdog, transition).await {
            Ok(result) => result,
            Err(_) => {
                tracing::error!(member = member_name, "coordinator: topology transition watchdog tripped");
                Err(RouteError::communication(std::io::Error::other(format!("join of '{member_name}' exceeded watchdog"))))
            }
        }
    }

    /// Removes a departed peer from the local cluster, disconnecting it first.
    ///
    /// # Errors
    /// Whatever [`Router::remove_route_to`] returns.
    pub async fn node_left(&self, member_name: &str) -> Result<(), RouteError> {
        let transition = async {
            self.pause_local().await;
            let cluster = self.router.local_cluster_name()?;
            if let Ok(node) = self.router.node_by_name(member_name) {
                node.shutdown().await;
            }
            let result = self.router.remove_route_to(&cluster, member_name);
            self.resume_local().await;
            result
        };

        match tokio::time::timeout(self.watchdog, transition).await {
            Ok(result) => result,
            Err(_) => {
                tracing::error!(member = member_name, "coordinator: leave watchdog tripped");
                Err(RouteError::communication(std::io::Error::other(format!("leave of '{member_name}' exceeded watchdog"))))
            }
        }
    }

    /// Disconnects every known node and clears all routes. Idempotent: a
    /// second call observes `Stopped` already and returns immediately (§8).
    pub async fn shutdown(&self) {
        use crate::shutdown::LifecycleState;
        if self.shutdown.state() == LifecycleState::Stopped {
            return;
        }
        self.shutdown.trigger_shutdown();

        if let Ok(broadcast) = self.router.broadcast_route() {
            for nodes in broadcast.into_values() {
                for node in nodes {
                    node.shutdown().await;
                }
            }
        }
        self.router.cleanup();
        *self.local_node.lock().await = None;
        if let Some(listener) = self.listener.lock().await.take() {
            listener.stop();
        }
        self.shutdown.wait_for_drain(self.watchdog).await;
        tracing::info!("coordinator: shutdown complete");
    }

    async fn wait_for_address(&self, name: &str) -> Result<MemberAddress, RouteError> {
        loop {
            if let Some(address) = self.addresses.lookup(name) {
                return Ok(address);
            }
            tokio::time::sleep(self.address_poll_interval).await;
        }
    }

    async fn pause_local(&self) {
        if let Some(node) = self.local_node.lock().await.as_ref() {
            node.pause();
        }
    }

    async fn resume_local(&self) {
        if let Some(node) = self.local_node.lock().await.as_ref() {
            node.resume();
        }
    }
}

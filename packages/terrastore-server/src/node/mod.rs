//! Node (§4.4): a uniform `send(command) -> result | error` endpoint, with
//! two implementations -- [`local::LocalNode`] (in-process, against a
//! [`crate::storage::StorageEngine`]) and [`remote::RemoteNode`] (length-prefixed
//! binary RPC over a persistent TCP connection). [`listener::RpcListener`] is
//! the server side that [`remote::RemoteNode`] connects to.

pub mod listener;
pub mod local;
pub mod remote;

pub use listener::{MembershipProvider, RpcListener};
pub use local::LocalNode;
pub use remote::RemoteNode;

use async_trait::async_trait;
use terrastore_core::{Command, CommandResult, RouteError};

/// The uniform command-sink abstraction the Router and dispatch layer see.
/// Thread-safe to call from any caller; ordering between concurrent `send`s
/// is not guaranteed (§4.4).
#[async_trait]
pub trait Node: Send + Sync + 'static {
    /// The node's logical name, as registered with the partitioners.
    fn name(&self) -> &str;

    /// Executes `command` and returns its result, or a [`RouteError`].
    async fn send(&self, command: Command) -> Result<CommandResult, RouteError>;

    /// Releases any transport resources. A no-op for [`local::LocalNode`];
    /// [`remote::RemoteNode`] overrides this to disconnect its socket.
    async fn shutdown(&self) {}
}

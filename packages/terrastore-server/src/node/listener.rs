//! `RpcListener` (§4.4, §6): the server side of the remote-node wire
//! protocol. [`node::remote::RemoteNode`](super::remote::RemoteNode) is the
//! client half -- this is what that client talks to: a bound socket that
//! accepts connections, decodes request frames, dispatches the decoded
//! [`Command`] against a local [`Node`], and writes back a response frame.
//!
//! `Membership` requests are special-cased: a [`MembershipProvider`] (set by
//! the [`crate::coordinator::Coordinator`] from the [`crate::router::Router`]
//! and [`crate::coordinator::SharedAddressTable`]) answers them directly
//! rather than going through the local command processor, since "this
//! cluster's members with addresses" is routing state the storage engine
//! does not hold.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;
use futures_util::{SinkExt, StreamExt};
use terrastore_core::command::wire::{RequestHeader, ResponseHeader, STATUS_OK, STATUS_PROCESSING_ERROR, STATUS_PROTOCOL_ERROR, STATUS_VALIDATION_ERROR};
use terrastore_core::{Command, CommandResult, ErrorMessage, MemberAddress, RouteError, PROTOCOL_VERSION};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use super::Node;

/// Answers a `Membership` request with the current cluster's members and
/// their addresses, bypassing the local [`Node`] dispatch (§4.5: the
/// storage engine has no notion of routing state).
pub type MembershipProvider = Arc<dyn Fn() -> Vec<MemberAddress> + Send + Sync>;

/// A bound RPC socket dispatching decoded frames to `node` (§6).
///
/// Each accepted connection gets its own task reading frames until the peer
/// disconnects or sends a malformed frame; [`RpcListener::drop`] aborts the
/// accept loop (and, transitively, the tasks it spawned exit once their
/// socket closes).
pub struct RpcListener {
    local_addr: SocketAddr,
    accept_task: JoinHandle<()>,
}

impl RpcListener {
    /// Binds `bind_addr` and starts accepting connections in the background.
    ///
    /// # Errors
    /// [`RouteError::CommunicationError`] if the address cannot be bound.
    pub async fn bind(bind_addr: &str, node: Arc<dyn Node>, membership: Option<MembershipProvider>) -> Result<Self, RouteError> {
        let listener = TcpListener::bind(bind_addr).await.map_err(RouteError::communication)?;
        let local_addr = listener.local_addr().map_err(RouteError::communication)?;
        tracing::info!(addr = %local_addr, "rpc listener: bound");
        let accept_task = tokio::spawn(accept_loop(listener, node, membership));
        Ok(Self { local_addr, accept_task })
    }

    /// The actual bound address, e.g. for publishing to a
    /// [`crate::coordinator::SharedAddressTable`] when `bind_addr` used an
    /// ephemeral port.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting new connections. Idempotent.
    pub fn stop(&self) {
        self.accept_task.abort();
    }
}

impl Drop for RpcListener {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

async fn accept_loop(listener: TcpListener, node: Arc<dyn Node>, membership: Option<MembershipProvider>) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(error) => {
                tracing::warn!(%error, "rpc listener: accept failed");
                continue;
            }
        };
        let node = Arc::clone(&node);
        let membership = membership.clone();
        tokio::spawn(async move {
            if let Err(error) = serve_connection(stream, &node, membership.as_ref()).await {
                tracing::debug!(%peer, %error, "rpc listener: connection ended");
            }
        });
    }
}

async fn serve_connection(stream: TcpStream, node: &Arc<dyn Node>, membership: Option<&MembershipProvider>) -> Result<(), RouteError> {
    let mut framed = Framed::new(stream, LengthDelimitedCodec::new());
    while let Some(frame) = framed.next().await {
        let frame = frame.map_err(RouteError::communication)?;
        let Some(header) = RequestHeader::decode(&frame) else {
            tracing::warn!("rpc listener: frame too short for a request header, dropping connection");
            break;
        };
        let body = &frame[RequestHeader::LEN..];
        let response = handle_request(header, body, node, membership).await;
        framed.send(response.freeze()).await.map_err(RouteError::communication)?;
    }
    Ok(())
}

async fn handle_request(header: RequestHeader, body: &[u8], node: &Arc<dyn Node>, membership: Option<&MembershipProvider>) -> BytesMut {
    if header.version != PROTOCOL_VERSION {
        return encode_response(header.request_id, STATUS_PROTOCOL_ERROR, format!("unsupported protocol version {}", header.version).into_bytes());
    }
    let command: Command = match rmp_serde::from_slice(body) {
        Ok(command) => command,
        Err(error) => return encode_response(header.request_id, STATUS_VALIDATION_ERROR, error.to_string().into_bytes()),
    };

    let result = if let (Command::Membership, Some(provider)) = (&command, membership) {
        Ok(CommandResult::Members(provider()))
    } else {
        node.send(command).await
    };

    match result {
        Ok(result) => match rmp_serde::to_vec(&result) {
            Ok(body) => encode_response(header.request_id, STATUS_OK, body),
            Err(error) => encode_response(header.request_id, STATUS_PROCESSING_ERROR, encode_error(500, error.to_string())),
        },
        Err(RouteError::ProcessingError(message)) => encode_response(header.request_id, STATUS_PROCESSING_ERROR, encode_error(message.code, message.message)),
        Err(RouteError::ValidationError(message)) => encode_response(header.request_id, STATUS_VALIDATION_ERROR, message.into_bytes()),
        Err(RouteError::ProtocolError(message)) => encode_response(header.request_id, STATUS_PROTOCOL_ERROR, message.into_bytes()),
        Err(other) => encode_response(header.request_id, STATUS_PROCESSING_ERROR, encode_error(500, other.to_string())),
    }
}

fn encode_error(code: u16, message: String) -> Vec<u8> {
    rmp_serde::to_vec(&ErrorMessage::new(code, message)).unwrap_or_default()
}

fn encode_response(request_id: u64, status: u8, body: Vec<u8>) -> BytesMut {
    let header = ResponseHeader { request_id, status };
    let mut out = BytesMut::with_capacity(ResponseHeader::LEN + body.len());
    out.extend_from_slice(&header.encode());
    out.extend_from_slice(&body);
    out
}

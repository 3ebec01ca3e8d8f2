//! `RemoteNode` (§4.4, §6): length-prefixed binary RPC over a persistent TCP
//! connection, with a `requestId -> awaiter` correlation map.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use terrastore_core::command::wire::{RequestHeader, ResponseHeader, STATUS_OK, STATUS_PROCESSING_ERROR, STATUS_PROTOCOL_ERROR, STATUS_VALIDATION_ERROR};
use terrastore_core::{Command, CommandResult, ErrorMessage, RouteError, PROTOCOL_VERSION};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use super::Node;

type Awaiter = oneshot::Sender<Result<CommandResult, RouteError>>;

/// [`Node`] over a TCP socket. `connect`/`disconnect` are explicit and
/// idempotent; `disconnect` cancels every in-flight awaiter with
/// [`RouteError::CommunicationError`] (§4.4).
pub struct RemoteNode {
    name: String,
    timeout: Duration,
    next_request_id: AtomicU64,
    awaiters: Arc<DashMap<u64, Awaiter>>,
    connected: Arc<AtomicBool>,
    writer: Mutex<Option<futures_util::stream::SplitSink<Framed<TcpStream, LengthDelimitedCodec>, Bytes>>>,
    reader_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl RemoteNode {
    /// Connects to `addr` and starts the background frame reader.
    ///
    /// # Errors
    /// Returns a [`RouteError::CommunicationError`] if the TCP connection fails.
    pub async fn connect(name: impl Into<String>, addr: &str, timeout: Duration) -> Result<Self, RouteError> {
        let name = name.into();
        let stream = TcpStream::connect(addr).await.map_err(RouteError::communication)?;
        let framed = Framed::new(stream, LengthDelimitedCodec::new());
        let (sink, stream) = framed.split();

        let awaiters: Arc<DashMap<u64, Awaiter>> = Arc::new(DashMap::new());
        let connected = Arc::new(AtomicBool::new(true));

        let reader_task = tokio::spawn(read_loop(stream, Arc::clone(&awaiters), Arc::clone(&connected)));

        tracing::info!(node = %name, addr, "remote node connected");
        Ok(Self {
            name,
            timeout,
            next_request_id: AtomicU64::new(0),
            awaiters,
            connected,
            writer: Mutex::new(Some(sink)),
            reader_task: Mutex::new(Some(reader_task)),
        })
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Idempotent: a second call on an already-disconnected node is a no-op.
    pub async fn disconnect(&self) {
        if !self.connected.swap(false, Ordering::AcqRel) {
            return;
        }
        tracing::info!(node = %self.name, "remote node disconnected");
        *self.writer.lock().await = None;
        if let Some(handle) = self.reader_task.lock().await.take() {
            handle.abort();
        }
        cancel_all(&self.awaiters);
    }
}

#[async_trait]
impl Node for RemoteNode {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, command: Command) -> Result<CommandResult, RouteError> {
        if !self.is_connected() {
            return Err(RouteError::MissingRoute(format!("node '{}' is disconnected", self.name)));
        }

        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let header = RequestHeader { request_id, kind: command.kind() as u16, version: PROTOCOL_VERSION };
        let body = rmp_serde::to_vec(&command).map_err(|e| RouteError::ValidationError(e.to_string()))?;

        let mut payload = BytesMut::with_capacity(RequestHeader::LEN + body.len());
        payload.extend_from_slice(&header.encode());
        payload.extend_from_slice(&body);

        let (tx, rx) = oneshot::channel();
        self.awaiters.insert(request_id, tx);

        {
            let mut writer_guard = self.writer.lock().await;
            let Some(writer) = writer_guard.as_mut() else {
                self.awaiters.remove(&request_id);
                return Err(RouteError::MissingRoute(format!("node '{}' is disconnected", self.name)));
            };
            if let Err(e) = writer.send(payload.freeze()).await {
                self.awaiters.remove(&request_id);
                return Err(RouteError::communication(e));
            }
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(RouteError::communication(std::io::Error::other("awaiter dropped"))),
            Err(_) => {
                self.awaiters.remove(&request_id);
                Err(RouteError::ProcessingError(ErrorMessage::new(408, "request timed out")))
            }
        }
    }

    async fn shutdown(&self) {
        self.disconnect().await;
    }
}

async fn read_loop(
    mut stream: futures_util::stream::SplitStream<Framed<TcpStream, LengthDelimitedCodec>>,
    awaiters: Arc<DashMap<u64, Awaiter>>,
    connected: Arc<AtomicBool>,
) {
    while let Some(frame) = stream.next().await {
        let Ok(frame) = frame else { break };
        let Some(header) = ResponseHeader::decode(&frame) else { continue };
        let body = &frame[ResponseHeader::LEN..];
        let result = decode_response(header.status, body);
        if let Some((_, tx)) = awaiters.remove(&header.request_id) {
            let _ = tx.send(result);
        }
    }
    connected.store(false, Ordering::Release);
    cancel_all(&awaiters);
}

fn decode_response(status: u8, body: &[u8]) -> Result<CommandResult, RouteError> {
    match status {
        STATUS_OK => rmp_serde::from_slice(body).map_err(RouteError::communication),
        STATUS_PROCESSING_ERROR => {
            let message: ErrorMessage = rmp_serde::from_slice(body).map_err(RouteError::communication)?;
            Err(RouteError::ProcessingError(message))
        }
        STATUS_VALIDATION_ERROR => Err(RouteError::ValidationError(String::from_utf8_lossy(body).into_owned())),
        STATUS_PROTOCOL_ERROR => Err(RouteError::ProtocolError(String::from_utf8_lossy(body).into_owned())),
        other => Err(RouteError::ProtocolError(format!("unknown status byte {other}"))),
    }
}

fn cancel_all(awaiters: &DashMap<u64, Awaiter>) {
    let pending: Vec<u64> = awaiters.iter().map(|entry| *entry.key()).collect();
    for request_id in pending {
        if let Some((_, tx)) = awaiters.remove(&request_id) {
            let _ = tx.send(Err(RouteError::communication(std::io::Error::other("connection closed"))));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use terrastore_core::command::wire::STATUS_OK;
    use tokio::net::TcpListener;

    /// A minimal peer that replies `STATUS_OK` with an `Ack` to every
    /// request it receives, for exercising the client side of the protocol.
    async fn spawn_echo_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut framed = Framed::new(stream, LengthDelimitedCodec::new());
            while let Some(Ok(frame)) = framed.next().await {
                let Some(header) = RequestHeader::decode(&frame) else { continue };
                let response = ResponseHeader { request_id: header.request_id, status: STATUS_OK };
                let body = rmp_serde::to_vec(&CommandResult::Ack).unwrap();
                let mut out = BytesMut::with_capacity(ResponseHeader::LEN + body.len());
                out.extend_from_slice(&response.encode());
                out.extend_from_slice(&body);
                framed.send(out.freeze()).await.unwrap();
            }
        });
        addr
    }

    /// A peer that accepts the connection and never replies, for exercising timeouts.
    async fn spawn_silent_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (_stream, _) = listener.accept().await.unwrap();
            std::future::pending::<()>().await;
        });
        addr
    }

    #[tokio::test]
    async fn send_round_trips_through_real_socket() {
        let addr = spawn_echo_server().await;
        let node = RemoteNode::connect("peer", &addr, Duration::from_secs(1)).await.unwrap();
        let result = node.send(Command::GetBuckets).await.unwrap();
        assert!(matches!(result, CommandResult::Ack));
    }

    #[tokio::test]
    async fn send_times_out_on_stalled_peer() {
        let addr = spawn_silent_server().await;
        let node = RemoteNode::connect("peer", &addr, Duration::from_millis(50)).await.unwrap();
        let started = tokio::time::Instant::now();
        let err = node.send(Command::GetBuckets).await.unwrap_err();
        assert!(started.elapsed() < Duration::from_millis(500));
        assert!(matches!(err, RouteError::ProcessingError(_)));
    }

    #[tokio::test]
    async fn disconnect_is_idempotent_and_fails_pending_sends() {
        let addr = spawn_silent_server().await;
        let node = Arc::new(RemoteNode::connect("peer", &addr, Duration::from_secs(5)).await.unwrap());
        assert!(node.is_connected());

        let sender = Arc::clone(&node);
        let handle = tokio::spawn(async move { sender.send(Command::GetBuckets).await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        node.disconnect().await;
        node.disconnect().await; // idempotent
        assert!(!node.is_connected());

        let result = handle.await.unwrap();
        assert!(matches!(result, Err(RouteError::CommunicationError(_))));

        let err = node.send(Command::GetBuckets).await.unwrap_err();
        assert!(matches!(err, RouteError::MissingRoute(_)));
    }
}

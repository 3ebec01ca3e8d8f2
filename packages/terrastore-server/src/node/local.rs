//! `LocalNode` (§4.4): in-process command sink backed by a bounded worker
//! pool and the local [`StorageEngine`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use terrastore_core::command::wire::{STATUS_OK, STATUS_PROCESSING_ERROR};
use terrastore_core::{Command, CommandResult, ErrorMessage, RouteError};
use tokio::sync::{watch, Semaphore};
use tracing::Instrument;

use crate::storage::StorageEngine;

use super::Node;

/// In-process [`Node`]: commands are enqueued (by waiting on a semaphore
/// permit, bounding concurrency at `node.concurrency`) and executed directly
/// against `storage`. While paused, `send` blocks until `resume` is called
/// (§4.4, §4.10).
pub struct LocalNode {
    name: String,
    storage: Arc<dyn StorageEngine>,
    permits: Arc<Semaphore>,
    paused: watch::Sender<bool>,
}

impl LocalNode {
    #[must_use]
    pub fn new(name: impl Into<String>, storage: Arc<dyn StorageEngine>, concurrency: usize) -> Self {
        let (paused, _) = watch::channel(false);
        Self { name: name.into(), storage, permits: Arc::new(Semaphore::new(concurrency.max(1))), paused }
    }

    /// Parks new commands: in-flight `send` calls already past the pause
    /// check still run to completion (§4.10: topology transitions pause
    /// *new* commands, they don't abort in-flight ones).
    pub fn pause(&self) {
        tracing::info!(node = %self.name, "local node paused");
        let _ = self.paused.send(true);
    }

    /// Unparks commands parked by [`LocalNode::pause`].
    pub fn resume(&self) {
        tracing::info!(node = %self.name, "local node resumed");
        let _ = self.paused.send(false);
    }

    async fn wait_while_paused(&self) {
        let mut rx = self.paused.subscribe();
        while *rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

#[async_trait]
impl Node for LocalNode {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, command: Command) -> Result<CommandResult, RouteError> {
        self.wait_while_paused().await;
        let _permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| RouteError::communication(std::io::Error::other(e)))?;

        let span = tracing::debug_span!("local_node.send", node = %self.name, kind = ?command.kind());
        let storage = Arc::clone(&self.storage);

        async move {
            // §5: `Update` carries its own end-to-end timeout, enforced by
            // the owning node cancelling its dispatched computation -- every
            // other kind runs inline under the worker-pool permit already
            // acquired above.
            let update_timeout_ms = match &command {
                Command::Update { timeout_ms, .. } => Some(*timeout_ms),
                _ => None,
            };
            let result = if let Some(timeout_ms) = update_timeout_ms {
                let mut handle = tokio::task::spawn_blocking(move || execute(storage.as_ref(), command));
                match tokio::time::timeout(Duration::from_millis(timeout_ms), &mut handle).await {
                    Ok(Ok(inner)) => inner,
                    Ok(Err(join_error)) => Err(RouteError::communication(std::io::Error::other(join_error.to_string()))),
                    Err(_elapsed) => {
                        handle.abort();
                        Err(RouteError::ProcessingError(ErrorMessage::new(408, "update timed out")))
                    }
                }
            } else {
                execute(storage.as_ref(), command)
            };
            match &result {
                Ok(_) => tracing::trace!(status = STATUS_OK, "command executed"),
                Err(_) => tracing::trace!(status = STATUS_PROCESSING_ERROR, "command failed"),
            }
            result
        }
        .instrument(span)
        .await
    }
}

/// Dispatches `command` against `storage` (§4.5, §9 "tagged variant over
/// reflection"): a `match` on the kind, not a reflective call.
pub fn execute(storage: &dyn StorageEngine, command: Command) -> Result<CommandResult, RouteError> {
    let to_route = RouteError::ProcessingError;
    match command {
        Command::GetBuckets => Ok(CommandResult::Buckets(storage.get_buckets())),
        Command::GetKeys { bucket } => Ok(CommandResult::Keys(storage.get_keys(&bucket).map_err(to_route)?)),
        Command::KeysInRange { bucket, range, limit, .. } => {
            Ok(CommandResult::KeysInRange(storage.keys_in_range(&bucket, &range, limit).map_err(to_route)?))
        }
        Command::GetValue { bucket, key, predicate } => {
            Ok(CommandResult::Value(storage.get_value(&bucket, &key, predicate.as_deref()).map_err(to_route)?))
        }
        Command::GetValues { bucket, keys, predicate } => {
            Ok(CommandResult::Values(storage.get_values(&bucket, &keys, predicate.as_deref()).map_err(to_route)?))
        }
        Command::PutValue { bucket, key, value, predicate } => {
            storage.put_value(&bucket, &key, value, predicate.as_deref()).map_err(to_route)?;
            Ok(CommandResult::Ack)
        }
        Command::RemoveValue { bucket, key } => {
            storage.remove_value(&bucket, &key).map_err(to_route)?;
            Ok(CommandResult::Ack)
        }
        Command::RemoveValues { bucket, keys, predicate } => {
            Ok(CommandResult::RemovedValues(storage.remove_values(&bucket, &keys, predicate.as_deref()).map_err(to_route)?))
        }
        Command::RemoveBucket { bucket } => {
            storage.remove_bucket(&bucket).map_err(to_route)?;
            Ok(CommandResult::Ack)
        }
        Command::Update { bucket, key, function, params, .. } => {
            Ok(CommandResult::UpdatedValue(storage.update(&bucket, &key, &function, &params).map_err(to_route)?))
        }
        Command::Membership => Ok(CommandResult::Members(Vec::new())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryStorageEngine;

    fn node() -> LocalNode {
        LocalNode::new("n1", Arc::new(InMemoryStorageEngine::new()), 4)
    }

    #[tokio::test]
    async fn put_then_get_round_trips_through_send() {
        let node = node();
        node.send(Command::PutValue { bucket: "b".into(), key: "k".into(), value: vec![9], predicate: None })
            .await
            .unwrap();
        let result = node.send(Command::GetValue { bucket: "b".into(), key: "k".into(), predicate: None }).await.unwrap();
        assert!(matches!(result, CommandResult::Value(Some(v)) if v == vec![9]));
    }

    #[tokio::test]
    async fn paused_node_blocks_until_resumed() {
        let node = Arc::new(node());
        node.pause();

        let sender = Arc::clone(&node);
        let handle = tokio::spawn(async move { sender.send(Command::GetBuckets).await });

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!handle.is_finished());

        node.resume();
        let result = handle.await.unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn unknown_update_function_surfaces_as_processing_error() {
        let node = node();
        let err = node
            .send(Command::Update { bucket: "b".into(), key: "k".into(), function: "nope".into(), params: vec![], timeout_ms: 1000 })
            .await
            .unwrap_err();
        assert!(!err.retryable());
    }

    #[tokio::test]
    async fn update_past_its_timeout_surfaces_as_non_retryable_processing_error() {
        let storage = Arc::new(InMemoryStorageEngine::new());
        storage.register_function(
            "slow",
            Arc::new(|_current, _params| {
                std::thread::sleep(Duration::from_millis(200));
                Ok(Vec::new())
            }),
        );
        let node = LocalNode::new("n1", storage, 4);

        let err = node
            .send(Command::Update { bucket: "b".into(), key: "k".into(), function: "slow".into(), params: vec![], timeout_ms: 20 })
            .await
            .unwrap_err();
        assert!(matches!(err, RouteError::ProcessingError(_)));
        assert!(!err.retryable());
    }
}

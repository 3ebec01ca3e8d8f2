//! FailureDecorator (§4.8): wraps a [`Node`] with bounded retry-with-backoff
//! on transient routing/communication errors, built on `tower`'s retry
//! middleware (the same middleware-layering style as the corpus's load-shed
//! and timeout layers).

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use terrastore_core::{Command, CommandResult, RouteError};
use tower::retry::{Policy, Retry};
use tower::Service;

use crate::config::FailoverConfig;
use crate::node::Node;

/// Adapts a `dyn Node` to a `tower::Service<Command>` so it can sit under
/// `tower::retry::Retry` and any other tower middleware.
#[derive(Clone)]
pub struct NodeService {
    node: Arc<dyn Node>,
}

impl NodeService {
    #[must_use]
    pub fn new(node: Arc<dyn Node>) -> Self {
        Self { node }
    }
}

impl Service<Command> for NodeService {
    type Response = CommandResult;
    type Error = RouteError;
    type Future = Pin<Box<dyn Future<Output = Result<CommandResult, RouteError>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, command: Command) -> Self::Future {
        let node = Arc::clone(&self.node);
        Box::pin(async move { node.send(command).await })
    }
}

/// Bounded-retry policy (§4.8): retries `MissingRoute`/`CommunicationError`
/// up to `retries` times with a fixed `interval` between attempts;
/// `ProcessingError`/`ValidationError`/`ProtocolError` are never retried.
/// Stateless across top-level calls: each `decorate` call gets a fresh copy
/// with the full retry budget.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    remaining: u32,
    interval: Duration,
}

impl RetryPolicy {
    #[must_use]
    pub fn new(config: FailoverConfig) -> Self {
        Self { remaining: config.retries, interval: config.interval }
    }
}

impl<Req, Res> Policy<Req, Res, RouteError> for RetryPolicy
where
    Req: Clone,
{
    type Future = Pin<Box<dyn Future<Output = Self> + Send>>;

    fn retry(&self, _req: &Req, result: Result<&Res, &RouteError>) -> Option<Self::Future> {
        let Err(error) = result else { return None };
        if !error.retryable() || self.remaining == 0 {
            return None;
        }
        tracing::warn!(remaining = self.remaining, error = %error, "failure decorator: retrying");
        let next = Self { remaining: self.remaining - 1, interval: self.interval };
        let interval = self.interval;
        Some(Box::pin(async move {
            tokio::time::sleep(interval).await;
            next
        }))
    }

    fn clone_request(&self, req: &Req) -> Option<Req> {
        Some(req.clone())
    }
}

/// Wraps `node` with bounded retry per `config` (§4.8).
#[must_use]
pub fn decorate(node: Arc<dyn Node>, config: FailoverConfig) -> Retry<RetryPolicy, NodeService> {
    Retry::new(RetryPolicy::new(config), NodeService::new(node))
}

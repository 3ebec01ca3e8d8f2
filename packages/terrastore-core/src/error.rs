//! Error taxonomy shared by partitioners, nodes, and services (§7).
//!
//! Five kinds, one enum: callers branch on variant rather than on string
//! messages, and [`RouteError::retryable`] centralizes the retry/no-retry
//! split so the `FailureDecorator` never has to re-derive it.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A structured `(code, message)` pair produced by the storage engine when a
/// command fails during execution (not during routing). Wire-serializable:
/// it is the response body for `STATUS_PROCESSING_ERROR` (§6).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorMessage {
    pub code: u16,
    pub message: String,
}

impl ErrorMessage {
    #[must_use]
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self { code, message: message.into() }
    }
}

impl fmt::Display for ErrorMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

/// The error taxonomy of §7: every failure in the routing/dispatch core is
/// one of these five kinds.
#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    /// No node owns the request: empty ring, unknown cluster, or a partial
    /// broadcast that could not reach every cluster. Retryable.
    #[error("missing route: {0}")]
    MissingRoute(String),

    /// Transport failed: disconnect, timeout, or a frame that failed to
    /// decode. Retryable.
    #[error("communication error: {0}")]
    CommunicationError(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// The remote node executed the command and reported a failure (key not
    /// found, condition not satisfied, update timeout). Not retried.
    #[error("processing error: {0}")]
    ProcessingError(ErrorMessage),

    /// Malformed input (invalid value, bad predicate). Not retried; surfaced
    /// as a 400-class error by the ingress collaborator.
    #[error("validation error: {0}")]
    ValidationError(String),

    /// Unknown command kind or protocol version. Not retried; fatal for the
    /// connection that produced it.
    #[error("protocol error: {0}")]
    ProtocolError(String),
}

impl RouteError {
    /// Builds a [`RouteError::CommunicationError`] from any `std::error::Error`.
    pub fn communication(source: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::CommunicationError(Box::new(source))
    }

    /// §7/§4.8: only `MissingRoute` and `CommunicationError` are retryable.
    /// `ProcessingError` and `ValidationError` reflect a decision already
    /// made by the remote, and `ProtocolError` is fatal for the connection.
    #[must_use]
    pub fn retryable(&self) -> bool {
        matches!(self, Self::MissingRoute(_) | Self::CommunicationError(_))
    }
}

//! Error types for the watch engine.

use docwatch_protocol::{CodecError, ProtocolError, Status, StatusCode, TargetId};
use thiserror::Error;

/// Result type for watch operations.
pub type WatchResult<T> = Result<T, WatchError>;

/// Errors that can occur while watching queries.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum WatchError {
    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the stream can be reopened.
        retryable: bool,
    },

    /// The stream ended with a server status.
    #[error("stream closed with {0}")]
    Stream(Status),

    /// The server refused or dropped a target (permission denied, invalid
    /// argument and similar).
    #[error("target {target_id} rejected: {status}")]
    TargetRejected {
        /// Rejected target.
        target_id: TargetId,
        /// Server status.
        status: Status,
    },

    /// Local and server document counts kept disagreeing after resets.
    #[error("existence filter mismatch on target {target_id}: expected {expected}, found {actual}")]
    ExistenceFilterMismatch {
        /// Affected target.
        target_id: TargetId,
        /// Server count.
        expected: usize,
        /// Local count.
        actual: usize,
    },

    /// The engine is shutting down.
    #[error("shutdown in progress")]
    ShutdownInProgress,

    /// Graceful shutdown was refused because listeners are still registered.
    #[error("{active} listeners are still registered")]
    StillListening {
        /// Number of active listeners.
        active: usize,
    },

    /// Protocol error (bad document or message).
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Codec error.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// The query cannot be watched.
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    /// The listen was cancelled.
    #[error("listen cancelled")]
    Cancelled,

    /// No Tokio runtime to run the stream on.
    #[error("no tokio runtime available")]
    NoRuntime,
}

impl WatchError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Returns true if the stream should be reopened after this error.
    pub fn is_retryable(&self) -> bool {
        match self {
            WatchError::Transport { retryable, .. } => *retryable,
            WatchError::Stream(status) => status.is_retryable(),
            _ => false,
        }
    }

    /// Returns true if the server asked clients to back off as far as they can.
    pub fn is_resource_exhausted(&self) -> bool {
        matches!(self, WatchError::Stream(status) if status.code == StatusCode::ResourceExhausted)
    }
}

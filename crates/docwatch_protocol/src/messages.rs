//! Watch stream messages.
//!
//! The client sends [`ListenRequest`]s to add and remove targets; the server
//! answers with a sequence of [`RawChange`]s.

use crate::path::DocumentKey;
use crate::query::QueryTarget;
use bytes::Bytes;
use docwatch_codec::Timestamp;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Locally assigned id of a watch target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TargetId(i32);

impl TargetId {
    /// Wraps a raw id.
    pub const fn new(id: i32) -> Self {
        Self(id)
    }

    /// The raw id.
    pub const fn get(self) -> i32 {
        self.0
    }
}

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Server status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StatusCode {
    /// Not an error.
    Ok,
    /// The operation was cancelled.
    Cancelled,
    /// Unknown error.
    Unknown,
    /// The client sent an invalid argument.
    InvalidArgument,
    /// Deadline expired before completion.
    DeadlineExceeded,
    /// Entity not found.
    NotFound,
    /// Entity already exists.
    AlreadyExists,
    /// The caller may not perform this operation.
    PermissionDenied,
    /// A quota or rate limit was hit.
    ResourceExhausted,
    /// The system is not in the required state.
    FailedPrecondition,
    /// The operation was aborted.
    Aborted,
    /// Out of range.
    OutOfRange,
    /// Not implemented.
    Unimplemented,
    /// Internal error.
    Internal,
    /// The service is temporarily unavailable.
    Unavailable,
    /// Unrecoverable data loss.
    DataLoss,
    /// Missing or invalid credentials.
    Unauthenticated,
}

/// A server status: code plus message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    /// Status code.
    pub code: StatusCode,
    /// Human-readable description.
    pub message: String,
}

impl Status {
    /// Creates a status.
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Whether a stream that failed with this status should be reopened.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.code,
            StatusCode::Cancelled
                | StatusCode::Unknown
                | StatusCode::DeadlineExceeded
                | StatusCode::ResourceExhausted
                | StatusCode::Internal
                | StatusCode::Unavailable
                | StatusCode::Unauthenticated
        )
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)
    }
}

/// Client-to-server message.
#[derive(Debug, Clone, PartialEq)]
pub enum ListenRequest {
    /// Start watching a target.
    AddTarget {
        /// Target id.
        target_id: TargetId,
        /// The translated query.
        query: QueryTarget,
        /// Where to resume from; `None` asks for a full initial result set.
        resume_token: Option<Bytes>,
    },
    /// Stop watching a target.
    RemoveTarget {
        /// Target id.
        target_id: TargetId,
    },
}

impl ListenRequest {
    /// The target this request is about.
    pub fn target_id(&self) -> TargetId {
        match self {
            ListenRequest::AddTarget { target_id, .. } | ListenRequest::RemoveTarget { target_id } => {
                *target_id
            }
        }
    }
}

/// Server-to-client message.
#[derive(Debug, Clone, PartialEq)]
pub enum RawChange {
    /// The server accepted a target.
    TargetAdded {
        /// Target id.
        target_id: TargetId,
    },
    /// The server stopped watching a target. With a cause, the target failed.
    TargetRemoved {
        /// Target id.
        target_id: TargetId,
        /// Why it was removed.
        cause: Option<Status>,
    },
    /// A document was added or updated.
    DocumentChanged {
        /// Document key.
        key: DocumentKey,
        /// Encoded document, read by a `DocumentDecoder`.
        data: Bytes,
        /// Revision of this version.
        update_time: Timestamp,
        /// Targets this document now matches.
        target_ids: Vec<TargetId>,
        /// Targets this document no longer matches.
        removed_target_ids: Vec<TargetId>,
    },
    /// A document was deleted or left the given targets.
    DocumentRemoved {
        /// Document key.
        key: DocumentKey,
        /// Affected targets.
        target_ids: Vec<TargetId>,
    },
    /// Everything sent so far for a target forms a consistent result set.
    TargetConsistent {
        /// Target id.
        target_id: TargetId,
        /// Token to resume the target from this point.
        resume_token: Bytes,
        /// Time the result set is consistent at.
        read_time: Timestamp,
    },
    /// The server will resend the target's full result set.
    TargetReset {
        /// Target id.
        target_id: TargetId,
    },
    /// The server's document count for a target. A differing local count
    /// means deletes were missed.
    ExistenceFilterMismatch {
        /// Target id.
        target_id: TargetId,
        /// Number of documents the server holds for the target.
        expected_count: usize,
    },
}

impl RawChange {
    /// Targets this message is addressed to.
    pub fn target_ids(&self) -> Vec<TargetId> {
        match self {
            RawChange::TargetAdded { target_id }
            | RawChange::TargetRemoved { target_id, .. }
            | RawChange::TargetConsistent { target_id, .. }
            | RawChange::TargetReset { target_id }
            | RawChange::ExistenceFilterMismatch { target_id, .. } => vec![*target_id],
            RawChange::DocumentChanged {
                target_ids,
                removed_target_ids,
                ..
            } => target_ids
                .iter()
                .chain(removed_target_ids)
                .copied()
                .collect(),
            RawChange::DocumentRemoved { target_ids, .. } => target_ids.clone(),
        }
    }
}

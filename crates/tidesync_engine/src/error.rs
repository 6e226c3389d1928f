//! Error types for the sync engine.

use thiserror::Error;
use tidesync_protocol::{CodecError, ConflictId, ErrorKind, ErrorReply};
use tidesync_store::StoreError;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// Protocol error (invalid or unexpected message).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The server refused the request.
    #[error("server rejected request ({kind:?}): {message}")]
    Rejected {
        /// Failure category reported by the server.
        kind: ErrorKind,
        /// Server-provided detail.
        message: String,
    },

    /// Local record store error.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Codec error.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// Durable client state could not be read or written.
    #[error("persistence error: {0}")]
    Persistence(String),

    /// No pending conflict with this id.
    #[error("unknown conflict {0}")]
    UnknownConflict(ConflictId),

    /// Local record does not exist or is deleted.
    #[error("record {collection}/{record_id} not found")]
    RecordNotFound {
        /// Collection name.
        collection: String,
        /// Record id.
        record_id: String,
    },

    /// A local edit was refused before it reached the queue.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// Timeout.
    #[error("operation timed out")]
    Timeout,

    /// Not connected.
    #[error("not connected to server")]
    NotConnected,
}

impl SyncError {
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

    /// Creates a record-not-found error.
    pub fn record_not_found(collection: impl Into<String>, record_id: impl Into<String>) -> Self {
        Self::RecordNotFound {
            collection: collection.into(),
            record_id: record_id.into(),
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport { retryable, .. } => *retryable,
            SyncError::Timeout => true,
            SyncError::Rejected { kind, .. } => *kind == ErrorKind::Internal,
            _ => false,
        }
    }

    /// Returns true if this error aborts a sync cycle.
    ///
    /// Retryable errors during push only requeue the affected changes.
    pub fn is_fatal(&self) -> bool {
        !self.is_retryable()
    }

    /// Returns true if the server reported the conflict's record as deleted.
    pub fn is_record_deleted(&self) -> bool {
        matches!(
            self,
            SyncError::Rejected {
                kind: ErrorKind::RecordDeleted,
                ..
            }
        )
    }
}

impl From<ErrorReply> for SyncError {
    fn from(reply: ErrorReply) -> Self {
        SyncError::Rejected {
            kind: reply.kind,
            message: reply.message,
        }
    }
}

/// Errors returned by the apply engine for a single change.
#[derive(Error, Debug)]
pub enum ApplyError {
    /// The change is malformed and will never succeed.
    #[error("invalid change: {0}")]
    Validation(String),

    /// The target record does not exist for this principal.
    #[error("record {collection}/{record_id} not found")]
    NotFound {
        /// Collection name.
        collection: String,
        /// Record id.
        record_id: String,
    },

    /// Compare-and-set kept losing to concurrent writers.
    #[error("record {collection}/{record_id} is under heavy contention")]
    Contention {
        /// Collection name.
        collection: String,
        /// Record id.
        record_id: String,
    },

    /// Underlying store failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Errors returned by the conflict resolver.
#[derive(Error, Debug)]
pub enum ResolveError {
    /// The conflict's record was deleted; the conflict is moot.
    #[error("record {collection}/{record_id} was deleted")]
    RecordDeleted {
        /// Collection name.
        collection: String,
        /// Record id.
        record_id: String,
    },

    /// The conflict has already been resolved.
    #[error("conflict {0} is already resolved")]
    AlreadyResolved(ConflictId),

    /// Compare-and-set kept losing to concurrent writers.
    #[error("record {collection}/{record_id} is under heavy contention")]
    Contention {
        /// Collection name.
        collection: String,
        /// Record id.
        record_id: String,
    },

    /// Underlying store failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

//! Error types for the sync server.

use thiserror::Error;
use tidesync_protocol::{CodecError, ErrorKind, ErrorReply};
use tidesync_store::StoreError;

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors that can occur in the sync server.
#[derive(Error, Debug)]
pub enum ServerError {
    /// Invalid request format.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Authentication failed.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Authorization failed.
    #[error("not authorized: {0}")]
    NotAuthorized(String),

    /// The addressed conflict or record does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The conflict's record was deleted.
    #[error("record {collection}/{record_id} was deleted")]
    RecordDeleted {
        /// Collection name.
        collection: String,
        /// Record id.
        record_id: String,
    },

    /// Malformed request body.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// Record store error.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Internal server error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ServerError {
    /// Returns true if this is a client error (4xx).
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            ServerError::InvalidRequest(_)
                | ServerError::AuthenticationFailed(_)
                | ServerError::NotAuthorized(_)
                | ServerError::NotFound(_)
                | ServerError::RecordDeleted { .. }
                | ServerError::Codec(_)
        )
    }

    /// Returns true if this is a server error (5xx).
    pub fn is_server_error(&self) -> bool {
        matches!(self, ServerError::Store(_) | ServerError::Internal(_))
    }

    /// Converts the error into the reply sent to the client.
    pub fn to_reply(&self) -> ErrorReply {
        let kind = match self {
            ServerError::InvalidRequest(_) | ServerError::Codec(_) => ErrorKind::InvalidRequest,
            ServerError::AuthenticationFailed(_) | ServerError::NotAuthorized(_) => {
                ErrorKind::Unauthorized
            }
            ServerError::NotFound(_) => ErrorKind::NotFound,
            ServerError::RecordDeleted { .. } => ErrorKind::RecordDeleted,
            ServerError::Store(_) | ServerError::Internal(_) => ErrorKind::Internal,
        };
        ErrorReply::new(kind, self.to_string())
    }
}

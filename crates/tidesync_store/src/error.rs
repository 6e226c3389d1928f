//! Error types for record store operations.

use std::io;
use thiserror::Error;

/// Result type for record store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur in a record store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A stored record could not be decoded.
    #[error("store corrupted: {0}")]
    Corrupted(String),

    /// A record was handed to the wrong collection or had an empty key.
    #[error("invalid record key: {0}")]
    InvalidKey(String),

    /// The store is not available.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

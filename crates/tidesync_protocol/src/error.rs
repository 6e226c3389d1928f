//! Codec error types.

use thiserror::Error;

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// Errors raised while encoding or decoding wire messages.
#[derive(Error, Debug)]
pub enum CodecError {
    /// Serialization to CBOR failed.
    #[error("encode failed: {0}")]
    Encode(String),

    /// Bytes were not valid CBOR for the expected type.
    #[error("decode failed: {0}")]
    Decode(String),

    /// Message decoded but carries the wrong shape for the endpoint.
    #[error("unexpected message: expected {expected}, got {actual}")]
    UnexpectedMessage {
        /// Expected message name.
        expected: &'static str,
        /// Received message name.
        actual: &'static str,
    },
}

//! # TideSync Protocol
//!
//! Data model, wire messages and CBOR codec for TideSync.
//!
//! This crate provides:
//! - `SyncableRecord` for the replicated record shape
//! - `Change` for client-side intents awaiting server acknowledgement
//! - `Conflict` and `ResolutionStrategy` for concurrent-write handling
//! - `SyncCursor` for per-collection sync watermarks
//! - Protocol messages (changes, apply, resolve, full dataset, health)
//! - CBOR encoding/decoding
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod change;
mod codec;
mod conflict;
mod cursor;
mod error;
mod messages;
mod outcome;
mod record;
mod types;

pub use change::{Change, ChangeDraft, ChangeKind};
pub use codec::{from_cbor, to_cbor};
pub use conflict::{Conflict, ResolutionState, ResolutionStrategy};
pub use cursor::SyncCursor;
pub use error::{CodecError, CodecResult};
pub use messages::{
    ApplyChangesRequest, ApplyChangesResponse, ChangesRequest, ChangesResponse, Envelope,
    ErrorKind, ErrorReply, FullDatasetRequest, ResolveConflictRequest, ResolveConflictResponse,
    SyncHealth, SyncHealthRequest, SyncMessage,
};
pub use outcome::{ApplyOutcome, ApplyResult, ChangeError, ChangeErrorKind};
pub use record::{merge_fields, SyncableRecord, RESERVED_FIELDS};
pub use types::{ChangeId, ConflictId, Document, PrincipalId, Timestamp};

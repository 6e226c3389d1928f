//! Protocol messages for sync.

use crate::change::Change;
use crate::codec::{from_cbor, to_cbor};
use crate::conflict::{Conflict, ResolutionStrategy};
use crate::error::CodecResult;
use crate::outcome::{ApplyResult, ChangeError};
use crate::record::SyncableRecord;
use crate::types::{ConflictId, PrincipalId, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A sync protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "body", rename_all = "camelCase")]
pub enum SyncMessage {
    /// Request for changes since a watermark.
    ChangesRequest(ChangesRequest),
    /// Changed records plus the server watermark.
    ChangesResponse(ChangesResponse),
    /// Batch of client changes to apply.
    ApplyChangesRequest(ApplyChangesRequest),
    /// Per-change results of an apply batch.
    ApplyChangesResponse(ApplyChangesResponse),
    /// Conflict resolution request.
    ResolveConflictRequest(ResolveConflictRequest),
    /// Resolved record.
    ResolveConflictResponse(ResolveConflictResponse),
    /// Bootstrap request for a new device.
    FullDatasetRequest(FullDatasetRequest),
    /// Health query.
    SyncHealthRequest(SyncHealthRequest),
    /// Health report.
    SyncHealth(SyncHealth),
    /// Request-level failure.
    Error(ErrorReply),
}

impl SyncMessage {
    /// Returns the message name.
    pub fn name(&self) -> &'static str {
        match self {
            SyncMessage::ChangesRequest(_) => "ChangesRequest",
            SyncMessage::ChangesResponse(_) => "ChangesResponse",
            SyncMessage::ApplyChangesRequest(_) => "ApplyChangesRequest",
            SyncMessage::ApplyChangesResponse(_) => "ApplyChangesResponse",
            SyncMessage::ResolveConflictRequest(_) => "ResolveConflictRequest",
            SyncMessage::ResolveConflictResponse(_) => "ResolveConflictResponse",
            SyncMessage::FullDatasetRequest(_) => "FullDatasetRequest",
            SyncMessage::SyncHealthRequest(_) => "SyncHealthRequest",
            SyncMessage::SyncHealth(_) => "SyncHealth",
            SyncMessage::Error(_) => "Error",
        }
    }

    /// Returns the principal a request acts for. Responses carry none.
    pub fn principal(&self) -> Option<&PrincipalId> {
        match self {
            SyncMessage::ChangesRequest(r) => Some(&r.principal),
            SyncMessage::ApplyChangesRequest(r) => Some(&r.principal),
            SyncMessage::ResolveConflictRequest(r) => Some(&r.principal),
            SyncMessage::FullDatasetRequest(r) => Some(&r.principal),
            SyncMessage::SyncHealthRequest(r) => Some(&r.principal),
            _ => None,
        }
    }

    /// Returns the HTTP path this request is posted to, if it is a request.
    pub fn endpoint(&self) -> Option<&'static str> {
        match self {
            SyncMessage::ChangesRequest(_) => Some("/sync/changes"),
            SyncMessage::ApplyChangesRequest(_) => Some("/sync/apply"),
            SyncMessage::ResolveConflictRequest(_) => Some("/sync/resolve"),
            SyncMessage::FullDatasetRequest(_) => Some("/sync/full"),
            SyncMessage::SyncHealthRequest(_) => Some("/sync/health"),
            _ => None,
        }
    }
}

/// Category of a request-level failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    /// Malformed or oversized request.
    InvalidRequest,
    /// Missing or invalid credential, or principal mismatch.
    Unauthorized,
    /// Referenced conflict does not exist.
    NotFound,
    /// The conflict's record was deleted; the conflict has been dropped.
    RecordDeleted,
    /// Server-side failure; the request may be retried.
    Internal,
}

/// Body of [`SyncMessage::Error`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReply {
    /// Failure category.
    pub kind: ErrorKind,
    /// Human-readable detail.
    pub message: String,
}

impl ErrorReply {
    /// Creates an error reply.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// A request message plus the caller's bearer credential.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Opaque bearer credential.
    pub credential: Option<Vec<u8>>,
    /// The wrapped message.
    pub message: SyncMessage,
}

impl Envelope {
    /// Wraps a message.
    pub fn new(credential: Option<Vec<u8>>, message: SyncMessage) -> Self {
        Self {
            credential,
            message,
        }
    }

    /// Encodes to CBOR.
    pub fn encode(&self) -> CodecResult<Vec<u8>> {
        to_cbor(self)
    }

    /// Decodes from CBOR.
    pub fn decode(bytes: &[u8]) -> CodecResult<Self> {
        from_cbor(bytes)
    }
}

/// `GET changes?principal=&collections=&since=`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangesRequest {
    /// Requesting principal.
    pub principal: PrincipalId,
    /// Collections to scan.
    pub collections: Vec<String>,
    /// Exclusive lower bound.
    pub since: Timestamp,
}

impl ChangesRequest {
    /// Creates a changes request.
    pub fn new(principal: PrincipalId, collections: Vec<String>, since: Timestamp) -> Self {
        Self {
            principal,
            collections,
            since,
        }
    }
}

/// Records per collection plus the server watermark.
///
/// Also the response shape of the full-dataset bootstrap.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangesResponse {
    /// Current record state per collection.
    pub records: BTreeMap<String, Vec<SyncableRecord>>,
    /// Server watermark to store as the next `since`.
    pub sync_timestamp: Timestamp,
}

impl ChangesResponse {
    /// Creates a response.
    pub fn new(records: BTreeMap<String, Vec<SyncableRecord>>, sync_timestamp: Timestamp) -> Self {
        Self {
            records,
            sync_timestamp,
        }
    }

    /// Total number of records across collections.
    pub fn record_count(&self) -> usize {
        self.records.values().map(Vec::len).sum()
    }

    /// Returns true if no records were returned.
    pub fn is_empty(&self) -> bool {
        self.record_count() == 0
    }
}

/// `POST applyChanges`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyChangesRequest {
    /// Principal the changes are applied for.
    pub principal: PrincipalId,
    /// Changes in queue order.
    pub changes: Vec<Change>,
}

impl ApplyChangesRequest {
    /// Creates an apply request.
    pub fn new(principal: PrincipalId, changes: Vec<Change>) -> Self {
        Self { principal, changes }
    }
}

/// Result of an apply batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyChangesResponse {
    /// Terminal results, including conflicts and duplicates.
    pub applied: Vec<ApplyResult>,
    /// Conflicts detected in this batch.
    pub conflicts: Vec<Conflict>,
    /// Per-change failures.
    pub errors: Vec<ChangeError>,
}

/// `POST resolveConflict`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolveConflictRequest {
    /// Principal resolving the conflict.
    pub principal: PrincipalId,
    /// Conflict to resolve.
    pub conflict_id: ConflictId,
    /// Chosen strategy (and optional user value).
    pub strategy: ResolutionStrategy,
}

/// The resolved record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolveConflictResponse {
    /// Server record after resolution.
    pub record: SyncableRecord,
}

/// `GET fullDataset?principal=&collections=`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FullDatasetRequest {
    /// Requesting principal.
    pub principal: PrincipalId,
    /// Collections to snapshot.
    pub collections: Vec<String>,
}

/// `GET syncHealth?principal=`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncHealthRequest {
    /// Principal to report on.
    pub principal: PrincipalId,
}

/// Staleness report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncHealth {
    /// Last successful sync, if any.
    pub last_sync_time: Option<Timestamp>,
    /// Hours since the last successful sync.
    pub hours_old: Option<f64>,
    /// Whether the staleness threshold has been crossed.
    pub needs_sync: bool,
}

impl SyncHealth {
    /// Builds a report from the last sync time and a staleness threshold.
    pub fn evaluate(last_sync_time: Option<Timestamp>, now: Timestamp, stale_after_ms: i64) -> Self {
        match last_sync_time {
            Some(last) => {
                let age = now.saturating_sub(last).max(0);
                Self {
                    last_sync_time: Some(last),
                    hours_old: Some(age as f64 / 3_600_000.0),
                    needs_sync: age >= stale_after_ms,
                }
            }
            None => Self {
                last_sync_time: None,
                hours_old: None,
                needs_sync: true,
            },
        }
    }
}

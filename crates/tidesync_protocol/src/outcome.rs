//! Per-change results reported by the apply endpoint.

use crate::change::Change;
use crate::record::SyncableRecord;
use crate::types::ChangeId;
use serde::{Deserialize, Serialize};

/// Terminal result of applying one change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ApplyOutcome {
    /// A new record was stored.
    Created,
    /// An existing record was overwritten.
    Updated,
    /// An existing record was tombstoned.
    Deleted,
    /// The change was already reflected; nothing was written.
    Duplicate,
    /// The record changed after the client's base; nothing was written.
    Conflict,
}

impl ApplyOutcome {
    /// Returns true if the change can be acknowledged and removed from the queue.
    pub fn acknowledges(&self) -> bool {
        !matches!(self, ApplyOutcome::Conflict)
    }
}

/// Result entry for one change in an apply batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyResult {
    /// The change this result belongs to.
    pub change_id: ChangeId,
    /// What happened.
    pub outcome: ApplyOutcome,
    /// Server record after the change, when one exists.
    pub record: Option<SyncableRecord>,
}

/// Category of a per-change failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ChangeErrorKind {
    /// Malformed change; dropped, never retried.
    Validation,
    /// Target record no longer exists; dropped, never retried.
    NotFound,
    /// Network or server hiccup; the change stays queued.
    Transient,
}

impl ChangeErrorKind {
    /// Returns true if the change should stay queued.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ChangeErrorKind::Transient)
    }
}

/// A per-change failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeError {
    /// The failing change.
    pub change_id: ChangeId,
    /// Collection of the change.
    pub collection: String,
    /// Record of the change.
    pub record_id: String,
    /// Failure category.
    pub kind: ChangeErrorKind,
    /// Human-readable detail.
    pub message: String,
}

impl ChangeError {
    /// Creates an error entry for `change`.
    pub fn new(change: &Change, kind: ChangeErrorKind, message: impl Into<String>) -> Self {
        Self {
            change_id: change.id,
            collection: change.collection.clone(),
            record_id: change.record_id.clone(),
            kind,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_conflicts_stay_unacknowledged() {
        assert!(ApplyOutcome::Created.acknowledges());
        assert!(ApplyOutcome::Duplicate.acknowledges());
        assert!(!ApplyOutcome::Conflict.acknowledges());
    }

    #[test]
    fn error_retryability() {
        assert!(ChangeErrorKind::Transient.is_retryable());
        assert!(!ChangeErrorKind::NotFound.is_retryable());
        assert!(!ChangeErrorKind::Validation.is_retryable());
    }
}

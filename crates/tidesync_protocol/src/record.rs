//! The replicated record shape.

use crate::types::{Document, PrincipalId, Timestamp};
use serde::{Deserialize, Serialize};

/// Field names that carry record metadata and are never merged into `data`.
pub const RESERVED_FIELDS: &[&str] = &["id", "owner", "createdAt", "updatedAt", "tombstoned"];

/// A record that participates in synchronization.
///
/// The server copy is the system of record. `updated_at` never decreases for
/// a given record and is assigned by whichever side commits the write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncableRecord {
    /// Collection the record belongs to.
    pub collection: String,
    /// Record identifier, unique within its collection.
    pub id: String,
    /// Principal that owns the record.
    pub owner: PrincipalId,
    /// User fields.
    pub data: Document,
    /// Last modification time.
    pub updated_at: Timestamp,
    /// Creation time.
    pub created_at: Timestamp,
    /// Soft-delete marker.
    pub tombstoned: bool,
}

impl SyncableRecord {
    /// Creates a live record whose creation and update times are both `at`.
    pub fn new(
        collection: impl Into<String>,
        id: impl Into<String>,
        owner: PrincipalId,
        data: Document,
        at: Timestamp,
    ) -> Self {
        Self {
            collection: collection.into(),
            id: id.into(),
            owner,
            data,
            updated_at: at,
            created_at: at,
            tombstoned: false,
        }
    }

    /// Returns true if the record was modified or created after `since`.
    pub fn changed_since(&self, since: Timestamp) -> bool {
        self.updated_at > since || self.created_at > since
    }

    /// Returns a copy with `patch` merged into the data and a new update time.
    pub fn patched(&self, patch: &Document, updated_at: Timestamp) -> Self {
        let mut next = self.clone();
        merge_fields(&mut next.data, patch);
        next.updated_at = updated_at;
        next
    }

    /// Returns a tombstoned copy stamped with `updated_at`.
    pub fn tombstone(&self, updated_at: Timestamp) -> Self {
        let mut next = self.clone();
        next.tombstoned = true;
        next.updated_at = updated_at;
        next
    }
}

/// Shallow field overwrite: fields in `patch` replace those in `target`,
/// fields absent from `patch` are preserved. Reserved metadata keys are skipped.
pub fn merge_fields(target: &mut Document, patch: &Document) {
    for (key, value) in patch {
        if RESERVED_FIELDS.contains(&key.as_str()) {
            continue;
        }
        target.insert(key.clone(), value.clone());
    }
}

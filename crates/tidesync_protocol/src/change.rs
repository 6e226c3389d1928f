//! Client-side change intents.

use crate::types::{ChangeId, Document, Timestamp};
use serde::{Deserialize, Serialize};

/// Kind of change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    /// Record was created.
    Create,
    /// Record fields were overwritten.
    Update,
    /// Record was deleted.
    Delete,
}

impl ChangeKind {
    /// Converts to a numeric code.
    pub fn to_code(&self) -> u8 {
        match self {
            ChangeKind::Create => 1,
            ChangeKind::Update => 2,
            ChangeKind::Delete => 3,
        }
    }

    /// Converts from a numeric code.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(ChangeKind::Create),
            2 => Some(ChangeKind::Update),
            3 => Some(ChangeKind::Delete),
            _ => None,
        }
    }

    /// Returns true if this kind carries a payload.
    pub fn requires_payload(&self) -> bool {
        !matches!(self, ChangeKind::Delete)
    }
}

/// A change not yet stamped by the change queue.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeDraft {
    /// Kind of change.
    pub kind: ChangeKind,
    /// Target collection.
    pub collection: String,
    /// Target record.
    pub record_id: String,
    /// Fields to write (Create/Update).
    pub payload: Option<Document>,
    /// `updated_at` the client observed before the edit; zero for Create.
    pub client_base_timestamp: Timestamp,
}

impl ChangeDraft {
    /// Creates a draft for a new record.
    pub fn create(
        collection: impl Into<String>,
        record_id: impl Into<String>,
        payload: Document,
    ) -> Self {
        Self {
            kind: ChangeKind::Create,
            collection: collection.into(),
            record_id: record_id.into(),
            payload: Some(payload),
            client_base_timestamp: 0,
        }
    }

    /// Creates a draft overwriting fields of an existing record.
    pub fn update(
        collection: impl Into<String>,
        record_id: impl Into<String>,
        payload: Document,
        base: Timestamp,
    ) -> Self {
        Self {
            kind: ChangeKind::Update,
            collection: collection.into(),
            record_id: record_id.into(),
            payload: Some(payload),
            client_base_timestamp: base,
        }
    }

    /// Creates a draft deleting a record.
    pub fn delete(
        collection: impl Into<String>,
        record_id: impl Into<String>,
        base: Timestamp,
    ) -> Self {
        Self {
            kind: ChangeKind::Delete,
            collection: collection.into(),
            record_id: record_id.into(),
            payload: None,
            client_base_timestamp: base,
        }
    }

    /// Stamps the draft with a queue identifier and enqueue time.
    pub fn into_change(self, id: ChangeId, enqueued_at: Timestamp) -> Change {
        Change {
            id,
            kind: self.kind,
            collection: self.collection,
            record_id: self.record_id,
            payload: self.payload,
            client_base_timestamp: self.client_base_timestamp,
            enqueued_at,
        }
    }
}

/// A client-side intent not yet confirmed by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Change {
    /// Queue-assigned identifier.
    pub id: ChangeId,
    /// Kind of change.
    pub kind: ChangeKind,
    /// Target collection.
    pub collection: String,
    /// Target record.
    pub record_id: String,
    /// Fields to write (Create/Update).
    pub payload: Option<Document>,
    /// `updated_at` the client observed before the edit; zero for Create.
    pub client_base_timestamp: Timestamp,
    /// When the change entered the queue.
    pub enqueued_at: Timestamp,
}

impl Change {
    /// Returns true if this change targets the given record.
    pub fn targets(&self, collection: &str, record_id: &str) -> bool {
        self.collection == collection && self.record_id == record_id
    }

    /// Checks the change is well formed.
    pub fn validate(&self) -> Result<(), String> {
        if self.collection.trim().is_empty() {
            return Err("collection must not be empty".into());
        }
        if self.record_id.trim().is_empty() {
            return Err("record id must not be empty".into());
        }
        if self.kind.requires_payload() && self.payload.is_none() {
            return Err(format!("{:?} change requires a payload", self.kind));
        }
        if self.client_base_timestamp < 0 {
            return Err("base timestamp must not be negative".into());
        }
        Ok(())
    }

    /// Returns the number of payload fields.
    pub fn payload_len(&self) -> usize {
        self.payload.as_ref().map(|p| p.len()).unwrap_or(0)
    }
}

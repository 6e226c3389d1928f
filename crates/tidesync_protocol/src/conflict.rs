//! Conflict records and resolution strategies.

use crate::types::{ConflictId, Document, PrincipalId, Timestamp};
use serde::{Deserialize, Serialize};

/// Whether a conflict still needs a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ResolutionState {
    /// Awaiting resolution.
    Pending,
    /// Resolved; no longer surfaced.
    Resolved,
}

/// A concurrent modification detected while applying a change.
///
/// Created when the server's `updated_at` for a record is newer than the
/// `client_base_timestamp` of the incoming change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conflict {
    /// Conflict identifier.
    pub id: ConflictId,
    /// Principal whose change conflicted.
    pub owner: PrincipalId,
    /// Collection of the record.
    pub collection: String,
    /// Record identifier.
    pub record_id: String,
    /// Field in dispute, when narrower than the whole record.
    pub field: Option<String>,
    /// Server data at detection time.
    pub server_value: Document,
    /// Payload of the rejected local change.
    pub local_value: Document,
    /// Server `updated_at` that triggered the conflict.
    pub server_updated_at: Timestamp,
    /// When the conflict was detected.
    pub detected_at: Timestamp,
    /// Resolution state.
    pub resolution_state: ResolutionState,
}

impl Conflict {
    /// Creates a pending whole-record conflict.
    pub fn new(
        owner: PrincipalId,
        collection: impl Into<String>,
        record_id: impl Into<String>,
        server_value: Document,
        local_value: Document,
        server_updated_at: Timestamp,
        detected_at: Timestamp,
    ) -> Self {
        Self {
            id: ConflictId::generate(),
            owner,
            collection: collection.into(),
            record_id: record_id.into(),
            field: None,
            server_value,
            local_value,
            server_updated_at,
            detected_at,
            resolution_state: ResolutionState::Pending,
        }
    }

    /// Returns true if the conflict has been resolved.
    pub fn is_resolved(&self) -> bool {
        self.resolution_state == ResolutionState::Resolved
    }

    /// Marks the conflict resolved.
    pub fn mark_resolved(&mut self) {
        self.resolution_state = ResolutionState::Resolved;
    }

    /// Returns true if this conflict concerns the given record.
    pub fn concerns(&self, collection: &str, record_id: &str) -> bool {
        self.collection == collection && self.record_id == record_id
    }
}

/// How to settle a conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", content = "userValue", rename_all = "lowercase")]
pub enum ResolutionStrategy {
    /// Discard the local change and keep the server state.
    Server,
    /// Re-apply the local payload on top of the current server record.
    Client,
    /// Overlay the given fields (or the local payload when absent) on the
    /// current server record.
    Merge(Option<Document>),
}

impl ResolutionStrategy {
    /// Returns the strategy name used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            ResolutionStrategy::Server => "server",
            ResolutionStrategy::Client => "client",
            ResolutionStrategy::Merge(_) => "merge",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: serde_json::Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn new_conflict_is_pending() {
        let mut conflict = Conflict::new(
            PrincipalId::new("u"),
            "notes",
            "n1",
            doc(json!({"name": "Y"})),
            doc(json!({"name": "Z"})),
            200,
            250,
        );
        assert!(!conflict.is_resolved());
        assert!(conflict.concerns("notes", "n1"));
        assert!(conflict.field.is_none());

        conflict.mark_resolved();
        assert!(conflict.is_resolved());
    }

    #[test]
    fn strategy_wire_shape() {
        let merge = ResolutionStrategy::Merge(Some(doc(json!({"note": "kept"}))));
        let value = serde_json::to_value(&merge).unwrap();
        assert_eq!(value["strategy"], json!("merge"));
        assert_eq!(value["userValue"]["note"], json!("kept"));

        let server = serde_json::to_value(ResolutionStrategy::Server).unwrap();
        assert_eq!(server["strategy"], json!("server"));
        assert_eq!(ResolutionStrategy::Client.name(), "client");
    }
}

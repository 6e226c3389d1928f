//! Per-collection sync watermark.

use crate::types::{PrincipalId, Timestamp};
use serde::{Deserialize, Serialize};

/// Timestamp up to which a principal's collection has been reconciled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncCursor {
    /// Principal the cursor belongs to.
    pub principal: PrincipalId,
    /// Collection the cursor tracks.
    pub collection: String,
    /// Watermark of the last completed cycle.
    pub last_sync_timestamp: Timestamp,
}

impl SyncCursor {
    /// Creates a cursor at the given watermark.
    pub fn new(principal: PrincipalId, collection: impl Into<String>, at: Timestamp) -> Self {
        Self {
            principal,
            collection: collection.into(),
            last_sync_timestamp: at,
        }
    }

    /// Moves the watermark forward. Never moves it backwards.
    ///
    /// Returns true if the watermark changed.
    pub fn advance(&mut self, to: Timestamp) -> bool {
        if to > self.last_sync_timestamp {
            self.last_sync_timestamp = to;
            true
        } else {
            false
        }
    }

    /// Time elapsed since the watermark, in milliseconds.
    pub fn staleness_millis(&self, now: Timestamp) -> i64 {
        now.saturating_sub(self.last_sync_timestamp).max(0)
    }
}

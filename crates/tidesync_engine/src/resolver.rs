//! Conflict resolution and the pending conflict log.

use crate::error::ResolveError;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tidesync_protocol::{
    Conflict, ConflictId, Document, PrincipalId, ResolutionStrategy, SyncableRecord,
};
use tidesync_store::{CasOutcome, Clock, RecordStore};
use tracing::debug;

const MAX_CAS_ATTEMPTS: usize = 16;

/// Settles conflicts against the authoritative store.
pub struct ConflictResolver<S: RecordStore, C: Clock> {
    store: Arc<S>,
    clock: C,
}

impl<S: RecordStore, C: Clock> ConflictResolver<S, C> {
    /// Creates a resolver over `store`.
    pub fn new(store: Arc<S>, clock: C) -> Self {
        Self { store, clock }
    }

    /// Writes the outcome of `strategy` and returns the resolved record.
    ///
    /// The current server record is always re-read, so fields written after
    /// the conflict was detected survive unless the strategy overlays them.
    /// The result's `updated_at` is strictly greater than both the current
    /// record's and `conflict.server_updated_at`.
    pub fn resolve(
        &self,
        conflict: &Conflict,
        strategy: &ResolutionStrategy,
    ) -> Result<SyncableRecord, ResolveError> {
        if conflict.is_resolved() {
            return Err(ResolveError::AlreadyResolved(conflict.id));
        }

        let overlay: Option<&Document> = match strategy {
            ResolutionStrategy::Server => None,
            ResolutionStrategy::Client => Some(&conflict.local_value),
            ResolutionStrategy::Merge(user) => Some(user.as_ref().unwrap_or(&conflict.local_value)),
        };

        for _ in 0..MAX_CAS_ATTEMPTS {
            let current = match self.store.get(&conflict.collection, &conflict.record_id)? {
                Some(r) if !r.tombstoned => r,
                _ => return Err(deleted(conflict)),
            };

            let at = self
                .clock
                .now()
                .max(current.updated_at.saturating_add(1))
                .max(conflict.server_updated_at.saturating_add(1));
            let next = match overlay {
                Some(patch) => current.patched(patch, at),
                None => {
                    let mut kept = current.clone();
                    kept.updated_at = at;
                    kept
                }
            };

            match self.store.compare_and_set(next.clone(), current.updated_at)? {
                CasOutcome::Stored => {
                    debug!(
                        conflict_id = %conflict.id,
                        collection = %conflict.collection,
                        record_id = %conflict.record_id,
                        strategy = strategy.name(),
                        "conflict resolved"
                    );
                    return Ok(next);
                }
                CasOutcome::Stale(_) => continue,
                CasOutcome::Missing => return Err(deleted(conflict)),
            }
        }
        Err(ResolveError::Contention {
            collection: conflict.collection.clone(),
            record_id: conflict.record_id.clone(),
        })
    }
}

fn deleted(conflict: &Conflict) -> ResolveError {
    ResolveError::RecordDeleted {
        collection: conflict.collection.clone(),
        record_id: conflict.record_id.clone(),
    }
}

/// Unresolved conflicts, kept until resolved or their record is deleted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConflictLog {
    conflicts: Vec<Conflict>,
}

impl ConflictLog {
    /// Creates an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds a log from persisted conflicts, dropping resolved ones.
    pub fn from_conflicts(conflicts: Vec<Conflict>) -> Self {
        Self {
            conflicts: conflicts.into_iter().filter(|c| !c.is_resolved()).collect(),
        }
    }

    /// Adds a conflict. A newer conflict replaces an older one for the same
    /// owner and record.
    pub fn record(&mut self, conflict: Conflict) {
        self.conflicts.retain(|c| {
            !(c.owner == conflict.owner && c.concerns(&conflict.collection, &conflict.record_id))
        });
        self.conflicts.push(conflict);
    }

    /// Returns pending conflicts, optionally only those of `owner`.
    pub fn pending(&self, owner: Option<&PrincipalId>) -> Vec<Conflict> {
        self.conflicts
            .iter()
            .filter(|c| owner.map_or(true, |o| c.owner == *o))
            .cloned()
            .collect()
    }

    /// Looks up a pending conflict.
    pub fn get(&self, id: ConflictId) -> Option<&Conflict> {
        self.conflicts.iter().find(|c| c.id == id)
    }

    /// Removes a conflict and returns it marked resolved.
    pub fn mark_resolved(&mut self, id: ConflictId) -> Option<Conflict> {
        let index = self.conflicts.iter().position(|c| c.id == id)?;
        let mut conflict = self.conflicts.remove(index);
        conflict.mark_resolved();
        Some(conflict)
    }

    /// Removes a conflict without resolving it.
    pub fn discard(&mut self, id: ConflictId) -> Option<Conflict> {
        let index = self.conflicts.iter().position(|c| c.id == id)?;
        Some(self.conflicts.remove(index))
    }

    /// Drops every conflict for a deleted record.
    pub fn discard_for_record(&mut self, collection: &str, record_id: &str) -> Vec<Conflict> {
        let (dropped, kept) = std::mem::take(&mut self.conflicts)
            .into_iter()
            .partition(|c| c.concerns(collection, record_id));
        self.conflicts = kept;
        dropped
    }

    /// Returns the number of pending conflicts.
    pub fn len(&self) -> usize {
        self.conflicts.len()
    }

    /// Returns true if nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.conflicts.is_empty()
    }

    /// Returns the pending conflicts in detection order.
    pub fn as_slice(&self) -> &[Conflict] {
        &self.conflicts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tidesync_protocol::Timestamp;
    use tidesync_store::{ManualClock, MemoryRecordStore};

    fn doc(value: serde_json::Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    fn alice() -> PrincipalId {
        PrincipalId::new("alice")
    }

    fn setup(data: Document, at: Timestamp, now: Timestamp) -> ConflictResolver<MemoryRecordStore, ManualClock> {
        let store = MemoryRecordStore::new();
        store
            .put(SyncableRecord::new("items", "r1", alice(), data, at))
            .unwrap();
        ConflictResolver::new(Arc::new(store), ManualClock::new(now))
    }

    fn conflict(server: Document, local: Document, server_updated_at: Timestamp) -> Conflict {
        Conflict::new(alice(), "items", "r1", server, local, server_updated_at, server_updated_at)
    }

    #[test]
    fn merge_with_user_value_preserves_server_fields() {
        let server = doc(json!({"name": "Y", "price": 5}));
        let resolver = setup(server.clone(), 200, 210);
        let c = conflict(server, doc(json!({"name": "X"})), 200);

        let user = doc(json!({"name": "Z", "note": "kept"}));
        let record = resolver
            .resolve(&c, &ResolutionStrategy::Merge(Some(user)))
            .unwrap();
        assert_eq!(record.data, doc(json!({"name": "Z", "note": "kept", "price": 5})));
        assert!(record.updated_at > 200);
        assert_eq!(record.created_at, 200);
    }

    #[test]
    fn client_strategy_overlays_local_payload() {
        let server = doc(json!({"name": "Y", "price": 5}));
        let resolver = setup(server.clone(), 200, 150);
        let c = conflict(server, doc(json!({"name": "X"})), 200);

        let record = resolver.resolve(&c, &ResolutionStrategy::Client).unwrap();
        assert_eq!(record.data, doc(json!({"name": "X", "price": 5})));
        // Clock behind the record still yields a newer timestamp.
        assert_eq!(record.updated_at, 201);
    }

    #[test]
    fn server_strategy_keeps_current_data() {
        let server = doc(json!({"name": "Y"}));
        let resolver = setup(server.clone(), 200, 500);
        let c = conflict(server.clone(), doc(json!({"name": "X"})), 200);

        let record = resolver.resolve(&c, &ResolutionStrategy::Server).unwrap();
        assert_eq!(record.data, server);
        assert_eq!(record.updated_at, 500);
    }

    #[test]
    fn merge_without_user_value_uses_local() {
        let server = doc(json!({"a": 1, "b": 1}));
        let resolver = setup(server.clone(), 200, 300);
        let c = conflict(server, doc(json!({"b": 2})), 200);

        let record = resolver.resolve(&c, &ResolutionStrategy::Merge(None)).unwrap();
        assert_eq!(record.data, doc(json!({"a": 1, "b": 2})));
    }

    #[test]
    fn deleted_record_cannot_be_resolved() {
        let server = doc(json!({"a": 1}));
        let resolver = setup(server.clone(), 200, 300);
        let current = resolver.store.get("items", "r1").unwrap().unwrap();
        resolver.store.put(current.tombstone(250)).unwrap();

        let c = conflict(server, doc(json!({"a": 2})), 200);
        assert!(matches!(
            resolver.resolve(&c, &ResolutionStrategy::Client),
            Err(ResolveError::RecordDeleted { .. })
        ));
    }

    #[test]
    fn resolved_conflicts_are_refused() {
        let server = doc(json!({"a": 1}));
        let resolver = setup(server.clone(), 200, 300);
        let mut c = conflict(server, doc(json!({"a": 2})), 200);
        c.mark_resolved();
        assert!(matches!(
            resolver.resolve(&c, &ResolutionStrategy::Server),
            Err(ResolveError::AlreadyResolved(_))
        ));
    }

    #[test]
    fn log_replaces_older_conflict_for_same_record() {
        let mut log = ConflictLog::new();
        let first = conflict(Document::new(), Document::new(), 100);
        let second = conflict(Document::new(), Document::new(), 200);
        let second_id = second.id;
        log.record(first);
        log.record(second);

        assert_eq!(log.len(), 1);
        assert_eq!(log.get(second_id).unwrap().server_updated_at, 200);
    }

    #[test]
    fn log_filters_by_owner_and_discards_by_record() {
        let mut log = ConflictLog::new();
        log.record(conflict(Document::new(), Document::new(), 100));
        log.record(Conflict::new(
            PrincipalId::new("bob"),
            "items",
            "r2",
            Document::new(),
            Document::new(),
            100,
            100,
        ));

        assert_eq!(log.pending(Some(&alice())).len(), 1);
        assert_eq!(log.pending(None).len(), 2);

        let dropped = log.discard_for_record("items", "r1");
        assert_eq!(dropped.len(), 1);
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn mark_resolved_removes_from_pending() {
        let mut log = ConflictLog::new();
        let c = conflict(Document::new(), Document::new(), 100);
        let id = c.id;
        log.record(c);

        let resolved = log.mark_resolved(id).unwrap();
        assert!(resolved.is_resolved());
        assert!(log.is_empty());
        assert!(log.mark_resolved(id).is_none());
    }

    #[test]
    fn restore_skips_resolved() {
        let mut resolved = conflict(Document::new(), Document::new(), 100);
        resolved.mark_resolved();
        let log = ConflictLog::from_conflicts(vec![resolved]);
        assert!(log.is_empty());
    }
}

//! Applies changes to a record store.
//!
//! The same engine runs on both sides: the server applies pushed changes
//! with conflict detection, and the client cache applies pulled records with
//! the local-apply rule.

use crate::error::ApplyError;
use crate::fetcher::Visibility;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tidesync_protocol::{
    merge_fields, ApplyOutcome, ApplyResult, Change, ChangeId, ChangeKind, Conflict, Document,
    PrincipalId, SyncableRecord, Timestamp,
};
use tidesync_store::{CasOutcome, Clock, InsertOutcome, RecordStore, StoreResult};
use tracing::debug;

/// Upper bound on compare-and-set retries for one change.
const MAX_CAS_ATTEMPTS: usize = 16;

/// Result of applying one change.
#[derive(Debug, Clone, PartialEq)]
pub enum Applied {
    /// A new record was stored.
    Created(SyncableRecord),
    /// An existing record was overwritten.
    Updated(SyncableRecord),
    /// An existing record was tombstoned.
    Deleted(SyncableRecord),
    /// Nothing to do; carries the current record when the principal may see it.
    Duplicate(Option<SyncableRecord>),
    /// The record moved past the change's base; nothing was written.
    Conflict {
        /// The detected conflict.
        conflict: Conflict,
        /// The record as it currently stands.
        current: SyncableRecord,
    },
}

impl Applied {
    /// Returns the wire outcome.
    pub fn outcome(&self) -> ApplyOutcome {
        match self {
            Applied::Created(_) => ApplyOutcome::Created,
            Applied::Updated(_) => ApplyOutcome::Updated,
            Applied::Deleted(_) => ApplyOutcome::Deleted,
            Applied::Duplicate(_) => ApplyOutcome::Duplicate,
            Applied::Conflict { .. } => ApplyOutcome::Conflict,
        }
    }

    /// Returns the record after the change, if any.
    pub fn record(&self) -> Option<&SyncableRecord> {
        match self {
            Applied::Created(r) | Applied::Updated(r) | Applied::Deleted(r) => Some(r),
            Applied::Duplicate(r) => r.as_ref(),
            Applied::Conflict { current, .. } => Some(current),
        }
    }

    /// Splits into the wire result and the conflict, if one was detected.
    pub fn into_result(self, change_id: ChangeId) -> (ApplyResult, Option<Conflict>) {
        let outcome = self.outcome();
        let (record, conflict) = match self {
            Applied::Created(r) | Applied::Updated(r) | Applied::Deleted(r) => (Some(r), None),
            Applied::Duplicate(r) => (r, None),
            Applied::Conflict { conflict, current } => (Some(current), Some(conflict)),
        };
        (
            ApplyResult {
                change_id,
                outcome,
                record,
            },
            conflict,
        )
    }
}

/// What happened to a pulled record in the local cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pulled {
    /// The pulled record replaced the cached copy.
    Overwritten,
    /// A newer local edit is pending; the cached copy was kept.
    ShadowedByLocal,
}

/// The identity of an update that was written to a record.
#[derive(Debug, Clone, PartialEq)]
struct WrittenUpdate {
    change_id: ChangeId,
    base: Timestamp,
    enqueued_at: Timestamp,
    payload: Document,
}

impl WrittenUpdate {
    fn of(change: &Change, payload: &Document) -> Self {
        Self {
            change_id: change.id,
            base: change.client_base_timestamp,
            enqueued_at: change.enqueued_at,
            payload: payload.clone(),
        }
    }
}

/// Last update each principal wrote, per (collection, record id).
type UpdateLedger = HashMap<(String, String), HashMap<PrincipalId, WrittenUpdate>>;

/// Applies changes to a [`RecordStore`].
pub struct ApplyEngine<S: RecordStore, C: Clock> {
    store: Arc<S>,
    clock: C,
    visibility: Visibility,
    written: Mutex<UpdateLedger>,
}

impl<S: RecordStore, C: Clock> ApplyEngine<S, C> {
    /// Creates an engine over `store` stamping writes with `clock`.
    pub fn new(store: Arc<S>, clock: C) -> Self {
        Self {
            store,
            clock,
            visibility: Visibility::private(),
            written: Mutex::new(HashMap::new()),
        }
    }

    /// Sets the visibility rules.
    pub fn with_visibility(mut self, visibility: Visibility) -> Self {
        self.visibility = visibility;
        self
    }

    /// Returns the underlying store.
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Returns a timestamp strictly greater than `prev` and not behind the clock.
    pub fn next_timestamp(&self, prev: Timestamp) -> Timestamp {
        self.clock.now().max(prev.saturating_add(1))
    }

    /// Applies one change on behalf of `principal`.
    pub fn apply(&self, principal: &PrincipalId, change: &Change) -> Result<Applied, ApplyError> {
        change.validate().map_err(ApplyError::Validation)?;

        let applied = match change.kind {
            ChangeKind::Create => self.apply_create(principal, change)?,
            ChangeKind::Update => self.apply_update(principal, change)?,
            ChangeKind::Delete => self.apply_delete(principal, change)?,
        };
        debug!(
            change_id = %change.id,
            collection = %change.collection,
            record_id = %change.record_id,
            outcome = ?applied.outcome(),
            "applied change"
        );
        Ok(applied)
    }

    fn apply_create(
        &self,
        principal: &PrincipalId,
        change: &Change,
    ) -> Result<Applied, ApplyError> {
        let mut data = Document::new();
        if let Some(payload) = &change.payload {
            merge_fields(&mut data, payload);
        }
        let record = SyncableRecord::new(
            change.collection.clone(),
            change.record_id.clone(),
            principal.clone(),
            data,
            self.clock.now(),
        );

        match self.store.insert_new(record.clone())? {
            InsertOutcome::Inserted => Ok(Applied::Created(record)),
            InsertOutcome::Exists(existing) => Ok(Applied::Duplicate(
                self.visibility
                    .can_see(principal, &existing)
                    .then_some(existing),
            )),
        }
    }

    fn apply_update(
        &self,
        principal: &PrincipalId,
        change: &Change,
    ) -> Result<Applied, ApplyError> {
        let empty = Document::new();
        let patch = change.payload.as_ref().unwrap_or(&empty);

        for _ in 0..MAX_CAS_ATTEMPTS {
            let current = match self.store.get(&change.collection, &change.record_id)? {
                Some(r) if !r.tombstoned && self.visibility.can_see(principal, &r) => r,
                _ => return Err(not_found(change)),
            };

            if current.updated_at > change.client_base_timestamp {
                if self.was_written(principal, change, patch) {
                    debug!(change_id = %change.id, "replayed update");
                    return Ok(Applied::Duplicate(Some(current)));
                }
                let conflict = Conflict::new(
                    principal.clone(),
                    change.collection.clone(),
                    change.record_id.clone(),
                    current.data.clone(),
                    patch.clone(),
                    current.updated_at,
                    self.clock.now(),
                );
                return Ok(Applied::Conflict { conflict, current });
            }

            let next = current.patched(patch, self.next_timestamp(current.updated_at));
            match self.store.compare_and_set(next.clone(), current.updated_at)? {
                CasOutcome::Stored => {
                    self.written
                        .lock()
                        .entry((change.collection.clone(), change.record_id.clone()))
                        .or_default()
                        .insert(principal.clone(), WrittenUpdate::of(change, patch));
                    return Ok(Applied::Updated(next));
                }
                CasOutcome::Stale(_) => continue,
                CasOutcome::Missing => return Err(not_found(change)),
            }
        }
        Err(ApplyError::Contention {
            collection: change.collection.clone(),
            record_id: change.record_id.clone(),
        })
    }

    fn apply_delete(
        &self,
        principal: &PrincipalId,
        change: &Change,
    ) -> Result<Applied, ApplyError> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let current = match self.store.get(&change.collection, &change.record_id)? {
                Some(r) if self.visibility.can_see(principal, &r) => r,
                _ => return Ok(Applied::Duplicate(None)),
            };
            if current.tombstoned {
                return Ok(Applied::Duplicate(Some(current)));
            }

            let next = current.tombstone(self.next_timestamp(current.updated_at));
            match self.store.compare_and_set(next.clone(), current.updated_at)? {
                CasOutcome::Stored => {
                    self.written
                        .lock()
                        .remove(&(change.collection.clone(), change.record_id.clone()));
                    return Ok(Applied::Deleted(next));
                }
                CasOutcome::Stale(_) => continue,
                CasOutcome::Missing => return Ok(Applied::Duplicate(None)),
            }
        }
        Err(ApplyError::Contention {
            collection: change.collection.clone(),
            record_id: change.record_id.clone(),
        })
    }

    /// Returns true if `change` is the last update `principal` wrote to the
    /// record, i.e. a resend after the response was lost.
    fn was_written(&self, principal: &PrincipalId, change: &Change, patch: &Document) -> bool {
        let key = (change.collection.clone(), change.record_id.clone());
        self.written
            .lock()
            .get(&key)
            .and_then(|by_principal| by_principal.get(principal))
            .is_some_and(|last| *last == WrittenUpdate::of(change, patch))
    }

    /// Writes a pulled record into a client cache.
    ///
    /// `latest_local_edit` is the newest `enqueued_at` of the record's pending
    /// changes. A pending edit newer than the pulled `updated_at` wins and the
    /// cached copy is kept; otherwise the server copy overwrites it.
    pub fn apply_pulled(
        &self,
        record: SyncableRecord,
        latest_local_edit: Option<Timestamp>,
    ) -> StoreResult<Pulled> {
        if latest_local_edit.is_some_and(|at| at > record.updated_at) {
            return Ok(Pulled::ShadowedByLocal);
        }
        self.store.put(record)?;
        Ok(Pulled::Overwritten)
    }
}

fn not_found(change: &Change) -> ApplyError {
    ApplyError::NotFound {
        collection: change.collection.clone(),
        record_id: change.record_id.clone(),
    }
}

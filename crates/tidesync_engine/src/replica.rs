//! The client-side replica: record cache, change queue, cursors and conflicts.
//!
//! Local edits go through [`LocalReplica`]: they update the cache right away
//! and enqueue a change for the next sync. The cache keeps the server-observed
//! `updated_at` of each record so follow-up edits carry the right base.

use crate::apply::{ApplyEngine, Pulled};
use crate::config::RetryConfig;
use crate::error::{SyncError, SyncResult};
use crate::persist::{ClientSnapshot, MemoryStateStore, StateStore, SNAPSHOT_VERSION};
use crate::queue::{ChangeQueue, EnqueueOutcome};
use crate::resolver::ConflictLog;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tidesync_protocol::{
    merge_fields, Change, ChangeDraft, ChangeId, Conflict, ConflictId, Document, PrincipalId,
    SyncCursor, SyncableRecord, Timestamp,
};
use tidesync_store::{Clock, MemoryRecordStore, RecordStore};
use tracing::debug;
use uuid::Uuid;

struct ReplicaState {
    queue: ChangeQueue,
    conflicts: ConflictLog,
    cursors: BTreeMap<String, SyncCursor>,
}

/// A principal's offline-capable copy of its records.
pub struct LocalReplica {
    principal: PrincipalId,
    clock: Arc<dyn Clock>,
    cache: ApplyEngine<MemoryRecordStore, Arc<dyn Clock>>,
    // Lock order: `state` before the cache's internal lock.
    state: Mutex<ReplicaState>,
    state_store: Box<dyn StateStore>,
}

impl LocalReplica {
    /// Opens a replica, restoring whatever `state_store` holds.
    pub fn open(
        principal: PrincipalId,
        clock: Arc<dyn Clock>,
        state_store: Box<dyn StateStore>,
    ) -> SyncResult<Self> {
        let snapshot = state_store
            .load()?
            .unwrap_or_else(|| ClientSnapshot::empty(principal.clone()));
        if snapshot.principal != principal {
            return Err(SyncError::Persistence(format!(
                "state belongs to {}, not {}",
                snapshot.principal, principal
            )));
        }

        let store = MemoryRecordStore::from_records(snapshot.records)?;
        let cursors = snapshot
            .cursors
            .into_iter()
            .map(|c| (c.collection.clone(), c))
            .collect();

        debug!(
            principal = %principal,
            records = store.len(),
            pending = snapshot.queue.entries.len(),
            "replica opened"
        );

        Ok(Self {
            cache: ApplyEngine::new(Arc::new(store), Arc::clone(&clock)),
            principal,
            clock,
            state: Mutex::new(ReplicaState {
                queue: ChangeQueue::restore(snapshot.queue),
                conflicts: ConflictLog::from_conflicts(snapshot.conflicts.as_slice().to_vec()),
                cursors,
            }),
            state_store,
        })
    }

    /// Creates an empty replica that is not persisted anywhere.
    pub fn in_memory(principal: PrincipalId, clock: Arc<dyn Clock>) -> Self {
        Self {
            cache: ApplyEngine::new(Arc::new(MemoryRecordStore::new()), Arc::clone(&clock)),
            principal,
            clock,
            state: Mutex::new(ReplicaState {
                queue: ChangeQueue::new(),
                conflicts: ConflictLog::new(),
                cursors: BTreeMap::new(),
            }),
            state_store: Box::new(MemoryStateStore::new()),
        }
    }

    /// Returns the principal this replica belongs to.
    pub fn principal(&self) -> &PrincipalId {
        &self.principal
    }

    /// Returns the replica's current time.
    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    fn store(&self) -> &MemoryRecordStore {
        self.cache.store()
    }

    // ---- local edits ----

    /// Creates a record with a generated id.
    pub fn create(&self, collection: &str, data: Document) -> SyncResult<SyncableRecord> {
        self.create_with_id(collection, &Uuid::new_v4().to_string(), data)
    }

    /// Creates a record with a caller-chosen id.
    pub fn create_with_id(
        &self,
        collection: &str,
        id: &str,
        data: Document,
    ) -> SyncResult<SyncableRecord> {
        let mut state = self.state.lock();
        if self.store().get(collection, id)?.is_some() {
            return Err(SyncError::InvalidOperation(format!(
                "record {collection}/{id} already exists"
            )));
        }

        let now = self.now();
        let mut fields = Document::new();
        merge_fields(&mut fields, &data);
        let record = SyncableRecord::new(collection, id, self.principal.clone(), fields, now);
        self.commit_edit(&mut state, Some(record.clone()), |queue, _| {
            queue.enqueue(ChangeDraft::create(collection, id, data), now);
        })?;
        Ok(record)
    }

    /// Overwrites fields of a live record.
    pub fn update(&self, collection: &str, id: &str, patch: Document) -> SyncResult<SyncableRecord> {
        let mut state = self.state.lock();
        let cached = self.live(collection, id)?;

        // The cached `updated_at` stays at the server-observed value: it is
        // the base of this edit.
        let mut next = cached.clone();
        merge_fields(&mut next.data, &patch);

        let now = self.now();
        self.commit_edit(&mut state, Some(next.clone()), |queue, _| {
            queue.enqueue(
                ChangeDraft::update(collection, id, patch, cached.updated_at),
                now,
            );
        })?;
        Ok(next)
    }

    /// Deletes a live record.
    pub fn delete(&self, collection: &str, id: &str) -> SyncResult<()> {
        let mut state = self.state.lock();
        let cached = self.live(collection, id)?;

        let base = cached.updated_at;
        let mut dead = cached;
        dead.tombstoned = true;

        let now = self.now();
        self.commit_edit(&mut state, Some(dead), |queue, conflicts| {
            let outcome = queue.enqueue(ChangeDraft::delete(collection, id, base), now);
            if outcome == EnqueueOutcome::Cancelled {
                debug!(collection, record_id = id, "offline create cancelled by delete");
            }
            conflicts.discard_for_record(collection, id);
        })
    }

    fn live(&self, collection: &str, id: &str) -> SyncResult<SyncableRecord> {
        match self.store().get(collection, id)? {
            Some(record) if !record.tombstoned => Ok(record),
            _ => Err(SyncError::record_not_found(collection, id)),
        }
    }

    /// Returns a live record.
    pub fn get(&self, collection: &str, id: &str) -> SyncResult<Option<SyncableRecord>> {
        Ok(self
            .store()
            .get(collection, id)?
            .filter(|r| !r.tombstoned))
    }

    /// Returns every live record of a collection, ordered by id.
    pub fn list(&self, collection: &str) -> SyncResult<Vec<SyncableRecord>> {
        let mut records: Vec<_> = self
            .store()
            .scan(collection)?
            .into_iter()
            .filter(|r| !r.tombstoned)
            .collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(records)
    }

    // ---- introspection ----

    /// Returns queued changes in push order.
    pub fn pending_changes(&self) -> Vec<Change> {
        self.state.lock().queue.peek_pending(None)
    }

    /// Returns the number of queued changes.
    pub fn pending_count(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Returns unresolved conflicts.
    pub fn pending_conflicts(&self) -> Vec<Conflict> {
        self.state.lock().conflicts.pending(None)
    }

    /// Looks up an unresolved conflict.
    pub fn conflict(&self, id: ConflictId) -> Option<Conflict> {
        self.state.lock().conflicts.get(id).cloned()
    }

    /// Returns the cursor of a collection.
    pub fn cursor(&self, collection: &str) -> Option<SyncCursor> {
        self.state.lock().cursors.get(collection).cloned()
    }

    /// Returns every cursor.
    pub fn cursors(&self) -> Vec<SyncCursor> {
        self.state.lock().cursors.values().cloned().collect()
    }

    // ---- sync hooks ----

    pub(crate) fn apply_pulled(&self, record: SyncableRecord) -> SyncResult<Pulled> {
        let mut state = self.state.lock();
        let latest = state
            .queue
            .latest_enqueued_at(&record.collection, &record.id);
        let (collection, id, tombstoned) =
            (record.collection.clone(), record.id.clone(), record.tombstoned);

        let pulled = self.cache.apply_pulled(record, latest)?;
        if tombstoned {
            let dropped = state.conflicts.discard_for_record(&collection, &id);
            if !dropped.is_empty() {
                debug!(collection = %collection, record_id = %id, "conflicts dropped for deleted record");
            }
        }
        Ok(pulled)
    }

    pub(crate) fn take_due_batch(
        &self,
        now: Timestamp,
        limit: usize,
        skip: &HashSet<ChangeId>,
    ) -> Vec<Change> {
        self.state.lock().queue.due_batch(now, limit, skip)
    }

    /// Removes an acknowledged change and adopts the server's copy of the record.
    pub(crate) fn acknowledge(&self, change_id: ChangeId, record: Option<SyncableRecord>) -> SyncResult<bool> {
        let mut state = self.state.lock();
        if !state.queue.acknowledge(change_id) {
            return Ok(false);
        }
        let Some(record) = record else {
            return Ok(true);
        };

        state
            .queue
            .rebase(&record.collection, &record.id, record.updated_at);
        if record.tombstoned {
            state
                .conflicts
                .discard_for_record(&record.collection, &record.id);
        }
        self.adopt(&state, record)?;
        Ok(true)
    }

    /// Drops a conflicting change, records the conflict and adopts the
    /// server's copy of the record.
    pub(crate) fn record_conflict(
        &self,
        change_id: ChangeId,
        conflict: Option<Conflict>,
        current: Option<SyncableRecord>,
    ) -> SyncResult<()> {
        let mut state = self.state.lock();
        state.queue.reject(change_id);
        if let Some(conflict) = conflict {
            state.conflicts.record(conflict);
        }
        if let Some(record) = current {
            self.adopt(&state, record)?;
        }
        Ok(())
    }

    /// Writes a server record into the cache.
    ///
    /// While later edits for the record are still queued the cached fields
    /// are kept and only the server metadata is taken over.
    fn adopt(&self, state: &ReplicaState, record: SyncableRecord) -> SyncResult<()> {
        if let Some(adopted) = self.adopted(&state.queue, record)? {
            self.store().put(adopted)?;
        }
        Ok(())
    }

    fn adopted(
        &self,
        queue: &ChangeQueue,
        record: SyncableRecord,
    ) -> SyncResult<Option<SyncableRecord>> {
        if !queue.has_pending_for(&record.collection, &record.id) {
            return Ok(Some(record));
        }
        Ok(self
            .store()
            .get(&record.collection, &record.id)?
            .map(|mut cached| {
                cached.updated_at = record.updated_at;
                cached.created_at = record.created_at;
                cached.owner = record.owner;
                cached
            }))
    }

    pub(crate) fn reject(&self, change_id: ChangeId) -> Option<Change> {
        self.state.lock().queue.reject(change_id)
    }

    pub(crate) fn requeue(&self, change_id: ChangeId, error: &str, retry: &RetryConfig) -> bool {
        let mut state = self.state.lock();
        let attempts = match state.queue.entry(change_id) {
            Some(entry) => entry.attempts.saturating_add(1),
            None => return false,
        };
        let delay = i64::try_from(retry.delay_for_attempt(attempts).as_millis()).unwrap_or(i64::MAX);
        let retry_at = self.now().saturating_add(delay);
        state.queue.requeue(change_id, error, retry_at)
    }

    pub(crate) fn release_in_flight(&self) {
        self.state.lock().queue.release_all();
    }

    pub(crate) fn advance_cursor(&self, collection: &str, to: Timestamp) -> bool {
        let mut state = self.state.lock();
        match state.cursors.get_mut(collection) {
            Some(cursor) => cursor.advance(to),
            None => {
                state.cursors.insert(
                    collection.to_string(),
                    SyncCursor::new(self.principal.clone(), collection, to),
                );
                true
            }
        }
    }

    pub(crate) fn conflict_resolved(&self, id: ConflictId, record: SyncableRecord) -> SyncResult<()> {
        let mut state = self.state.lock();
        let adopted = self.adopted(&state.queue, record)?;
        self.commit_edit(&mut state, adopted, |_, conflicts| {
            conflicts.mark_resolved(id);
        })
    }

    pub(crate) fn discard_conflict(&self, id: ConflictId) -> SyncResult<()> {
        let mut state = self.state.lock();
        if state.conflicts.get(id).is_none() {
            return Ok(());
        }
        self.commit_edit(&mut state, None, |_, conflicts| {
            conflicts.discard(id);
        })
    }

    /// Saves the outcome of an edit, then makes it visible.
    ///
    /// `edit` runs on copies of the queue and conflict log, and `record`
    /// replaces its cached counterpart. If the save fails nothing changes.
    fn commit_edit(
        &self,
        state: &mut ReplicaState,
        record: Option<SyncableRecord>,
        edit: impl FnOnce(&mut ChangeQueue, &mut ConflictLog),
    ) -> SyncResult<()> {
        let mut queue = state.queue.clone();
        let mut conflicts = state.conflicts.clone();
        edit(&mut queue, &mut conflicts);

        let mut records = self.store().snapshot();
        if let Some(record) = &record {
            let slot = records
                .iter_mut()
                .find(|r| r.collection == record.collection && r.id == record.id);
            match slot {
                Some(slot) => *slot = record.clone(),
                None => records.push(record.clone()),
            }
        }
        self.state_store
            .save(&self.snapshot_of(records, &queue, &conflicts, &state.cursors))?;

        if let Some(record) = record {
            self.store().put(record)?;
        }
        state.queue = queue;
        state.conflicts = conflicts;
        Ok(())
    }

    /// Saves the replica through its state store.
    pub fn persist(&self) -> SyncResult<()> {
        let state = self.state.lock();
        self.save_locked(&state)
    }

    /// Returns a snapshot of the replica.
    pub fn snapshot(&self) -> ClientSnapshot {
        let state = self.state.lock();
        self.snapshot_locked(&state)
    }

    fn snapshot_locked(&self, state: &ReplicaState) -> ClientSnapshot {
        self.snapshot_of(
            self.store().snapshot(),
            &state.queue,
            &state.conflicts,
            &state.cursors,
        )
    }

    fn snapshot_of(
        &self,
        records: Vec<SyncableRecord>,
        queue: &ChangeQueue,
        conflicts: &ConflictLog,
        cursors: &BTreeMap<String, SyncCursor>,
    ) -> ClientSnapshot {
        ClientSnapshot {
            version: SNAPSHOT_VERSION,
            principal: self.principal.clone(),
            records,
            queue: queue.snapshot(),
            cursors: cursors.values().cloned().collect(),
            conflicts: conflicts.clone(),
            saved_at: self.now(),
        }
    }

    fn save_locked(&self, state: &ReplicaState) -> SyncResult<()> {
        self.state_store.save(&self.snapshot_locked(state))
    }
}

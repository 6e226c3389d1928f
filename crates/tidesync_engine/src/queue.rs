//! Local change queue.
//!
//! Changes are kept in FIFO order per record. Consecutive edits to the same
//! record collapse while they are still waiting to be pushed, so a burst of
//! offline edits costs one round-trip.

use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use tidesync_protocol::{
    merge_fields, Change, ChangeDraft, ChangeId, ChangeKind, Document, Timestamp,
};

/// A queued change plus its delivery bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueEntry {
    /// The change to push.
    pub change: Change,
    /// Failed delivery attempts so far.
    pub attempts: u32,
    /// Last transient error.
    pub last_error: Option<String>,
    /// Earliest time the change may be pushed again.
    pub not_before: Option<Timestamp>,
    #[serde(skip)]
    in_flight: bool,
}

impl QueueEntry {
    fn new(change: Change) -> Self {
        Self {
            change,
            attempts: 0,
            last_error: None,
            not_before: None,
            in_flight: false,
        }
    }

    /// Returns true while the change is part of an unanswered push.
    pub fn is_in_flight(&self) -> bool {
        self.in_flight
    }

    // A change that was sent once may have been applied; it stays as sent.
    fn is_unsent(&self) -> bool {
        !self.in_flight && self.attempts == 0
    }

    fn is_due(&self, now: Timestamp) -> bool {
        self.not_before.map_or(true, |at| at <= now)
    }
}

/// What [`ChangeQueue::enqueue`] did with a draft.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// A new entry was appended.
    Queued(ChangeId),
    /// The draft was merged into an existing pending entry.
    Collapsed(ChangeId),
    /// The draft cancelled a pending create; nothing needs to be pushed.
    Cancelled,
}

impl EnqueueOutcome {
    /// Returns the id of the entry holding the draft, if any.
    pub fn change_id(&self) -> Option<ChangeId> {
        match self {
            EnqueueOutcome::Queued(id) | EnqueueOutcome::Collapsed(id) => Some(*id),
            EnqueueOutcome::Cancelled => None,
        }
    }
}

/// Serializable queue state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueSnapshot {
    /// Entries in push order.
    pub entries: Vec<QueueEntry>,
    /// Next change id to assign.
    pub next_id: u64,
}

/// FIFO queue of local changes awaiting acknowledgement.
#[derive(Debug, Clone)]
pub struct ChangeQueue {
    entries: VecDeque<QueueEntry>,
    next_id: u64,
}

impl Default for ChangeQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl ChangeQueue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self {
            entries: VecDeque::new(),
            next_id: 1,
        }
    }

    /// Rebuilds a queue from a snapshot. Nothing is in flight afterwards.
    pub fn restore(snapshot: QueueSnapshot) -> Self {
        let highest = snapshot
            .entries
            .iter()
            .map(|e| e.change.id.0)
            .max()
            .unwrap_or(0);
        let entries = snapshot
            .entries
            .into_iter()
            .map(|mut entry| {
                entry.in_flight = false;
                entry
            })
            .collect();
        Self {
            entries,
            next_id: snapshot.next_id.max(highest + 1).max(1),
        }
    }

    /// Returns a serializable copy of the queue.
    pub fn snapshot(&self) -> QueueSnapshot {
        QueueSnapshot {
            entries: self.entries.iter().cloned().collect(),
            next_id: self.next_id,
        }
    }

    /// Adds a local edit, collapsing it into pending work for the same record.
    pub fn enqueue(&mut self, draft: ChangeDraft, now: Timestamp) -> EnqueueOutcome {
        match draft.kind {
            ChangeKind::Create => self.append(draft, now),
            ChangeKind::Update => self.enqueue_update(draft, now),
            ChangeKind::Delete => self.enqueue_delete(draft, now),
        }
    }

    fn append(&mut self, draft: ChangeDraft, now: Timestamp) -> EnqueueOutcome {
        let id = ChangeId(self.next_id);
        self.next_id += 1;
        self.entries
            .push_back(QueueEntry::new(draft.into_change(id, now)));
        EnqueueOutcome::Queued(id)
    }

    fn enqueue_update(&mut self, draft: ChangeDraft, now: Timestamp) -> EnqueueOutcome {
        let target = self
            .entries
            .iter_mut()
            .rev()
            .find(|e| e.change.targets(&draft.collection, &draft.record_id))
            .filter(|e| {
                e.is_unsent() && matches!(e.change.kind, ChangeKind::Create | ChangeKind::Update)
            });

        match target {
            Some(entry) => {
                let payload = entry.change.payload.get_or_insert_with(Document::new);
                if let Some(patch) = &draft.payload {
                    merge_fields(payload, patch);
                }
                entry.change.enqueued_at = now;
                EnqueueOutcome::Collapsed(entry.change.id)
            }
            None => self.append(draft, now),
        }
    }

    fn enqueue_delete(&mut self, mut draft: ChangeDraft, now: Timestamp) -> EnqueueOutcome {
        let mut cancelled_create = false;
        let mut base = draft.client_base_timestamp;

        self.entries.retain(|e| {
            let cancellable = e.is_unsent()
                && e.change.kind != ChangeKind::Delete
                && e.change.targets(&draft.collection, &draft.record_id);
            if cancellable {
                match e.change.kind {
                    ChangeKind::Create => cancelled_create = true,
                    _ => base = base.min(e.change.client_base_timestamp),
                }
            }
            !cancellable
        });

        if cancelled_create {
            return EnqueueOutcome::Cancelled;
        }
        draft.client_base_timestamp = base;
        self.append(draft, now)
    }

    /// Returns every queued change in push order, optionally for one collection.
    pub fn peek_pending(&self, collection: Option<&str>) -> Vec<Change> {
        self.entries
            .iter()
            .filter(|e| collection.map_or(true, |c| e.change.collection == c))
            .map(|e| e.change.clone())
            .collect()
    }

    /// Returns the entry for `id`.
    pub fn entry(&self, id: ChangeId) -> Option<&QueueEntry> {
        self.entries.iter().find(|e| e.change.id == id)
    }

    /// Iterates over entries in push order.
    pub fn entries(&self) -> impl Iterator<Item = &QueueEntry> {
        self.entries.iter()
    }

    /// Takes up to `limit` changes that may be pushed now and marks them in flight.
    ///
    /// At most one change per record is returned. If the first queued entry
    /// for a record is in flight, not yet due, or listed in `skip`, every
    /// later entry for that record is withheld as well.
    pub fn due_batch(
        &mut self,
        now: Timestamp,
        limit: usize,
        skip: &HashSet<ChangeId>,
    ) -> Vec<Change> {
        let mut seen: HashSet<(String, String)> = HashSet::new();
        let mut batch = Vec::new();

        for entry in self.entries.iter_mut() {
            if batch.len() >= limit {
                break;
            }
            let key = (
                entry.change.collection.clone(),
                entry.change.record_id.clone(),
            );
            if !seen.insert(key) {
                continue;
            }
            if entry.in_flight || skip.contains(&entry.change.id) || !entry.is_due(now) {
                continue;
            }
            entry.in_flight = true;
            batch.push(entry.change.clone());
        }
        batch
    }

    /// Removes an acknowledged change. Returns false if it was not queued.
    pub fn acknowledge(&mut self, id: ChangeId) -> bool {
        self.remove(id).is_some()
    }

    /// Removes a change after a terminal failure.
    pub fn reject(&mut self, id: ChangeId) -> Option<Change> {
        self.remove(id)
    }

    fn remove(&mut self, id: ChangeId) -> Option<Change> {
        let index = self.entries.iter().position(|e| e.change.id == id)?;
        self.entries.remove(index).map(|e| e.change)
    }

    /// Keeps a change in place after a transient failure.
    ///
    /// Returns false if the change is not queued.
    pub fn requeue(&mut self, id: ChangeId, error: impl Into<String>, retry_at: Timestamp) -> bool {
        match self.entries.iter_mut().find(|e| e.change.id == id) {
            Some(entry) => {
                entry.in_flight = false;
                entry.attempts = entry.attempts.saturating_add(1);
                entry.last_error = Some(error.into());
                entry.not_before = Some(retry_at);
                true
            }
            None => false,
        }
    }

    /// Clears the in-flight mark without counting a failed attempt.
    pub fn release(&mut self, id: ChangeId) {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.change.id == id) {
            entry.in_flight = false;
        }
    }

    /// Clears every in-flight mark.
    pub fn release_all(&mut self) {
        for entry in &mut self.entries {
            entry.in_flight = false;
        }
    }

    /// Moves the base timestamp of a record's remaining changes forward.
    ///
    /// Called after a predecessor was acknowledged with a server-assigned
    /// `updated_at`, so the follow-up edits do not conflict with our own write.
    pub fn rebase(&mut self, collection: &str, record_id: &str, new_base: Timestamp) -> usize {
        let mut moved = 0;
        for entry in &mut self.entries {
            if entry.change.kind != ChangeKind::Create
                && entry.change.targets(collection, record_id)
                && entry.change.client_base_timestamp < new_base
            {
                entry.change.client_base_timestamp = new_base;
                moved += 1;
            }
        }
        moved
    }

    /// Returns true if any change for the record is queued.
    pub fn has_pending_for(&self, collection: &str, record_id: &str) -> bool {
        self.entries
            .iter()
            .any(|e| e.change.targets(collection, record_id))
    }

    /// Returns the newest `enqueued_at` among the record's queued changes.
    pub fn latest_enqueued_at(&self, collection: &str, record_id: &str) -> Option<Timestamp> {
        self.entries
            .iter()
            .filter(|e| e.change.targets(collection, record_id))
            .map(|e| e.change.enqueued_at)
            .max()
    }

    /// Returns the number of queued changes.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

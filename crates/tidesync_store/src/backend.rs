//! Record store adapter trait definition.

use crate::error::StoreResult;
use tidesync_protocol::{SyncableRecord, Timestamp};

/// Result of inserting a record that must not exist yet.
#[derive(Debug, Clone, PartialEq)]
pub enum InsertOutcome {
    /// The record was stored.
    Inserted,
    /// A record with the same key already exists; nothing was written.
    Exists(SyncableRecord),
}

/// Result of a compare-and-set write.
#[derive(Debug, Clone, PartialEq)]
pub enum CasOutcome {
    /// The stored `updated_at` matched and the record was replaced.
    Stored,
    /// Someone else wrote first; carries the current record.
    Stale(SyncableRecord),
    /// The record does not exist.
    Missing,
}

/// A keyed document store holding [`SyncableRecord`]s.
///
/// Stores are addressed by `(collection, id)`. Deletion is soft: a tombstoned
/// record is written back through [`RecordStore::compare_and_set`] and stays
/// visible to [`RecordStore::modified_since`] so deletes propagate.
///
/// # Invariants
///
/// - `compare_and_set` is atomic with respect to every other write
/// - `insert_new` never overwrites an existing record, tombstoned or not
/// - `modified_since` returns records with `updated_at > since` or
///   `created_at > since`
/// - Stores must be `Send + Sync` for concurrent access
///
/// # Implementors
///
/// - [`super::MemoryRecordStore`] - In-process store
pub trait RecordStore: Send + Sync {
    /// Loads a record, tombstoned or not.
    fn get(&self, collection: &str, id: &str) -> StoreResult<Option<SyncableRecord>>;

    /// Stores a record only if its key is unused.
    fn insert_new(&self, record: SyncableRecord) -> StoreResult<InsertOutcome>;

    /// Replaces a record only if its stored `updated_at` equals `expected_updated_at`.
    fn compare_and_set(
        &self,
        record: SyncableRecord,
        expected_updated_at: Timestamp,
    ) -> StoreResult<CasOutcome>;

    /// Stores a record unconditionally.
    ///
    /// Used by client caches, which accept whatever the server says.
    fn put(&self, record: SyncableRecord) -> StoreResult<()>;

    /// Returns every record of `collection` changed after `since`, oldest first.
    fn modified_since(&self, collection: &str, since: Timestamp)
        -> StoreResult<Vec<SyncableRecord>>;

    /// Returns every record of `collection`, tombstones included.
    fn scan(&self, collection: &str) -> StoreResult<Vec<SyncableRecord>>;

    /// Returns the names of collections holding at least one record.
    fn collections(&self) -> StoreResult<Vec<String>>;
}

//! In-memory record store.

use crate::backend::{CasOutcome, InsertOutcome, RecordStore};
use crate::error::{StoreError, StoreResult};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tidesync_protocol::{SyncableRecord, Timestamp};

/// Records of one collection plus a last-modified index.
#[derive(Debug, Default)]
struct Collection {
    records: HashMap<String, SyncableRecord>,
    /// `(max(updated_at, created_at), id)` for every record.
    by_modified: BTreeSet<(Timestamp, String)>,
}

impl Collection {
    fn index_key(record: &SyncableRecord) -> (Timestamp, String) {
        (record.updated_at.max(record.created_at), record.id.clone())
    }

    fn upsert(&mut self, record: SyncableRecord) {
        if let Some(previous) = self.records.get(&record.id) {
            self.by_modified.remove(&Self::index_key(previous));
        }
        self.by_modified.insert(Self::index_key(&record));
        self.records.insert(record.id.clone(), record);
    }

    fn modified_since(&self, since: Timestamp) -> Vec<SyncableRecord> {
        self.by_modified
            .range((since.saturating_add(1), String::new())..)
            .filter_map(|(_, id)| self.records.get(id).cloned())
            .collect()
    }
}

/// A thread-safe in-memory record store.
///
/// Suitable for:
/// - Unit and integration tests
/// - The reference sync server
/// - Client-side record caches (persisted separately as snapshots)
///
/// All writes take a single write lock, which makes
/// [`RecordStore::compare_and_set`] atomic.
#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    collections: RwLock<BTreeMap<String, Collection>>,
}

impl MemoryRecordStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store pre-populated with records.
    pub fn from_records(records: impl IntoIterator<Item = SyncableRecord>) -> StoreResult<Self> {
        let store = Self::new();
        for record in records {
            store.put(record)?;
        }
        Ok(store)
    }

    /// Returns a copy of every record, ordered by collection then id.
    #[must_use]
    pub fn snapshot(&self) -> Vec<SyncableRecord> {
        let collections = self.collections.read();
        let mut out = Vec::new();
        for collection in collections.values() {
            let mut records: Vec<_> = collection.records.values().cloned().collect();
            records.sort_by(|a, b| a.id.cmp(&b.id));
            out.extend(records);
        }
        out
    }

    /// Returns the number of records, tombstones included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.collections
            .read()
            .values()
            .map(|c| c.records.len())
            .sum()
    }

    /// Returns true if the store holds no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_key(record: &SyncableRecord) -> StoreResult<()> {
        if record.collection.is_empty() || record.id.is_empty() {
            return Err(StoreError::InvalidKey(format!(
                "collection={:?} id={:?}",
                record.collection, record.id
            )));
        }
        Ok(())
    }
}

impl RecordStore for MemoryRecordStore {
    fn get(&self, collection: &str, id: &str) -> StoreResult<Option<SyncableRecord>> {
        Ok(self
            .collections
            .read()
            .get(collection)
            .and_then(|c| c.records.get(id))
            .cloned())
    }

    fn insert_new(&self, record: SyncableRecord) -> StoreResult<InsertOutcome> {
        Self::check_key(&record)?;
        let mut collections = self.collections.write();
        let collection = collections.entry(record.collection.clone()).or_default();

        if let Some(existing) = collection.records.get(&record.id) {
            return Ok(InsertOutcome::Exists(existing.clone()));
        }
        collection.upsert(record);
        Ok(InsertOutcome::Inserted)
    }

    fn compare_and_set(
        &self,
        record: SyncableRecord,
        expected_updated_at: Timestamp,
    ) -> StoreResult<CasOutcome> {
        Self::check_key(&record)?;
        let mut collections = self.collections.write();
        let Some(collection) = collections.get_mut(&record.collection) else {
            return Ok(CasOutcome::Missing);
        };

        match collection.records.get(&record.id) {
            None => Ok(CasOutcome::Missing),
            Some(current) if current.updated_at != expected_updated_at => {
                Ok(CasOutcome::Stale(current.clone()))
            }
            Some(_) => {
                collection.upsert(record);
                Ok(CasOutcome::Stored)
            }
        }
    }

    fn put(&self, record: SyncableRecord) -> StoreResult<()> {
        Self::check_key(&record)?;
        self.collections
            .write()
            .entry(record.collection.clone())
            .or_default()
            .upsert(record);
        Ok(())
    }

    fn modified_since(
        &self,
        collection: &str,
        since: Timestamp,
    ) -> StoreResult<Vec<SyncableRecord>> {
        Ok(self
            .collections
            .read()
            .get(collection)
            .map(|c| c.modified_since(since))
            .unwrap_or_default())
    }

    fn scan(&self, collection: &str) -> StoreResult<Vec<SyncableRecord>> {
        Ok(self
            .collections
            .read()
            .get(collection)
            .map(|c| c.records.values().cloned().collect())
            .unwrap_or_default())
    }

    fn collections(&self) -> StoreResult<Vec<String>> {
        Ok(self
            .collections
            .read()
            .iter()
            .filter(|(_, c)| !c.records.is_empty())
            .map(|(name, _)| name.clone())
            .collect())
    }
}

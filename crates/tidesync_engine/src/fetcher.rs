//! Read-only change scans over a record store.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tidesync_protocol::{PrincipalId, SyncableRecord, Timestamp};
use tidesync_store::{RecordStore, StoreResult};

/// Which records a principal may read and write.
///
/// Records are private to their owner unless their collection is shared.
#[derive(Debug, Clone, Default)]
pub struct Visibility {
    shared: BTreeSet<String>,
}

impl Visibility {
    /// Every collection is private to record owners.
    pub fn private() -> Self {
        Self::default()
    }

    /// Marks a collection as visible to every principal.
    pub fn with_shared(mut self, collection: impl Into<String>) -> Self {
        self.shared.insert(collection.into());
        self
    }

    /// Returns true if `collection` is shared.
    pub fn is_shared(&self, collection: &str) -> bool {
        self.shared.contains(collection)
    }

    /// Returns true if `principal` may see `record`.
    pub fn can_see(&self, principal: &PrincipalId, record: &SyncableRecord) -> bool {
        record.owner == *principal || self.is_shared(&record.collection)
    }
}

/// Answers "what changed since T" for a principal.
pub struct RemoteChangeFetcher<S: RecordStore> {
    store: Arc<S>,
    visibility: Visibility,
}

impl<S: RecordStore> RemoteChangeFetcher<S> {
    /// Creates a fetcher over `store`.
    pub fn new(store: Arc<S>, visibility: Visibility) -> Self {
        Self { store, visibility }
    }

    /// Returns the visibility rules in use.
    pub fn visibility(&self) -> &Visibility {
        &self.visibility
    }

    /// Returns every visible record changed after `since`, tombstones included.
    ///
    /// Every requested collection appears in the result, possibly empty.
    pub fn fetch_since(
        &self,
        principal: &PrincipalId,
        collections: &[String],
        since: Timestamp,
    ) -> StoreResult<BTreeMap<String, Vec<SyncableRecord>>> {
        let mut out = BTreeMap::new();
        for collection in collections {
            if out.contains_key(collection) {
                continue;
            }
            let records: Vec<_> = self
                .store
                .modified_since(collection, since)?
                .into_iter()
                .filter(|r| self.visibility.can_see(principal, r))
                .collect();
            out.insert(collection.clone(), records);
        }
        Ok(out)
    }

    /// Returns every live visible record, ordered by id.
    pub fn full_dataset(
        &self,
        principal: &PrincipalId,
        collections: &[String],
    ) -> StoreResult<BTreeMap<String, Vec<SyncableRecord>>> {
        let mut out = BTreeMap::new();
        for collection in collections {
            let mut records: Vec<_> = self
                .store
                .scan(collection)?
                .into_iter()
                .filter(|r| !r.tombstoned && self.visibility.can_see(principal, r))
                .collect();
            records.sort_by(|a, b| a.id.cmp(&b.id));
            out.insert(collection.clone(), records);
        }
        Ok(out)
    }
}

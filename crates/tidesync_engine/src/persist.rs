//! Durable client state.
//!
//! A replica's cache, change queue, cursors and pending conflicts are saved
//! together as one JSON document after every mutation. The file-backed store
//! keeps it in a state directory:
//!
//! ```text
//! <state_dir>/
//! ├─ LOCK              # Advisory lock for single-writer
//! └─ state.json        # Latest snapshot
//! ```

use crate::error::{SyncError, SyncResult};
use crate::queue::QueueSnapshot;
use crate::resolver::ConflictLog;
use fs2::FileExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tidesync_protocol::{PrincipalId, SyncCursor, SyncableRecord, Timestamp};

const LOCK_FILE: &str = "LOCK";
const STATE_FILE: &str = "state.json";
const STATE_TEMP: &str = "state.json.tmp";

/// Current snapshot format version.
pub const SNAPSHOT_VERSION: u32 = 1;

/// Everything a replica needs to survive a restart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientSnapshot {
    /// Snapshot format version.
    pub version: u32,
    /// Principal the replica belongs to.
    pub principal: PrincipalId,
    /// Cached records, tombstones included.
    pub records: Vec<SyncableRecord>,
    /// Pending changes.
    pub queue: QueueSnapshot,
    /// Per-collection sync cursors.
    pub cursors: Vec<SyncCursor>,
    /// Unresolved conflicts.
    pub conflicts: ConflictLog,
    /// When the snapshot was taken.
    pub saved_at: Timestamp,
}

impl ClientSnapshot {
    /// Creates an empty snapshot for `principal`.
    pub fn empty(principal: PrincipalId) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            principal,
            records: Vec::new(),
            queue: QueueSnapshot::default(),
            cursors: Vec::new(),
            conflicts: ConflictLog::new(),
            saved_at: 0,
        }
    }
}

/// Where a replica keeps its snapshot.
pub trait StateStore: Send + Sync {
    /// Loads the latest snapshot, if one was ever saved.
    fn load(&self) -> SyncResult<Option<ClientSnapshot>>;

    /// Replaces the stored snapshot.
    fn save(&self, snapshot: &ClientSnapshot) -> SyncResult<()>;
}

/// Keeps the snapshot in memory. Used by tests and ephemeral replicas.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    snapshot: Mutex<Option<ClientSnapshot>>,
    fail_saves: Mutex<bool>,
}

impl MemoryStateStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store holding `snapshot`.
    pub fn with_snapshot(snapshot: ClientSnapshot) -> Self {
        Self {
            snapshot: Mutex::new(Some(snapshot)),
            fail_saves: Mutex::new(false),
        }
    }

    /// Makes every following save fail, to simulate a full disk.
    pub fn set_fail_saves(&self, fail: bool) {
        *self.fail_saves.lock() = fail;
    }

    /// Returns the last saved snapshot.
    pub fn latest(&self) -> Option<ClientSnapshot> {
        self.snapshot.lock().clone()
    }
}

impl StateStore for MemoryStateStore {
    fn load(&self) -> SyncResult<Option<ClientSnapshot>> {
        Ok(self.snapshot.lock().clone())
    }

    fn save(&self, snapshot: &ClientSnapshot) -> SyncResult<()> {
        if *self.fail_saves.lock() {
            return Err(SyncError::Persistence("state store is read-only".into()));
        }
        *self.snapshot.lock() = Some(snapshot.clone());
        Ok(())
    }
}

/// Keeps the snapshot in a locked state directory.
///
/// Only one `FileStateStore` may hold a directory at a time; a second
/// `open` fails until the first is dropped.
#[derive(Debug)]
pub struct FileStateStore {
    path: PathBuf,
    _lock_file: File,
}

impl FileStateStore {
    /// Opens or creates a state directory and takes its lock.
    pub fn open(path: impl AsRef<Path>) -> SyncResult<Self> {
        let path = path.as_ref();
        fs::create_dir_all(path).map_err(|e| io_error("create state directory", path, e))?;

        let lock_path = path.join(LOCK_FILE);
        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(|e| io_error("open lock file", &lock_path, e))?;

        if lock_file.try_lock_exclusive().is_err() {
            return Err(SyncError::Persistence(format!(
                "state directory {} is locked by another process",
                path.display()
            )));
        }

        Ok(Self {
            path: path.to_path_buf(),
            _lock_file: lock_file,
        })
    }

    /// Returns the state directory.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the snapshot in `path` without taking the lock.
    ///
    /// Writers replace the file atomically, so readers always see a complete
    /// snapshot.
    pub fn read(path: impl AsRef<Path>) -> SyncResult<Option<ClientSnapshot>> {
        let state_path = path.as_ref().join(STATE_FILE);
        if !state_path.exists() {
            return Ok(None);
        }
        let data = fs::read(&state_path).map_err(|e| io_error("read state", &state_path, e))?;
        if data.is_empty() {
            return Ok(None);
        }
        let snapshot: ClientSnapshot = serde_json::from_slice(&data).map_err(|e| {
            SyncError::Persistence(format!("corrupt state file {}: {e}", state_path.display()))
        })?;
        if snapshot.version > SNAPSHOT_VERSION {
            return Err(SyncError::Persistence(format!(
                "state file version {} is newer than supported version {SNAPSHOT_VERSION}",
                snapshot.version
            )));
        }
        Ok(Some(snapshot))
    }

    #[cfg(unix)]
    fn sync_directory(&self) -> SyncResult<()> {
        File::open(&self.path)
            .and_then(|dir| dir.sync_all())
            .map_err(|e| io_error("sync state directory", &self.path, e))
    }

    #[cfg(not(unix))]
    fn sync_directory(&self) -> SyncResult<()> {
        Ok(())
    }
}

impl StateStore for FileStateStore {
    fn load(&self) -> SyncResult<Option<ClientSnapshot>> {
        Self::read(&self.path)
    }

    /// Write-then-rename: the temp file is synced before it replaces the
    /// state file, and the directory is synced after.
    fn save(&self, snapshot: &ClientSnapshot) -> SyncResult<()> {
        let temp_path = self.path.join(STATE_TEMP);
        let state_path = self.path.join(STATE_FILE);

        let data = serde_json::to_vec_pretty(snapshot)
            .map_err(|e| SyncError::Persistence(format!("encode state: {e}")))?;
        let mut file =
            File::create(&temp_path).map_err(|e| io_error("create temp state", &temp_path, e))?;
        file.write_all(&data)
            .and_then(|()| file.sync_all())
            .map_err(|e| io_error("write temp state", &temp_path, e))?;
        drop(file);

        fs::rename(&temp_path, &state_path)
            .map_err(|e| io_error("replace state", &state_path, e))?;
        self.sync_directory()
    }
}

fn io_error(action: &str, path: &Path, error: std::io::Error) -> SyncError {
    SyncError::Persistence(format!("{action} {}: {error}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tidesync_protocol::Document;

    fn snapshot() -> ClientSnapshot {
        let mut snapshot = ClientSnapshot::empty(PrincipalId::new("alice"));
        snapshot.records.push(SyncableRecord::new(
            "notes",
            "n1",
            PrincipalId::new("alice"),
            Document::new(),
            10,
        ));
        snapshot
            .cursors
            .push(SyncCursor::new(PrincipalId::new("alice"), "notes", 10));
        snapshot.saved_at = 11;
        snapshot
    }

    #[test]
    fn memory_store_roundtrip() {
        let store = MemoryStateStore::new();
        assert!(store.load().unwrap().is_none());
        store.save(&snapshot()).unwrap();
        assert_eq!(store.load().unwrap(), Some(snapshot()));

        store.set_fail_saves(true);
        assert!(matches!(
            store.save(&snapshot()),
            Err(SyncError::Persistence(_))
        ));
    }

    #[test]
    fn file_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStateStore::open(dir.path().join("state")).unwrap();
        assert!(store.load().unwrap().is_none());

        store.save(&snapshot()).unwrap();
        store.save(&snapshot()).unwrap();
        assert_eq!(store.load().unwrap(), Some(snapshot()));
        assert!(!store.path().join(STATE_TEMP).exists());

        assert_eq!(
            FileStateStore::read(store.path()).unwrap(),
            Some(snapshot())
        );
    }

    #[test]
    fn file_store_is_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let first = FileStateStore::open(dir.path()).unwrap();
        assert!(matches!(
            FileStateStore::open(dir.path()),
            Err(SyncError::Persistence(_))
        ));
        drop(first);
        assert!(FileStateStore::open(dir.path()).is_ok());
    }

    #[test]
    fn corrupt_state_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(STATE_FILE), b"{not json").unwrap();
        assert!(matches!(
            FileStateStore::read(dir.path()),
            Err(SyncError::Persistence(_))
        ));
    }

    #[test]
    fn newer_versions_are_refused() {
        let dir = tempfile::tempdir().unwrap();
        let mut future = snapshot();
        future.version = SNAPSHOT_VERSION + 1;
        fs::write(
            dir.path().join(STATE_FILE),
            serde_json::to_vec(&future).unwrap(),
        )
        .unwrap();
        assert!(FileStateStore::read(dir.path()).is_err());
    }
}

//! CLI command implementations.

pub mod conflicts;
pub mod inspect;
pub mod queue;

use chrono::{DateTime, Utc};
use std::path::Path;
use tidesync_engine::{ClientSnapshot, FileStateStore};
use tidesync_protocol::Timestamp;
use tracing::debug;

/// Reads the snapshot in a state directory without locking it.
pub(crate) fn load_snapshot(path: &Path) -> Result<ClientSnapshot, Box<dyn std::error::Error>> {
    let snapshot = FileStateStore::read(path)?
        .ok_or_else(|| format!("No client state found at {}", path.display()))?;
    debug!(
        path = %path.display(),
        version = snapshot.version,
        saved_at = snapshot.saved_at,
        "state loaded"
    );
    Ok(snapshot)
}

pub(crate) fn format_timestamp(at: Timestamp) -> String {
    DateTime::<Utc>::from_timestamp_millis(at)
        .map(|t| t.to_rfc3339_opts(chrono::SecondsFormat::Millis, true))
        .unwrap_or_else(|| format!("{at} ms"))
}

pub(crate) fn format_age(millis: i64) -> String {
    let secs = millis.max(0) / 1000;
    if secs < 60 {
        format!("{secs}s")
    } else if secs < 60 * 60 {
        format!("{}m", secs / 60)
    } else if secs < 24 * 60 * 60 {
        format!("{:.1}h", secs as f64 / 3600.0)
    } else {
        format!("{:.1}d", secs as f64 / 86_400.0)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::path::Path;
    use std::sync::Arc;
    use tidesync_engine::{FileStateStore, LocalReplica};
    use tidesync_protocol::PrincipalId;
    use tidesync_store::ManualClock;

    /// Opens a file-backed replica for alice at `now`.
    pub fn replica(dir: &Path, now: i64) -> LocalReplica {
        let store = FileStateStore::open(dir).unwrap();
        LocalReplica::open(
            PrincipalId::new("alice"),
            Arc::new(ManualClock::new(now)),
            Box::new(store),
        )
        .unwrap()
    }
}

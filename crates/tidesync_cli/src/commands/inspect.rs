//! Inspect command implementation.

use super::{format_age, format_timestamp, load_snapshot};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use tidesync_engine::ClientSnapshot;
use tidesync_protocol::Timestamp;

/// State inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// State directory.
    pub path: String,
    /// Principal the replica belongs to.
    pub principal: String,
    /// State format version.
    pub version: u32,
    /// When the state was last saved.
    pub saved_at: Timestamp,
    /// Changes waiting to be pushed.
    pub pending_changes: usize,
    /// Pending changes that already failed at least once.
    pub retrying_changes: usize,
    /// Unresolved conflicts.
    pub pending_conflicts: usize,
    /// Per-collection statistics.
    pub collections: Vec<CollectionStats>,
}

/// Statistics for a single collection.
#[derive(Debug, Default, Serialize)]
pub struct CollectionStats {
    /// Collection name.
    pub name: String,
    /// Live cached records.
    pub records: usize,
    /// Cached tombstones.
    pub tombstones: usize,
    /// Pending changes for the collection.
    pub pending: usize,
    /// Sync cursor, if the collection was ever synced.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor: Option<Timestamp>,
    /// Milliseconds since the cursor's watermark.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub staleness_ms: Option<i64>,
}

/// Runs the inspect command.
pub fn run(path: &Path, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let snapshot = load_snapshot(path)?;
    let now = chrono::Utc::now().timestamp_millis();
    let result = analyze(path, &snapshot, now);

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        _ => {
            print_text_output(&result);
        }
    }

    Ok(())
}

fn analyze(path: &Path, snapshot: &ClientSnapshot, now: Timestamp) -> InspectResult {
    let mut collections: BTreeMap<String, CollectionStats> = BTreeMap::new();

    for record in &snapshot.records {
        let stats = collection(&mut collections, &record.collection);
        if record.tombstoned {
            stats.tombstones += 1;
        } else {
            stats.records += 1;
        }
    }
    for entry in &snapshot.queue.entries {
        collection(&mut collections, &entry.change.collection).pending += 1;
    }
    for cursor in &snapshot.cursors {
        let stats = collection(&mut collections, &cursor.collection);
        stats.cursor = Some(cursor.last_sync_timestamp);
        stats.staleness_ms = Some(now.saturating_sub(cursor.last_sync_timestamp).max(0));
    }

    InspectResult {
        path: path.display().to_string(),
        principal: snapshot.principal.to_string(),
        version: snapshot.version,
        saved_at: snapshot.saved_at,
        pending_changes: snapshot.queue.entries.len(),
        retrying_changes: snapshot
            .queue
            .entries
            .iter()
            .filter(|e| e.attempts > 0)
            .count(),
        pending_conflicts: snapshot.conflicts.len(),
        collections: collections.into_values().collect(),
    }
}

fn collection<'a>(
    collections: &'a mut BTreeMap<String, CollectionStats>,
    name: &str,
) -> &'a mut CollectionStats {
    collections
        .entry(name.to_string())
        .or_insert_with(|| CollectionStats {
            name: name.to_string(),
            ..CollectionStats::default()
        })
}

fn print_text_output(result: &InspectResult) {
    println!("TideSync Client State");
    println!("=====================");
    println!();
    println!("Path:      {}", result.path);
    println!("Principal: {}", result.principal);
    println!("Format:    v{}", result.version);
    println!("Saved at:  {}", format_timestamp(result.saved_at));
    println!();
    println!("Queue:");
    println!("  Pending changes:   {}", result.pending_changes);
    println!("  Retrying:          {}", result.retrying_changes);
    println!("  Pending conflicts: {}", result.pending_conflicts);

    if result.collections.is_empty() {
        return;
    }
    println!();
    println!("Collections:");
    for stats in &result.collections {
        let synced = match (stats.cursor, stats.staleness_ms) {
            (Some(cursor), Some(age)) => {
                format!("synced {} ({} ago)", format_timestamp(cursor), format_age(age))
            }
            _ => "never synced".to_string(),
        };
        println!(
            "  {}: {} records, {} tombstones, {} pending, {}",
            stats.name, stats.records, stats.tombstones, stats.pending, synced
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::testing::replica;
    use serde_json::json;
    use tidesync_protocol::Document;

    #[test]
    fn counts_records_queue_and_cursors() {
        let dir = tempfile::tempdir().unwrap();
        {
            let replica = replica(dir.path(), 10_000);
            let data = json!({"title": "a"}).as_object().cloned().unwrap();
            replica.create_with_id("notes", "n1", data).unwrap();
            replica.create_with_id("notes", "n2", Document::new()).unwrap();
            replica.create_with_id("tags", "t1", Document::new()).unwrap();
            replica.delete("notes", "n2").unwrap();
        }

        let snapshot = load_snapshot(dir.path()).unwrap();
        let result = analyze(dir.path(), &snapshot, 20_000);
        assert_eq!(result.principal, "alice");
        assert_eq!(result.pending_changes, 2);
        assert_eq!(result.retrying_changes, 0);
        assert_eq!(result.pending_conflicts, 0);

        let names: Vec<_> = result.collections.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["notes", "tags"]);
        let notes = &result.collections[0];
        assert_eq!(notes.records, 1);
        assert_eq!(notes.tombstones, 1);
        assert_eq!(notes.pending, 1);
        assert!(notes.cursor.is_none());
    }

    #[test]
    fn json_output_skips_missing_cursor() {
        let dir = tempfile::tempdir().unwrap();
        replica(dir.path(), 10_000)
            .create_with_id("notes", "n1", Document::new())
            .unwrap();

        let snapshot = load_snapshot(dir.path()).unwrap();
        let value = serde_json::to_value(analyze(dir.path(), &snapshot, 10_000)).unwrap();
        assert_eq!(value["collections"][0]["name"], json!("notes"));
        assert!(value["collections"][0].get("cursor").is_none());
    }
}

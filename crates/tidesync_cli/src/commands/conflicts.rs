//! Conflicts command implementation.

use super::{format_timestamp, load_snapshot};
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::Path;
use tidesync_protocol::{Conflict, Document, ResolutionState, Timestamp};

/// A pending conflict, as listed by the CLI.
#[derive(Debug, Serialize)]
pub struct ConflictInfo {
    /// Conflict id, used to resolve it.
    pub id: String,
    /// Collection of the conflicting record.
    pub collection: String,
    /// Conflicting record.
    pub record_id: String,
    /// `updated_at` of the server copy when the conflict was detected.
    pub server_updated_at: Timestamp,
    /// When the conflict was detected.
    pub detected_at: Timestamp,
    /// Fields whose server and local values differ.
    pub differing_fields: Vec<String>,
    /// Server copy.
    pub server_value: Document,
    /// Rejected local values.
    pub local_value: Document,
}

/// Runs the conflicts command.
pub fn run(path: &Path, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let snapshot = load_snapshot(path)?;
    let conflicts = list(snapshot.conflicts.as_slice());

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&conflicts)?);
        }
        _ => {
            print_text_output(&conflicts);
        }
    }

    Ok(())
}

fn list(conflicts: &[Conflict]) -> Vec<ConflictInfo> {
    conflicts
        .iter()
        .filter(|c| c.resolution_state == ResolutionState::Pending)
        .map(|c| ConflictInfo {
            id: c.id.to_string(),
            collection: c.collection.clone(),
            record_id: c.record_id.clone(),
            server_updated_at: c.server_updated_at,
            detected_at: c.detected_at,
            differing_fields: differing_fields(&c.server_value, &c.local_value),
            server_value: c.server_value.clone(),
            local_value: c.local_value.clone(),
        })
        .collect()
}

/// Local fields the server copy lacks or holds a different value for.
fn differing_fields(server: &Document, local: &Document) -> Vec<String> {
    let keys: BTreeSet<&String> = local.keys().collect();
    keys.into_iter()
        .filter(|k| server.get(k.as_str()) != local.get(k.as_str()))
        .cloned()
        .collect()
}

fn print_text_output(conflicts: &[ConflictInfo]) {
    if conflicts.is_empty() {
        println!("No pending conflicts");
        return;
    }

    println!("{} pending conflict(s)", conflicts.len());
    for conflict in conflicts {
        println!();
        println!("Conflict {}", conflict.id);
        println!("  Record:   {}/{}", conflict.collection, conflict.record_id);
        println!("  Detected: {}", format_timestamp(conflict.detected_at));
        println!(
            "  Server copy updated at {}",
            format_timestamp(conflict.server_updated_at)
        );
        for field in &conflict.differing_fields {
            let show = |doc: &Document| {
                doc.get(field)
                    .map(|v| v.to_string())
                    .unwrap_or_else(|| "<absent>".to_string())
            };
            println!(
                "  {}: server={} local={}",
                field,
                show(&conflict.server_value),
                show(&conflict.local_value)
            );
        }
    }
}

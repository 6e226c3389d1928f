//! Queue command implementation.

use super::{format_timestamp, load_snapshot};
use serde::Serialize;
use std::path::Path;
use tidesync_engine::QueueEntry;
use tidesync_protocol::{ChangeKind, Timestamp};

/// A pending change, as listed by the CLI.
#[derive(Debug, Serialize)]
pub struct QueuedChange {
    /// Position in push order, starting at 1.
    pub position: usize,
    /// Change id.
    pub change_id: u64,
    /// Change kind.
    pub kind: ChangeKind,
    /// Target collection.
    pub collection: String,
    /// Target record.
    pub record_id: String,
    /// Base timestamp the change was made against.
    pub base: Timestamp,
    /// When the change was queued.
    pub enqueued_at: Timestamp,
    /// Field names the change writes.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<String>,
    /// Failed delivery attempts.
    pub attempts: u32,
    /// Last delivery error.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Earliest retry time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub not_before: Option<Timestamp>,
}

/// Runs the queue command.
pub fn run(path: &Path, limit: Option<usize>, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let snapshot = load_snapshot(path)?;
    let total = snapshot.queue.entries.len();
    let changes = list(&snapshot.queue.entries, limit);

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&changes)?);
        }
        _ => {
            print_text_output(&changes, total);
        }
    }

    Ok(())
}

fn list(entries: &[QueueEntry], limit: Option<usize>) -> Vec<QueuedChange> {
    entries
        .iter()
        .take(limit.unwrap_or(usize::MAX))
        .enumerate()
        .map(|(i, entry)| {
            let change = &entry.change;
            QueuedChange {
                position: i + 1,
                change_id: change.id.0,
                kind: change.kind,
                collection: change.collection.clone(),
                record_id: change.record_id.clone(),
                base: change.client_base_timestamp,
                enqueued_at: change.enqueued_at,
                fields: change
                    .payload
                    .as_ref()
                    .map(|p| p.keys().cloned().collect())
                    .unwrap_or_default(),
                attempts: entry.attempts,
                last_error: entry.last_error.clone(),
                not_before: entry.not_before,
            }
        })
        .collect()
}

fn print_text_output(changes: &[QueuedChange], total: usize) {
    if changes.is_empty() {
        println!("No pending changes");
        return;
    }

    for change in changes {
        println!(
            "{:>4}  #{:<6} {:<6} {}/{}  base={}  queued {}",
            change.position,
            change.change_id,
            format!("{:?}", change.kind).to_uppercase(),
            change.collection,
            change.record_id,
            change.base,
            format_timestamp(change.enqueued_at),
        );
        if !change.fields.is_empty() {
            println!("        fields: {}", change.fields.join(", "));
        }
        if change.attempts > 0 {
            let retry = change
                .not_before
                .map(|at| format!(", retry after {}", format_timestamp(at)))
                .unwrap_or_default();
            println!(
                "        {} failed attempt(s): {}{}",
                change.attempts,
                change.last_error.as_deref().unwrap_or("unknown error"),
                retry
            );
        }
    }

    if total > changes.len() {
        println!();
        println!("... {} more", total - changes.len());
    }
}

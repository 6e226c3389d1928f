//! # TideSync Engine
//!
//! Offline-first sync engine for TideSync.
//!
//! This crate provides:
//! - Change queue with per-record collapsing and retry bookkeeping
//! - Apply engine (server-side conflict detection with compare-and-set)
//! - Remote change fetcher with per-principal visibility
//! - Conflict resolver and pending conflict log
//! - Local replica with durable state
//! - Sync coordinator state machine (idle → pulling → pushing → reconciling)
//! - Event-driven sync loop
//! - HTTP transport abstraction
//!
//! ## Architecture
//!
//! The coordinator implements a **pull-then-push** model:
//! 1. Pull records changed since each collection's cursor
//! 2. Apply them to the local cache, unless a newer local edit is queued
//! 3. Push queued changes; the server detects conflicts per record
//! 4. Advance cursors to the server watermark read at the start of the pull
//!
//! ## Key Invariants
//!
//! - Server is authoritative for `updated_at`
//! - A change is removed from the queue only on a terminal result
//! - Cursors never move backwards
//! - Conflicts are kept until resolved or their record is deleted

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod apply;
mod config;
mod coordinator;
mod error;
mod fetcher;
mod http;
mod persist;
mod queue;
mod replica;
mod resolver;
mod transport;
mod trigger;

pub use apply::{Applied, ApplyEngine, Pulled};
pub use config::{RetryConfig, SyncConfig};
pub use coordinator::{
    CycleOutcome, CycleSummary, HealthReport, OutcomeKind, SyncCoordinator, SyncState, SyncStats,
};
pub use error::{ApplyError, ResolveError, SyncError, SyncResult};
pub use fetcher::{RemoteChangeFetcher, Visibility};
pub use http::{HttpClient, HttpTransport, LoopbackClient, LoopbackServer};
pub use persist::{ClientSnapshot, FileStateStore, MemoryStateStore, StateStore, SNAPSHOT_VERSION};
pub use queue::{ChangeQueue, EnqueueOutcome, QueueEntry, QueueSnapshot};
pub use replica::LocalReplica;
pub use resolver::{ConflictLog, ConflictResolver};
pub use transport::{MockTransport, SyncTransport};
pub use trigger::{spawn_sync_loop, LoopEvent, SyncLoop, Trigger, TriggerHandle};

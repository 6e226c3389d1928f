//! # TideSync Store
//!
//! Record store adapter trait and implementations for TideSync.
//!
//! The sync core never talks to a concrete database. It is handed a
//! [`RecordStore`] and relies only on per-record CRUD, an atomic
//! compare-and-set on `updated_at`, and a last-modified scan.
//!
//! ## Available Stores
//!
//! - [`MemoryRecordStore`] - For tests, the reference server and client caches
//!
//! ## Clocks
//!
//! - [`SystemClock`] - Wall clock in Unix milliseconds
//! - [`ManualClock`] - Settable clock for deterministic tests
//! - [`MonotonicClock`] - Wrapper that never issues the same timestamp twice
//!
//! ## Example
//!
//! ```rust
//! use tidesync_protocol::{Document, PrincipalId, SyncableRecord};
//! use tidesync_store::{MemoryRecordStore, RecordStore};
//!
//! let store = MemoryRecordStore::new();
//! let record = SyncableRecord::new("notes", "n1", PrincipalId::new("u"), Document::new(), 100);
//! store.insert_new(record).unwrap();
//! assert_eq!(store.modified_since("notes", 50).unwrap().len(), 1);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod clock;
mod error;
mod memory;

pub use backend::{CasOutcome, InsertOutcome, RecordStore};
pub use clock::{Clock, ManualClock, MonotonicClock, SystemClock};
pub use error::{StoreError, StoreResult};
pub use memory::MemoryRecordStore;

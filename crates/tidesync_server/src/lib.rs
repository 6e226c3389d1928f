//! # TideSync Server
//!
//! Reference sync server for TideSync.
//!
//! This crate provides:
//! - Handlers for the changes, apply, resolve, full dataset and health endpoints
//! - Server-side conflict detection and a per-principal conflict log
//! - Authentication (HMAC-SHA256 tokens bound to a principal)
//! - A [`tidesync_engine::LoopbackServer`] impl for in-process clients
//!
//! # Architecture
//!
//! The server is the authority for `updated_at`. Every write is stamped from
//! a strictly monotonic clock and committed with compare-and-set, so
//! concurrent pushes to one record cannot both win. It keeps:
//! - The record store (any [`tidesync_store::RecordStore`])
//! - Pending conflicts, per owning principal
//! - The last successful pull per principal, for health reports
//!
//! # Authentication
//!
//! Authentication is optional but recommended for production:
//!
//! ```rust
//! use tidesync_protocol::PrincipalId;
//! use tidesync_server::{ServerConfig, SyncServer};
//!
//! let secret = b"my-secure-secret-32-bytes-long!".to_vec();
//! let server = SyncServer::new(ServerConfig::default().with_auth(secret));
//!
//! // Issue a token for a principal
//! let validator = server.validator().unwrap();
//! let token = validator.create_token(&PrincipalId::new("alice")).unwrap();
//! assert!(validator.validate_token(&token, &PrincipalId::new("alice")).is_ok());
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
// Production code MUST NOT use panic!/unwrap()/expect()
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod auth;
mod config;
mod error;
mod server;
mod service;

pub use auth::{AuthConfig, TokenValidator};
pub use config::ServerConfig;
pub use error::{ServerError, ServerResult};
pub use server::SyncServer;
pub use service::SyncService;

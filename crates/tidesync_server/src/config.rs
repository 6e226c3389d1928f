//! Server configuration.

use std::time::Duration;
use tidesync_engine::Visibility;

/// Configuration for the sync server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Maximum changes per apply request.
    pub max_push_batch: usize,
    /// Collections every principal may read and write.
    pub shared_collections: Vec<String>,
    /// Age after which `sync_health` reports `needs_sync`.
    pub stale_after: Duration,
    /// Whether to require authentication.
    pub require_auth: bool,
    /// Secret key for token validation (if auth enabled).
    pub auth_secret: Option<Vec<u8>>,
    /// Lifetime of issued tokens.
    pub token_expiry: Duration,
}

impl ServerConfig {
    /// Creates a configuration with defaults.
    pub fn new() -> Self {
        Self {
            max_push_batch: 100,
            shared_collections: Vec::new(),
            stale_after: Duration::from_secs(24 * 60 * 60),
            require_auth: false,
            auth_secret: None,
            token_expiry: Duration::from_secs(24 * 60 * 60),
        }
    }

    /// Sets the maximum push batch size.
    pub fn with_max_push_batch(mut self, size: usize) -> Self {
        self.max_push_batch = size.max(1);
        self
    }

    /// Makes a collection readable and writable by every principal.
    pub fn with_shared_collection(mut self, collection: impl Into<String>) -> Self {
        let collection = collection.into();
        if !self.shared_collections.contains(&collection) {
            self.shared_collections.push(collection);
        }
        self
    }

    /// Sets the staleness threshold.
    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    /// Enables authentication with the given secret.
    pub fn with_auth(mut self, secret: Vec<u8>) -> Self {
        self.require_auth = true;
        self.auth_secret = Some(secret);
        self
    }

    /// Sets the token lifetime.
    pub fn with_token_expiry(mut self, expiry: Duration) -> Self {
        self.token_expiry = expiry;
        self
    }

    /// Builds the visibility rules for this configuration.
    pub fn visibility(&self) -> Visibility {
        self.shared_collections
            .iter()
            .fold(Visibility::private(), |v, c| v.with_shared(c.clone()))
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new()
    }
}

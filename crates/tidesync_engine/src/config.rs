//! Configuration for the sync engine.

use rand::Rng;
use std::time::Duration;
use tidesync_protocol::PrincipalId;

/// Configuration for one principal's sync coordinator.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Principal whose records are synced.
    pub principal: PrincipalId,
    /// Collections to sync, in pull order.
    pub collections: Vec<String>,
    /// Maximum changes per apply request.
    pub push_batch_size: usize,
    /// Timeout for every network call.
    pub request_timeout: Duration,
    /// Backoff for changes that failed transiently.
    pub retry: RetryConfig,
    /// Period of the timer trigger, if any.
    pub sync_interval: Option<Duration>,
    /// Age after which the replica reports `needs_sync`.
    pub stale_after: Duration,
}

impl SyncConfig {
    /// Creates a new sync configuration.
    pub fn new(principal: impl Into<PrincipalId>) -> Self {
        Self {
            principal: principal.into(),
            collections: Vec::new(),
            push_batch_size: 1,
            request_timeout: Duration::from_secs(30),
            retry: RetryConfig::default(),
            sync_interval: None,
            stale_after: Duration::from_secs(24 * 60 * 60),
        }
    }

    /// Adds a collection to sync.
    pub fn with_collection(mut self, collection: impl Into<String>) -> Self {
        let collection = collection.into();
        if !self.collections.contains(&collection) {
            self.collections.push(collection);
        }
        self
    }

    /// Sets the push batch size (at least 1).
    pub fn with_push_batch_size(mut self, size: usize) -> Self {
        self.push_batch_size = size.max(1);
        self
    }

    /// Sets the request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the sync interval for automatic sync.
    pub fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = Some(interval);
        self
    }

    /// Sets the staleness threshold.
    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new("")
    }
}

/// Backoff applied to changes that failed transiently.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Initial delay after the first failure.
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add up to 25% random jitter to delays.
    pub add_jitter: bool,
}

impl RetryConfig {
    /// Creates the default backoff: 100ms doubling up to 30s, with jitter.
    pub fn new() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }

    /// Retries immediately on the next cycle.
    pub fn immediate() -> Self {
        Self {
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            add_jitter: false,
        }
    }

    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Enables or disables jitter.
    pub fn with_jitter(mut self, add_jitter: bool) -> Self {
        self.add_jitter = add_jitter;
        self
    }

    /// Calculates the delay before attempt number `attempt` (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let base_delay = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        let delay_secs = base_delay.min(self.max_delay.as_secs_f64());

        if self.add_jitter && delay_secs > 0.0 {
            let jitter = delay_secs * 0.25 * rand::thread_rng().gen_range(0.0..1.0);
            Duration::from_secs_f64(delay_secs + jitter)
        } else {
            Duration::from_secs_f64(delay_secs)
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new()
    }
}

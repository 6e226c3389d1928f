//! Sync coordinator state machine.
//!
//! One cycle runs `Idle → Pulling → Pushing → Reconciling → Idle`. Any fatal
//! error moves the coordinator to `Failed` and straight back to `Idle`; the
//! queue and pending conflicts survive and the next cycle picks up where
//! this one stopped.

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::replica::LocalReplica;
use crate::transport::SyncTransport;
use parking_lot::RwLock;
use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tidesync_protocol::{
    ApplyChangesRequest, ApplyChangesResponse, ApplyResult, Change, ChangeError, ChangeId,
    ChangesRequest, ChangesResponse, Conflict, ConflictId, FullDatasetRequest,
    ResolutionStrategy, ResolveConflictRequest, SyncHealth, SyncHealthRequest, SyncableRecord,
    Timestamp,
};
use tracing::{debug, info, warn};

/// The current state of the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// No cycle is running.
    Idle,
    /// Fetching server changes.
    Pulling,
    /// Sending queued changes.
    Pushing,
    /// Advancing cursors and saving state.
    Reconciling,
    /// The cycle hit a fatal error.
    Failed,
}

impl SyncState {
    /// Returns true while a cycle is running.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            SyncState::Pulling | SyncState::Pushing | SyncState::Reconciling
        )
    }
}

/// Statistics about sync cycles.
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    /// Cycles that completed.
    pub cycles_completed: u64,
    /// Cycles that failed.
    pub cycles_failed: u64,
    /// Records pulled from the server.
    pub records_pulled: u64,
    /// Changes the server acknowledged.
    pub changes_pushed: u64,
    /// Conflicts detected during push.
    pub conflicts_detected: u64,
    /// Per-change errors reported by the server.
    pub change_errors: u64,
    /// Changes put back in the queue for a later attempt.
    pub retries: u64,
    /// Last error message.
    pub last_error: Option<String>,
    /// Local time the last cycle finished.
    pub last_cycle_at: Option<Timestamp>,
}

/// What one cycle did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleSummary {
    /// Per-change results returned by the server.
    pub applied: Vec<ApplyResult>,
    /// Conflicts detected while pushing.
    pub conflicts: Vec<Conflict>,
    /// Per-change errors returned by the server.
    pub errors: Vec<ChangeError>,
    /// Records received during pull.
    pub pulled: usize,
    /// Changes acknowledged by the server.
    pub pushed: usize,
    /// Changes kept for a later cycle after a transient failure.
    pub requeued: usize,
    /// Whether any cursor moved forward.
    pub cursor_advanced: bool,
    /// Wall time of the cycle.
    pub duration: Duration,
}

/// Result of [`SyncCoordinator::run_cycle`].
#[derive(Debug)]
pub enum CycleOutcome {
    /// The cycle ran to the end.
    Completed(CycleSummary),
    /// The cycle stopped at a fatal error.
    Failed {
        /// What stopped it.
        error: SyncError,
        /// What happened before the error.
        summary: CycleSummary,
    },
    /// Another cycle was already running; nothing was done.
    Coalesced,
    /// The coordinator is suspended; nothing was done.
    Suspended,
}

/// Shape of a [`CycleOutcome`] without its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeKind {
    /// See [`CycleOutcome::Completed`].
    Completed,
    /// See [`CycleOutcome::Failed`].
    Failed,
    /// See [`CycleOutcome::Coalesced`].
    Coalesced,
    /// See [`CycleOutcome::Suspended`].
    Suspended,
}

impl CycleOutcome {
    /// Returns the outcome kind.
    pub fn kind(&self) -> OutcomeKind {
        match self {
            CycleOutcome::Completed(_) => OutcomeKind::Completed,
            CycleOutcome::Failed { .. } => OutcomeKind::Failed,
            CycleOutcome::Coalesced => OutcomeKind::Coalesced,
            CycleOutcome::Suspended => OutcomeKind::Suspended,
        }
    }

    /// Returns true if the cycle completed.
    pub fn is_completed(&self) -> bool {
        matches!(self, CycleOutcome::Completed(_))
    }

    /// Returns the summary of a cycle that ran.
    pub fn summary(&self) -> Option<&CycleSummary> {
        match self {
            CycleOutcome::Completed(summary) | CycleOutcome::Failed { summary, .. } => Some(summary),
            CycleOutcome::Coalesced | CycleOutcome::Suspended => None,
        }
    }
}

/// Read-only view of how far behind the replica is.
#[derive(Debug, Clone, PartialEq)]
pub struct HealthReport {
    /// Oldest cursor across the configured collections; `None` until every
    /// collection has synced once.
    pub last_sync_time: Option<Timestamp>,
    /// Hours since `last_sync_time`.
    pub hours_old: Option<f64>,
    /// Whether the staleness threshold was crossed.
    pub needs_sync: bool,
    /// Queued changes.
    pub pending_changes: usize,
    /// Unresolved conflicts.
    pub pending_conflicts: usize,
    /// Last cycle error.
    pub last_error: Option<String>,
    /// Coordinator state.
    pub state: SyncState,
}

struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Drives sync cycles for one principal.
pub struct SyncCoordinator<T: SyncTransport> {
    config: SyncConfig,
    transport: T,
    replica: LocalReplica,
    state: RwLock<SyncState>,
    stats: RwLock<SyncStats>,
    running: AtomicBool,
    suspended: AtomicBool,
}

impl<T: SyncTransport> SyncCoordinator<T> {
    /// Creates a coordinator. The replica must belong to the configured principal.
    pub fn new(config: SyncConfig, transport: T, replica: LocalReplica) -> SyncResult<Self> {
        if replica.principal() != &config.principal {
            return Err(SyncError::InvalidOperation(format!(
                "replica belongs to {}, coordinator syncs {}",
                replica.principal(),
                config.principal
            )));
        }
        Ok(Self {
            config,
            transport,
            replica,
            state: RwLock::new(SyncState::Idle),
            stats: RwLock::new(SyncStats::default()),
            running: AtomicBool::new(false),
            suspended: AtomicBool::new(false),
        })
    }

    /// Returns the configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Returns the transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Returns the local replica, for local edits and reads.
    pub fn replica(&self) -> &LocalReplica {
        &self.replica
    }

    /// Gets the current state.
    pub fn state(&self) -> SyncState {
        *self.state.read()
    }

    /// Gets the current stats.
    pub fn stats(&self) -> SyncStats {
        self.stats.read().clone()
    }

    fn set_state(&self, state: SyncState) {
        *self.state.write() = state;
    }

    /// Stops new cycles from starting. A running cycle is not interrupted.
    pub fn suspend(&self) {
        self.suspended.store(true, Ordering::SeqCst);
        info!(principal = %self.config.principal, "sync suspended");
    }

    /// Allows cycles again.
    pub fn resume(&self) {
        self.suspended.store(false, Ordering::SeqCst);
        info!(principal = %self.config.principal, "sync resumed");
    }

    /// Returns true while suspended.
    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::SeqCst)
    }

    /// Runs one pull → push → reconcile cycle.
    ///
    /// Never returns an error: failures are reported in the outcome and in
    /// [`SyncCoordinator::stats`].
    pub async fn run_cycle(&self) -> CycleOutcome {
        if self.is_suspended() {
            debug!(principal = %self.config.principal, "cycle skipped while suspended");
            return CycleOutcome::Suspended;
        }
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!(principal = %self.config.principal, "cycle coalesced into running one");
            return CycleOutcome::Coalesced;
        }
        let _running = RunningGuard(&self.running);

        let start = Instant::now();
        let mut summary = CycleSummary::default();
        let result = self.cycle(&mut summary).await;
        summary.duration = start.elapsed();

        let mut stats = self.stats.write();
        stats.records_pulled += summary.pulled as u64;
        stats.changes_pushed += summary.pushed as u64;
        stats.conflicts_detected += summary.conflicts.len() as u64;
        stats.change_errors += summary.errors.len() as u64;
        stats.retries += summary.requeued as u64;
        stats.last_cycle_at = Some(self.replica.now());

        match result {
            Ok(()) => {
                stats.cycles_completed += 1;
                stats.last_error = None;
                drop(stats);
                self.set_state(SyncState::Idle);
                info!(
                    principal = %self.config.principal,
                    pulled = summary.pulled,
                    pushed = summary.pushed,
                    conflicts = summary.conflicts.len(),
                    errors = summary.errors.len(),
                    requeued = summary.requeued,
                    "sync cycle completed"
                );
                CycleOutcome::Completed(summary)
            }
            Err(error) => {
                stats.cycles_failed += 1;
                stats.last_error = Some(error.to_string());
                drop(stats);
                self.set_state(SyncState::Failed);
                self.replica.release_in_flight();
                if let Err(e) = self.replica.persist() {
                    warn!(error = %e, "could not save state after failed cycle");
                }
                warn!(principal = %self.config.principal, error = %error, "sync cycle failed");
                self.set_state(SyncState::Idle);
                CycleOutcome::Failed { error, summary }
            }
        }
    }

    async fn cycle(&self, summary: &mut CycleSummary) -> SyncResult<()> {
        self.set_state(SyncState::Pulling);
        let watermarks = self.pull(summary).await?;
        self.replica.persist()?;

        self.set_state(SyncState::Pushing);
        self.push(summary).await?;

        self.set_state(SyncState::Reconciling);
        for (collection, sync_timestamp) in watermarks {
            if self.replica.advance_cursor(&collection, sync_timestamp) {
                debug!(collection = %collection, cursor = sync_timestamp, "cursor advanced");
                summary.cursor_advanced = true;
            }
        }
        self.replica.persist()
    }

    async fn call<R>(&self, request: impl Future<Output = SyncResult<R>>) -> SyncResult<R> {
        tokio::time::timeout(self.config.request_timeout, request)
            .await
            .unwrap_or(Err(SyncError::Timeout))
    }

    /// Pulls every configured collection and returns each one's watermark.
    async fn pull(&self, summary: &mut CycleSummary) -> SyncResult<Vec<(String, Timestamp)>> {
        let principal = &self.config.principal;
        let mut watermarks = Vec::with_capacity(self.config.collections.len());

        for collection in &self.config.collections {
            let response: ChangesResponse = match self.replica.cursor(collection) {
                Some(cursor) => {
                    let request = ChangesRequest::new(
                        principal.clone(),
                        vec![collection.clone()],
                        cursor.last_sync_timestamp,
                    );
                    self.call(self.transport.fetch_changes(&request)).await?
                }
                None => {
                    debug!(collection = %collection, "bootstrapping from full dataset");
                    let request = FullDatasetRequest {
                        principal: principal.clone(),
                        collections: vec![collection.clone()],
                    };
                    self.call(self.transport.full_dataset(&request)).await?
                }
            };

            let sync_timestamp = response.sync_timestamp;
            for record in response.records.into_values().flatten() {
                if &record.collection != collection {
                    continue;
                }
                self.replica.apply_pulled(record)?;
                summary.pulled += 1;
            }
            watermarks.push((collection.clone(), sync_timestamp));
        }

        debug!(principal = %principal, pulled = summary.pulled, "pull finished");
        Ok(watermarks)
    }

    /// Pushes due changes until none are left that this cycle has not tried.
    async fn push(&self, summary: &mut CycleSummary) -> SyncResult<()> {
        let mut attempted: HashSet<ChangeId> = HashSet::new();

        loop {
            let batch = self.replica.take_due_batch(
                self.replica.now(),
                self.config.push_batch_size,
                &attempted,
            );
            if batch.is_empty() {
                break;
            }
            attempted.extend(batch.iter().map(|c| c.id));

            let request = ApplyChangesRequest::new(self.config.principal.clone(), batch.clone());
            match self.call(self.transport.apply_changes(&request)).await {
                Ok(response) => self.settle(&batch, response, summary)?,
                Err(error) if error.is_retryable() => {
                    warn!(changes = batch.len(), error = %error, "push failed, changes requeued");
                    let message = error.to_string();
                    for change in &batch {
                        self.replica
                            .requeue(change.id, &message, &self.config.retry);
                    }
                    summary.requeued += batch.len();
                }
                Err(error) => return Err(error),
            }
            self.replica.persist()?;
        }
        Ok(())
    }

    /// Applies the server's per-change results to the replica.
    fn settle(
        &self,
        batch: &[Change],
        response: ApplyChangesResponse,
        summary: &mut CycleSummary,
    ) -> SyncResult<()> {
        let mut answered: HashSet<ChangeId> = HashSet::new();

        for result in response.applied {
            answered.insert(result.change_id);
            if result.outcome.acknowledges() {
                self.replica
                    .acknowledge(result.change_id, result.record.clone())?;
                summary.pushed += 1;
                debug!(change_id = %result.change_id, outcome = ?result.outcome, "change acknowledged");
            } else {
                let conflict = batch
                    .iter()
                    .find(|c| c.id == result.change_id)
                    .and_then(|change| {
                        response
                            .conflicts
                            .iter()
                            .find(|k| k.concerns(&change.collection, &change.record_id))
                            .cloned()
                    });
                if let Some(conflict) = &conflict {
                    info!(
                        change_id = %result.change_id,
                        collection = %conflict.collection,
                        record_id = %conflict.record_id,
                        "conflict detected"
                    );
                    summary.conflicts.push(conflict.clone());
                }
                self.replica
                    .record_conflict(result.change_id, conflict, result.record.clone())?;
            }
            summary.applied.push(result);
        }

        for error in response.errors {
            answered.insert(error.change_id);
            if error.kind.is_retryable() {
                self.replica
                    .requeue(error.change_id, &error.message, &self.config.retry);
                summary.requeued += 1;
            } else {
                warn!(
                    change_id = %error.change_id,
                    collection = %error.collection,
                    record_id = %error.record_id,
                    kind = ?error.kind,
                    message = %error.message,
                    "change dropped"
                );
                self.replica.reject(error.change_id);
            }
            summary.errors.push(error);
        }

        for change in batch.iter().filter(|c| !answered.contains(&c.id)) {
            self.replica
                .requeue(change.id, "no result returned", &self.config.retry);
            summary.requeued += 1;
        }
        Ok(())
    }

    /// Resolves a pending conflict on the server and adopts the result.
    ///
    /// If the server reports the record as deleted, the conflict is dropped
    /// locally and the error is returned.
    pub async fn resolve_conflict(
        &self,
        id: ConflictId,
        strategy: ResolutionStrategy,
    ) -> SyncResult<SyncableRecord> {
        if self.replica.conflict(id).is_none() {
            return Err(SyncError::UnknownConflict(id));
        }
        let request = ResolveConflictRequest {
            principal: self.config.principal.clone(),
            conflict_id: id,
            strategy,
        };

        match self.call(self.transport.resolve_conflict(&request)).await {
            Ok(response) => {
                self.replica.conflict_resolved(id, response.record.clone())?;
                info!(
                    conflict_id = %id,
                    strategy = request.strategy.name(),
                    "conflict resolved"
                );
                Ok(response.record)
            }
            Err(error) if error.is_record_deleted() => {
                info!(conflict_id = %id, "conflict dropped, record deleted");
                self.replica.discard_conflict(id)?;
                Err(error)
            }
            Err(error) => Err(error),
        }
    }

    /// Returns pending conflicts.
    pub fn pending_conflicts(&self) -> Vec<Conflict> {
        self.replica.pending_conflicts()
    }

    /// Time since `collection` last synced, or `None` if it never did.
    pub fn staleness(&self, collection: &str) -> Option<Duration> {
        let cursor = self.replica.cursor(collection)?;
        let millis = cursor.staleness_millis(self.replica.now());
        Some(Duration::from_millis(u64::try_from(millis).unwrap_or(0)))
    }

    /// Reports staleness and backlog from local state.
    pub fn health(&self) -> HealthReport {
        let last_sync_time = self
            .config
            .collections
            .iter()
            .map(|c| self.replica.cursor(c).map(|cursor| cursor.last_sync_timestamp))
            .collect::<Option<Vec<_>>>()
            .and_then(|times| times.into_iter().min());
        let stale_after_ms = i64::try_from(self.config.stale_after.as_millis()).unwrap_or(i64::MAX);
        let health = SyncHealth::evaluate(last_sync_time, self.replica.now(), stale_after_ms);

        HealthReport {
            last_sync_time: health.last_sync_time,
            hours_old: health.hours_old,
            needs_sync: health.needs_sync,
            pending_changes: self.replica.pending_count(),
            pending_conflicts: self.replica.pending_conflicts().len(),
            last_error: self.stats.read().last_error.clone(),
            state: self.state(),
        }
    }

    /// Asks the server how stale it considers this principal.
    pub async fn remote_health(&self) -> SyncResult<SyncHealth> {
        let request = SyncHealthRequest {
            principal: self.config.principal.clone(),
        };
        self.call(self.transport.sync_health(&request)).await
    }
}

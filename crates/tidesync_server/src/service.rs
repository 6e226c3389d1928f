//! Request handlers for sync endpoints.

use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tidesync_engine::{
    ApplyEngine, ApplyError, ConflictLog, ConflictResolver, RemoteChangeFetcher, ResolveError,
};
use tidesync_protocol::{
    ApplyChangesRequest, ApplyChangesResponse, ApplyOutcome, ChangeError, ChangeErrorKind,
    ChangesRequest, ChangesResponse, Conflict, FullDatasetRequest, PrincipalId,
    ResolveConflictRequest, ResolveConflictResponse, SyncHealth, SyncHealthRequest, Timestamp,
};
use tidesync_store::{Clock, MonotonicClock, RecordStore, SystemClock};
use tracing::{debug, info, warn};

type ServerClock = Arc<MonotonicClock<Arc<dyn Clock>>>;

/// The sync endpoints over one record store.
///
/// Every `updated_at` the service writes comes from a strictly monotonic
/// clock. Pull handlers read their `sync_timestamp` while no write is in
/// progress, so every record stamped at or below it is already visible to
/// the scan that follows.
pub struct SyncService<S: RecordStore> {
    config: ServerConfig,
    store: Arc<S>,
    clock: ServerClock,
    wall: Arc<dyn Clock>,
    engine: ApplyEngine<S, ServerClock>,
    fetcher: RemoteChangeFetcher<S>,
    resolver: ConflictResolver<S, ServerClock>,
    conflicts: Mutex<ConflictLog>,
    last_pull: RwLock<HashMap<PrincipalId, Timestamp>>,
    // Writers hold it shared; watermark reads take it exclusively.
    write_gate: RwLock<()>,
}

impl<S: RecordStore> SyncService<S> {
    /// Creates a service on the system clock.
    pub fn new(config: ServerConfig, store: Arc<S>) -> Self {
        Self::with_clock(config, store, Arc::new(SystemClock))
    }

    /// Creates a service reading time from `wall`.
    pub fn with_clock(config: ServerConfig, store: Arc<S>, wall: Arc<dyn Clock>) -> Self {
        let clock: ServerClock = Arc::new(MonotonicClock::new(Arc::clone(&wall)));
        let visibility = config.visibility();
        Self {
            engine: ApplyEngine::new(Arc::clone(&store), Arc::clone(&clock))
                .with_visibility(visibility.clone()),
            fetcher: RemoteChangeFetcher::new(Arc::clone(&store), visibility),
            resolver: ConflictResolver::new(Arc::clone(&store), Arc::clone(&clock)),
            conflicts: Mutex::new(ConflictLog::new()),
            last_pull: RwLock::new(HashMap::new()),
            write_gate: RwLock::new(()),
            config,
            store,
            clock,
            wall,
        }
    }

    /// Returns the configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Returns the record store.
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Returns the unresolved conflicts of `principal`.
    pub fn pending_conflicts(&self, principal: &PrincipalId) -> Vec<Conflict> {
        self.conflicts.lock().pending(Some(principal))
    }

    /// Issues a timestamp greater than every `updated_at` written so far.
    fn watermark(&self) -> Timestamp {
        let _gate = self.write_gate.write();
        self.clock.now()
    }

    fn record_pull(&self, principal: &PrincipalId) {
        self.last_pull
            .write()
            .insert(principal.clone(), self.wall.now());
    }

    /// Handles `POST /sync/changes`.
    pub fn handle_changes(&self, request: ChangesRequest) -> ServerResult<ChangesResponse> {
        if request.collections.is_empty() {
            return Err(ServerError::InvalidRequest("no collections requested".into()));
        }
        let sync_timestamp = self.watermark();
        let records =
            self.fetcher
                .fetch_since(&request.principal, &request.collections, request.since)?;
        self.record_pull(&request.principal);

        let response = ChangesResponse::new(records, sync_timestamp);
        debug!(
            principal = %request.principal,
            since = request.since,
            sync_timestamp,
            records = response.record_count(),
            "changes served"
        );
        Ok(response)
    }

    /// Handles `POST /sync/full`.
    pub fn handle_full(&self, request: FullDatasetRequest) -> ServerResult<ChangesResponse> {
        if request.collections.is_empty() {
            return Err(ServerError::InvalidRequest("no collections requested".into()));
        }
        let sync_timestamp = self.watermark();
        let records = self
            .fetcher
            .full_dataset(&request.principal, &request.collections)?;
        self.record_pull(&request.principal);

        let response = ChangesResponse::new(records, sync_timestamp);
        info!(
            principal = %request.principal,
            records = response.record_count(),
            "full dataset served"
        );
        Ok(response)
    }

    /// Handles `POST /sync/apply`.
    ///
    /// Every change gets exactly one entry in `applied` or `errors`.
    pub fn handle_apply(&self, request: ApplyChangesRequest) -> ServerResult<ApplyChangesResponse> {
        if request.changes.len() > self.config.max_push_batch {
            return Err(ServerError::InvalidRequest(format!(
                "too many changes: {} > {}",
                request.changes.len(),
                self.config.max_push_batch
            )));
        }

        let principal = &request.principal;
        let mut response = ApplyChangesResponse::default();
        for change in &request.changes {
            let applied = {
                let _gate = self.write_gate.read();
                self.engine.apply(principal, change)
            };

            match applied {
                Ok(applied) => {
                    let (result, conflict) = applied.into_result(change.id);
                    let mut log = self.conflicts.lock();
                    if result.outcome == ApplyOutcome::Deleted {
                        log.discard_for_record(&change.collection, &change.record_id);
                    }
                    if let Some(conflict) = conflict {
                        info!(
                            principal = %principal,
                            collection = %conflict.collection,
                            record_id = %conflict.record_id,
                            server_updated_at = conflict.server_updated_at,
                            base = change.client_base_timestamp,
                            "conflict detected"
                        );
                        log.record(conflict.clone());
                        response.conflicts.push(conflict);
                    }
                    response.applied.push(result);
                }
                Err(error) => {
                    let kind = match &error {
                        ApplyError::Validation(_) => ChangeErrorKind::Validation,
                        ApplyError::NotFound { .. } => ChangeErrorKind::NotFound,
                        ApplyError::Contention { .. } | ApplyError::Store(_) => {
                            ChangeErrorKind::Transient
                        }
                    };
                    warn!(
                        principal = %principal,
                        change_id = %change.id,
                        collection = %change.collection,
                        record_id = %change.record_id,
                        error = %error,
                        "change not applied"
                    );
                    response
                        .errors
                        .push(ChangeError::new(change, kind, error.to_string()));
                }
            }
        }
        Ok(response)
    }

    /// Handles `POST /sync/resolve`. Only the conflict's owner may resolve it.
    pub fn handle_resolve(
        &self,
        request: ResolveConflictRequest,
    ) -> ServerResult<ResolveConflictResponse> {
        let conflict = self
            .conflicts
            .lock()
            .get(request.conflict_id)
            .cloned()
            .ok_or_else(|| ServerError::NotFound(format!("conflict {}", request.conflict_id)))?;
        if conflict.owner != request.principal {
            return Err(ServerError::NotAuthorized(format!(
                "conflict {} belongs to another principal",
                conflict.id
            )));
        }

        let resolved = {
            let _gate = self.write_gate.read();
            self.resolver.resolve(&conflict, &request.strategy)
        };
        match resolved {
            Ok(record) => {
                self.conflicts.lock().mark_resolved(conflict.id);
                Ok(ResolveConflictResponse { record })
            }
            Err(ResolveError::RecordDeleted {
                collection,
                record_id,
            }) => {
                self.conflicts.lock().discard(conflict.id);
                Err(ServerError::RecordDeleted {
                    collection,
                    record_id,
                })
            }
            Err(ResolveError::AlreadyResolved(id)) => Err(ServerError::InvalidRequest(format!(
                "conflict {id} is already resolved"
            ))),
            Err(error @ ResolveError::Contention { .. }) => {
                Err(ServerError::Internal(error.to_string()))
            }
            Err(ResolveError::Store(e)) => Err(e.into()),
        }
    }

    /// Handles `POST /sync/health`.
    pub fn handle_health(&self, request: SyncHealthRequest) -> ServerResult<SyncHealth> {
        let last = self.last_pull.read().get(&request.principal).copied();
        let stale_after = i64::try_from(self.config.stale_after.as_millis()).unwrap_or(i64::MAX);
        Ok(SyncHealth::evaluate(last, self.wall.now(), stale_after))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tidesync_protocol::{
        Change, ChangeDraft, ChangeId, Document, ResolutionStrategy, SyncableRecord,
    };
    use tidesync_store::{ManualClock, MemoryRecordStore};

    fn doc(value: serde_json::Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    fn alice() -> PrincipalId {
        PrincipalId::new("alice")
    }

    fn service(config: ServerConfig) -> (SyncService<MemoryRecordStore>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_000));
        let service = SyncService::with_clock(config, Arc::new(MemoryRecordStore::new()), clock.clone());
        (service, clock)
    }

    fn change(id: u64, draft: ChangeDraft) -> Change {
        draft.into_change(ChangeId(id), 0)
    }

    fn apply(service: &SyncService<MemoryRecordStore>, who: &PrincipalId, changes: Vec<Change>) -> ApplyChangesResponse {
        service
            .handle_apply(ApplyChangesRequest::new(who.clone(), changes))
            .unwrap()
    }

    fn create(service: &SyncService<MemoryRecordStore>, id: &str, data: Document) -> SyncableRecord {
        let response = apply(service, &alice(), vec![change(1, ChangeDraft::create("notes", id, data))]);
        response.applied[0].record.clone().unwrap()
    }

    #[test]
    fn pull_after_bootstrap_is_empty() {
        let (service, _) = service(ServerConfig::new());
        create(&service, "n1", doc(json!({"a": 1})));

        let full = service
            .handle_full(FullDatasetRequest {
                principal: alice(),
                collections: vec!["notes".into()],
            })
            .unwrap();
        assert_eq!(full.record_count(), 1);

        let changes = service
            .handle_changes(ChangesRequest::new(alice(), vec!["notes".into()], full.sync_timestamp))
            .unwrap();
        assert!(changes.is_empty());
        assert!(changes.sync_timestamp > full.sync_timestamp);
    }

    #[test]
    fn stale_base_yields_conflict_and_newer_base_succeeds() {
        let (service, clock) = service(ServerConfig::new());
        let created = create(&service, "n1", doc(json!({"v": 1})));
        clock.advance(100);

        let stale = change(2, ChangeDraft::update("notes", "n1", doc(json!({"v": 2})), created.updated_at - 1));
        let response = apply(&service, &alice(), vec![stale]);
        assert_eq!(response.applied[0].outcome, ApplyOutcome::Conflict);
        assert_eq!(response.conflicts.len(), 1);
        assert_eq!(service.pending_conflicts(&alice()).len(), 1);

        let fresh = change(3, ChangeDraft::update("notes", "n1", doc(json!({"v": 3})), created.updated_at));
        let response = apply(&service, &alice(), vec![fresh]);
        assert_eq!(response.applied[0].outcome, ApplyOutcome::Updated);
        assert!(response.applied[0].record.as_ref().unwrap().updated_at > created.updated_at);
    }

    #[test]
    fn oversized_batch_is_refused() {
        let (service, _) = service(ServerConfig::new().with_max_push_batch(1));
        let changes = vec![
            change(1, ChangeDraft::create("notes", "a", Document::new())),
            change(2, ChangeDraft::create("notes", "b", Document::new())),
        ];
        assert!(matches!(
            service.handle_apply(ApplyChangesRequest::new(alice(), changes)),
            Err(ServerError::InvalidRequest(_))
        ));
    }

    #[test]
    fn errors_are_reported_per_change() {
        let (service, _) = service(ServerConfig::new());
        let missing = change(1, ChangeDraft::update("notes", "nope", doc(json!({"a": 1})), 0));
        let mut invalid = change(2, ChangeDraft::create("notes", "x", Document::new()));
        invalid.payload = None;
        let fine = change(3, ChangeDraft::create("notes", "ok", Document::new()));

        let response = apply(&service, &alice(), vec![missing, invalid, fine]);
        assert_eq!(response.applied.len(), 1);
        assert_eq!(response.errors.len(), 2);
        assert_eq!(response.errors[0].kind, ChangeErrorKind::NotFound);
        assert_eq!(response.errors[1].kind, ChangeErrorKind::Validation);
    }

    #[test]
    fn private_records_are_invisible_to_others() {
        let (service, _) = service(ServerConfig::new());
        create(&service, "n1", Document::new());

        let bob = PrincipalId::new("bob");
        let changes = service
            .handle_changes(ChangesRequest::new(bob.clone(), vec!["notes".into()], 0))
            .unwrap();
        assert!(changes.is_empty());

        let response = apply(&service, &bob, vec![change(1, ChangeDraft::update("notes", "n1", Document::new(), 0))]);
        assert_eq!(response.errors[0].kind, ChangeErrorKind::NotFound);
    }

    #[test]
    fn only_owner_resolves() {
        let (service, _) = service(ServerConfig::new().with_shared_collection("notes"));
        let created = create(&service, "n1", doc(json!({"v": 1})));
        let bob = PrincipalId::new("bob");
        let stale = change(2, ChangeDraft::update("notes", "n1", doc(json!({"v": 2})), created.updated_at - 1));
        let conflict = apply(&service, &bob, vec![stale]).conflicts.remove(0);

        let request = |who: PrincipalId| ResolveConflictRequest {
            principal: who,
            conflict_id: conflict.id,
            strategy: ResolutionStrategy::Client,
        };
        assert!(matches!(
            service.handle_resolve(request(alice())),
            Err(ServerError::NotAuthorized(_))
        ));

        let resolved = service.handle_resolve(request(bob.clone())).unwrap();
        assert_eq!(resolved.record.data["v"], json!(2));
        assert!(resolved.record.updated_at > conflict.server_updated_at);
        assert!(service.pending_conflicts(&bob).is_empty());

        assert!(matches!(
            service.handle_resolve(request(bob)),
            Err(ServerError::NotFound(_))
        ));
    }

    #[test]
    fn delete_drops_conflicts_and_resolve_reports_deleted() {
        let (service, _) = service(ServerConfig::new());
        let created = create(&service, "n1", doc(json!({"v": 1})));
        let stale = change(2, ChangeDraft::update("notes", "n1", doc(json!({"v": 2})), created.updated_at - 1));
        let conflict = apply(&service, &alice(), vec![stale]).conflicts.remove(0);

        // Tombstone behind the service's back so the conflict survives.
        let current = service.store().get("notes", "n1").unwrap().unwrap();
        service.store().put(current.tombstone(current.updated_at + 1)).unwrap();

        let request = ResolveConflictRequest {
            principal: alice(),
            conflict_id: conflict.id,
            strategy: ResolutionStrategy::Server,
        };
        assert!(matches!(
            service.handle_resolve(request),
            Err(ServerError::RecordDeleted { .. })
        ));
        assert!(service.pending_conflicts(&alice()).is_empty());

        let created = create(&service, "n2", Document::new());
        let stale = change(3, ChangeDraft::update("notes", "n2", doc(json!({"x": 1})), created.updated_at - 1));
        apply(&service, &alice(), vec![stale]);
        assert_eq!(service.pending_conflicts(&alice()).len(), 1);
        apply(&service, &alice(), vec![change(4, ChangeDraft::delete("notes", "n2", created.updated_at))]);
        assert!(service.pending_conflicts(&alice()).is_empty());
    }

    #[test]
    fn health_tracks_last_pull() {
        let (service, clock) = service(ServerConfig::new().with_stale_after(std::time::Duration::from_secs(60)));
        let request = || SyncHealthRequest { principal: alice() };
        assert!(service.handle_health(request()).unwrap().needs_sync);

        service
            .handle_changes(ChangesRequest::new(alice(), vec!["notes".into()], 0))
            .unwrap();
        let health = service.handle_health(request()).unwrap();
        assert!(!health.needs_sync);
        assert_eq!(health.last_sync_time, Some(1_000));

        clock.advance(60_000);
        assert!(service.handle_health(request()).unwrap().needs_sync);
    }

    #[test]
    fn empty_collection_list_is_refused() {
        let (service, _) = service(ServerConfig::new());
        assert!(service
            .handle_changes(ChangesRequest::new(alice(), Vec::new(), 0))
            .is_err());
    }
}

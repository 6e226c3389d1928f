//! End-to-end tests: sync coordinators talking to the reference server over
//! the loopback HTTP client.

use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tidesync_engine::{
    spawn_sync_loop, FileStateStore, HttpTransport, LocalReplica, LoopbackClient, LoopbackServer,
    OutcomeKind, RetryConfig, SyncConfig, SyncCoordinator, SyncError,
};
use tidesync_protocol::{
    ApplyOutcome, ChangeKind, ChangesRequest, Document, ErrorKind, PrincipalId,
    ResolutionStrategy,
};
use tidesync_server::{ServerConfig, SyncServer};
use tidesync_store::{ManualClock, MemoryRecordStore, RecordStore};

type Device<L> = SyncCoordinator<HttpTransport<LoopbackClient<L>>>;

fn doc(value: serde_json::Value) -> Document {
    value.as_object().cloned().unwrap()
}

fn server(clock: &Arc<ManualClock>, config: ServerConfig) -> Arc<SyncServer> {
    Arc::new(SyncServer::with_store(
        config,
        Arc::new(MemoryRecordStore::new()),
        clock.clone(),
    ))
}

fn sync_config(principal: &str) -> SyncConfig {
    SyncConfig::new(principal)
        .with_collection("notes")
        .with_retry(RetryConfig::immediate())
        .with_request_timeout(Duration::from_secs(5))
}

fn device_on<L: LoopbackServer>(link: L, principal: &str, clock: &Arc<ManualClock>) -> Device<L> {
    let transport = HttpTransport::new("http://sync.local", LoopbackClient::new(link));
    let replica = LocalReplica::in_memory(PrincipalId::new(principal), clock.clone());
    SyncCoordinator::new(sync_config(principal), transport, replica).unwrap()
}

fn device(server: &Arc<SyncServer>, principal: &str, clock: &Arc<ManualClock>) -> Device<Arc<SyncServer>> {
    device_on(Arc::clone(server), principal, clock)
}

/// Forwards to the server but can lose the next response, as a dropped
/// connection would after the server already committed.
struct LossyLink {
    server: Arc<SyncServer>,
    drop_next_response: AtomicBool,
}

impl LoopbackServer for LossyLink {
    fn handle_post(&self, path: &str, body: &[u8]) -> Result<Vec<u8>, String> {
        let response = self.server.handle_post(path, body)?;
        if path == "/sync/apply" && self.drop_next_response.swap(false, Ordering::SeqCst) {
            return Err("connection reset".into());
        }
        Ok(response)
    }
}

#[tokio::test]
async fn stale_update_conflicts_and_merge_resolves() {
    let clock = Arc::new(ManualClock::new(100));
    let server = server(&clock, ServerConfig::new());
    let phone = device(&server, "alice", &clock);
    let laptop = device(&server, "alice", &clock);

    phone
        .replica()
        .create_with_id("notes", "n1", doc(json!({"name": "X", "price": 5})))
        .unwrap();
    assert!(phone.run_cycle().await.is_completed());
    assert!(laptop.run_cycle().await.is_completed());
    assert!(laptop.replica().get("notes", "n1").unwrap().is_some());

    clock.set(200);
    laptop
        .replica()
        .update("notes", "n1", doc(json!({"name": "Y"})))
        .unwrap();
    assert!(laptop.run_cycle().await.is_completed());

    clock.set(300);
    phone
        .replica()
        .update("notes", "n1", doc(json!({"name": "Z"})))
        .unwrap();
    let outcome = phone.run_cycle().await;
    let summary = outcome.summary().unwrap();
    assert_eq!(summary.conflicts.len(), 1);
    let conflict = summary.conflicts[0].clone();
    assert_eq!(conflict.server_value["name"], json!("Y"));
    assert_eq!(conflict.local_value["name"], json!("Z"));
    assert_eq!(conflict.server_updated_at, 200);
    assert_eq!(phone.replica().pending_count(), 0);
    assert_eq!(phone.pending_conflicts().len(), 1);

    clock.set(400);
    let record = phone
        .resolve_conflict(
            conflict.id,
            ResolutionStrategy::Merge(Some(doc(json!({"name": "Z", "note": "kept"})))),
        )
        .await
        .unwrap();
    assert_eq!(record.data["name"], json!("Z"));
    assert_eq!(record.data["note"], json!("kept"));
    assert_eq!(record.data["price"], json!(5));
    assert!(record.updated_at > 200);
    assert!(phone.pending_conflicts().is_empty());
    assert_eq!(phone.replica().get("notes", "n1").unwrap().unwrap(), record);

    assert!(laptop.run_cycle().await.is_completed());
    assert_eq!(laptop.replica().get("notes", "n1").unwrap().unwrap().data, record.data);
}

#[tokio::test]
async fn offline_create_then_delete_never_reaches_server() {
    let clock = Arc::new(ManualClock::new(100));
    let server = server(&clock, ServerConfig::new());
    let phone = device(&server, "alice", &clock);

    let record = phone.replica().create("notes", doc(json!({"a": 1}))).unwrap();
    phone.replica().delete("notes", &record.id).unwrap();
    assert_eq!(phone.replica().pending_count(), 0);

    let outcome = phone.run_cycle().await;
    assert_eq!(outcome.summary().unwrap().pushed, 0);
    assert!(server.service().store().get("notes", &record.id).unwrap().is_none());
}

#[tokio::test]
async fn bootstrap_watermark_has_no_phantom_redelivery() {
    let clock = Arc::new(ManualClock::new(100));
    let server = server(&clock, ServerConfig::new());
    let phone = device(&server, "alice", &clock);
    for i in 0..3 {
        phone
            .replica()
            .create_with_id("notes", &format!("n{i}"), doc(json!({"i": i})))
            .unwrap();
    }
    assert!(phone.run_cycle().await.is_completed());

    let tablet = device(&server, "alice", &clock);
    let outcome = tablet.run_cycle().await;
    assert_eq!(outcome.summary().unwrap().pulled, 3);
    let cursor = tablet.replica().cursor("notes").unwrap().last_sync_timestamp;

    let changes = server
        .service()
        .handle_changes(ChangesRequest::new(
            PrincipalId::new("alice"),
            vec!["notes".into()],
            cursor,
        ))
        .unwrap();
    assert_eq!(changes.record_count(), 0);

    let outcome = tablet.run_cycle().await;
    assert_eq!(outcome.summary().unwrap().pulled, 0);
    assert!(tablet.replica().cursor("notes").unwrap().last_sync_timestamp >= cursor);
}

#[tokio::test]
async fn lost_response_replays_idempotently() {
    let clock = Arc::new(ManualClock::new(100));
    let server = server(&clock, ServerConfig::new());
    let link = Arc::new(LossyLink {
        server: Arc::clone(&server),
        drop_next_response: AtomicBool::new(true),
    });
    let phone = device_on(Arc::clone(&link), "alice", &clock);

    phone
        .replica()
        .create_with_id("notes", "n1", doc(json!({"a": 1})))
        .unwrap();
    let outcome = phone.run_cycle().await;
    assert!(outcome.is_completed());
    assert_eq!(outcome.summary().unwrap().requeued, 1);
    assert_eq!(phone.replica().pending_count(), 1);
    assert!(server.service().store().get("notes", "n1").unwrap().is_some());

    clock.advance(10);
    let outcome = phone.run_cycle().await;
    assert_eq!(outcome.summary().unwrap().pushed, 1);
    assert_eq!(phone.replica().pending_count(), 0);

    // The same for an update whose response is lost. The resend carries the
    // same change id, so the server recognizes it despite the stale base.
    phone.replica().update("notes", "n1", doc(json!({"a": 2}))).unwrap();
    link.drop_next_response.store(true, Ordering::SeqCst);
    phone.run_cycle().await;

    // An edit made meanwhile queues behind the unanswered one.
    clock.advance(10);
    phone.replica().update("notes", "n1", doc(json!({"b": 3}))).unwrap();
    assert_eq!(phone.replica().pending_count(), 2);

    let outcome = phone.run_cycle().await;
    let summary = outcome.summary().unwrap();
    assert!(summary.conflicts.is_empty());
    assert_eq!(summary.pushed, 2);
    assert_eq!(summary.applied[0].outcome, ApplyOutcome::Duplicate);
    assert_eq!(summary.applied[1].outcome, ApplyOutcome::Updated);
    assert_eq!(phone.replica().pending_count(), 0);
    assert_eq!(
        server.service().store().get("notes", "n1").unwrap().unwrap().data,
        doc(json!({"a": 2, "b": 3}))
    );
}

#[tokio::test]
async fn sequential_updates_never_conflict() {
    let clock = Arc::new(ManualClock::new(100));
    let server = server(&clock, ServerConfig::new());
    let phone = device(&server, "alice", &clock);

    phone.replica().create_with_id("notes", "n1", Document::new()).unwrap();
    phone.run_cycle().await;
    for i in 0..5 {
        clock.advance(1);
        phone
            .replica()
            .update("notes", "n1", doc(json!({"count": i})))
            .unwrap();
        let outcome = phone.run_cycle().await;
        assert!(outcome.summary().unwrap().conflicts.is_empty());
    }
    assert_eq!(
        server.service().store().get("notes", "n1").unwrap().unwrap().data["count"],
        json!(4)
    );
}

#[tokio::test]
async fn offline_edits_collapse_before_push() {
    let clock = Arc::new(ManualClock::new(100));
    let server = server(&clock, ServerConfig::new());
    let phone = device(&server, "alice", &clock);
    phone.replica().create_with_id("notes", "n1", Document::new()).unwrap();
    phone.run_cycle().await;

    phone.replica().update("notes", "n1", doc(json!({"a": 1}))).unwrap();
    phone.replica().update("notes", "n1", doc(json!({"a": 2}))).unwrap();
    let pending = phone.replica().pending_changes();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].kind, ChangeKind::Update);
    assert_eq!(pending[0].payload, Some(doc(json!({"a": 2}))));

    let outcome = phone.run_cycle().await;
    assert_eq!(outcome.summary().unwrap().pushed, 1);
    assert_eq!(
        server.service().store().get("notes", "n1").unwrap().unwrap().data["a"],
        json!(2)
    );
}

#[tokio::test]
async fn cursor_only_moves_forward() {
    let clock = Arc::new(ManualClock::new(100));
    let server = server(&clock, ServerConfig::new());
    let phone = device(&server, "alice", &clock);

    let mut last = i64::MIN;
    for _ in 0..4 {
        assert!(phone.run_cycle().await.is_completed());
        let cursor = phone.replica().cursor("notes").unwrap().last_sync_timestamp;
        assert!(cursor > last);
        last = cursor;
    }
}

#[tokio::test]
async fn offline_device_keeps_queue_until_reconnect() {
    let clock = Arc::new(ManualClock::new(100));
    let server = server(&clock, ServerConfig::new());
    let phone = device(&server, "alice", &clock);
    phone.run_cycle().await;

    phone.transport().client().set_online(false);
    phone.replica().create_with_id("notes", "n1", Document::new()).unwrap();
    let outcome = phone.run_cycle().await;
    assert_eq!(outcome.kind(), OutcomeKind::Failed);
    assert_eq!(phone.replica().pending_count(), 1);
    assert!(phone.health().last_error.is_some());

    phone.transport().client().set_online(true);
    let outcome = phone.run_cycle().await;
    assert_eq!(outcome.summary().unwrap().pushed, 1);
    assert!(phone.health().last_error.is_none());
    assert!(server.service().store().get("notes", "n1").unwrap().is_some());
}

#[tokio::test]
async fn remote_delete_drops_local_conflict() {
    let clock = Arc::new(ManualClock::new(100));
    let server = server(&clock, ServerConfig::new());
    let phone = device(&server, "alice", &clock);
    let laptop = device(&server, "alice", &clock);

    phone.replica().create_with_id("notes", "n1", doc(json!({"v": 0}))).unwrap();
    phone.run_cycle().await;
    laptop.run_cycle().await;

    clock.set(200);
    laptop.replica().update("notes", "n1", doc(json!({"v": 1}))).unwrap();
    laptop.run_cycle().await;
    clock.set(300);
    phone.replica().update("notes", "n1", doc(json!({"v": 2}))).unwrap();
    phone.run_cycle().await;
    assert_eq!(phone.pending_conflicts().len(), 1);

    clock.set(400);
    laptop.run_cycle().await;
    laptop.replica().delete("notes", "n1").unwrap();
    laptop.run_cycle().await;

    phone.run_cycle().await;
    assert!(phone.pending_conflicts().is_empty());
    assert!(phone.replica().get("notes", "n1").unwrap().is_none());
}

#[tokio::test]
async fn resolving_after_remote_delete_reports_deletion() {
    let clock = Arc::new(ManualClock::new(100));
    let server = server(&clock, ServerConfig::new());
    let phone = device(&server, "alice", &clock);
    let laptop = device(&server, "alice", &clock);

    phone.replica().create_with_id("notes", "n1", doc(json!({"v": 0}))).unwrap();
    phone.run_cycle().await;
    laptop.run_cycle().await;

    clock.set(200);
    laptop.replica().update("notes", "n1", doc(json!({"v": 1}))).unwrap();
    laptop.run_cycle().await;
    clock.set(300);
    phone.replica().update("notes", "n1", doc(json!({"v": 2}))).unwrap();
    let conflict = phone.run_cycle().await.summary().unwrap().conflicts[0].clone();

    // Tombstoned directly in the store: a delete pushed through the service
    // would already have dropped the server's conflict.
    let store = server.service().store();
    let current = store.get("notes", "n1").unwrap().unwrap();
    store.put(current.tombstone(current.updated_at + 1)).unwrap();

    clock.set(400);
    let err = phone
        .resolve_conflict(conflict.id, ResolutionStrategy::Client)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        SyncError::Rejected {
            kind: ErrorKind::RecordDeleted,
            ..
        }
    ));
    assert!(phone.pending_conflicts().is_empty());
}

#[tokio::test]
async fn authenticated_devices_sync_and_strangers_fail() {
    let clock = Arc::new(ManualClock::new(100));
    let server = server(&clock, ServerConfig::new().with_auth(b"integration-secret".to_vec()));
    let token = server
        .validator()
        .unwrap()
        .create_token(&PrincipalId::new("alice"))
        .unwrap();

    let transport = HttpTransport::new("http://sync.local", LoopbackClient::new(Arc::clone(&server)))
        .with_credential(token);
    let replica = LocalReplica::in_memory(PrincipalId::new("alice"), clock.clone());
    let phone = SyncCoordinator::new(sync_config("alice"), transport, replica).unwrap();
    assert!(phone.run_cycle().await.is_completed());

    let stranger = device(&server, "alice", &clock);
    match stranger.run_cycle().await {
        tidesync_engine::CycleOutcome::Failed { error, .. } => {
            assert!(matches!(
                error,
                SyncError::Rejected {
                    kind: ErrorKind::Unauthorized,
                    ..
                }
            ));
        }
        other => panic!("expected failure, got {other:?}"),
    }
}

#[tokio::test]
async fn shared_collections_are_visible_to_everyone() {
    let clock = Arc::new(ManualClock::new(100));
    let server = server(&clock, ServerConfig::new().with_shared_collection("catalog"));
    let config = |who: &str| sync_config(who).with_collection("catalog");
    let replica = |who: &str| LocalReplica::in_memory(PrincipalId::new(who), clock.clone());
    let transport = || HttpTransport::new("http://sync.local", LoopbackClient::new(Arc::clone(&server)));

    let alice = SyncCoordinator::new(config("alice"), transport(), replica("alice")).unwrap();
    let bob = SyncCoordinator::new(config("bob"), transport(), replica("bob")).unwrap();

    alice.replica().create_with_id("catalog", "c1", doc(json!({"sku": 1}))).unwrap();
    alice.replica().create_with_id("notes", "private", Document::new()).unwrap();
    alice.run_cycle().await;
    bob.run_cycle().await;

    assert!(bob.replica().get("catalog", "c1").unwrap().is_some());
    assert!(bob.replica().get("notes", "private").unwrap().is_none());
}

#[tokio::test]
async fn queued_changes_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(ManualClock::new(100));
    let server = server(&clock, ServerConfig::new());
    let open = || {
        let store = FileStateStore::open(dir.path()).unwrap();
        let replica =
            LocalReplica::open(PrincipalId::new("alice"), clock.clone(), Box::new(store)).unwrap();
        let transport =
            HttpTransport::new("http://sync.local", LoopbackClient::new(Arc::clone(&server)));
        SyncCoordinator::new(sync_config("alice"), transport, replica).unwrap()
    };

    let phone = open();
    phone.run_cycle().await;
    phone.transport().client().set_online(false);
    phone.replica().create_with_id("notes", "n1", doc(json!({"a": 1}))).unwrap();
    drop(phone);

    let phone = open();
    assert_eq!(phone.replica().pending_count(), 1);
    assert!(phone.replica().cursor("notes").is_some());
    assert_eq!(phone.run_cycle().await.summary().unwrap().pushed, 1);
    assert!(server.service().store().get("notes", "n1").unwrap().is_some());
}

#[tokio::test]
async fn trigger_bursts_run_one_cycle() {
    let clock = Arc::new(ManualClock::new(100));
    let server = server(&clock, ServerConfig::new());
    let phone = Arc::new(device(&server, "alice", &clock));
    phone.replica().create_with_id("notes", "n1", Document::new()).unwrap();

    let sync = spawn_sync_loop(Arc::clone(&phone));
    let mut events = sync.events();
    let handle = sync.handle();
    handle.reconnected();
    for _ in 0..10 {
        handle.sync_now();
    }

    tokio::time::timeout(Duration::from_secs(2), events.changed())
        .await
        .unwrap()
        .unwrap();
    let event = events.borrow_and_update().unwrap();
    assert_eq!(event.cycle, 1);
    assert_eq!(event.outcome, OutcomeKind::Completed);
    sync.shutdown().await;

    assert_eq!(phone.stats().cycles_completed, 1);
    assert_eq!(phone.replica().pending_count(), 0);
}

#[tokio::test]
async fn server_health_follows_pulls() {
    let clock = Arc::new(ManualClock::new(100));
    let server = server(&clock, ServerConfig::new().with_stale_after(Duration::from_secs(60)));
    let phone = device(&server, "alice", &clock);

    assert!(phone.remote_health().await.unwrap().needs_sync);
    phone.run_cycle().await;
    assert!(!phone.remote_health().await.unwrap().needs_sync);
    clock.advance(61_000);
    assert!(phone.remote_health().await.unwrap().needs_sync);
}

//! # Service Integration Tests
//!
//! User-facing storage operations: local writes, best-effort mirroring and the
//! pending-log fallback, plus the auth-driven lifecycle.

mod common;

use std::sync::Arc;

use common::{eventually, local_program, session, Harness};
use liftlog_core::{
    Collection, ConnectivityMonitor, Exercise, OperationKind, ParseError, PendingLog, Program,
    UserId, Workout,
};
use liftlog_sync::{
    DocumentStore, EngineConfig, FileStore, MemoryRemote, ServiceError, SessionAuth, SyncEngine,
    SyncService,
};

fn spreadsheet_parser(name: &str, bytes: &[u8]) -> Result<Program, ParseError> {
    if bytes.is_empty() {
        return Err(ParseError::Empty);
    }
    let mut program = Program::new(name);
    program.workouts = vec![Workout::new("1", "A", vec![Exercise::named("Squat")])];
    Ok(program)
}

// ---------------------------------------------------------------------------
// Programs
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_store_program_online_mirrors_immediately() {
    let h = Harness::online();
    let service = h.service();

    let stored = service
        .store_program(Program::with_id("p1", "Strength"))
        .await
        .expect("store");

    let remote = h.remote.get_program("p1").await.expect("get").expect("mirrored");
    assert_eq!(remote.updated_at, stored.updated_at);
    assert_eq!(remote.user_id, Some(common::user()));
    assert!(h.pending.is_empty());
}

#[tokio::test]
async fn test_store_program_offline_queues_upsert() {
    let h = Harness::offline();
    let service = h.service();

    service
        .store_program(Program::with_id("p1", "Strength"))
        .await
        .expect("store");

    assert!(local_program(&h.local, "p1").await.is_some());
    assert_eq!(h.remote.write_count(), 0);
    let queued = h.pending.list_pending();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].kind, OperationKind::Upsert);
    assert_eq!(queued[0].entity_id, "p1");
}

/// A remote failure while online falls back to the pending log.
#[tokio::test]
async fn test_store_program_remote_failure_queues_upsert() {
    let h = Harness::online();
    h.remote.reject("p1");
    let service = h.service();

    service
        .store_program(Program::with_id("p1", "Strength"))
        .await
        .expect("local write still succeeds");

    assert!(h.pending.has_pending(Collection::Programs, "p1"));
}

/// Every save moves the clock forward, even with a stale input clock.
#[tokio::test]
async fn test_store_program_advances_clock() {
    let h = Harness::offline();
    let service = h.service();

    let first = service
        .store_program(Program::with_id("p1", "v1"))
        .await
        .expect("store");
    let mut stale = first.clone();
    stale.name = "v2".into();
    stale.updated_at = 1;
    let second = service.store_program(stale).await.expect("store");

    assert!(second.updated_at > first.updated_at);
}

#[tokio::test]
async fn test_deleted_programs_are_hidden() {
    let h = Harness::offline();
    let service = h.service();
    service
        .store_program(Program::with_id("p1", "Keep"))
        .await
        .expect("store");
    service
        .store_program(Program::with_id("p2", "Drop"))
        .await
        .expect("store");

    assert!(service.delete_program("p2").await.expect("delete"));

    assert!(service.get_program("p2").await.expect("get").is_none());
    let names: Vec<_> = service
        .list_programs()
        .await
        .expect("list")
        .into_iter()
        .map(|p| p.name)
        .collect();
    assert_eq!(names, ["Keep"]);
    assert!(local_program(&h.local, "p2").await.expect("tombstone").deleted);
}

#[tokio::test]
async fn test_delete_missing_program_returns_false() {
    let h = Harness::online();
    assert!(!h.service().delete_program("nope").await.expect("delete"));
}

/// Online deletes are confirmed remotely and removed outright.
#[tokio::test]
async fn test_delete_program_online() {
    let h = Harness::online();
    let service = h.service();
    service
        .store_program(Program::with_id("p1", "Gone"))
        .await
        .expect("store");

    assert!(service.delete_program("p1").await.expect("delete"));

    assert!(local_program(&h.local, "p1").await.is_none());
    assert!(h.remote.get_program("p1").await.expect("get").expect("tombstone").deleted);
    assert!(h.pending.is_empty());
}

/// Offline deletes queue behind earlier writes and purge the tombstone on replay.
#[tokio::test]
async fn test_delete_program_offline_then_replay() {
    let h = Harness::offline();
    let service = h.service();
    service
        .store_program(Program::with_id("p1", "Gone"))
        .await
        .expect("store");
    service.delete_program("p1").await.expect("delete");

    let kinds: Vec<_> = h.pending.list_pending().iter().map(|op| op.kind).collect();
    assert_eq!(kinds, [OperationKind::Upsert, OperationKind::Delete]);

    h.monitor.set_online(true);
    let report = h.engine.drain_pending().await.expect("online");
    assert_eq!(report.applied, 2);
    assert!(local_program(&h.local, "p1").await.is_none());
    assert!(h.remote.get_program("p1").await.expect("get").expect("tombstone").deleted);
}

/// A successful remote delete drops writes still queued for that program.
#[tokio::test]
async fn test_delete_program_discards_stale_queued_writes() {
    let h = Harness::online();
    h.remote.set_available(false);
    let service = h.service();
    service
        .store_program(Program::with_id("p1", "Queued"))
        .await
        .expect("store");
    assert_eq!(h.pending.len(), 1);

    h.remote.set_available(true);
    h.remote
        .put_program(&Program::with_id("p1", "Queued"))
        .await
        .expect("put");
    service.delete_program("p1").await.expect("delete");

    assert!(h.pending.is_empty());
}

// ---------------------------------------------------------------------------
// Sessions
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_record_session_updates_program_history() {
    let h = Harness::online();
    let service = h.service();
    service
        .store_program(Program::with_id("p1", "Strength"))
        .await
        .expect("store");

    let late = service
        .record_session(session("s2", "p1", "2024-03-08", 0))
        .await
        .expect("record");
    service
        .record_session(session("s1", "p1", "2024-03-01", 0))
        .await
        .expect("record");

    assert!(h.local.get_session(&late.id).await.expect("get").is_some());
    let program = service.get_program("p1").await.expect("get").expect("exists");
    let dates: Vec<_> = program.history.iter().map(|s| s.date.as_str()).collect();
    assert_eq!(dates, ["2024-03-01", "2024-03-08"]);

    assert!(h.remote.get_session("s1").await.expect("get").is_some());
    let remote = h.remote.get_program("p1").await.expect("get").expect("exists");
    assert_eq!(remote.history.len(), 2);
}

#[tokio::test]
async fn test_record_session_requires_program() {
    let h = Harness::online();
    let err = h
        .service()
        .record_session(session("s1", "missing", "2024-03-01", 0))
        .await
        .unwrap_err();

    assert!(matches!(err, ServiceError::ProgramNotFound(id) if id == "missing"));
    assert!(h.local.get_session("s1").await.expect("get").is_none());
}

// ---------------------------------------------------------------------------
// Import
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_import_program_stores_parsed_program() {
    let h = Harness::offline();
    let service = h.service();

    let program = service
        .import_program("Block 1", b"week,day,exercise", &spreadsheet_parser)
        .await
        .expect("import");

    assert_eq!(program.name, "Block 1");
    let stored = service.get_program(&program.id).await.expect("get").expect("stored");
    assert_eq!(stored.workouts.len(), 1);
}

#[tokio::test]
async fn test_import_program_rejects_bad_file() {
    let h = Harness::offline();
    let service = h.service();

    let err = service
        .import_program("Empty", b"", &spreadsheet_parser)
        .await
        .unwrap_err();

    assert!(matches!(err, ServiceError::Parse(ParseError::Empty)));
    assert!(service.list_programs().await.expect("list").is_empty());
    assert!(h.pending.is_empty());
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

/// Sync follows the signed-in user.
#[tokio::test]
async fn test_start_follows_auth_changes() {
    let h = Harness::online();
    h.auth.sign_out();
    let service = h.service();
    service.start().await.expect("start");
    assert!(!service.status().live);

    h.auth.sign_in(UserId::new("u1"));
    let engine = h.engine.clone();
    eventually("live sync after sign-in", || {
        let engine = engine.clone();
        async move { engine.status().live }
    })
    .await;

    h.auth.sign_out();
    let engine = h.engine.clone();
    eventually("sync to stop after sign-out", || {
        let engine = engine.clone();
        async move { !engine.status().live }
    })
    .await;

    service.shutdown();
}

/// A file-backed store is unusable until `start` initialises it.
#[tokio::test]
async fn test_start_initialises_file_store() {
    let dir = tempfile::tempdir().expect("tempdir");
    let build = || {
        let store = FileStore::open(dir.path()).expect("open");
        let engine = SyncEngine::new(
            Arc::new(store.clone()),
            Arc::new(MemoryRemote::new()),
            Arc::new(SessionAuth::new()),
            ConnectivityMonitor::new(false),
            PendingLog::in_memory(),
            EngineConfig::default(),
        );
        (store, SyncService::new(engine))
    };

    let (store, service) = build();
    assert!(store.get_program("p1").await.is_err());
    service.start().await.expect("start");
    service
        .store_program(Program::with_id("p1", "Persisted"))
        .await
        .expect("store");
    service.shutdown();

    let (_, restarted) = build();
    restarted.start().await.expect("start");
    let program = restarted.get_program("p1").await.expect("get").expect("exists");
    assert_eq!(program.name, "Persisted");
    restarted.shutdown();
}

#[tokio::test]
async fn test_force_push_and_pull() {
    let h = Harness::online();
    let service = h.service();
    h.local
        .put_program(&common::program("p1", "Local", 100))
        .await
        .expect("put");
    h.remote
        .put_program(&common::program("p2", "Remote", 100))
        .await
        .expect("put");

    let (drained, pushed) = service.force_push().await;
    assert_eq!(drained.expect("online").attempted, 0);
    assert_eq!(pushed.report().expect("completed").programs, 1);

    let pulled = service.force_pull().await;
    assert_eq!(pulled.report().expect("completed").programs, 1);
    assert!(local_program(&h.local, "p2").await.is_some());

    let status = service.status();
    assert!(status.last_push_at.is_some());
    assert!(status.last_pull_at.is_some());
}

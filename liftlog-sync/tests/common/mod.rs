//! Test harness for integration tests.
//!
//! Wires a [`SyncEngine`] to an in-memory local store, a [`MemoryRemote`] and
//! session auth, with handles kept so tests can poke every side directly.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use liftlog_core::{ConnectivityMonitor, PendingLog, Program, Session, UserId};
use liftlog_sync::{
    DocumentStore, EngineConfig, FileStore, MemoryRemote, SessionAuth, SyncEngine, SyncService,
};

/// The user every harness signs in as.
pub const USER: &str = "u1";

/// An engine and handles to all of its collaborators.
pub struct Harness {
    pub engine: SyncEngine,
    pub local: FileStore,
    pub remote: MemoryRemote,
    pub auth: Arc<SessionAuth>,
    pub monitor: ConnectivityMonitor,
    pub pending: PendingLog,
}

impl Harness {
    /// Signed in as [`USER`] and online.
    pub fn online() -> Self {
        Self::build(true, PendingLog::in_memory())
    }

    /// Signed in as [`USER`] and offline.
    pub fn offline() -> Self {
        Self::build(false, PendingLog::in_memory())
    }

    /// Signed in, with the given connectivity and pending log.
    pub fn build(online: bool, pending: PendingLog) -> Self {
        // Keep the timer out of the way; tests drive passes directly.
        Self::with_interval(online, pending, Duration::from_secs(3600))
    }

    /// Like [`Harness::build`], with the periodic timer firing every `sync_interval`.
    pub fn with_interval(online: bool, pending: PendingLog, sync_interval: Duration) -> Self {
        let local = FileStore::in_memory();
        let remote = MemoryRemote::new();
        let auth = Arc::new(SessionAuth::signed_in(user()));
        let monitor = ConnectivityMonitor::new(online);
        let engine = SyncEngine::new(
            Arc::new(local.clone()),
            Arc::new(remote.clone()),
            auth.clone(),
            monitor.clone(),
            pending.clone(),
            EngineConfig {
                sync_interval,
                ..EngineConfig::default()
            },
        );
        Self {
            engine,
            local,
            remote,
            auth,
            monitor,
            pending,
        }
    }

    /// Start live sync and let the initial snapshots settle.
    pub async fn go_live(&self) {
        self.engine.init_sync().await;
        settle().await;
    }

    /// A service over this harness's engine.
    pub fn service(&self) -> SyncService {
        SyncService::new(self.engine.clone())
    }
}

pub fn user() -> UserId {
    UserId::new(USER)
}

/// A program owned by [`USER`] with an explicit clock.
pub fn program(id: &str, name: &str, updated_at: u64) -> Program {
    let mut program = Program::with_id(id, name);
    program.user_id = Some(user());
    program.updated_at = updated_at;
    program
}

/// A session owned by [`USER`] with an explicit clock.
pub fn session(id: &str, program_id: &str, date: &str, updated_at: u64) -> Session {
    let mut session = Session::new(program_id, date);
    session.id = id.to_string();
    session.user_id = Some(user());
    session.updated_at = updated_at;
    session
}

/// Give spawned sync tasks a moment to process what they have been sent.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

/// Poll `check` until it holds or two seconds pass.
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let waited = tokio::time::timeout(Duration::from_secs(2), async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {what}");
}

/// The local program with `id`, including tombstones.
pub async fn local_program(store: &FileStore, id: &str) -> Option<Program> {
    store.get_program(id).await.expect("local get")
}

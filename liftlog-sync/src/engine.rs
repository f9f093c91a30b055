//! # Sync Engine
//!
//! Reconciles the local store with the remote store for the signed-in user.
//!
//! ## Passes
//!
//! ```text
//! push   local ──▶ remote   every local doc that is newer or missing remotely
//! pull   remote ──▶ local   remote wins if newer, merge on an exact tie
//! watch  remote ──▶ local   pull logic per snapshot, plus deletion checks
//! drain  pending ──▶ remote replay of queued writes (see `replay`)
//! ```
//!
//! Push, pull and watch passes share one single-flight flag: a pass that finds
//! another one running is skipped, not queued. Drain is not guarded.
//!
//! ## Lifecycle
//!
//! `init_sync` installs a reconnect hook on the [`ConnectivityMonitor`] and,
//! when online, pulls, drains, opens the live watches and starts the periodic
//! timer. When it runs offline, the first reconnect does the same work.
//! `stop_sync` tears everything down again.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use liftlog_core::{
    merge_programs, merge_sessions, now_ms, resolve, Collection, ConnectivityMonitor, Document,
    ListenerId, PendingLog, PendingOperation, Program, RemovalReason, Resolution, Session,
    StorageResult, UserId, Versioned,
};
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::auth::AuthProvider;
use crate::config::{EngineConfig, MIN_TICK};
use crate::metrics;
use crate::replay::{self, DrainReport};
use crate::store::{DocumentStore, RemoteStore, Watch};

/// Why a pass did not run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// The monitor reports offline.
    Offline,
    /// No authenticated user.
    SignedOut,
    /// Another pass holds the single-flight flag.
    InProgress,
}

impl SkipReason {
    fn as_str(self) -> &'static str {
        match self {
            Self::Offline => "offline",
            Self::SignedOut => "signed_out",
            Self::InProgress => "in_progress",
        }
    }
}

/// Counters for one completed pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PassReport {
    /// Programs written to the target side.
    pub programs: usize,
    /// Sessions written to the target side.
    pub sessions: usize,
    /// Local copies removed after the remote confirmed their deletion.
    pub deleted_locally: usize,
    /// Local copies queued for re-push because the remote had lost them.
    pub requeued: usize,
    /// Store calls that failed; the pass continued past each one.
    pub failures: usize,
}

/// Result of a push, pull or watch pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassOutcome {
    /// The pass ran.
    Completed(PassReport),
    /// The pass was not started.
    Skipped(SkipReason),
}

impl PassOutcome {
    /// The report, if the pass ran.
    #[must_use]
    pub fn report(&self) -> Option<&PassReport> {
        match self {
            Self::Completed(report) => Some(report),
            Self::Skipped(_) => None,
        }
    }

    /// Whether the pass was skipped.
    #[must_use]
    pub fn is_skipped(&self) -> bool {
        matches!(self, Self::Skipped(_))
    }
}

/// Point-in-time view of the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    /// Monitor state.
    pub online: bool,
    /// A pass currently holds the single-flight flag.
    pub syncing: bool,
    /// Signed-in user.
    pub user: Option<UserId>,
    /// Live watches and the periodic timer are running.
    pub live: bool,
    /// Queued operations.
    pub pending: usize,
    /// Operations lost at the retry ceiling since startup.
    pub abandoned: u64,
    /// Completion time of the last push (ms since epoch).
    pub last_push_at: Option<u64>,
    /// Completion time of the last pull (ms since epoch).
    pub last_pull_at: Option<u64>,
}

/// RAII holder of the single-flight flag.
struct FlightGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> FlightGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { flag })
    }
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// Running watch and timer tasks.
struct LiveTasks {
    handles: Vec<JoinHandle<()>>,
    shutdown: Vec<oneshot::Sender<()>>,
}

impl LiveTasks {
    fn push(&mut self, (handle, shutdown): (JoinHandle<()>, oneshot::Sender<()>)) {
        self.handles.push(handle);
        self.shutdown.push(shutdown);
    }

    fn stop(self) {
        for tx in self.shutdown {
            let _ = tx.send(());
        }
        // Abort handles as backup
        for handle in self.handles {
            handle.abort();
        }
    }
}

#[derive(Default)]
struct SyncTasks {
    user: Option<UserId>,
    reconnect_hook: Option<ListenerId>,
    live: Option<LiveTasks>,
}

#[derive(Default)]
struct PassClock {
    last_push_at: Option<u64>,
    last_pull_at: Option<u64>,
}

struct EngineInner {
    local: Arc<dyn DocumentStore>,
    remote: Arc<dyn RemoteStore>,
    auth: Arc<dyn AuthProvider>,
    monitor: ConnectivityMonitor,
    pending: PendingLog,
    config: EngineConfig,
    in_flight: AtomicBool,
    tasks: Mutex<SyncTasks>,
    clock: Mutex<PassClock>,
    removal_observer: ListenerId,
    connectivity_listener: ListenerId,
}

impl Drop for EngineInner {
    fn drop(&mut self) {
        let tasks = std::mem::take(
            self.tasks
                .get_mut()
                .unwrap_or_else(PoisonError::into_inner),
        );
        if let Some(hook) = tasks.reconnect_hook {
            self.monitor.remove_reconnect(hook);
        }
        if let Some(live) = tasks.live {
            live.stop();
        }
        self.pending.remove_observer(self.removal_observer);
        self.monitor.unsubscribe(self.connectivity_listener);
    }
}

/// The bidirectional sync engine. Cloning yields another handle to the same engine.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<EngineInner>,
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl SyncEngine {
    /// Wire an engine to its collaborators.
    pub fn new(
        local: Arc<dyn DocumentStore>,
        remote: Arc<dyn RemoteStore>,
        auth: Arc<dyn AuthProvider>,
        monitor: ConnectivityMonitor,
        pending: PendingLog,
        config: EngineConfig,
    ) -> Self {
        let removal_observer = pending.on_removed(|removal| match removal.reason {
            RemovalReason::Applied => metrics::record_pending_applied(),
            RemovalReason::Abandoned => metrics::record_pending_abandoned(),
            RemovalReason::Discarded => {}
        });
        let connectivity_listener = monitor.subscribe(|online| metrics::set_online(*online));

        Self {
            inner: Arc::new(EngineInner {
                local,
                remote,
                auth,
                monitor,
                pending,
                config,
                in_flight: AtomicBool::new(false),
                tasks: Mutex::new(SyncTasks::default()),
                clock: Mutex::new(PassClock::default()),
                removal_observer,
                connectivity_listener,
            }),
        }
    }

    /// Local store.
    #[must_use]
    pub fn local(&self) -> &Arc<dyn DocumentStore> {
        &self.inner.local
    }

    /// Remote store.
    #[must_use]
    pub fn remote(&self) -> &Arc<dyn RemoteStore> {
        &self.inner.remote
    }

    /// Auth collaborator.
    #[must_use]
    pub fn auth(&self) -> &Arc<dyn AuthProvider> {
        &self.inner.auth
    }

    /// Connectivity monitor.
    #[must_use]
    pub fn monitor(&self) -> &ConnectivityMonitor {
        &self.inner.monitor
    }

    /// Pending operation log.
    #[must_use]
    pub fn pending(&self) -> &PendingLog {
        &self.inner.pending
    }

    /// Whether a pass currently holds the single-flight flag.
    #[must_use]
    pub fn is_syncing(&self) -> bool {
        self.inner.in_flight.load(Ordering::Acquire)
    }

    /// Snapshot of the engine state.
    #[must_use]
    pub fn status(&self) -> SyncStatus {
        let live = self.tasks().live.is_some();
        let clock = self
            .inner
            .clock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        SyncStatus {
            online: self.inner.monitor.is_online(),
            syncing: self.is_syncing(),
            user: self.inner.auth.current_user(),
            live,
            pending: self.inner.pending.len(),
            abandoned: self.inner.pending.abandoned_count(),
            last_push_at: clock.last_push_at,
            last_pull_at: clock.last_pull_at,
        }
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Start syncing for the current user. No-op when signed out.
    ///
    /// Re-initialising tears down the previous watches and timer first.
    pub async fn init_sync(&self) {
        let Some(user) = self.inner.auth.current_user() else {
            tracing::debug!("init_sync: no authenticated user");
            return;
        };

        self.stop_sync();
        match self.inner.pending.reload() {
            Ok(count) => metrics::set_pending_operations(count),
            Err(e) => tracing::warn!(error = %e, "Failed to reload pending log"),
        }

        let hook = self.install_reconnect_hook();
        {
            let mut tasks = self.tasks();
            tasks.user = Some(user.clone());
            tasks.reconnect_hook = hook;
        }

        if self.inner.monitor.is_online() {
            tracing::info!(user = %user, "Starting sync");
            self.go_live(&user).await;
        } else {
            tracing::info!(user = %user, "Offline; sync starts on reconnect");
        }
    }

    /// Stop the watches and timer and remove the reconnect hook.
    pub fn stop_sync(&self) {
        let (hook, live) = {
            let mut tasks = self.tasks();
            tasks.user = None;
            (tasks.reconnect_hook.take(), tasks.live.take())
        };
        if let Some(hook) = hook {
            self.inner.monitor.remove_reconnect(hook);
        }
        if let Some(live) = live {
            live.stop();
            tracing::info!("Sync stopped");
        }
    }

    fn install_reconnect_hook(&self) -> Option<ListenerId> {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!("No tokio runtime; reconnect hook not installed");
            return None;
        };
        let weak = Arc::downgrade(&self.inner);
        Some(self.inner.monitor.on_reconnect(move |()| {
            let weak = weak.clone();
            runtime.spawn(async move {
                if let Some(inner) = weak.upgrade() {
                    SyncEngine { inner }.on_reconnect().await;
                }
            });
        }))
    }

    async fn on_reconnect(&self) {
        let Some(user) = self.tasks().user.clone() else {
            return;
        };
        tracing::info!("Reconnected; replaying pending operations");
        self.drain_pending().await;
        self.push_to_remote().await;
        let live = self.tasks().live.is_some();
        if !live {
            self.go_live(&user).await;
        }
    }

    async fn go_live(&self, user: &UserId) {
        self.pull_from_remote().await;
        self.drain_pending().await;
        self.start_live(user).await;
    }

    async fn start_live(&self, user: &UserId) {
        let already_live = self.tasks().live.is_some();
        if already_live {
            return;
        }

        let weak = Arc::downgrade(&self.inner);
        let mut live = LiveTasks {
            handles: Vec::new(),
            shutdown: Vec::new(),
        };

        match self.inner.remote.watch_programs_by_owner(user).await {
            Ok(watch) => live.push(spawn_watch_task(weak.clone(), watch, "watch_programs")),
            Err(e) => tracing::warn!(error = %e, "Failed to watch remote programs"),
        }
        match self.inner.remote.watch_sessions_by_owner(user).await {
            Ok(watch) => live.push(spawn_watch_task(weak.clone(), watch, "watch_sessions")),
            Err(e) => tracing::warn!(error = %e, "Failed to watch remote sessions"),
        }
        live.push(spawn_timer(weak, self.inner.config.sync_interval));

        let mut tasks = self.tasks();
        if tasks.live.is_some() || tasks.user.as_ref() != Some(user) {
            // Raced with another start or with stop_sync.
            drop(tasks);
            live.stop();
            return;
        }
        tasks.live = Some(live);
        tracing::info!(user = %user, "Live sync running");
    }

    async fn periodic_sync(&self) {
        if !self.inner.monitor.is_online() || self.is_syncing() {
            tracing::trace!("Periodic sync skipped");
            return;
        }
        self.drain_pending().await;
        self.push_to_remote().await;
    }

    // -----------------------------------------------------------------------
    // Passes
    // -----------------------------------------------------------------------

    /// Replay the pending log. `None` when offline.
    pub async fn drain_pending(&self) -> Option<DrainReport> {
        if !self.inner.monitor.is_online() {
            tracing::debug!("Drain skipped while offline");
            return None;
        }
        Some(
            replay::drain(
                &self.inner.pending,
                self.inner.local.as_ref(),
                self.inner.remote.as_ref(),
                self.inner.config.drain_batch_size,
            )
            .await,
        )
    }

    /// Push local documents that are newer than, or missing from, the remote.
    pub async fn push_to_remote(&self) -> PassOutcome {
        let user = match self.gate() {
            Ok(user) => user,
            Err(reason) => return skipped("push", reason),
        };
        let Some(_guard) = FlightGuard::acquire(&self.inner.in_flight) else {
            return skipped("push", SkipReason::InProgress);
        };

        let mut report = PassReport::default();
        let programs: Vec<Program> = match self.inner.local.list_programs().await {
            Ok(programs) => programs
                .into_iter()
                .filter(|p| belongs_to(p, Some(&user)))
                .collect(),
            Err(e) => {
                tracing::warn!(error = %e, "Push: failed to list local programs");
                report.failures += 1;
                return self.finish_push(report);
            }
        };

        let program_lists = join_all(
            programs
                .iter()
                .map(|p| self.inner.local.list_sessions_by_program(&p.id)),
        )
        .await;
        let mut sessions = Vec::new();
        for listed in program_lists {
            match listed {
                Ok(listed) => {
                    let owned = listed.into_iter().filter(|s| belongs_to(s, Some(&user)));
                    sessions.extend(owned);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Push: failed to list local sessions");
                    report.failures += 1;
                }
            }
        }

        let programs_written = self.push_collection(&user, programs, &mut report).await;
        let sessions_written = self.push_collection(&user, sessions, &mut report).await;
        report.programs = programs_written;
        report.sessions = sessions_written;
        self.finish_push(report)
    }

    fn finish_push(&self, report: PassReport) -> PassOutcome {
        self.inner
            .clock
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last_push_at = Some(now_ms());
        metrics::record_pass("push", "completed");
        tracing::info!(
            programs = report.programs,
            sessions = report.sessions,
            failures = report.failures,
            "Push finished"
        );
        PassOutcome::Completed(report)
    }

    /// Commit every document newer than its remote copy. Returns the count written.
    async fn push_collection<T: Synced>(
        &self,
        user: &UserId,
        local: Vec<T>,
        report: &mut PassReport,
    ) -> usize {
        let collection = T::COLLECTION;
        if local.is_empty() {
            return 0;
        }
        let remote_clock: HashMap<String, u64> =
            match T::list_owned(self.inner.remote.as_ref(), user).await {
                Ok(remote) => remote
                    .iter()
                    .map(|doc| (doc.id().to_string(), doc.updated_at()))
                    .collect(),
                Err(e) => {
                    metrics::record_remote_failure("list_owned");
                    tracing::warn!(%collection, error = %e, "Push: remote listing failed");
                    report.failures += 1;
                    return 0;
                }
            };

        let outgoing: Vec<Document> = local
            .into_iter()
            .filter(|doc| {
                remote_clock
                    .get(doc.id())
                    .map_or(true, |&remote_at| doc.updated_at() > remote_at)
            })
            .map(|doc| Into::<Document>::into(doc).owned_by(user))
            .collect();

        let mut written = 0;
        for batch in outgoing.chunks(self.inner.config.push_batch_size.max(1)) {
            match self.inner.remote.commit(batch.to_vec()).await {
                Ok(()) => written += batch.len(),
                Err(e) => {
                    metrics::record_remote_failure("commit");
                    tracing::warn!(
                        %collection,
                        size = batch.len(),
                        error = %e,
                        "Push: batch commit failed"
                    );
                    report.failures += 1;
                }
            }
        }
        metrics::record_documents_written("remote", &collection.to_string(), written);
        written
    }

    /// Pull the user's remote documents into the local store.
    pub async fn pull_from_remote(&self) -> PassOutcome {
        let user = match self.gate() {
            Ok(user) => user,
            Err(reason) => return skipped("pull", reason),
        };
        let Some(_guard) = FlightGuard::acquire(&self.inner.in_flight) else {
            return skipped("pull", SkipReason::InProgress);
        };

        let mut report = PassReport::default();
        let programs: Vec<Program> =
            match self.inner.remote.list_programs_by_owner(&user).await {
                Ok(programs) => programs.into_iter().filter(|p| !p.deleted).collect(),
                Err(e) => {
                    metrics::record_remote_failure("list_owned");
                    tracing::warn!(error = %e, "Pull: failed to list remote programs");
                    report.failures += 1;
                    Vec::new()
                }
            };

        for program in &programs {
            if self.reconcile(program.clone(), &mut report).await {
                report.programs += 1;
            }
        }

        for program in &programs {
            match self
                .inner
                .remote
                .list_sessions_by_program(&program.id)
                .await
            {
                Ok(sessions) => {
                    for session in sessions.into_iter().filter(|s| !s.deleted) {
                        if self.reconcile(session, &mut report).await {
                            report.sessions += 1;
                        }
                    }
                }
                Err(e) => {
                    metrics::record_remote_failure("list_sessions");
                    tracing::warn!(program_id = %program.id, error = %e, "Pull: failed to list sessions");
                    report.failures += 1;
                }
            }
        }

        self.inner
            .clock
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last_pull_at = Some(now_ms());
        metrics::record_pass("pull", "completed");
        metrics::record_documents_written("local", "programs", report.programs);
        metrics::record_documents_written("local", "sessions", report.sessions);
        tracing::info!(
            programs = report.programs,
            sessions = report.sessions,
            failures = report.failures,
            "Pull finished"
        );
        PassOutcome::Completed(report)
    }

    /// Reconcile one live-watch snapshot of the user's documents.
    async fn apply_snapshot<T: Synced>(&self, snapshot: Vec<T>, pass: &'static str) -> PassOutcome {
        let Some(_guard) = FlightGuard::acquire(&self.inner.in_flight) else {
            tracing::debug!(pass, "Snapshot skipped; another pass is running");
            return skipped(pass, SkipReason::InProgress);
        };
        let user = self.inner.auth.current_user();

        let mut report = PassReport::default();
        let seen: HashSet<String> = snapshot.iter().map(|doc| doc.id().to_string()).collect();
        for doc in snapshot {
            if self.reconcile(doc, &mut report).await {
                match T::COLLECTION {
                    Collection::Programs => report.programs += 1,
                    Collection::Sessions => report.sessions += 1,
                }
            }
        }

        match T::list(self.inner.local.as_ref()).await {
            Ok(local) => {
                let missing = local.into_iter().filter(|doc| {
                    !doc.is_deleted()
                        && !seen.contains(doc.id())
                        && belongs_to(doc, user.as_ref())
                });
                for doc in missing {
                    self.reconcile_missing(doc, user.as_ref(), &mut report)
                        .await;
                }
            }
            Err(e) => {
                tracing::warn!(pass, error = %e, "Snapshot: failed to list local documents");
                report.failures += 1;
            }
        }

        metrics::record_pass(pass, "completed");
        tracing::debug!(
            pass,
            programs = report.programs,
            sessions = report.sessions,
            deleted_locally = report.deleted_locally,
            requeued = report.requeued,
            "Snapshot applied"
        );
        PassOutcome::Completed(report)
    }

    /// Store the winning copy of `remote` locally. Returns true if written.
    async fn reconcile<T: Synced>(&self, remote: T, report: &mut PassReport) -> bool {
        if self
            .inner
            .pending
            .has_pending_delete(T::COLLECTION, remote.id())
        {
            tracing::debug!(id = %remote.id(), "Local delete queued; remote copy ignored");
            return false;
        }
        let local = match T::get(self.inner.local.as_ref(), remote.id()).await {
            Ok(local) => local,
            Err(e) => {
                tracing::warn!(id = %remote.id(), error = %e, "Failed to read local copy");
                report.failures += 1;
                return false;
            }
        };

        let winner = match resolve(local.as_ref(), Some(&remote)) {
            Resolution::KeepLocal => return false,
            Resolution::KeepRemote => remote,
            Resolution::Merge => {
                let Some(local) = local else {
                    return false;
                };
                let merged = T::merge(&local, &remote);
                if merged == local {
                    return false;
                }
                merged
            }
        };

        match T::put(self.inner.local.as_ref(), &winner).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(id = %winner.id(), error = %e, "Failed to store remote copy");
                report.failures += 1;
                false
            }
        }
    }

    /// A local document is absent from the owner's snapshot: find out why.
    async fn reconcile_missing<T: Synced>(
        &self,
        local: T,
        user: Option<&UserId>,
        report: &mut PassReport,
    ) {
        let collection = T::COLLECTION;
        // A queued write for this entity will settle it either way.
        if self.inner.pending.has_pending(collection, local.id()) {
            return;
        }

        match T::get(self.inner.remote.as_ref(), local.id()).await {
            Ok(Some(remote)) if remote.is_deleted() => {
                match T::delete(self.inner.local.as_ref(), local.id()).await {
                    Ok(()) => {
                        tracing::info!(%collection, id = %local.id(), "Removed locally after remote deletion");
                        metrics::record_remote_deletion(&collection.to_string());
                        report.deleted_locally += 1;
                    }
                    Err(e) => {
                        tracing::warn!(id = %local.id(), error = %e, "Failed to delete local copy");
                        report.failures += 1;
                    }
                }
            }
            Ok(Some(_)) => {
                tracing::debug!(%collection, id = %local.id(), "Present remotely outside this snapshot");
            }
            Ok(None) => {
                let mut doc: Document = local.into();
                if let Some(user) = user {
                    doc = doc.owned_by(user);
                }
                let id = doc.id().to_string();
                match self.inner.pending.enqueue(PendingOperation::upsert(doc)) {
                    Ok(()) => {
                        tracing::warn!(%collection, id = %id, "Missing remotely; re-push queued");
                        metrics::set_pending_operations(self.inner.pending.len());
                        report.requeued += 1;
                    }
                    Err(e) => {
                        tracing::error!(id = %id, error = %e, "Failed to queue re-push");
                        report.failures += 1;
                    }
                }
            }
            Err(e) => {
                metrics::record_remote_failure("get");
                tracing::warn!(id = %local.id(), error = %e, "Failed to check remote copy");
                report.failures += 1;
            }
        }
    }

    fn gate(&self) -> Result<UserId, SkipReason> {
        if !self.inner.monitor.is_online() {
            return Err(SkipReason::Offline);
        }
        self.inner
            .auth
            .current_user()
            .ok_or(SkipReason::SignedOut)
    }

    fn tasks(&self) -> MutexGuard<'_, SyncTasks> {
        self.inner
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

fn skipped(pass: &str, reason: SkipReason) -> PassOutcome {
    tracing::debug!(pass, reason = reason.as_str(), "Pass skipped");
    metrics::record_pass(pass, reason.as_str());
    PassOutcome::Skipped(reason)
}

/// Feed each snapshot of `watch` into the engine until shut down.
fn spawn_watch_task<T: Synced>(
    engine: Weak<EngineInner>,
    mut watch: Watch<T>,
    pass: &'static str,
) -> (JoinHandle<()>, oneshot::Sender<()>) {
    let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

    let handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    tracing::debug!(pass, "Watch received shutdown signal");
                    break;
                }

                snapshot = watch.next() => {
                    let Some(snapshot) = snapshot else {
                        tracing::warn!(pass, "Watch feed ended");
                        break;
                    };
                    let Some(inner) = engine.upgrade() else {
                        break;
                    };
                    SyncEngine { inner }.apply_snapshot(snapshot, pass).await;
                }
            }
        }
    });

    (handle, shutdown_tx)
}

/// Unowned documents belong to whoever is signed in; owned ones only to their owner.
fn belongs_to<T: Synced>(doc: &T, user: Option<&UserId>) -> bool {
    doc.owner().map_or(true, |owner| Some(owner) == user)
}

/// Drain and push every `period` while online and idle.
fn spawn_timer(
    engine: Weak<EngineInner>,
    period: Duration,
) -> (JoinHandle<()>, oneshot::Sender<()>) {
    let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

    let handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period.max(MIN_TICK));
        // Don't fire immediately on start
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    tracing::debug!("Sync timer received shutdown signal");
                    break;
                }

                _ = ticker.tick() => {
                    let Some(inner) = engine.upgrade() else {
                        break;
                    };
                    SyncEngine { inner }.periodic_sync().await;
                }
            }
        }
    });

    (handle, shutdown_tx)
}

// ---------------------------------------------------------------------------
// Per-collection access
// ---------------------------------------------------------------------------

/// A document type the engine reconciles.
#[async_trait]
trait Synced: Versioned + Clone + PartialEq + Into<Document> + Send + Sync + 'static {
    const COLLECTION: Collection;

    fn merge(local: &Self, remote: &Self) -> Self;
    fn is_deleted(&self) -> bool;
    fn owner(&self) -> Option<&UserId>;

    async fn get<S: DocumentStore + ?Sized>(store: &S, id: &str) -> StorageResult<Option<Self>>;
    async fn put<S: DocumentStore + ?Sized>(store: &S, doc: &Self) -> StorageResult<()>;
    async fn delete<S: DocumentStore + ?Sized>(store: &S, id: &str) -> StorageResult<()>;
    async fn list<S: DocumentStore + ?Sized>(store: &S) -> StorageResult<Vec<Self>>;
    async fn list_owned<S: RemoteStore + ?Sized>(
        store: &S,
        owner: &UserId,
    ) -> StorageResult<Vec<Self>>;
}

#[async_trait]
impl Synced for Program {
    const COLLECTION: Collection = Collection::Programs;

    fn merge(local: &Self, remote: &Self) -> Self {
        merge_programs(local, remote)
    }

    fn is_deleted(&self) -> bool {
        self.deleted
    }

    fn owner(&self) -> Option<&UserId> {
        self.user_id.as_ref()
    }

    async fn get<S: DocumentStore + ?Sized>(store: &S, id: &str) -> StorageResult<Option<Self>> {
        store.get_program(id).await
    }

    async fn put<S: DocumentStore + ?Sized>(store: &S, doc: &Self) -> StorageResult<()> {
        store.put_program(doc).await
    }

    async fn delete<S: DocumentStore + ?Sized>(store: &S, id: &str) -> StorageResult<()> {
        store.delete_program(id).await
    }

    async fn list<S: DocumentStore + ?Sized>(store: &S) -> StorageResult<Vec<Self>> {
        store.list_programs().await
    }

    async fn list_owned<S: RemoteStore + ?Sized>(
        store: &S,
        owner: &UserId,
    ) -> StorageResult<Vec<Self>> {
        store.list_programs_by_owner(owner).await
    }
}

#[async_trait]
impl Synced for Session {
    const COLLECTION: Collection = Collection::Sessions;

    fn merge(local: &Self, remote: &Self) -> Self {
        merge_sessions(local, remote)
    }

    fn is_deleted(&self) -> bool {
        self.deleted
    }

    fn owner(&self) -> Option<&UserId> {
        self.user_id.as_ref()
    }

    async fn get<S: DocumentStore + ?Sized>(store: &S, id: &str) -> StorageResult<Option<Self>> {
        store.get_session(id).await
    }

    async fn put<S: DocumentStore + ?Sized>(store: &S, doc: &Self) -> StorageResult<()> {
        store.put_session(doc).await
    }

    async fn delete<S: DocumentStore + ?Sized>(store: &S, id: &str) -> StorageResult<()> {
        store.delete_session(id).await
    }

    async fn list<S: DocumentStore + ?Sized>(store: &S) -> StorageResult<Vec<Self>> {
        store.list_sessions().await
    }

    async fn list_owned<S: RemoteStore + ?Sized>(
        store: &S,
        owner: &UserId,
    ) -> StorageResult<Vec<Self>> {
        store.list_sessions_by_owner(owner).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::SessionAuth;
    use crate::local::FileStore;
    use crate::remote::MemoryRemote;

    fn engine(online: bool) -> (SyncEngine, FileStore, MemoryRemote) {
        let local = FileStore::in_memory();
        let remote = MemoryRemote::new();
        let engine = SyncEngine::new(
            Arc::new(local.clone()),
            Arc::new(remote.clone()),
            Arc::new(SessionAuth::signed_in(UserId::new("u1"))),
            ConnectivityMonitor::new(online),
            PendingLog::in_memory(),
            EngineConfig::default(),
        );
        (engine, local, remote)
    }

    #[test]
    fn test_flight_guard_is_exclusive() {
        let flag = AtomicBool::new(false);
        let guard = FlightGuard::acquire(&flag).expect("first acquire");
        assert!(FlightGuard::acquire(&flag).is_none());
        drop(guard);
        assert!(FlightGuard::acquire(&flag).is_some());
    }

    #[tokio::test]
    async fn test_pass_skipped_while_another_runs() {
        let (engine, local, _remote) = engine(true);
        local
            .put_program(&Program::with_id("p1", "A"))
            .await
            .expect("put");

        let guard = FlightGuard::acquire(&engine.inner.in_flight).expect("acquire");
        assert_eq!(
            engine.push_to_remote().await,
            PassOutcome::Skipped(SkipReason::InProgress)
        );
        assert_eq!(
            engine.pull_from_remote().await,
            PassOutcome::Skipped(SkipReason::InProgress)
        );
        assert!(engine
            .apply_snapshot(Vec::<Program>::new(), "watch_programs")
            .await
            .is_skipped());
        drop(guard);

        assert!(!engine.push_to_remote().await.is_skipped());
    }

    #[tokio::test]
    async fn test_flag_released_after_failed_pass() {
        let (engine, local, remote) = engine(true);
        local
            .put_program(&Program::with_id("p1", "A"))
            .await
            .expect("put");
        remote.set_available(false);

        let outcome = engine.push_to_remote().await;
        assert!(outcome.report().expect("completed").failures > 0);
        assert!(!engine.is_syncing());

        remote.set_available(true);
        let outcome = engine.push_to_remote().await;
        assert_eq!(outcome.report().expect("completed").programs, 1);
    }

    #[tokio::test]
    async fn test_offline_and_signed_out_gates() {
        let (offline, _, _) = engine(false);
        assert_eq!(
            offline.push_to_remote().await,
            PassOutcome::Skipped(SkipReason::Offline)
        );
        assert!(offline.drain_pending().await.is_none());

        let anonymous = SyncEngine::new(
            Arc::new(FileStore::in_memory()),
            Arc::new(MemoryRemote::new()),
            Arc::new(SessionAuth::new()),
            ConnectivityMonitor::new(true),
            PendingLog::in_memory(),
            EngineConfig::default(),
        );
        assert_eq!(
            anonymous.pull_from_remote().await,
            PassOutcome::Skipped(SkipReason::SignedOut)
        );
        anonymous.init_sync().await;
        assert!(!anonymous.status().live);
    }

    #[tokio::test]
    async fn test_push_batches_by_configured_size() {
        let local = FileStore::in_memory();
        let remote = MemoryRemote::new();
        let engine = SyncEngine::new(
            Arc::new(local.clone()),
            Arc::new(remote.clone()),
            Arc::new(SessionAuth::signed_in(UserId::new("u1"))),
            ConnectivityMonitor::new(true),
            PendingLog::in_memory(),
            EngineConfig {
                push_batch_size: 2,
                ..EngineConfig::default()
            },
        );
        for id in ["a", "b", "c"] {
            local
                .put_program(&Program::with_id(id, id))
                .await
                .expect("put");
        }
        remote.reject("c");

        let report = *engine.push_to_remote().await.report().expect("completed");
        assert_eq!(report.programs, 2);
        assert_eq!(report.failures, 1);
        assert!(remote.get_program("a").await.expect("get").is_some());
    }
}

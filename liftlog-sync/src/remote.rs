//! In-process remote store.
//!
//! Behaves like the hosted document store (owner queries, soft deletes, live
//! watches, atomic batches) and adds switches for simulating outages and
//! rejected writes. Used by the integration tests and for offline demos.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use liftlog_core::{Collection, Document, Program, Session, StorageError, StorageResult, UserId};
use tokio::sync::{mpsc, watch};

use crate::store::{DocumentStore, RemoteStore, Watch};

/// Buffered snapshots per watch before the feed waits on the consumer.
const WATCH_BUFFER: usize = 8;

#[derive(Debug)]
struct RemoteState {
    programs: HashMap<String, Program>,
    sessions: HashMap<String, Session>,
    available: bool,
    rejected: HashSet<String>,
}

#[derive(Debug)]
struct Inner {
    state: Mutex<RemoteState>,
    programs_version: watch::Sender<u64>,
    sessions_version: watch::Sender<u64>,
    writes: AtomicU64,
}

/// Shared in-memory remote. Cloning yields another handle to the same data.
#[derive(Debug, Clone)]
pub struct MemoryRemote {
    inner: Arc<Inner>,
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRemote {
    /// Create an empty, reachable remote.
    #[must_use]
    pub fn new() -> Self {
        let (programs_version, _) = watch::channel(0);
        let (sessions_version, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(RemoteState {
                    programs: HashMap::new(),
                    sessions: HashMap::new(),
                    available: true,
                    rejected: HashSet::new(),
                }),
                programs_version,
                sessions_version,
                writes: AtomicU64::new(0),
            }),
        }
    }

    /// Simulate an outage (`false`) or recovery (`true`).
    pub fn set_available(&self, available: bool) {
        self.lock().available = available;
    }

    /// Reject every future write targeting `entity_id`.
    pub fn reject(&self, entity_id: impl Into<String>) {
        self.lock().rejected.insert(entity_id.into());
    }

    /// Remove a document outright, as if it had never existed.
    pub fn purge(&self, id: &str) {
        let (program, session) = {
            let mut state = self.lock();
            (state.programs.remove(id), state.sessions.remove(id))
        };
        if program.is_some() {
            self.bump(Collection::Programs);
        }
        if session.is_some() {
            self.bump(Collection::Sessions);
        }
    }

    /// Number of documents written so far (puts, deletes and batch entries).
    #[must_use]
    pub fn write_count(&self) -> u64 {
        self.inner.writes.load(Ordering::Relaxed)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RemoteState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn version(&self, collection: Collection) -> &watch::Sender<u64> {
        match collection {
            Collection::Programs => &self.inner.programs_version,
            Collection::Sessions => &self.inner.sessions_version,
        }
    }

    /// Wake the watches on one collection.
    fn bump(&self, collection: Collection) {
        self.version(collection).send_modify(|v| *v += 1);
    }

    /// Lock the state for a write after the availability and rejection checks.
    fn writable<'i>(
        &self,
        ids: impl IntoIterator<Item = &'i str>,
    ) -> StorageResult<std::sync::MutexGuard<'_, RemoteState>> {
        let state = self.readable()?;
        for id in ids {
            if state.rejected.contains(id) {
                return Err(StorageError::Rejected(format!("write to {id} refused")));
            }
        }
        Ok(state)
    }

    fn readable(&self) -> StorageResult<std::sync::MutexGuard<'_, RemoteState>> {
        let state = self.lock();
        if state.available {
            Ok(state)
        } else {
            Err(StorageError::Unavailable("remote store unreachable".into()))
        }
    }

    fn record_writes(&self, collection: Collection, count: usize) {
        self.inner.writes.fetch_add(count as u64, Ordering::Relaxed);
        self.bump(collection);
    }

    /// Spawn a feed that re-sends the snapshot on every change.
    fn spawn_watch<T, F>(&self, collection: Collection, snapshot: F) -> Watch<T>
    where
        T: Send + 'static,
        F: Fn(&RemoteState) -> Vec<T> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(WATCH_BUFFER);
        let mut changes = self.version(collection).subscribe();
        let remote = self.clone();

        let task = tokio::spawn(async move {
            loop {
                let current = snapshot(&remote.lock());
                if tx.send(current).await.is_err() {
                    break;
                }
                if changes.changed().await.is_err() {
                    break;
                }
            }
        });
        Watch::new(rx, task)
    }
}

fn owned_live_programs(state: &RemoteState, owner: &UserId) -> Vec<Program> {
    let mut programs: Vec<_> = state
        .programs
        .values()
        .filter(|p| !p.deleted && p.user_id.as_ref() == Some(owner))
        .cloned()
        .collect();
    programs.sort_by(|a, b| a.id.cmp(&b.id));
    programs
}

fn owned_live_sessions(state: &RemoteState, owner: &UserId) -> Vec<Session> {
    let mut sessions: Vec<_> = state
        .sessions
        .values()
        .filter(|s| !s.deleted && s.user_id.as_ref() == Some(owner))
        .cloned()
        .collect();
    sessions.sort_by(|a, b| a.id.cmp(&b.id));
    sessions
}

#[async_trait]
impl DocumentStore for MemoryRemote {
    async fn init(&self) -> StorageResult<()> {
        Ok(())
    }

    async fn put_program(&self, program: &Program) -> StorageResult<()> {
        self.writable([program.id.as_str()])?
            .programs
            .insert(program.id.clone(), program.clone());
        self.record_writes(Collection::Programs, 1);
        Ok(())
    }

    async fn get_program(&self, id: &str) -> StorageResult<Option<Program>> {
        Ok(self.readable()?.programs.get(id).cloned())
    }

    async fn list_programs(&self) -> StorageResult<Vec<Program>> {
        let mut programs: Vec<_> = self.readable()?.programs.values().cloned().collect();
        programs.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(programs)
    }

    async fn delete_program(&self, id: &str) -> StorageResult<()> {
        {
            let mut state = self.writable([id])?;
            let Some(program) = state.programs.get_mut(id) else {
                return Ok(());
            };
            program.deleted = true;
            program.touch();
        }
        self.record_writes(Collection::Programs, 1);
        Ok(())
    }

    async fn put_session(&self, session: &Session) -> StorageResult<()> {
        self.writable([session.id.as_str()])?
            .sessions
            .insert(session.id.clone(), session.clone());
        self.record_writes(Collection::Sessions, 1);
        Ok(())
    }

    async fn get_session(&self, id: &str) -> StorageResult<Option<Session>> {
        Ok(self.readable()?.sessions.get(id).cloned())
    }

    async fn list_sessions(&self) -> StorageResult<Vec<Session>> {
        let mut sessions: Vec<_> = self.readable()?.sessions.values().cloned().collect();
        sessions.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(sessions)
    }

    async fn list_sessions_by_program(&self, program_id: &str) -> StorageResult<Vec<Session>> {
        let mut sessions = self.list_sessions().await?;
        sessions.retain(|s| s.program_id == program_id);
        Ok(sessions)
    }

    async fn delete_session(&self, id: &str) -> StorageResult<()> {
        {
            let mut state = self.writable([id])?;
            let Some(session) = state.sessions.get_mut(id) else {
                return Ok(());
            };
            session.deleted = true;
            session.touch();
        }
        self.record_writes(Collection::Sessions, 1);
        Ok(())
    }
}

#[async_trait]
impl RemoteStore for MemoryRemote {
    async fn list_programs_by_owner(&self, owner: &UserId) -> StorageResult<Vec<Program>> {
        let mut programs = self.list_programs().await?;
        programs.retain(|p| p.user_id.as_ref() == Some(owner));
        Ok(programs)
    }

    async fn list_sessions_by_owner(&self, owner: &UserId) -> StorageResult<Vec<Session>> {
        let mut sessions = self.list_sessions().await?;
        sessions.retain(|s| s.user_id.as_ref() == Some(owner));
        Ok(sessions)
    }

    async fn watch_programs_by_owner(&self, owner: &UserId) -> StorageResult<Watch<Program>> {
        drop(self.readable()?);
        let owner = owner.clone();
        Ok(self.spawn_watch(Collection::Programs, move |state| {
            owned_live_programs(state, &owner)
        }))
    }

    async fn watch_sessions_by_owner(&self, owner: &UserId) -> StorageResult<Watch<Session>> {
        drop(self.readable()?);
        let owner = owner.clone();
        Ok(self.spawn_watch(Collection::Sessions, move |state| {
            owned_live_sessions(state, &owner)
        }))
    }

    async fn commit(&self, writes: Vec<Document>) -> StorageResult<()> {
        let (mut programs, mut sessions) = (0, 0);
        {
            let mut state = self.writable(writes.iter().map(Document::id))?;
            for doc in writes {
                match doc {
                    Document::Program(p) => {
                        state.programs.insert(p.id.clone(), p);
                        programs += 1;
                    }
                    Document::Session(s) => {
                        state.sessions.insert(s.id.clone(), s);
                        sessions += 1;
                    }
                }
            }
        }
        if programs > 0 {
            self.record_writes(Collection::Programs, programs);
        }
        if sessions > 0 {
            self.record_writes(Collection::Sessions, sessions);
        }
        Ok(())
    }

    async fn ping(&self) -> StorageResult<()> {
        self.readable().map(drop)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owned(id: &str, owner: &str) -> Program {
        let mut p = Program::with_id(id, id);
        p.user_id = Some(UserId::new(owner));
        p
    }

    #[tokio::test]
    async fn test_delete_is_soft() {
        let remote = MemoryRemote::new();
        let program = owned("p1", "u1");
        let before = program.updated_at;
        remote.put_program(&program).await.expect("put");

        remote.delete_program("p1").await.expect("delete");
        let stored = remote.get_program("p1").await.expect("get").expect("exists");
        assert!(stored.deleted);
        assert!(stored.updated_at > before);
    }

    #[tokio::test]
    async fn test_owner_queries() {
        let remote = MemoryRemote::new();
        remote.put_program(&owned("p1", "u1")).await.expect("put");
        remote.put_program(&owned("p2", "u2")).await.expect("put");

        let mine = remote
            .list_programs_by_owner(&UserId::new("u1"))
            .await
            .expect("list");
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0].id, "p1");
    }

    #[tokio::test]
    async fn test_outage_fails_requests() {
        let remote = MemoryRemote::new();
        remote.set_available(false);

        assert!(matches!(
            remote.ping().await,
            Err(StorageError::Unavailable(_))
        ));
        assert!(remote.put_program(&owned("p1", "u1")).await.is_err());
        assert_eq!(remote.write_count(), 0);
    }

    #[tokio::test]
    async fn test_commit_is_atomic() {
        let remote = MemoryRemote::new();
        remote.reject("p2");

        let result = remote
            .commit(vec![owned("p1", "u1").into(), owned("p2", "u1").into()])
            .await;
        assert!(matches!(result, Err(StorageError::Rejected(_))));
        assert!(remote.get_program("p1").await.expect("get").is_none());
    }

    #[tokio::test]
    async fn test_watch_emits_on_change_and_hides_deleted() {
        let remote = MemoryRemote::new();
        let owner = UserId::new("u1");
        remote.put_program(&owned("p1", "u1")).await.expect("put");

        let mut watch = remote.watch_programs_by_owner(&owner).await.expect("watch");
        let first = watch.next().await.expect("snapshot");
        assert_eq!(first.len(), 1);

        remote.delete_program("p1").await.expect("delete");
        let second = watch.next().await.expect("snapshot");
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn test_session_writes_do_not_wake_program_watch() {
        let remote = MemoryRemote::new();
        let owner = UserId::new("u1");
        let mut watch = remote.watch_programs_by_owner(&owner).await.expect("watch");
        assert!(watch.next().await.expect("initial").is_empty());

        let mut session = Session::new("p1", "2024-03-01");
        session.user_id = Some(owner.clone());
        remote.put_session(&session).await.expect("put");

        let woke =
            tokio::time::timeout(std::time::Duration::from_millis(50), watch.next()).await;
        assert!(woke.is_err(), "program watch fired for a session write");
    }
}

//! Store adapter contracts.
//!
//! The engine talks to both replicas through these traits. The local store is
//! plain CRUD; the remote store adds owner-scoped queries, live watches and a
//! batched write.

use async_trait::async_trait;
use liftlog_core::{Document, Program, Session, StorageResult, UserId};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// CRUD over programs and sessions.
///
/// Local adapters hard-delete; remote adapters soft-delete by setting
/// `deleted` and advancing `updatedAt`.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Prepare the store for use (open files, load indexes).
    async fn init(&self) -> StorageResult<()>;

    /// Create or replace a program.
    async fn put_program(&self, program: &Program) -> StorageResult<()>;

    /// Fetch a program by id, including soft-deleted ones.
    async fn get_program(&self, id: &str) -> StorageResult<Option<Program>>;

    /// All programs in the store.
    async fn list_programs(&self) -> StorageResult<Vec<Program>>;

    /// Delete a program. Deleting a missing id is not an error.
    async fn delete_program(&self, id: &str) -> StorageResult<()>;

    /// Create or replace a session.
    async fn put_session(&self, session: &Session) -> StorageResult<()>;

    /// Fetch a session by id, including soft-deleted ones.
    async fn get_session(&self, id: &str) -> StorageResult<Option<Session>>;

    /// All sessions in the store.
    async fn list_sessions(&self) -> StorageResult<Vec<Session>>;

    /// Sessions belonging to `program_id`.
    async fn list_sessions_by_program(&self, program_id: &str) -> StorageResult<Vec<Session>>;

    /// Delete a session. Deleting a missing id is not an error.
    async fn delete_session(&self, id: &str) -> StorageResult<()>;
}

/// A network-backed document store.
#[async_trait]
pub trait RemoteStore: DocumentStore {
    /// Programs whose `userId` is `owner`, soft-deleted ones included.
    async fn list_programs_by_owner(&self, owner: &UserId) -> StorageResult<Vec<Program>>;

    /// Sessions whose `userId` is `owner`, soft-deleted ones included.
    async fn list_sessions_by_owner(&self, owner: &UserId) -> StorageResult<Vec<Session>>;

    /// Live snapshots of the owner's non-deleted programs.
    async fn watch_programs_by_owner(&self, owner: &UserId) -> StorageResult<Watch<Program>>;

    /// Live snapshots of the owner's non-deleted sessions.
    async fn watch_sessions_by_owner(&self, owner: &UserId) -> StorageResult<Watch<Session>>;

    /// Write every document in one batch.
    async fn commit(&self, writes: Vec<Document>) -> StorageResult<()>;

    /// Cheap reachability check.
    async fn ping(&self) -> StorageResult<()>;
}

/// A live query subscription.
///
/// Each item is a full snapshot of the matching documents. The first snapshot
/// is delivered as soon as the watch is established. Dropping the watch
/// unsubscribes.
#[derive(Debug)]
pub struct Watch<T> {
    rx: mpsc::Receiver<Vec<T>>,
    task: Option<JoinHandle<()>>,
}

impl<T> Watch<T> {
    /// Wrap a snapshot channel and the task feeding it.
    #[must_use]
    pub fn new(rx: mpsc::Receiver<Vec<T>>, task: JoinHandle<()>) -> Self {
        Self {
            rx,
            task: Some(task),
        }
    }

    /// Wait for the next snapshot. `None` once the feed has ended.
    pub async fn next(&mut self) -> Option<Vec<T>> {
        self.rx.recv().await
    }
}

impl<T> Drop for Watch<T> {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_watch_delivers_snapshots() {
        let (tx, rx) = mpsc::channel(4);
        let task = tokio::spawn(async move {
            let _ = tx.send(vec![1, 2]).await;
            let _ = tx.send(vec![3]).await;
        });
        let mut watch = Watch::new(rx, task);

        assert_eq!(watch.next().await, Some(vec![1, 2]));
        assert_eq!(watch.next().await, Some(vec![3]));
        assert_eq!(watch.next().await, None);
    }

    #[tokio::test]
    async fn test_watch_drop_aborts_feed() {
        let (tx, rx) = mpsc::channel::<Vec<u8>>(1);
        let probe = tx.clone();
        let task = tokio::spawn(async move {
            let _keep = tx;
            std::future::pending::<()>().await;
        });
        let watch = Watch::new(rx, task);
        drop(watch);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(probe.is_closed(), "receiver should be gone after drop");
    }
}

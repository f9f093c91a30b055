//! # Pending Operation Log
//!
//! Durable FIFO of remote mutations that have not been confirmed as applied.
//!
//! ## Lifecycle
//!
//! ```text
//! 1. enqueue: written to disk before the call returns
//! 2. drain:   retry count bumped and persisted, then the remote write is tried
//! 3. success: entry removed (Applied)
//! 4. failure: entry kept; evicted (Abandoned) once MAX_RETRIES attempts failed
//! ```
//!
//! Each operation is stored as `<data_dir>/<operation id>.json`. Replay order
//! is `(enqueued_at, sequence)` ascending, so later operations on the same
//! entity supersede earlier ones.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};

use crate::error::LogError;
use crate::file_name::json_file_name;
use crate::model::{now_ms, Collection, Document};
use crate::observer::{ListenerId, Observers};

/// Attempts after which an operation is abandoned.
pub const MAX_RETRIES: u32 = 5;

/// Operations replayed per batch, matching remote batch-write limits.
pub const DRAIN_BATCH_SIZE: usize = 20;

/// What a pending operation does to its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OperationKind {
    /// Create or replace the document with the payload snapshot.
    Upsert,
    /// Soft-delete the document remotely.
    Delete,
}

/// A remote mutation awaiting confirmation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingOperation {
    /// Operation id, independent of the target entity.
    pub id: String,
    /// Upsert or delete.
    pub kind: OperationKind,
    /// Target collection.
    pub collection: Collection,
    /// Target entity id.
    pub entity_id: String,
    /// Document snapshot; present for upserts only.
    #[serde(default)]
    pub payload: Option<Document>,
    /// When the operation was enqueued (ms since epoch).
    pub enqueued_at: u64,
    /// Tie-break for operations enqueued within the same millisecond.
    #[serde(default)]
    pub sequence: u64,
    /// Failed or in-flight attempts so far.
    #[serde(default)]
    pub retry_count: u32,
}

impl PendingOperation {
    /// Build an upsert carrying a snapshot of `document`.
    pub fn upsert(document: impl Into<Document>) -> Self {
        let document = document.into();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind: OperationKind::Upsert,
            collection: document.collection(),
            entity_id: document.id().to_string(),
            payload: Some(document),
            enqueued_at: now_ms(),
            sequence: 0,
            retry_count: 0,
        }
    }

    /// Build a delete for `entity_id` in `collection`.
    pub fn delete(collection: Collection, entity_id: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind: OperationKind::Delete,
            collection,
            entity_id: entity_id.into(),
            payload: None,
            enqueued_at: now_ms(),
            sequence: 0,
            retry_count: 0,
        }
    }

    /// Whether the retry ceiling has been reached.
    #[must_use]
    pub const fn is_exhausted(&self) -> bool {
        self.retry_count >= MAX_RETRIES
    }
}

/// Why an operation left the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemovalReason {
    /// The remote write succeeded.
    Applied,
    /// The retry ceiling was reached; the mutation is lost.
    Abandoned,
    /// Removed explicitly by a caller.
    Discarded,
}

/// Notification emitted whenever an operation leaves the log.
#[derive(Debug, Clone)]
pub struct Removal {
    /// The operation as it was when removed.
    pub operation: PendingOperation,
    /// Why it was removed.
    pub reason: RemovalReason,
}

/// Result of [`PendingLog::begin_attempt`].
#[derive(Debug, Clone, PartialEq)]
pub enum Attempt {
    /// Retry count was bumped and persisted; perform the remote write.
    Proceed(PendingOperation),
    /// The operation had already reached the ceiling and was dropped.
    Abandoned,
    /// The operation is no longer in the log.
    Missing,
}

#[derive(Debug, Default)]
struct LogState {
    operations: Vec<PendingOperation>,
    next_sequence: u64,
    abandoned: u64,
}

impl LogState {
    fn position(&self, id: &str) -> Option<usize> {
        self.operations.iter().position(|op| op.id == id)
    }

    fn sort(&mut self) {
        self.operations
            .sort_by_key(|op| (op.enqueued_at, op.sequence));
    }
}

/// Durable, ordered queue of pending remote mutations.
///
/// Cloning yields another handle to the same log.
#[derive(Clone)]
pub struct PendingLog {
    state: Arc<Mutex<LogState>>,
    data_dir: Option<PathBuf>,
    removals: Arc<Observers<Removal>>,
}

impl std::fmt::Debug for PendingLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingLog")
            .field("len", &self.len())
            .field("data_dir", &self.data_dir)
            .finish_non_exhaustive()
    }
}

impl PendingLog {
    /// Create a log that lives only in memory.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            state: Arc::new(Mutex::new(LogState::default())),
            data_dir: None,
            removals: Arc::new(Observers::new()),
        }
    }

    /// Open (or create) a log persisted under `data_dir` and load its entries.
    ///
    /// # Errors
    ///
    /// Returns [`LogError::Io`] if the directory cannot be created or read.
    pub fn open(data_dir: impl Into<PathBuf>) -> Result<Self, LogError> {
        let data_dir = data_dir.into();
        std::fs::create_dir_all(&data_dir)?;
        let log = Self {
            state: Arc::new(Mutex::new(LogState::default())),
            data_dir: Some(data_dir),
            removals: Arc::new(Observers::new()),
        };
        log.reload()?;
        Ok(log)
    }

    /// Replace the in-memory view with what is on disk.
    ///
    /// No-op for in-memory logs. Returns the number of loaded operations.
    ///
    /// # Errors
    ///
    /// Returns [`LogError::Io`] if the directory cannot be read.
    pub fn reload(&self) -> Result<usize, LogError> {
        let Some(ref data_dir) = self.data_dir else {
            return Ok(self.len());
        };

        let mut operations = Vec::new();
        for entry in std::fs::read_dir(data_dir)? {
            let path = entry?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            match read_operation(&path) {
                Ok(op) => operations.push(op),
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "Skipping unreadable pending operation"
                    );
                }
            }
        }

        let mut state = self.lock();
        state.next_sequence = operations
            .iter()
            .map(|op| op.sequence + 1)
            .max()
            .unwrap_or(0);
        state.operations = operations;
        state.sort();
        tracing::debug!(count = state.operations.len(), "Pending log loaded");
        Ok(state.operations.len())
    }

    /// Append an operation, persisting it before returning.
    ///
    /// # Errors
    ///
    /// Returns [`LogError::MissingPayload`] for an upsert without a payload, or
    /// an I/O error if the operation could not be written.
    pub fn enqueue(&self, mut operation: PendingOperation) -> Result<(), LogError> {
        if operation.kind == OperationKind::Upsert && operation.payload.is_none() {
            return Err(LogError::MissingPayload(operation.id));
        }

        let mut state = self.lock();
        operation.sequence = state.next_sequence;
        self.persist(&operation)?;
        state.next_sequence += 1;

        tracing::debug!(
            op_id = %operation.id,
            kind = ?operation.kind,
            collection = %operation.collection,
            entity_id = %operation.entity_id,
            "Enqueued pending operation"
        );
        state.operations.push(operation);
        state.sort();
        Ok(())
    }

    /// All operations, oldest first.
    #[must_use]
    pub fn list_pending(&self) -> Vec<PendingOperation> {
        self.lock().operations.clone()
    }

    /// Number of pending operations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().operations.len()
    }

    /// Whether the log is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Operations abandoned at the retry ceiling since this log was created.
    #[must_use]
    pub fn abandoned_count(&self) -> u64 {
        self.lock().abandoned
    }

    /// Whether a delete for `entity_id` is still waiting to be applied.
    #[must_use]
    pub fn has_pending_delete(&self, collection: Collection, entity_id: &str) -> bool {
        self.lock().operations.iter().any(|op| {
            op.kind == OperationKind::Delete
                && op.collection == collection
                && op.entity_id == entity_id
        })
    }

    /// Whether any operation targets `entity_id`.
    #[must_use]
    pub fn has_pending(&self, collection: Collection, entity_id: &str) -> bool {
        self.lock()
            .operations
            .iter()
            .any(|op| op.collection == collection && op.entity_id == entity_id)
    }

    /// Remove an operation. Removing an absent id is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the persisted file could not be deleted.
    pub fn remove(&self, operation_id: &str) -> Result<(), LogError> {
        self.evict(operation_id, RemovalReason::Discarded)
    }

    /// Mark an operation as applied and remove it.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the persisted file could not be deleted.
    pub fn complete(&self, operation_id: &str) -> Result<(), LogError> {
        self.evict(operation_id, RemovalReason::Applied)
    }

    /// Prepare an attempt: drop exhausted operations, otherwise bump and
    /// persist the retry count before the caller touches the network.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the updated retry count could not be written.
    pub fn begin_attempt(&self, operation_id: &str) -> Result<Attempt, LogError> {
        let attempt = {
            let mut state = self.lock();
            let Some(index) = state.position(operation_id) else {
                return Ok(Attempt::Missing);
            };
            if state.operations[index].is_exhausted() {
                None
            } else {
                let mut updated = state.operations[index].clone();
                updated.retry_count += 1;
                self.persist(&updated)?;
                state.operations[index] = updated.clone();
                Some(updated)
            }
        };

        match attempt {
            Some(op) => Ok(Attempt::Proceed(op)),
            None => {
                self.evict(operation_id, RemovalReason::Abandoned)?;
                Ok(Attempt::Abandoned)
            }
        }
    }

    /// Record a failed attempt. Returns true if the operation was abandoned
    /// because it reached the retry ceiling.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if an abandoned operation's file could not be deleted.
    pub fn record_failure(&self, operation_id: &str) -> Result<bool, LogError> {
        let exhausted = {
            let state = self.lock();
            state
                .position(operation_id)
                .is_some_and(|index| state.operations[index].is_exhausted())
        };
        if exhausted {
            self.evict(operation_id, RemovalReason::Abandoned)?;
        }
        Ok(exhausted)
    }

    /// Observe operations leaving the log.
    pub fn on_removed<F>(&self, observer: F) -> ListenerId
    where
        F: Fn(&Removal) + Send + Sync + 'static,
    {
        self.removals.subscribe(observer)
    }

    /// Stop observing removals.
    pub fn remove_observer(&self, id: ListenerId) {
        self.removals.unsubscribe(id);
    }

    fn evict(&self, operation_id: &str, reason: RemovalReason) -> Result<(), LogError> {
        let removed = {
            let mut state = self.lock();
            let Some(index) = state.position(operation_id) else {
                return Ok(());
            };
            self.unpersist(operation_id)?;
            if reason == RemovalReason::Abandoned {
                state.abandoned += 1;
            }
            state.operations.remove(index)
        };

        match reason {
            RemovalReason::Abandoned => tracing::warn!(
                op_id = %removed.id,
                collection = %removed.collection,
                entity_id = %removed.entity_id,
                retries = removed.retry_count,
                "Abandoning pending operation after retry ceiling"
            ),
            RemovalReason::Applied | RemovalReason::Discarded => tracing::debug!(
                op_id = %removed.id,
                reason = ?reason,
                "Removed pending operation"
            ),
        }

        self.removals.notify(&Removal {
            operation: removed,
            reason,
        });
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LogState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Write an operation to `<id>.json` via a synced temp file and rename.
    fn persist(&self, operation: &PendingOperation) -> Result<(), LogError> {
        use std::io::Write;

        let Some(ref data_dir) = self.data_dir else {
            return Ok(());
        };
        let json = serde_json::to_vec_pretty(operation)?;
        let path = operation_path(data_dir, &operation.id);
        let tmp = path.with_extension("json.tmp");
        {
            let mut file = std::fs::File::create(&tmp)?;
            file.write_all(&json)?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn unpersist(&self, operation_id: &str) -> Result<(), LogError> {
        let Some(ref data_dir) = self.data_dir else {
            return Ok(());
        };
        match std::fs::remove_file(operation_path(data_dir, operation_id)) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }
}

fn read_operation(path: &Path) -> Result<PendingOperation, LogError> {
    let contents = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&contents)?)
}

fn operation_path(data_dir: &Path, operation_id: &str) -> PathBuf {
    data_dir.join(json_file_name(operation_id))
}

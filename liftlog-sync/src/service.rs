//! Service facade.
//!
//! Entry point for the application shell: lifecycle (`start`, `shutdown`),
//! manual sync triggers, and the user-facing storage operations. Local failures
//! propagate to the caller. Remote mirroring is best effort: when it cannot
//! happen right away, the write is queued in the pending log.

use std::sync::{Mutex, PoisonError};

use liftlog_core::{
    Collection, Document, LogError, ParseError, PendingOperation, Program, ProgramParser,
    Session, StorageError, UserId,
};
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::engine::{PassOutcome, SyncEngine, SyncStatus};
use crate::metrics;
use crate::replay::DrainReport;
use crate::store::DocumentStore;

/// Errors returned by user-facing operations.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// The local store failed.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    /// The pending log could not record a write.
    #[error("pending log error: {0}")]
    PendingLog(#[from] LogError),
    /// An uploaded spreadsheet was rejected.
    #[error("import failed: {0}")]
    Parse(#[from] ParseError),
    /// A session referenced a program that does not exist locally.
    #[error("program not found: {0}")]
    ProgramNotFound(String),
}

/// Result type for service operations.
pub type ServiceResult<T> = Result<T, ServiceError>;

struct AuthWatcher {
    handle: JoinHandle<()>,
    shutdown_tx: oneshot::Sender<()>,
}

/// Facade over the engine and the stores.
pub struct SyncService {
    engine: SyncEngine,
    auth_watcher: Mutex<Option<AuthWatcher>>,
}

impl std::fmt::Debug for SyncService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncService")
            .field("engine", &self.engine)
            .finish_non_exhaustive()
    }
}

impl SyncService {
    /// Wrap an engine.
    #[must_use]
    pub fn new(engine: SyncEngine) -> Self {
        Self {
            engine,
            auth_watcher: Mutex::new(None),
        }
    }

    /// The underlying engine.
    #[must_use]
    pub fn engine(&self) -> &SyncEngine {
        &self.engine
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Initialise the local store and follow auth changes: a user appearing
    /// starts sync, a user leaving stops it.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::Storage`] if the local store fails to initialise.
    pub async fn start(&self) -> ServiceResult<()> {
        self.engine.local().init().await?;
        self.engine.remote().init().await?;

        let mut rx = self.engine.auth().subscribe();
        let initial = rx.borrow_and_update().clone();
        if initial.is_some() {
            self.engine.init_sync().await;
        }

        let engine = self.engine.clone();
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => {
                        tracing::debug!("Auth watcher received shutdown signal");
                        break;
                    }

                    changed = rx.changed() => {
                        if changed.is_err() {
                            tracing::debug!("Auth provider dropped");
                            break;
                        }
                        let user = rx.borrow_and_update().clone();
                        match user {
                            Some(user) => {
                                tracing::info!(user = %user, "Auth changed; initialising sync");
                                engine.init_sync().await;
                            }
                            None => {
                                tracing::info!("Signed out; stopping sync");
                                engine.stop_sync();
                            }
                        }
                    }
                }
            }
        });

        let previous = self
            .auth_watcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(AuthWatcher {
                handle,
                shutdown_tx,
            });
        if let Some(previous) = previous {
            previous.stop();
        }
        Ok(())
    }

    /// Stop the auth watcher and all sync tasks.
    pub fn shutdown(&self) {
        let watcher = self
            .auth_watcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(watcher) = watcher {
            watcher.stop();
        }
        self.engine.stop_sync();
        tracing::info!("Sync service shut down");
    }

    /// (Re)start sync for the current user.
    pub async fn init_sync(&self) {
        self.engine.init_sync().await;
    }

    /// Replay queued writes, then push local changes.
    pub async fn force_push(&self) -> (Option<DrainReport>, PassOutcome) {
        let drained = self.engine.drain_pending().await;
        (drained, self.engine.push_to_remote().await)
    }

    /// Pull remote changes.
    pub async fn force_pull(&self) -> PassOutcome {
        self.engine.pull_from_remote().await
    }

    /// Current engine status.
    #[must_use]
    pub fn status(&self) -> SyncStatus {
        self.engine.status()
    }

    // -----------------------------------------------------------------------
    // User-facing storage
    // -----------------------------------------------------------------------

    /// Save a program locally and mirror it.
    ///
    /// The stored copy's `updatedAt` is advanced past both the wall clock and
    /// any previously stored version.
    ///
    /// # Errors
    ///
    /// Returns an error if the local write or the fallback enqueue fails.
    pub async fn store_program(&self, mut program: Program) -> ServiceResult<Program> {
        let previous = self.engine.local().get_program(&program.id).await?;
        if let Some(previous) = previous {
            program.updated_at = program.updated_at.max(previous.updated_at);
        }
        program.touch();
        self.engine.local().put_program(&program).await?;
        tracing::debug!(program_id = %program.id, updated_at = program.updated_at, "Program stored");

        self.mirror(program.clone().into()).await?;
        Ok(program)
    }

    /// A program by id. Soft-deleted programs are hidden.
    ///
    /// # Errors
    ///
    /// Returns an error if the local store fails.
    pub async fn get_program(&self, id: &str) -> ServiceResult<Option<Program>> {
        let program = self.engine.local().get_program(id).await?;
        Ok(program.filter(|p| !p.deleted))
    }

    /// Every live program.
    ///
    /// # Errors
    ///
    /// Returns an error if the local store fails.
    pub async fn list_programs(&self) -> ServiceResult<Vec<Program>> {
        let mut programs = self.engine.local().list_programs().await?;
        programs.retain(|p| !p.deleted);
        Ok(programs)
    }

    /// Record a completed session against its program.
    ///
    /// The session is stored on its own and in the program's history, and both
    /// documents are mirrored.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::ProgramNotFound`] if the program does not exist,
    /// or an error if a local write fails.
    pub async fn record_session(&self, mut session: Session) -> ServiceResult<Session> {
        let mut program = self
            .get_program(&session.program_id)
            .await?
            .ok_or_else(|| ServiceError::ProgramNotFound(session.program_id.clone()))?;

        if let Some(previous) = self.engine.local().get_session(&session.id).await? {
            session.updated_at = session.updated_at.max(previous.updated_at);
        }
        session.touch();
        self.engine.local().put_session(&session).await?;

        program.record_session(session.clone());
        program.touch();
        self.engine.local().put_program(&program).await?;
        tracing::debug!(
            session_id = %session.id,
            program_id = %program.id,
            "Session recorded"
        );

        self.mirror(session.clone().into()).await?;
        self.mirror(program.into()).await?;
        Ok(session)
    }

    /// Delete a program.
    ///
    /// The local copy becomes a tombstone until the remote confirms the delete,
    /// then it is removed. Returns false if there was nothing to delete.
    ///
    /// # Errors
    ///
    /// Returns an error if the local write or the fallback enqueue fails.
    pub async fn delete_program(&self, id: &str) -> ServiceResult<bool> {
        let Some(mut program) = self.get_program(id).await? else {
            return Ok(false);
        };
        program.deleted = true;
        program.touch();
        self.engine.local().put_program(&program).await?;

        if self.remote_ready().is_some() {
            match self.engine.remote().delete_program(id).await {
                Ok(()) => {
                    self.discard_queued(Collection::Programs, id)?;
                    self.engine.local().delete_program(id).await?;
                    tracing::info!(program_id = %id, "Program deleted");
                    return Ok(true);
                }
                Err(e) => {
                    metrics::record_remote_failure("delete");
                    tracing::warn!(program_id = %id, error = %e, "Remote delete failed; queued");
                }
            }
        }

        self.enqueue(PendingOperation::delete(Collection::Programs, id))?;
        Ok(true)
    }

    /// Parse an uploaded spreadsheet and store the resulting program.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::Parse`] if the parser rejects the file, or a
    /// storage error if saving fails.
    pub async fn import_program(
        &self,
        name: &str,
        bytes: &[u8],
        parser: &dyn ProgramParser,
    ) -> ServiceResult<Program> {
        let program = parser.parse(name, bytes).map_err(|e| {
            tracing::warn!(name, error = %e, "Spreadsheet rejected");
            e
        })?;
        tracing::info!(
            name,
            program_id = %program.id,
            workouts = program.workouts.len(),
            "Spreadsheet imported"
        );
        self.store_program(program).await
    }

    /// The signed-in user, if the remote can be written right now.
    fn remote_ready(&self) -> Option<UserId> {
        if self.engine.monitor().is_online() {
            self.engine.auth().current_user()
        } else {
            None
        }
    }

    /// Write `doc` to the remote now, or queue it.
    async fn mirror(&self, doc: Document) -> ServiceResult<()> {
        let user = self.engine.auth().current_user();
        let doc = match user {
            Some(ref user) => doc.owned_by(user),
            None => doc,
        };

        if self.remote_ready().is_some() {
            let result = match doc {
                Document::Program(ref p) => self.engine.remote().put_program(p).await,
                Document::Session(ref s) => self.engine.remote().put_session(s).await,
            };
            match result {
                Ok(()) => {
                    metrics::record_documents_written("remote", &doc.collection().to_string(), 1);
                    return Ok(());
                }
                Err(e) => {
                    metrics::record_remote_failure("mirror");
                    tracing::warn!(id = %doc.id(), error = %e, "Remote mirror failed; queued");
                }
            }
        }

        self.enqueue(PendingOperation::upsert(doc))
    }

    /// Drop queued writes for an entity the remote has already deleted.
    fn discard_queued(&self, collection: Collection, id: &str) -> ServiceResult<()> {
        let pending = self.engine.pending();
        for op in pending.list_pending() {
            if op.collection == collection && op.entity_id == id {
                pending.remove(&op.id)?;
            }
        }
        Ok(())
    }

    fn enqueue(&self, op: PendingOperation) -> ServiceResult<()> {
        self.engine.pending().enqueue(op)?;
        metrics::set_pending_operations(self.engine.pending().len());
        Ok(())
    }
}

impl AuthWatcher {
    fn stop(self) {
        let _ = self.shutdown_tx.send(());
        self.handle.abort();
    }
}

impl Drop for SyncService {
    fn drop(&mut self) {
        let watcher = self
            .auth_watcher
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(watcher) = watcher {
            watcher.stop();
        }
    }
}

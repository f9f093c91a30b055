//! Pending operation replay.
//!
//! Drains the [`PendingLog`] against the remote store. Every operation is
//! attempted at most once per drain, oldest first; a failing operation never
//! blocks the ones behind it.

use liftlog_core::pending::Attempt;
use liftlog_core::{Collection, Document, OperationKind, PendingLog, PendingOperation, StorageError};
use serde::Serialize;

use crate::metrics;
use crate::store::{DocumentStore, RemoteStore};

/// Summary of one drain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    /// Operations whose remote write was attempted.
    pub attempted: usize,
    /// Operations confirmed and removed.
    pub applied: usize,
    /// Operations that failed and remain queued.
    pub failed: usize,
    /// Operations evicted at the retry ceiling.
    pub abandoned: usize,
}

/// Attempt every pending operation once, `batch_size` at a time.
pub async fn drain(
    log: &PendingLog,
    local: &dyn DocumentStore,
    remote: &dyn RemoteStore,
    batch_size: usize,
) -> DrainReport {
    let pending = log.list_pending();
    let mut report = DrainReport::default();
    if pending.is_empty() {
        return report;
    }

    tracing::debug!(count = pending.len(), "Draining pending operations");
    for (index, batch) in pending.chunks(batch_size.max(1)).enumerate() {
        tracing::trace!(batch = index, size = batch.len(), "Replaying batch");
        for queued in batch {
            replay_one(log, local, remote, &queued.id, &mut report).await;
        }
    }

    metrics::set_pending_operations(log.len());
    tracing::info!(
        attempted = report.attempted,
        applied = report.applied,
        failed = report.failed,
        abandoned = report.abandoned,
        "Drain finished"
    );
    report
}

async fn replay_one(
    log: &PendingLog,
    local: &dyn DocumentStore,
    remote: &dyn RemoteStore,
    operation_id: &str,
    report: &mut DrainReport,
) {
    let op = match log.begin_attempt(operation_id) {
        Ok(Attempt::Proceed(op)) => op,
        Ok(Attempt::Abandoned) => {
            report.abandoned += 1;
            return;
        }
        Ok(Attempt::Missing) => return,
        Err(e) => {
            // Without a persisted retry count the ceiling cannot be enforced.
            tracing::error!(op_id = %operation_id, error = %e, "Failed to record attempt");
            report.failed += 1;
            return;
        }
    };

    report.attempted += 1;
    match apply(remote, &op).await {
        Ok(()) => {
            if let Err(e) = log.complete(&op.id) {
                tracing::error!(op_id = %op.id, error = %e, "Failed to remove applied operation");
            }
            report.applied += 1;
            if op.kind == OperationKind::Delete {
                purge_tombstone(local, &op).await;
            }
        }
        Err(e) => {
            metrics::record_remote_failure("replay");
            tracing::warn!(
                op_id = %op.id,
                entity_id = %op.entity_id,
                attempt = op.retry_count,
                error = %e,
                "Pending operation failed"
            );
            match log.record_failure(&op.id) {
                Ok(true) => report.abandoned += 1,
                Ok(false) => report.failed += 1,
                Err(e) => {
                    tracing::error!(op_id = %op.id, error = %e, "Failed to evict operation");
                    report.failed += 1;
                }
            }
        }
    }
}

/// Perform the remote write an operation describes.
async fn apply(remote: &dyn RemoteStore, op: &PendingOperation) -> Result<(), StorageError> {
    match (op.kind, &op.payload) {
        (OperationKind::Upsert, Some(Document::Program(program))) => {
            remote.put_program(program).await
        }
        (OperationKind::Upsert, Some(Document::Session(session))) => {
            remote.put_session(session).await
        }
        (OperationKind::Upsert, None) => Err(StorageError::Rejected(format!(
            "operation {} has no payload",
            op.id
        ))),
        (OperationKind::Delete, _) => match op.collection {
            Collection::Programs => remote.delete_program(&op.entity_id).await,
            Collection::Sessions => remote.delete_session(&op.entity_id).await,
        },
    }
}

/// Drop the local tombstone once the remote has accepted the delete.
async fn purge_tombstone(local: &dyn DocumentStore, op: &PendingOperation) {
    let result = match op.collection {
        Collection::Programs => local.delete_program(&op.entity_id).await,
        Collection::Sessions => local.delete_session(&op.entity_id).await,
    };
    if let Err(e) = result {
        tracing::warn!(
            entity_id = %op.entity_id,
            error = %e,
            "Failed to remove local tombstone"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::FileStore;
    use crate::remote::MemoryRemote;
    use liftlog_core::{Program, MAX_RETRIES};

    #[tokio::test]
    async fn test_drain_applies_in_order() {
        let log = PendingLog::in_memory();
        let local = FileStore::in_memory();
        let remote = MemoryRemote::new();

        let mut first = Program::with_id("p1", "First");
        first.updated_at = 1;
        let mut second = first.clone();
        second.name = "Second".into();
        second.updated_at = 2;
        log.enqueue(PendingOperation::upsert(first)).expect("enqueue");
        log.enqueue(PendingOperation::upsert(second)).expect("enqueue");

        let report = drain(&log, &local, &remote, 20).await;
        assert_eq!(report.applied, 2);
        assert!(log.is_empty());

        let stored = remote.get_program("p1").await.expect("get").expect("exists");
        assert_eq!(stored.name, "Second");
    }

    #[tokio::test]
    async fn test_failure_does_not_block_later_operations() {
        let log = PendingLog::in_memory();
        let local = FileStore::in_memory();
        let remote = MemoryRemote::new();
        remote.reject("bad");

        log.enqueue(PendingOperation::upsert(Program::with_id("bad", "Bad")))
            .expect("enqueue");
        log.enqueue(PendingOperation::upsert(Program::with_id("good", "Good")))
            .expect("enqueue");

        let report = drain(&log, &local, &remote, 1).await;
        assert_eq!(report.attempted, 2);
        assert_eq!(report.applied, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(log.list_pending()[0].retry_count, 1);
    }

    #[tokio::test]
    async fn test_applied_delete_purges_local_tombstone() {
        let log = PendingLog::in_memory();
        let local = FileStore::in_memory();
        let remote = MemoryRemote::new();

        let mut tombstone = Program::with_id("p1", "Gone");
        tombstone.deleted = true;
        local.put_program(&tombstone).await.expect("put");
        remote.put_program(&Program::with_id("p1", "Gone")).await.expect("put");
        log.enqueue(PendingOperation::delete(Collection::Programs, "p1"))
            .expect("enqueue");

        drain(&log, &local, &remote, 20).await;
        assert!(local.get_program("p1").await.expect("get").is_none());
        assert!(remote.get_program("p1").await.expect("get").expect("kept").deleted);
    }

    #[tokio::test]
    async fn test_ceiling_reached_on_fifth_failure() {
        let log = PendingLog::in_memory();
        let local = FileStore::in_memory();
        let remote = MemoryRemote::new();
        remote.set_available(false);
        log.enqueue(PendingOperation::upsert(Program::with_id("p1", "A")))
            .expect("enqueue");

        for _ in 1..MAX_RETRIES {
            let report = drain(&log, &local, &remote, 20).await;
            assert_eq!(report.failed, 1);
        }
        let last = drain(&log, &local, &remote, 20).await;
        assert_eq!(last.abandoned, 1);
        assert!(log.is_empty());
    }
}

//! Prometheus metrics for liftlog-sync.
//!
//! The recording helpers are no-ops until a recorder is installed, so the
//! library and its tests can call them unconditionally.

use std::net::SocketAddr;

use metrics::{counter, gauge};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

// Metric names as constants for consistency
const SYNC_PASSES_TOTAL: &str = "liftlog_sync_passes_total";
const DOCUMENTS_WRITTEN_TOTAL: &str = "liftlog_documents_written_total";
const REMOTE_FAILURES_TOTAL: &str = "liftlog_remote_failures_total";
const PENDING_OPERATIONS: &str = "liftlog_pending_operations";
const PENDING_APPLIED_TOTAL: &str = "liftlog_pending_applied_total";
const PENDING_ABANDONED_TOTAL: &str = "liftlog_pending_abandoned_total";
const REMOTE_DELETIONS_TOTAL: &str = "liftlog_remote_deletions_total";
const CONNECTIVITY_ONLINE: &str = "liftlog_connectivity_online";

/// Install the Prometheus recorder.
///
/// With `listen` set, the exporter also serves `/metrics` on that address;
/// this needs a running tokio runtime.
///
/// # Errors
///
/// Returns an error if the recorder cannot be installed (e.g., if another
/// recorder is already installed) or the listener cannot bind.
pub fn init_metrics(listen: Option<SocketAddr>) -> Result<(), BuildError> {
    match listen {
        Some(addr) => PrometheusBuilder::new().with_http_listener(addr).install(),
        None => PrometheusBuilder::new().install_recorder().map(drop),
    }
}

/// Record the outcome of a push, pull or listener pass.
///
/// # Arguments
///
/// * `pass` - "push", "pull", "watch_programs" or "watch_sessions"
/// * `outcome` - "completed", "offline", "signed_out" or "in_progress"
pub fn record_pass(pass: &str, outcome: &str) {
    counter!(
        SYNC_PASSES_TOTAL,
        "pass" => pass.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record documents written to one side.
///
/// # Arguments
///
/// * `target` - "local" or "remote"
/// * `collection` - "programs" or "sessions"
pub fn record_documents_written(target: &str, collection: &str, count: usize) {
    counter!(
        DOCUMENTS_WRITTEN_TOTAL,
        "target" => target.to_string(),
        "collection" => collection.to_string()
    )
    .increment(count as u64);
}

/// Record a remote call that failed inside a pass.
pub fn record_remote_failure(operation: &str) {
    counter!(REMOTE_FAILURES_TOTAL, "operation" => operation.to_string()).increment(1);
}

/// Update the pending log depth.
pub fn set_pending_operations(count: usize) {
    gauge!(PENDING_OPERATIONS).set(count as f64);
}

/// Record a pending operation confirmed by the remote.
pub fn record_pending_applied() {
    counter!(PENDING_APPLIED_TOTAL).increment(1);
}

/// Record a pending operation lost at the retry ceiling.
pub fn record_pending_abandoned() {
    counter!(PENDING_ABANDONED_TOTAL).increment(1);
}

/// Record a local copy removed because the remote confirmed its deletion.
pub fn record_remote_deletion(collection: &str) {
    counter!(REMOTE_DELETIONS_TOTAL, "collection" => collection.to_string()).increment(1);
}

/// Update connectivity state.
pub fn set_online(online: bool) {
    gauge!(CONNECTIVITY_ONLINE).set(if online { 1.0 } else { 0.0 });
}

//! # LiftLog Sync Daemon
//!
//! Runs the sync engine against a file-backed local store and an HTTP remote
//! until interrupted.

use std::sync::Arc;

use anyhow::Context;
use liftlog_core::{ConnectivityMonitor, PendingLog, UserId};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use liftlog_sync::metrics;
use liftlog_sync::{
    spawn_connectivity_probe, FileStore, HttpRemote, SessionAuth, SyncConfig, SyncEngine,
    SyncService,
};

/// Initialize structured tracing with optional JSON format.
///
/// Set `RUST_LOG` to control log levels (default: info,liftlog_sync=debug,liftlog_core=debug).
/// Set `RUST_LOG_FORMAT=json` for JSON output.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,liftlog_sync=debug,liftlog_core=debug"));

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true);

    if std::env::var("RUST_LOG_FORMAT").as_deref() == Ok("json") {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt_layer.json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt_layer)
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = SyncConfig::from_env().context("Invalid configuration")?;

    metrics::init_metrics(config.metrics_addr)
        .map_err(|e| anyhow::anyhow!("Failed to initialize Prometheus metrics: {}", e))?;
    tracing::info!(listen = ?config.metrics_addr, "Prometheus metrics initialized");

    let remote_url = config
        .remote_url
        .clone()
        .context("LIFTLOG_REMOTE_URL must be set")?;
    let remote = HttpRemote::new(remote_url.as_str(), config.http_remote())?;

    let local = FileStore::open(config.data_dir.join("store"))?;
    let pending = PendingLog::open(config.data_dir.join("pending"))?;
    tracing::info!(
        data_dir = %config.data_dir.display(),
        pending = pending.len(),
        "Local state opened"
    );

    let auth = Arc::new(match config.user_id.clone() {
        Some(user) => SessionAuth::signed_in(UserId::new(user)),
        None => SessionAuth::new(),
    });

    // Offline until the first successful ping.
    let monitor = ConnectivityMonitor::new(false);
    let remote: Arc<HttpRemote> = Arc::new(remote);
    let probe = spawn_connectivity_probe(remote.clone(), monitor.clone(), config.probe_interval);

    let engine = SyncEngine::new(
        Arc::new(local),
        remote,
        auth,
        monitor,
        pending,
        config.engine.clone(),
    );
    let service = SyncService::new(engine);
    service.start().await?;
    tracing::info!(remote = %remote_url, "LiftLog sync running");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Shutdown signal received");

    service.shutdown();
    probe.shutdown().await;
    Ok(())
}

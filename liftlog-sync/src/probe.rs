//! Connectivity probe.
//!
//! Pings the remote on an interval and feeds the result into the
//! [`ConnectivityMonitor`]. The monitor only fires its listeners on an actual
//! transition, so a steady state costs nothing beyond the ping.

use std::sync::Arc;
use std::time::Duration;

use liftlog_core::ConnectivityMonitor;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::config::MIN_TICK;
use crate::store::RemoteStore;

/// Handle to a running probe.
#[derive(Debug)]
pub struct ProbeHandle {
    handle: JoinHandle<()>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl ProbeHandle {
    /// Stop probing and wait for the task to finish.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        let _ = (&mut self.handle).await;
    }

    /// Stop probing without waiting.
    pub fn abort(&self) {
        self.handle.abort();
    }
}

impl Drop for ProbeHandle {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Probe `remote` every `interval`, starting immediately.
pub fn spawn_connectivity_probe(
    remote: Arc<dyn RemoteStore>,
    monitor: ConnectivityMonitor,
    interval: Duration,
) -> ProbeHandle {
    let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

    let handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval.max(MIN_TICK));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    tracing::debug!("Connectivity probe received shutdown signal");
                    break;
                }

                _ = ticker.tick() => {
                    let online = match remote.ping().await {
                        Ok(()) => true,
                        Err(e) => {
                            tracing::trace!(error = %e, "Remote ping failed");
                            false
                        }
                    };
                    monitor.set_online(online);
                }
            }
        }
    });

    ProbeHandle {
        handle,
        shutdown_tx: Some(shutdown_tx),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::MemoryRemote;

    async fn wait_for(monitor: &ConnectivityMonitor, online: bool) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while monitor.is_online() != online {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("monitor did not reach expected state");
    }

    #[tokio::test]
    async fn test_probe_tracks_remote_availability() {
        let remote = MemoryRemote::new();
        let monitor = ConnectivityMonitor::new(false);
        let probe = spawn_connectivity_probe(
            Arc::new(remote.clone()),
            monitor.clone(),
            Duration::from_millis(10),
        );

        wait_for(&monitor, true).await;
        remote.set_available(false);
        wait_for(&monitor, false).await;

        probe.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_stops_probe() {
        let remote = MemoryRemote::new();
        let monitor = ConnectivityMonitor::new(false);
        let probe = spawn_connectivity_probe(
            Arc::new(remote.clone()),
            monitor.clone(),
            Duration::from_millis(10),
        );
        wait_for(&monitor, true).await;
        probe.shutdown().await;

        remote.set_available(false);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(monitor.is_online());
    }

    #[tokio::test]
    async fn test_zero_interval_still_probes() {
        let monitor = ConnectivityMonitor::new(false);
        let probe = spawn_connectivity_probe(
            Arc::new(MemoryRemote::new()),
            monitor.clone(),
            Duration::ZERO,
        );

        wait_for(&monitor, true).await;
        probe.shutdown().await;
    }
}

//! # Online/Offline Monitor
//!
//! Two-state connectivity tracker. The platform (or a probe task) reports
//! connectivity through [`ConnectivityMonitor::set_online`]; listeners observe
//! every transition and reconnect hooks run after an offline→online transition.
//!
//! ```text
//!            set_online(true): listeners(true), then reconnect hooks
//!   Offline ───────────────────────────────────────────────────────▶ Online
//!          ◀───────────────────────────────────────────────────────
//!            set_online(false): listeners(false)
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::observer::{ListenerId, Observers};

/// Current connectivity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectivityState {
    /// The remote store is reachable.
    Online,
    /// Remote-facing work is deferred to the pending log.
    Offline,
}

impl From<bool> for ConnectivityState {
    fn from(online: bool) -> Self {
        if online {
            Self::Online
        } else {
            Self::Offline
        }
    }
}

struct MonitorInner {
    online: AtomicBool,
    listeners: Observers<bool>,
    reconnect_hooks: Observers<()>,
}

/// Shared connectivity monitor. Cloning yields another handle to the same state.
#[derive(Clone)]
pub struct ConnectivityMonitor {
    inner: Arc<MonitorInner>,
}

impl std::fmt::Debug for ConnectivityMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectivityMonitor")
            .field("online", &self.is_online())
            .field("listeners", &self.inner.listeners.len())
            .field("reconnect_hooks", &self.inner.reconnect_hooks.len())
            .finish()
    }
}

impl ConnectivityMonitor {
    /// Create a monitor seeded from the platform's connectivity signal.
    #[must_use]
    pub fn new(initially_online: bool) -> Self {
        Self {
            inner: Arc::new(MonitorInner {
                online: AtomicBool::new(initially_online),
                listeners: Observers::new(),
                reconnect_hooks: Observers::new(),
            }),
        }
    }

    /// Whether the monitor currently reports online.
    #[must_use]
    pub fn is_online(&self) -> bool {
        self.inner.online.load(Ordering::Acquire)
    }

    /// Current state as an enum.
    #[must_use]
    pub fn state(&self) -> ConnectivityState {
        self.is_online().into()
    }

    /// Report connectivity. Returns true if this was a transition.
    ///
    /// Repeating the current state is not a transition and notifies nobody.
    pub fn set_online(&self, online: bool) -> bool {
        let previous = self.inner.online.swap(online, Ordering::AcqRel);
        if previous == online {
            return false;
        }

        if online {
            tracing::info!("Connectivity restored");
        } else {
            tracing::warn!("Connectivity lost");
        }

        self.inner.listeners.notify(&online);
        if online {
            self.inner.reconnect_hooks.notify(&());
        }
        true
    }

    /// Register a listener and invoke it once with the current state.
    pub fn subscribe<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&bool) + Send + Sync + 'static,
    {
        let id = self.inner.listeners.subscribe(listener);
        self.inner.listeners.notify_one(id, &self.is_online());
        id
    }

    /// Remove a listener. Unknown ids are ignored.
    pub fn unsubscribe(&self, id: ListenerId) {
        self.inner.listeners.unsubscribe(id);
    }

    /// Register a hook run after each offline→online transition.
    pub fn on_reconnect<F>(&self, hook: F) -> ListenerId
    where
        F: Fn(&()) + Send + Sync + 'static,
    {
        self.inner.reconnect_hooks.subscribe(hook)
    }

    /// Remove a reconnect hook. Unknown ids are ignored.
    pub fn remove_reconnect(&self, id: ListenerId) {
        self.inner.reconnect_hooks.unsubscribe(id);
    }

    /// Number of registered listeners (excluding reconnect hooks).
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.inner.listeners.len()
    }
}

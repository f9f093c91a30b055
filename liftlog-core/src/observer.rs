//! Observer registry with token-based unsubscription.
//!
//! Callbacks are invoked outside the registry lock, in registration order, so a
//! callback may subscribe or unsubscribe without deadlocking. A panicking
//! callback is contained and does not stop the remaining ones.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};

/// Handle returned by [`Observers::subscribe`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Registry<T> {
    next_id: u64,
    entries: Vec<(ListenerId, Callback<T>)>,
}

/// A set of callbacks notified with a shared value.
pub struct Observers<T> {
    registry: Mutex<Registry<T>>,
}

impl<T> Default for Observers<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for Observers<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Observers")
            .field("len", &self.len())
            .finish()
    }
}

impl<T> Observers<T> {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            registry: Mutex::new(Registry {
                next_id: 0,
                entries: Vec::new(),
            }),
        }
    }

    /// Register a callback.
    pub fn subscribe<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let mut registry = self
            .registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let id = ListenerId(registry.next_id);
        registry.next_id += 1;
        registry.entries.push((id, Arc::new(callback)));
        id
    }

    /// Remove a callback. Returns false if it was not registered.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut registry = self
            .registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let before = registry.entries.len();
        registry.entries.retain(|(entry, _)| *entry != id);
        registry.entries.len() != before
    }

    /// Number of registered callbacks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .len()
    }

    /// Whether no callbacks are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Notify every callback. Returns the number of callbacks that panicked.
    pub fn notify(&self, value: &T) -> usize {
        let callbacks: Vec<_> = self
            .registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .iter()
            .map(|(id, cb)| (*id, Arc::clone(cb)))
            .collect();

        callbacks
            .into_iter()
            .filter(|(id, cb)| !invoke(*id, cb, value))
            .count()
    }

    /// Notify a single callback, if it is still registered.
    pub fn notify_one(&self, id: ListenerId, value: &T) -> bool {
        let callback = self
            .registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .iter()
            .find(|(entry, _)| *entry == id)
            .map(|(_, cb)| Arc::clone(cb));

        callback.is_some_and(|cb| invoke(id, &cb, value))
    }
}

/// Run one callback, returning false if it panicked.
fn invoke<T>(id: ListenerId, callback: &Callback<T>, value: &T) -> bool {
    if catch_unwind(AssertUnwindSafe(|| callback(value))).is_err() {
        tracing::error!(listener = ?id, "Listener panicked; continuing with remaining listeners");
        return false;
    }
    true
}

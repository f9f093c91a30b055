//! Authentication collaborator.
//!
//! The engine only needs to know whether a user is present and to hear about
//! changes; sign-in flows live elsewhere.

use liftlog_core::UserId;
use tokio::sync::watch;

/// Source of the current authenticated user.
pub trait AuthProvider: Send + Sync {
    /// The signed-in user, if any.
    fn current_user(&self) -> Option<UserId>;

    /// Observe auth changes. Dropping the receiver unsubscribes.
    fn subscribe(&self) -> watch::Receiver<Option<UserId>>;
}

/// In-process auth state driven by explicit sign-in and sign-out calls.
#[derive(Debug)]
pub struct SessionAuth {
    tx: watch::Sender<Option<UserId>>,
}

impl Default for SessionAuth {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionAuth {
    /// Start signed out.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx }
    }

    /// Start signed in as `user`.
    #[must_use]
    pub fn signed_in(user: UserId) -> Self {
        let (tx, _) = watch::channel(Some(user));
        Self { tx }
    }

    /// Sign in, replacing any current user.
    pub fn sign_in(&self, user: UserId) {
        tracing::info!(user = %user, "User signed in");
        self.tx.send_replace(Some(user));
    }

    /// Sign out. No-op when already signed out.
    pub fn sign_out(&self) {
        if self.tx.send_replace(None).is_some() {
            tracing::info!("User signed out");
        }
    }
}

impl AuthProvider for SessionAuth {
    fn current_user(&self) -> Option<UserId> {
        self.tx.borrow().clone()
    }

    fn subscribe(&self) -> watch::Receiver<Option<UserId>> {
        self.tx.subscribe()
    }
}

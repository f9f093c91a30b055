//! Error types for storage and pending-log operations.

use thiserror::Error;

/// Result type for store adapter operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors raised by local or remote store adapters.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred while reading or writing durable storage.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A document could not be serialized or deserialized.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The store could not be reached (network failure, offline, timeout).
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// The store refused the request (bad payload, quota, permissions).
    #[error("Request rejected: {0}")]
    Rejected(String),

    /// The store was used before `init` succeeded or after it was closed.
    #[error("Store not initialized: {0}")]
    NotInitialized(String),

    /// An internal lock was poisoned by a panicking thread.
    #[error("Lock poisoned")]
    LockPoisoned,
}

impl StorageError {
    /// Returns true when retrying the same request later may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Io(_))
    }
}

/// Errors raised while persisting the pending operation log.
#[derive(Debug, Error)]
pub enum LogError {
    /// Writing or removing an operation file failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// An operation could not be encoded or a persisted file was corrupt.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An upsert operation was built without a payload.
    #[error("Operation {0} has no payload")]
    MissingPayload(String),
}

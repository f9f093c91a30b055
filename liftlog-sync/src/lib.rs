//! # LiftLog Sync
//!
//! Async sync engine keeping a local document store and a remote store in
//! agreement while the device moves between online and offline.
//! This library is used by both the daemon binary and integration tests.
//!
//! ## Data flow
//!
//! ```text
//!   SyncService ──writes──▶ local store ──push──▶ remote store
//!        │                       ▲                     │
//!        └─offline─▶ pending log │◀──pull / watches────┘
//!                        │       │
//!                        └─drain─┴──────────────────▶ remote store
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![allow(clippy::module_name_repetitions)]

pub mod auth;
pub mod config;
pub mod engine;
pub mod http;
pub mod local;
pub mod metrics;
pub mod probe;
pub mod remote;
pub mod replay;
pub mod service;
pub mod store;

pub use auth::{AuthProvider, SessionAuth};
pub use config::{ConfigError, EngineConfig, SyncConfig, PUSH_BATCH_SIZE};
pub use engine::{PassOutcome, PassReport, SkipReason, SyncEngine, SyncStatus};
pub use http::{HttpRemote, HttpRemoteConfig, HttpRemoteError};
pub use local::FileStore;
pub use probe::{spawn_connectivity_probe, ProbeHandle};
pub use remote::MemoryRemote;
pub use replay::{drain, DrainReport};
pub use service::{ServiceError, ServiceResult, SyncService};
pub use store::{DocumentStore, RemoteStore, Watch};

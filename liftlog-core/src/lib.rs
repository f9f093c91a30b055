//! # LiftLog Core
//!
//! Runtime-free building blocks of the LiftLog offline sync engine.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │                liftlog-core                 │
//! ├─────────────────────────────────────────────┤
//! │  Model           │  Merge                   │
//! │  - Programs      │  - Last write wins       │
//! │  - Sessions      │  - Field-level tie merge │
//! ├─────────────────────────────────────────────┤
//! │  Pending Log     │  Connectivity            │
//! │  - Durable queue │  - Online/offline state  │
//! │  - Retry ceiling │  - Listener registry     │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! The async orchestration (push, pull, live listeners, replay) lives in
//! `liftlog-sync`; everything here is synchronous and side-effect free apart
//! from the pending log's file persistence.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod connectivity;
pub mod error;
pub mod file_name;
pub mod merge;
pub mod model;
pub mod observer;
pub mod parse;
pub mod pending;

pub use connectivity::{ConnectivityMonitor, ConnectivityState};
pub use error::{LogError, StorageError, StorageResult};
pub use file_name::json_file_name;
pub use merge::{merge_programs, merge_sessions, resolve, Resolution, Versioned};
pub use model::{
    now_ms, Collection, CompletedExercise, Document, Exercise, Program, Session, SetEntry, UserId,
    Workout,
};
pub use observer::{ListenerId, Observers};
pub use parse::{ParseError, ProgramParser};
pub use pending::{
    Attempt, OperationKind, PendingLog, PendingOperation, Removal, RemovalReason, DRAIN_BATCH_SIZE,
    MAX_RETRIES,
};

/// Core library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

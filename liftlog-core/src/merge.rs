//! # Conflict Resolution
//!
//! Last-write-wins on the `updatedAt` clock, with a field-level merge when both
//! replicas carry exactly the same timestamp.
//!
//! ## Precedence on a tie
//!
//! ```text
//! field            Program                      Session
//! ---------------  ---------------------------  ---------------------------
//! id, name, date   local                        local
//! notes            -                            local
//! userId           local, else remote           local, else remote
//! deleted          local                        local
//! workouts         keyed (week, day), local wins -
//! history          keyed session id, local wins, -
//!                  sorted by date ascending
//! exercises        -                            keyed name, local wins
//! ```
//!
//! Remote entries seed each keyed collection in their original order; local
//! entries replace same-keyed entries in place and novel local entries are
//! appended.

use std::collections::HashMap;
use std::hash::Hash;

use crate::model::{Program, Session};

/// A document that carries an identity and a last-modified clock.
pub trait Versioned {
    /// Document id.
    fn id(&self) -> &str;
    /// Last-modified timestamp in milliseconds.
    fn updated_at(&self) -> u64;
}

impl Versioned for Program {
    fn id(&self) -> &str {
        &self.id
    }

    fn updated_at(&self) -> u64 {
        self.updated_at
    }
}

impl Versioned for Session {
    fn id(&self) -> &str {
        &self.id
    }

    fn updated_at(&self) -> u64 {
        self.updated_at
    }
}

/// Outcome of comparing a local and a remote replica of one document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// The local copy is authoritative; push it if anything.
    KeepLocal,
    /// The remote copy is authoritative; store it locally.
    KeepRemote,
    /// Clocks are equal; store the field-level merge.
    Merge,
}

/// Decide which replica wins.
///
/// A side that is absent always loses to a present one. When both are absent
/// there is nothing to do and [`Resolution::KeepLocal`] is returned.
#[must_use]
pub fn resolve<T: Versioned>(local: Option<&T>, remote: Option<&T>) -> Resolution {
    match (local, remote) {
        (None, Some(_)) => Resolution::KeepRemote,
        (Some(_) | None, None) => Resolution::KeepLocal,
        (Some(local), Some(remote)) => {
            if remote.updated_at() > local.updated_at() {
                Resolution::KeepRemote
            } else if local.updated_at() > remote.updated_at() {
                Resolution::KeepLocal
            } else {
                Resolution::Merge
            }
        }
    }
}

/// Which side survives when one or both inputs are malformed.
enum Usable {
    Both,
    LocalOnly,
    RemoteOnly,
}

fn usable<T: Versioned>(local: &T, remote: &T) -> Usable {
    let local_ok = !local.id().is_empty();
    let remote_ok = !remote.id().is_empty();
    match (local_ok, remote_ok) {
        (true, true) if local.id() == remote.id() => Usable::Both,
        (false, true) => Usable::RemoteOnly,
        _ => Usable::LocalOnly,
    }
}

/// Merge two programs that carry the same timestamp.
///
/// Pure and total: a malformed side (empty id, or ids that disagree) is
/// discarded in favour of the well-formed one, never failing the caller.
#[must_use]
pub fn merge_programs(local: &Program, remote: &Program) -> Program {
    match usable(local, remote) {
        Usable::LocalOnly => {
            tracing::warn!(
                local_id = %local.id,
                remote_id = %remote.id,
                "merge_programs: malformed input, keeping local"
            );
            return local.clone();
        }
        Usable::RemoteOnly => {
            tracing::warn!(remote_id = %remote.id, "merge_programs: malformed local, keeping remote");
            return remote.clone();
        }
        Usable::Both => {}
    }

    let workouts = merge_keyed(&remote.workouts, &local.workouts, |w| {
        (w.week.clone(), w.day.clone())
    });
    let mut history = merge_keyed(&remote.history, &local.history, |s| s.id.clone());
    history.sort_by(|a, b| a.date.cmp(&b.date));

    Program {
        id: local.id.clone(),
        name: local.name.clone(),
        workouts,
        history,
        user_id: local.user_id.clone().or_else(|| remote.user_id.clone()),
        updated_at: local.updated_at.max(remote.updated_at),
        deleted: local.deleted,
    }
}

/// Merge two sessions that carry the same timestamp.
#[must_use]
pub fn merge_sessions(local: &Session, remote: &Session) -> Session {
    match usable(local, remote) {
        Usable::LocalOnly => return local.clone(),
        Usable::RemoteOnly => return remote.clone(),
        Usable::Both => {}
    }

    Session {
        id: local.id.clone(),
        program_id: local.program_id.clone(),
        date: local.date.clone(),
        exercises: merge_keyed(&remote.exercises, &local.exercises, |e| e.name.clone()),
        notes: local.notes.clone(),
        user_id: local.user_id.clone().or_else(|| remote.user_id.clone()),
        updated_at: local.updated_at.max(remote.updated_at),
        deleted: local.deleted,
    }
}

/// Seed with `remote`, then overwrite or append with `local`.
fn merge_keyed<T, K, F>(remote: &[T], local: &[T], key: F) -> Vec<T>
where
    T: Clone,
    K: Eq + Hash,
    F: Fn(&T) -> K,
{
    let mut merged: Vec<T> = Vec::with_capacity(remote.len() + local.len());
    let mut index: HashMap<K, usize> = HashMap::new();

    for item in remote.iter().chain(local) {
        match index.get(&key(item)) {
            Some(&slot) => merged[slot] = item.clone(),
            None => {
                index.insert(key(item), merged.len());
                merged.push(item.clone());
            }
        }
    }
    merged
}

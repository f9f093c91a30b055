//! Workout program data model shared by the local and remote replicas.
//!
//! Every stored document carries the contractual `updatedAt`, `deleted` and
//! `userId` fields used for conflict resolution and owner-scoped queries.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Identifier of an authenticated user, used as the remote owner id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    /// Wrap a raw user id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the raw id.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The two document collections kept in sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Collection {
    /// Workout programs, keyed by program id.
    Programs,
    /// Completed sessions, keyed by session id.
    Sessions,
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Programs => f.write_str("programs"),
            Self::Sessions => f.write_str("sessions"),
        }
    }
}

/// A prescribed exercise inside a workout template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Exercise {
    /// Exercise name as written in the spreadsheet.
    pub name: String,
    /// Number of working sets.
    #[serde(default)]
    pub sets: u32,
    /// Rep target, kept verbatim ("5", "8-12", "AMRAP").
    #[serde(default)]
    pub reps: String,
    /// Prescribed load, if the program specifies one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load: Option<String>,
    /// Coaching notes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl Exercise {
    /// Create an exercise with the given name and no prescription.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sets: 0,
            reps: String::new(),
            load: None,
            notes: None,
        }
    }
}

/// One day of a program template, identified by `(week, day)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workout {
    /// Week label ("1", "2", "Deload").
    pub week: String,
    /// Day label within the week ("Push #1").
    pub day: String,
    /// Exercises in prescribed order.
    #[serde(default)]
    pub exercises: Vec<Exercise>,
}

impl Workout {
    /// Create a workout for the given week and day.
    pub fn new(week: impl Into<String>, day: impl Into<String>, exercises: Vec<Exercise>) -> Self {
        Self {
            week: week.into(),
            day: day.into(),
            exercises,
        }
    }

    /// The merge key of this workout.
    #[must_use]
    pub fn key(&self) -> (&str, &str) {
        (&self.week, &self.day)
    }
}

/// A single performed set.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetEntry {
    /// Repetitions completed.
    pub reps: u32,
    /// Load used.
    pub load: f64,
    /// Rate of perceived exertion, if recorded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effort: Option<u8>,
}

/// An exercise as performed during a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletedExercise {
    /// Exercise name, the merge key within a session.
    pub name: String,
    /// Sets in the order they were performed.
    #[serde(default)]
    pub sets: Vec<SetEntry>,
}

/// A completed workout instance linked to a program.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    /// Session identifier.
    pub id: String,
    /// Owning program id.
    pub program_id: String,
    /// ISO-8601 date the session was performed.
    pub date: String,
    /// Completed exercises.
    #[serde(default)]
    pub exercises: Vec<CompletedExercise>,
    /// Free-text notes.
    #[serde(default)]
    pub notes: String,
    /// Remote owner id, set once the session has been mirrored.
    #[serde(default)]
    pub user_id: Option<UserId>,
    /// Last-modified logical clock in milliseconds.
    #[serde(default)]
    pub updated_at: u64,
    /// Soft-delete flag.
    #[serde(default)]
    pub deleted: bool,
}

impl Session {
    /// Create a session for `program_id` on `date` with a fresh id.
    pub fn new(program_id: impl Into<String>, date: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            program_id: program_id.into(),
            date: date.into(),
            exercises: Vec::new(),
            notes: String::new(),
            user_id: None,
            updated_at: now_ms(),
            deleted: false,
        }
    }

    /// Advance the logical clock, never moving it backwards.
    pub fn touch(&mut self) {
        self.updated_at = next_clock(self.updated_at);
    }
}

/// A workout program: template plus completed-session history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Program {
    /// Program identifier, stable across replicas.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Template workouts in spreadsheet order.
    #[serde(default)]
    pub workouts: Vec<Workout>,
    /// Completed sessions, ascending by date.
    #[serde(default)]
    pub history: Vec<Session>,
    /// Remote owner id, set once the program has been mirrored.
    #[serde(default)]
    pub user_id: Option<UserId>,
    /// Last-modified logical clock in milliseconds.
    #[serde(default)]
    pub updated_at: u64,
    /// Soft-delete flag.
    #[serde(default)]
    pub deleted: bool,
}

impl Program {
    /// Create an empty program with a fresh id.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_id(uuid::Uuid::new_v4().to_string(), name)
    }

    /// Create an empty program with an explicit id.
    pub fn with_id(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            workouts: Vec::new(),
            history: Vec::new(),
            user_id: None,
            updated_at: now_ms(),
            deleted: false,
        }
    }

    /// Advance the logical clock, never moving it backwards.
    pub fn touch(&mut self) {
        self.updated_at = next_clock(self.updated_at);
    }

    /// Append or replace a session in the history, keeping date order.
    pub fn record_session(&mut self, session: Session) {
        self.history.retain(|s| s.id != session.id);
        self.history.push(session);
        self.history.sort_by(|a, b| a.date.cmp(&b.date));
    }
}

/// A document in either collection; the unit of batched remote writes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "collection", content = "document", rename_all = "lowercase")]
pub enum Document {
    /// A program document.
    Program(Program),
    /// A session document.
    Session(Session),
}

impl Document {
    /// Collection this document belongs to.
    #[must_use]
    pub const fn collection(&self) -> Collection {
        match self {
            Self::Program(_) => Collection::Programs,
            Self::Session(_) => Collection::Sessions,
        }
    }

    /// Document id.
    #[must_use]
    pub fn id(&self) -> &str {
        match self {
            Self::Program(p) => &p.id,
            Self::Session(s) => &s.id,
        }
    }

    /// Last-modified timestamp.
    #[must_use]
    pub const fn updated_at(&self) -> u64 {
        match self {
            Self::Program(p) => p.updated_at,
            Self::Session(s) => s.updated_at,
        }
    }

    /// Stamp the owner id onto the document.
    #[must_use]
    pub fn owned_by(mut self, user: &UserId) -> Self {
        match &mut self {
            Self::Program(p) => p.user_id = Some(user.clone()),
            Self::Session(s) => s.user_id = Some(user.clone()),
        }
        self
    }
}

impl From<Program> for Document {
    fn from(program: Program) -> Self {
        Self::Program(program)
    }
}

impl From<Session> for Document {
    fn from(session: Session) -> Self {
        Self::Session(session)
    }
}

/// Get the current Unix timestamp in milliseconds.
#[must_use]
pub fn now_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map_or(0, |d| {
        // Timestamp will not exceed u64 max for millennia
        #[allow(clippy::cast_possible_truncation)]
        {
            d.as_millis() as u64
        }
    })
}

fn next_clock(previous: u64) -> u64 {
    now_ms().max(previous.saturating_add(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_program_serializes_contract_fields() {
        let mut program = Program::with_id("p1", "Strength");
        program.user_id = Some(UserId::new("u1"));
        program.updated_at = 100;

        let json = serde_json::to_value(&program).expect("serialize");
        assert_eq!(json["updatedAt"], 100);
        assert_eq!(json["deleted"], false);
        assert_eq!(json["userId"], "u1");
    }

    #[test]
    fn test_program_defaults_missing_fields() {
        let program: Program =
            serde_json::from_str(r#"{"id":"p1","name":"Minimal"}"#).expect("deserialize");
        assert!(program.workouts.is_empty());
        assert!(program.user_id.is_none());
        assert_eq!(program.updated_at, 0);
        assert!(!program.deleted);
    }

    #[test]
    fn test_touch_is_monotonic() {
        let mut program = Program::with_id("p1", "Future");
        program.updated_at = u64::MAX - 1;
        program.touch();
        assert_eq!(program.updated_at, u64::MAX);
        program.touch();
        assert_eq!(program.updated_at, u64::MAX);
    }

    #[test]
    fn test_record_session_keeps_date_order() {
        let mut program = Program::with_id("p1", "Test");
        let mut late = Session::new("p1", "2024-03-10");
        late.id = "late".into();
        let mut early = Session::new("p1", "2024-03-01");
        early.id = "early".into();

        program.record_session(late);
        program.record_session(early.clone());
        program.record_session(early);

        let ids: Vec<_> = program.history.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["early", "late"]);
    }

    #[test]
    fn test_document_tagging() {
        let doc = Document::from(Session::new("p1", "2024-01-01"));
        assert_eq!(doc.collection(), Collection::Sessions);

        let json = serde_json::to_value(&doc).expect("serialize");
        assert_eq!(json["collection"], "session");
        assert_eq!(json["document"]["programId"], "p1");
    }

    #[test]
    fn test_owned_by_stamps_user() {
        let user = UserId::new("owner");
        let doc = Document::from(Program::with_id("p1", "Test")).owned_by(&user);
        match doc {
            Document::Program(p) => assert_eq!(p.user_id, Some(user)),
            Document::Session(_) => panic!("expected program"),
        }
    }
}

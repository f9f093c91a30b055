//! Contract for turning an uploaded spreadsheet into a [`Program`].
//!
//! Column parsing itself lives outside this crate; the sync layer only needs
//! a pure `bytes -> Program` function that fails with a typed error.

use thiserror::Error;

use crate::model::Program;

/// Errors a spreadsheet parser may report.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    /// The file is empty or has no data rows.
    #[error("spreadsheet is empty")]
    Empty,

    /// A required column is absent from the header row.
    #[error("missing required column: {0}")]
    MissingColumn(String),

    /// A row could not be interpreted.
    #[error("invalid row {row}: {reason}")]
    InvalidRow {
        /// 1-based row number.
        row: usize,
        /// What was wrong with it.
        reason: String,
    },

    /// The bytes are not in a supported encoding or format.
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),
}

/// A pure spreadsheet parser.
pub trait ProgramParser: Send + Sync {
    /// Parse raw file bytes into a program.
    ///
    /// # Errors
    ///
    /// Returns a [`ParseError`] describing why the file was rejected.
    fn parse(&self, name: &str, bytes: &[u8]) -> Result<Program, ParseError>;
}

impl<F> ProgramParser for F
where
    F: Fn(&str, &[u8]) -> Result<Program, ParseError> + Send + Sync,
{
    fn parse(&self, name: &str, bytes: &[u8]) -> Result<Program, ParseError> {
        self(name, bytes)
    }
}

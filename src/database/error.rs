//! Database error classification
//!
//! PostgreSQL reports failures with five-character SQLSTATE codes. The
//! executor only needs to know which of four buckets a failure falls into.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Duplicate table, object, schema, database, column, function
const ALREADY_EXISTS: &[&str] = &["42P07", "42710", "42P06", "42P04", "42701", "42723"];

/// `invalid_table_definition`, raised for a second primary key whether or
/// not it matches the existing one
pub const INVALID_TABLE_DEFINITION: &str = "42P16";

/// Undefined table, object, column, schema, database, function
const DOES_NOT_EXIST: &[&str] = &["42P01", "42704", "42703", "3F000", "3D000", "42883"];

/// Admin/crash shutdown, cannot connect now, too many connections
const CONNECTIVITY: &[&str] = &["57P01", "57P02", "57P03", "53300"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DbErrorKind {
    AlreadyExists,
    DoesNotExist,
    /// Connection and authentication failures, never suppressed
    Connectivity,
    Unclassified,
}

impl DbErrorKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::AlreadyExists => "already exists",
            Self::DoesNotExist => "does not exist",
            Self::Connectivity => "connectivity",
            Self::Unclassified => "unclassified",
        }
    }
}

impl fmt::Display for DbErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Bucket a SQLSTATE code
pub fn classify_sqlstate(code: &str) -> DbErrorKind {
    if ALREADY_EXISTS.contains(&code) {
        DbErrorKind::AlreadyExists
    } else if DOES_NOT_EXIST.contains(&code) {
        DbErrorKind::DoesNotExist
    } else if code.starts_with("08") || code.starts_with("28") || CONNECTIVITY.contains(&code) {
        DbErrorKind::Connectivity
    } else {
        DbErrorKind::Unclassified
    }
}

/// A failure reported by a site database
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{kind} error{}: {message}", .code.as_deref().map(|c| format!(" [{c}]")).unwrap_or_default())]
pub struct DatabaseError {
    pub kind: DbErrorKind,
    /// SQLSTATE, when the server sent one
    pub code: Option<String>,
    pub message: String,
}

impl DatabaseError {
    /// Error carrying a SQLSTATE; the kind is derived from the code
    pub fn from_sqlstate(code: impl Into<String>, message: impl Into<String>) -> Self {
        let code = code.into();
        Self {
            kind: classify_sqlstate(&code),
            code: Some(code),
            message: message.into(),
        }
    }

    /// Failure to reach or authenticate with the server
    pub fn connectivity(message: impl Into<String>) -> Self {
        Self {
            kind: DbErrorKind::Connectivity,
            code: None,
            message: message.into(),
        }
    }

    /// Re-bucket an error after inspecting the catalog
    pub fn with_kind(mut self, kind: DbErrorKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn unclassified(message: impl Into<String>) -> Self {
        Self {
            kind: DbErrorKind::Unclassified,
            code: None,
            message: message.into(),
        }
    }

    /// Get a user-friendly error message for CLI output
    pub fn user_message(&self) -> String {
        match self.kind {
            DbErrorKind::Connectivity => format!(
                "{self}\n\nHint: Check the connection string, credentials and that the server is reachable."
            ),
            DbErrorKind::AlreadyExists | DbErrorKind::DoesNotExist => format!(
                "{self}\n\nHint: Run with normal sensitivity to tolerate existing or missing objects."
            ),
            DbErrorKind::Unclassified => self.to_string(),
        }
    }
}

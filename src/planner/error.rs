//! Planning errors

use thiserror::Error;

use crate::transform::TransformError;

/// Errors found while planning definitions or statements.
///
/// These are configuration problems and abort a run before any database is
/// touched.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlanningError {
    /// Two sources define the same name differently
    #[error("Conflicting definitions for {name}: {existing} vs {proposed}")]
    Conflict {
        name: String,
        existing: String,
        proposed: String,
    },

    #[error("Dependency cycle between: {}", .members.join(", "))]
    Cycle { members: Vec<String> },

    /// A foreign key points at a table the metadata does not declare
    #[error("Constraint {constraint} references unknown table {table}")]
    UnresolvedReference { constraint: String, table: String },

    #[error("Metadata is for version {found}, expected {expected}")]
    VersionMismatch { expected: String, found: String },

    #[error(transparent)]
    Transform(#[from] TransformError),
}

impl PlanningError {
    pub fn conflict(
        name: impl Into<String>,
        existing: impl ToString,
        proposed: impl ToString,
    ) -> Self {
        Self::Conflict {
            name: name.into(),
            existing: existing.to_string(),
            proposed: proposed.to_string(),
        }
    }

    /// Get a user-friendly error message for CLI output
    pub fn user_message(&self) -> String {
        match self {
            Self::Conflict { name, .. } => format!(
                "{self}\n\nHint: Two transforms declare {name} with different definitions. Rename one of them."
            ),
            Self::Cycle { .. } => format!(
                "{self}\n\nHint: Foreign keys should not reference each other in a loop; check the data model."
            ),
            Self::UnresolvedReference { table, .. } => format!(
                "{self}\n\nHint: Add {table} to the data model or drop the foreign key."
            ),
            Self::VersionMismatch { .. } => format!(
                "{self}\n\nHint: Load metadata for the version being processed."
            ),
            Self::Transform(e) => e.user_message(),
        }
    }
}

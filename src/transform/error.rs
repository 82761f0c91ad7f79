//! Transform errors

use thiserror::Error;

/// Errors raised while rewriting a table's selection
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransformError {
    /// The transform was asked about a table the metadata does not declare
    #[error("Unknown table: {0}")]
    UnknownTable(String),

    #[error("Unknown column: {table}.{column}")]
    UnknownColumn { table: String, column: String },

    /// A transform needs per-run context that was not supplied
    #[error("Missing transform context: {0}")]
    MissingContext(String),

    #[error("Invalid {transform} configuration: {message}")]
    InvalidConfiguration { transform: String, message: String },
}

impl TransformError {
    pub fn unknown_column(table: impl Into<String>, column: impl Into<String>) -> Self {
        Self::UnknownColumn {
            table: table.into(),
            column: column.into(),
        }
    }

    pub fn invalid(transform: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidConfiguration {
            transform: transform.into(),
            message: message.into(),
        }
    }

    /// Get a user-friendly error message for CLI output
    pub fn user_message(&self) -> String {
        match self {
            Self::UnknownTable(table) => format!(
                "Unknown table: {table}\n\nHint: Check that the data model version declares this table."
            ),
            Self::UnknownColumn { table, column } => format!(
                "Unknown column: {table}.{column}\n\nHint: Check the transform configuration against the data model."
            ),
            Self::MissingContext(what) => format!(
                "Missing transform context: {what}\n\nHint: Pass the site name when running transforms."
            ),
            Self::InvalidConfiguration { .. } => self.to_string(),
        }
    }
}

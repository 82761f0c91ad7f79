//! Crate-level error type
//!
//! Wraps every module error so callers such as a CLI can hold one type and
//! still print a hint for the specific failure.

use thiserror::Error;

use crate::config::ConfigError;
use crate::connection::ConnectionError;
use crate::database::DatabaseError;
use crate::executor::ExecutorError;
use crate::lifecycle::LifecycleError;
use crate::model::MetadataError;
use crate::naming::NamingError;
use crate::planner::PlanningError;
use crate::transform::TransformError;

#[derive(Error, Debug)]
pub enum EtlError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Metadata(#[from] MetadataError),

    #[error(transparent)]
    Transform(#[from] TransformError),

    #[error(transparent)]
    Planning(#[from] PlanningError),

    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error(transparent)]
    Executor(#[from] ExecutorError),

    #[error(transparent)]
    Naming(#[from] NamingError),

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
}

impl EtlError {
    /// Get a user-friendly error message for CLI output
    pub fn user_message(&self) -> String {
        match self {
            Self::Config(e) => e.user_message(),
            Self::Metadata(e) => e.user_message(),
            Self::Transform(e) => e.user_message(),
            Self::Planning(e) => e.user_message(),
            Self::Executor(e) => e.user_message(),
            Self::Lifecycle(e) => e.user_message(),
            Self::Connection(_) => {
                format!("{self}\n\nHint: Use libpq key=value pairs or a postgresql:// URI.")
            }
            Self::Database(_) | Self::Naming(_) => self.to_string(),
        }
    }
}

pub type EtlResult<T> = Result<T, EtlError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_message_keeps_module_hint() {
        let err: EtlError = TransformError::UnknownTable("visit".to_string()).into();
        assert!(err.user_message().contains("Hint:"));
        assert_eq!(err.to_string(), "Unknown table: visit");

        let err: EtlError = LifecycleError::from(ExecutorError::NoTargets).into();
        assert!(err.user_message().starts_with("No site targets given"));
    }
}

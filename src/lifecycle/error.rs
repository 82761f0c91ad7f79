//! Lifecycle errors

use thiserror::Error;

use crate::executor::ExecutorError;
use crate::model::MetadataError;
use crate::naming::NamingError;
use crate::planner::PlanningError;

/// Errors that stop a lifecycle operation before or between steps.
///
/// Failures at individual sites are not errors here; they are recorded in
/// the step's [`RunReport`](crate::executor::RunReport).
#[derive(Error, Debug)]
pub enum LifecycleError {
    #[error(transparent)]
    Metadata(#[from] MetadataError),

    #[error(transparent)]
    Planning(#[from] PlanningError),

    #[error(transparent)]
    Executor(#[from] ExecutorError),

    #[error(transparent)]
    Naming(#[from] NamingError),

    #[error("No sites given for {step}")]
    NoSites { step: String },
}

impl LifecycleError {
    /// Get a user-friendly error message for CLI output
    pub fn user_message(&self) -> String {
        match self {
            Self::Metadata(e) => e.user_message(),
            Self::Planning(e) => e.user_message(),
            Self::Executor(e) => e.user_message(),
            Self::Naming(e) => e.to_string(),
            Self::NoSites { .. } => {
                format!("{self}\n\nHint: Pass a comma-separated site list or set `sites` in the configuration.")
            }
        }
    }
}

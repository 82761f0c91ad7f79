//! Statement execution across site databases
//!
//! Statements for one site always run in order on one session. Sites are
//! independent: in parallel mode each site gets its own task and session,
//! bounded by a semaphore; in sequential mode sites run one at a time and an
//! unsuppressed failure cancels the sites still queued.

pub mod report;
pub mod scheduler;

pub use report::{OperationResult, Outcome, RunReport, SoftFailure};
pub use scheduler::run_per_site;

use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::database::{ErrorSensitivity, SessionFactory, SiteTarget};
use crate::statements::Statement;

pub const DEFAULT_MAX_CONCURRENCY: usize = 24;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecutorError {
    #[error("No site targets given")]
    NoTargets,

    #[error("Site {0} was given more than once")]
    DuplicateTarget(String),
}

impl ExecutorError {
    /// Get a user-friendly error message for CLI output
    pub fn user_message(&self) -> String {
        match self {
            Self::NoTargets => format!("{self}\n\nHint: Pass at least one site."),
            Self::DuplicateTarget(site) => {
                format!("{self}\n\nHint: Remove the repeated '{site}' from the site list.")
            }
        }
    }
}

/// How sites are scheduled
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    Sequential,
    #[default]
    Parallel,
}

impl ExecutionMode {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Sequential => "sequential",
            Self::Parallel => "parallel",
        }
    }
}

impl From<bool> for ExecutionMode {
    fn from(parallel: bool) -> Self {
        if parallel {
            Self::Parallel
        } else {
            Self::Sequential
        }
    }
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ExecutionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "sequential" => Ok(Self::Sequential),
            "parallel" => Ok(Self::Parallel),
            _ => Err(format!("Unknown execution mode: {s}")),
        }
    }
}

/// Statements to run at one site
#[derive(Debug, Clone)]
pub struct SitePlan {
    pub target: SiteTarget,
    pub statements: Vec<Statement>,
}

impl SitePlan {
    pub fn new(target: SiteTarget, statements: Vec<Statement>) -> Self {
        Self { target, statements }
    }
}

/// Runs site plans through sessions opened by `F`
pub struct Executor<F: SessionFactory> {
    factory: Arc<F>,
    max_concurrency: usize,
}

impl<F: SessionFactory> Clone for Executor<F> {
    fn clone(&self) -> Self {
        Self {
            factory: Arc::clone(&self.factory),
            max_concurrency: self.max_concurrency,
        }
    }
}

impl<F: SessionFactory> Executor<F> {
    pub fn new(factory: F) -> Self {
        Self::from_arc(Arc::new(factory))
    }

    pub fn from_arc(factory: Arc<F>) -> Self {
        Self {
            factory,
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
        }
    }

    /// Upper bound on concurrently running site tasks
    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max.max(1);
        self
    }

    pub fn factory(&self) -> &F {
        &self.factory
    }

    /// Run the same statements at every target
    pub async fn execute(
        &self,
        step: &str,
        statements: &[Statement],
        targets: &[SiteTarget],
        sensitivity: ErrorSensitivity,
        mode: ExecutionMode,
    ) -> Result<RunReport, ExecutorError> {
        let plans = targets
            .iter()
            .map(|t| SitePlan::new(t.clone(), statements.to_vec()))
            .collect();
        self.execute_plans(step, plans, sensitivity, mode).await
    }

    /// Run each site's own statements.
    ///
    /// Every plan's site appears in the report, whatever happened to it.
    pub async fn execute_plans(
        &self,
        step: &str,
        plans: Vec<SitePlan>,
        sensitivity: ErrorSensitivity,
        mode: ExecutionMode,
    ) -> Result<RunReport, ExecutorError> {
        debug!(step, %sensitivity, "Scheduling statement plans");
        let tasks = plans
            .into_iter()
            .map(|plan| (plan.target.site.clone(), plan))
            .collect();
        let factory = Arc::clone(&self.factory);
        run_per_site(step, tasks, mode, self.max_concurrency, move |plan| {
            run_site(Arc::clone(&factory), plan, sensitivity)
        })
        .await
    }
}

/// Run one site's statements in order on one session
async fn run_site<F: SessionFactory>(
    factory: Arc<F>,
    plan: SitePlan,
    sensitivity: ErrorSensitivity,
) -> OperationResult {
    let start = Instant::now();
    let site = plan.target.site.clone();

    let mut session = match factory.open(&plan.target).await {
        Ok(session) => session,
        Err(e) => {
            error!(site = %site, error = %e, "Could not open session");
            let mut result = OperationResult::new(&site, Outcome::failed(e, None));
            result.elapsed_ms = start.elapsed().as_millis() as u64;
            return result;
        }
    };

    let mut result = OperationResult::new(&site, Outcome::Success);
    for statement in &plan.statements {
        let effective = statement.sensitivity.stricter(sensitivity);
        match session.execute(statement).await {
            Ok(rows) => {
                debug!(site = %site, statement = %statement.description, rows, "Statement applied");
                result.applied += 1;
            }
            Err(e) if effective.suppresses(e.kind) => {
                warn!(
                    site = %site,
                    statement = %statement.description,
                    code = e.code.as_deref().unwrap_or("-"),
                    sensitivity = %effective,
                    error = %e.message,
                    "Tolerated database error"
                );
                result
                    .suppressed
                    .push(SoftFailure::new(&statement.description, e, effective));
            }
            Err(e) => {
                error!(
                    site = %site,
                    statement = %statement.description,
                    sensitivity = %effective,
                    error = %e,
                    "Statement failed, skipping the rest of this site"
                );
                result.outcome = Outcome::failed(e, Some(statement.description.clone()));
                break;
            }
        }
    }

    if let Err(e) = session.close().await {
        warn!(site = %site, error = %e, "Error closing session");
    }
    result.elapsed_ms = start.elapsed().as_millis() as u64;
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionInfo;
    use crate::database::{DbErrorKind, MemoryDatabase, MemorySessionFactory};
    use crate::models::{Column, IndexDefinition, Table};
    use crate::statements::DdlAction;

    fn target(site: &str) -> SiteTarget {
        let conn = ConnectionInfo::parse(&format!(
            "host=localhost dbname=pedsnet options='-c search_path={site}_pedsnet'"
        ))
        .unwrap();
        SiteTarget::new(site, conn)
    }

    fn database(sites: &[&str]) -> MemoryDatabase {
        let db = MemoryDatabase::new();
        let person = Table::new("person", vec![Column::new("person_id", "BIGINT")]);
        for site in sites {
            db.seed_table("pedsnet", &format!("{site}_pedsnet"), &person, 5);
        }
        db
    }

    fn create_index(sensitivity: ErrorSensitivity) -> Statement {
        Statement::new(
            DdlAction::CreateIndex(IndexDefinition::on_column(
                "idx_person_id",
                "person",
                "person_id",
            )),
            sensitivity,
        )
    }

    #[tokio::test]
    async fn test_rejects_empty_and_duplicate_targets() {
        let executor = Executor::new(MemorySessionFactory::new(database(&[])));
        let err = executor
            .execute("step", &[], &[], ErrorSensitivity::Normal, ExecutionMode::Parallel)
            .await
            .unwrap_err();
        assert_eq!(err, ExecutorError::NoTargets);

        let err = executor
            .execute(
                "step",
                &[],
                &[target("sitea"), target("sitea")],
                ErrorSensitivity::Normal,
                ExecutionMode::Parallel,
            )
            .await
            .unwrap_err();
        assert_eq!(err, ExecutorError::DuplicateTarget("sitea".to_string()));
    }

    #[tokio::test]
    async fn test_failure_stops_only_that_site() {
        let db = database(&["sitea", "siteb"]);
        db.fail_statements(Some("siteb"), "CREATE INDEX", "XX000");
        let executor = Executor::new(MemorySessionFactory::new(db.clone()));
        let statements = vec![
            create_index(ErrorSensitivity::Normal),
            Statement::new(
                DdlAction::CreateIndex(IndexDefinition::on_column("idx_other", "person", "person_id")),
                ErrorSensitivity::Normal,
            ),
        ];

        let report = executor
            .execute(
                "add_indexes",
                &statements,
                &[target("sitea"), target("siteb")],
                ErrorSensitivity::Normal,
                ExecutionMode::Parallel,
            )
            .await
            .unwrap();

        assert!(report.get("sitea").unwrap().is_success());
        assert_eq!(report.get("sitea").unwrap().applied, 2);
        let b = report.get("siteb").unwrap();
        assert_eq!(b.error_kind(), Some(DbErrorKind::Unclassified));
        assert_eq!(b.applied, 0);
        assert!(db.indexes("pedsnet", "siteb_pedsnet").is_empty());
    }

    #[tokio::test]
    async fn test_sequential_cancels_remaining_sites() {
        let db = database(&["sitea", "siteb", "sitec"]);
        db.refuse_connections("siteb");
        let executor = Executor::new(MemorySessionFactory::new(db));
        let report = executor
            .execute(
                "add_indexes",
                &[create_index(ErrorSensitivity::Force)],
                &[target("sitea"), target("siteb"), target("sitec")],
                ErrorSensitivity::Force,
                ExecutionMode::Sequential,
            )
            .await
            .unwrap();

        assert!(report.get("sitea").unwrap().is_success());
        assert_eq!(report.get("siteb").unwrap().error_kind(), Some(DbErrorKind::Connectivity));
        assert!(report.get("sitec").unwrap().is_cancelled());
    }

    #[tokio::test]
    async fn test_statement_policy_can_tighten_run_policy() {
        let db = database(&["sitea"]);
        let executor = Executor::new(MemorySessionFactory::new(db));
        let statements = vec![
            create_index(ErrorSensitivity::Normal),
            create_index(ErrorSensitivity::Strict),
        ];
        let report = executor
            .execute(
                "add_indexes",
                &statements,
                &[target("sitea")],
                ErrorSensitivity::Force,
                ExecutionMode::Sequential,
            )
            .await
            .unwrap();
        assert_eq!(
            report.get("sitea").unwrap().error_kind(),
            Some(DbErrorKind::AlreadyExists)
        );
    }

    #[tokio::test]
    async fn test_suppressed_errors_are_recorded() {
        let db = database(&["sitea"]);
        let executor = Executor::new(MemorySessionFactory::new(db)).with_max_concurrency(1);
        let statements = vec![
            create_index(ErrorSensitivity::Normal),
            create_index(ErrorSensitivity::Normal),
        ];
        let report = executor
            .execute(
                "add_indexes",
                &statements,
                &[target("sitea")],
                ErrorSensitivity::Normal,
                ExecutionMode::Parallel,
            )
            .await
            .unwrap();
        let a = report.get("sitea").unwrap();
        assert!(a.is_success());
        assert_eq!(a.applied, 1);
        assert_eq!(a.suppressed.len(), 1);
        assert_eq!(a.suppressed[0].code.as_deref(), Some("42P07"));
        assert_eq!(report.suppressed_count(), 1);
    }
}

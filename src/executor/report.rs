//! Per-site results and run reports

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::database::{DatabaseError, DbErrorKind, ErrorSensitivity};

/// A database error that was tolerated and logged instead of surfaced
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SoftFailure {
    pub statement: String,
    pub kind: DbErrorKind,
    pub code: Option<String>,
    pub message: String,
    /// Policy that suppressed it
    pub sensitivity: ErrorSensitivity,
}

impl SoftFailure {
    pub fn new(statement: impl Into<String>, error: DatabaseError, sensitivity: ErrorSensitivity) -> Self {
        Self {
            statement: statement.into(),
            kind: error.kind,
            code: error.code,
            message: error.message,
            sensitivity,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Failed {
        kind: DbErrorKind,
        code: Option<String>,
        message: String,
        /// Statement that failed; `None` when the session could not be opened
        statement: Option<String>,
    },
    /// Never attempted because an earlier site failed in sequential mode
    Cancelled { reason: String },
}

impl Outcome {
    pub fn failed(error: DatabaseError, statement: Option<String>) -> Self {
        Self::Failed {
            kind: error.kind,
            code: error.code,
            message: error.message,
            statement,
        }
    }
}

/// Outcome of one step at one site
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationResult {
    pub site: String,
    pub outcome: Outcome,
    /// Statements that completed without error
    pub applied: usize,
    pub suppressed: Vec<SoftFailure>,
    pub elapsed_ms: u64,
}

impl OperationResult {
    pub fn new(site: impl Into<String>, outcome: Outcome) -> Self {
        Self {
            site: site.into(),
            outcome,
            applied: 0,
            suppressed: Vec::new(),
            elapsed_ms: 0,
        }
    }

    pub fn cancelled(site: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::new(
            site,
            Outcome::Cancelled {
                reason: reason.into(),
            },
        )
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, Outcome::Success)
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.outcome, Outcome::Cancelled { .. })
    }

    pub fn error_kind(&self) -> Option<DbErrorKind> {
        match &self.outcome {
            Outcome::Failed { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    pub fn summary(&self) -> String {
        match &self.outcome {
            Outcome::Success if self.suppressed.is_empty() => {
                format!("{}: success ({} statements)", self.site, self.applied)
            }
            Outcome::Success => format!(
                "{}: success ({} statements, {} tolerated errors)",
                self.site,
                self.applied,
                self.suppressed.len()
            ),
            Outcome::Failed {
                kind,
                message,
                statement,
                ..
            } => match statement {
                Some(statement) => format!("{}: {kind} error at '{statement}': {message}", self.site),
                None => format!("{}: {kind} error: {message}", self.site),
            },
            Outcome::Cancelled { reason } => format!("{}: cancelled ({reason})", self.site),
        }
    }
}

/// Every site's result for one lifecycle step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
    pub step: String,
    pub results: BTreeMap<String, OperationResult>,
    pub elapsed_ms: u64,
}

impl RunReport {
    pub fn new(step: impl Into<String>) -> Self {
        Self {
            step: step.into(),
            results: BTreeMap::new(),
            elapsed_ms: 0,
        }
    }

    pub fn insert(&mut self, result: OperationResult) {
        self.results.insert(result.site.clone(), result);
    }

    pub fn get(&self, site: &str) -> Option<&OperationResult> {
        self.results.get(site)
    }

    pub fn all_failed(&self) -> bool {
        !self.results.is_empty() && self.results.values().all(|r| !r.is_success())
    }

    pub fn all_succeeded(&self) -> bool {
        self.results.values().all(OperationResult::is_success)
    }

    pub fn succeeded_sites(&self) -> Vec<&str> {
        self.results
            .values()
            .filter(|r| r.is_success())
            .map(|r| r.site.as_str())
            .collect()
    }

    pub fn failed_sites(&self) -> Vec<&str> {
        self.results
            .values()
            .filter(|r| !r.is_success())
            .map(|r| r.site.as_str())
            .collect()
    }

    pub fn suppressed_count(&self) -> usize {
        self.results.values().map(|r| r.suppressed.len()).sum()
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failed(site: &str) -> OperationResult {
        OperationResult::new(
            site,
            Outcome::failed(
                DatabaseError::from_sqlstate("42P07", "relation exists"),
                Some("create index".to_string()),
            ),
        )
    }

    #[test]
    fn test_report_queries() {
        let mut report = RunReport::new("add_indexes");
        report.insert(OperationResult::new("siteA", Outcome::Success));
        report.insert(failed("siteB"));
        report.insert(OperationResult::cancelled("siteC", "siteB failed"));

        assert_eq!(report.succeeded_sites(), vec!["siteA"]);
        assert_eq!(report.failed_sites(), vec!["siteB", "siteC"]);
        assert!(!report.all_failed());
        assert_eq!(report.get("siteB").unwrap().error_kind(), Some(DbErrorKind::AlreadyExists));
        assert!(report.get("siteC").unwrap().is_cancelled());
    }

    #[test]
    fn test_all_failed_needs_results() {
        let mut report = RunReport::new("add_indexes");
        assert!(!report.all_failed());
        report.insert(failed("siteA"));
        assert!(report.all_failed());
    }

    #[test]
    fn test_json_shape() {
        let mut report = RunReport::new("add_indexes");
        report.insert(failed("siteA"));
        let json: serde_json::Value = serde_json::from_str(&report.to_json().unwrap()).unwrap();
        assert_eq!(json["results"]["siteA"]["outcome"]["status"], "failed");
        assert_eq!(json["results"]["siteA"]["outcome"]["kind"], "already_exists");
    }
}

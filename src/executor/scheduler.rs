//! Per-site task scheduling
//!
//! Statement plans and derivations share one scheduler. Every site given to
//! [`run_per_site`] appears in the report: a panicked task is recorded as a
//! failed site and sequential mode reports queued sites as cancelled after
//! the first failure.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{Instrument, debug, error, info, info_span};

use super::report::{OperationResult, Outcome, RunReport};
use super::{ExecutionMode, ExecutorError};
use crate::database::DatabaseError;

/// Run `task` once per `(site, work)` pair and collect a report.
///
/// Fails before running anything when `tasks` is empty or names a site twice.
pub async fn run_per_site<T, R, Fut>(
    step: &str,
    tasks: Vec<(String, T)>,
    mode: ExecutionMode,
    max_concurrency: usize,
    task: R,
) -> Result<RunReport, ExecutorError>
where
    T: Send + 'static,
    R: Fn(T) -> Fut,
    Fut: Future<Output = OperationResult> + Send + 'static,
{
    if tasks.is_empty() {
        return Err(ExecutorError::NoTargets);
    }
    let mut seen = BTreeSet::new();
    for (site, _) in &tasks {
        if !seen.insert(site.as_str()) {
            return Err(ExecutorError::DuplicateTarget(site.clone()));
        }
    }

    let start = Instant::now();
    info!(step, sites = tasks.len(), %mode, "Executing step");

    let mut report = match mode {
        ExecutionMode::Sequential => run_sequential(step, tasks, task).await,
        ExecutionMode::Parallel => run_parallel(step, tasks, max_concurrency, task).await,
    };
    report.elapsed_ms = start.elapsed().as_millis() as u64;

    info!(
        step,
        succeeded = report.succeeded_sites().len(),
        failed = report.failed_sites().len(),
        suppressed = report.suppressed_count(),
        elapsed_ms = report.elapsed_ms,
        "Step finished"
    );
    Ok(report)
}

async fn run_sequential<T, R, Fut>(step: &str, tasks: Vec<(String, T)>, task: R) -> RunReport
where
    R: Fn(T) -> Fut,
    Fut: Future<Output = OperationResult>,
{
    let mut report = RunReport::new(step);
    let mut failed_site: Option<String> = None;
    for (site, work) in tasks {
        if let Some(failed) = &failed_site {
            debug!(site = %site, "Cancelling queued site");
            report.insert(OperationResult::cancelled(
                &site,
                format!("site {failed} failed earlier in sequential mode"),
            ));
            continue;
        }
        let span = info_span!("site_task", step, site = %site);
        let result = task(work).instrument(span).await;
        if !result.is_success() {
            failed_site = Some(result.site.clone());
        }
        report.insert(result);
    }
    report
}

async fn run_parallel<T, R, Fut>(
    step: &str,
    tasks: Vec<(String, T)>,
    max_concurrency: usize,
    task: R,
) -> RunReport
where
    R: Fn(T) -> Fut,
    Fut: Future<Output = OperationResult> + Send + 'static,
{
    let semaphore = Arc::new(Semaphore::new(max_concurrency.max(1)));
    let mut sites = Vec::with_capacity(tasks.len());
    let mut join_set = JoinSet::new();

    for (site, work) in tasks {
        let semaphore = Arc::clone(&semaphore);
        let span = info_span!("site_task", step, site = %site);
        let future = task(work);
        join_set.spawn(
            async move {
                // acquire fails only on a closed semaphore
                let _permit = semaphore.acquire_owned().await.ok();
                future.await
            }
            .instrument(span),
        );
        sites.push(site);
    }

    let mut report = RunReport::new(step);
    let mut join_errors = Vec::new();
    while let Some(joined) = join_set.join_next().await {
        match joined {
            Ok(result) => report.insert(result),
            Err(e) => {
                error!(step, error = %e, "Site task panicked");
                join_errors.push(e.to_string());
            }
        }
    }

    for site in sites {
        if report.get(&site).is_none() {
            report.insert(OperationResult::new(
                &site,
                Outcome::failed(
                    DatabaseError::unclassified(format!(
                        "site task terminated before reporting: {}",
                        join_errors.join("; ")
                    )),
                    None,
                ),
            ));
        }
    }
    report
}

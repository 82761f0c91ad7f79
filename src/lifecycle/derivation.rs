//! External derivation steps
//!
//! Domain computations such as BMI z-scores run outside the statement
//! pipeline. The core only invokes them once per site and records the
//! outcome.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;
use tracing::error;

use crate::database::{DatabaseError, SiteTarget};
use crate::executor::{
    ExecutionMode, ExecutorError, OperationResult, Outcome, RunReport, run_per_site,
};

/// An opaque per-site computation
#[async_trait]
pub trait Derivation: Send + Sync + 'static {
    fn name(&self) -> &str;

    async fn run(&self, target: &SiteTarget, version: &str) -> anyhow::Result<()>;
}

async fn run_one(
    derivation: Arc<dyn Derivation>,
    target: SiteTarget,
    version: String,
) -> OperationResult {
    let start = Instant::now();
    let outcome = match derivation.run(&target, &version).await {
        Ok(()) => Outcome::Success,
        Err(e) => {
            error!(site = %target.site, derivation = derivation.name(), error = %format!("{e:#}"), "Derivation failed");
            Outcome::failed(
                DatabaseError::unclassified(format!("{e:#}")),
                Some(derivation.name().to_string()),
            )
        }
    };
    let mut result = OperationResult::new(&target.site, outcome);
    if result.is_success() {
        result.applied = 1;
    }
    result.elapsed_ms = start.elapsed().as_millis() as u64;
    result
}

/// Invoke `derivation` at every target.
///
/// Sequential mode stops at the first failing site and reports the rest as
/// cancelled.
pub async fn run_derivation(
    derivation: Arc<dyn Derivation>,
    targets: Vec<SiteTarget>,
    version: &str,
    mode: ExecutionMode,
    max_concurrency: usize,
) -> Result<RunReport, ExecutorError> {
    let step = derivation_step(derivation.as_ref());
    let version = version.to_string();
    let tasks = targets
        .into_iter()
        .map(|target| (target.site.clone(), target))
        .collect();
    run_per_site(&step, tasks, mode, max_concurrency, move |target| {
        run_one(Arc::clone(&derivation), target, version.clone())
    })
    .await
}

/// Report step name for `derivation`
pub fn derivation_step(derivation: &dyn Derivation) -> String {
    format!("derivation:{}", derivation.name())
}

//! Schema lifecycle orchestrator
//!
//! Fans each lifecycle step out across sites through the [`Executor`] and
//! tracks every (version, site) pair's state. Planning for a step (metadata,
//! transformed selections, definitions, statement order) completes before
//! any statement runs, so configuration errors never leave a site half done.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{Instrument, info, info_span, warn};

use super::derivation::{Derivation, derivation_step, run_derivation};
use super::error::LifecycleError;
use super::pk_move::move_primary_key_statements;
use super::state::{Admission, LifecycleState, LifecycleStep, StateTracker};
use super::steps::{
    Roles, create_database_statements, site_schema_statements, transform_statements,
    undo_constraint_statements, undo_transform_statements, vocabulary_schema_statements,
};
use crate::config::EtlConfig;
use crate::connection::ConnectionInfo;
use crate::database::{ErrorSensitivity, SessionFactory, SiteTarget};
use crate::executor::{ExecutionMode, Executor, OperationResult, Outcome, RunReport, SitePlan};
use crate::model::MetadataProvider;
use crate::models::{Definition, SchemaMetadata};
use crate::naming::{VOCABULARY_SCHEMA, database_name, site_data_schema};
use crate::planner::{TableScope, plan_constraints, plan_dropped_indexes, plan_indexes};
use crate::statements::{Statement, generate_create, generate_drop, generate_index_removal};
use crate::transform::{
    AgeTransform, ConceptNameTransform, IdMappingTransform, SiteNameTransform, TransformContext,
    TransformRegistry,
};

/// Reports of one `run_all` invocation
#[derive(Debug, Clone, Serialize)]
pub struct LifecycleReport {
    pub version: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub reports: Vec<RunReport>,
    /// Step after which the run stopped because every site failed it
    pub halted_at: Option<LifecycleStep>,
}

impl LifecycleReport {
    pub fn completed(&self) -> bool {
        self.halted_at.is_none()
    }

    pub fn report(&self, step: LifecycleStep) -> Option<&RunReport> {
        self.reports.iter().find(|r| r.step == step.name())
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

/// Registry built from configuration: age, concept names, site name and id
/// mapping, in that order
pub fn configured_registry(config: &EtlConfig) -> TransformRegistry {
    TransformRegistry::new(vec![
        AgeTransform::default().into(),
        ConceptNameTransform::default().into(),
        SiteNameTransform::default().into(),
        IdMappingTransform::new(&config.id_name)
            .with_counter_schema(&config.id_counter_schema)
            .into(),
    ])
}

/// Statements of one index or constraint step, split by where they run
struct ScopedStatements {
    data: Option<Vec<Statement>>,
    vocabulary: Option<Vec<Statement>>,
}

/// Everything `run_all` executes, built before the first statement runs
struct ForwardPlan {
    transforms: Vec<(String, Vec<Statement>)>,
    indexes: Vec<Statement>,
    constraints: Vec<Statement>,
}

pub struct SchemaLifecycle<P: MetadataProvider, F: SessionFactory> {
    config: EtlConfig,
    provider: P,
    executor: Executor<F>,
    registry: TransformRegistry,
    /// Server connection; site targets are derived from it
    connection: ConnectionInfo,
    states: StateTracker,
}

impl<P: MetadataProvider, F: SessionFactory> SchemaLifecycle<P, F> {
    pub fn new(config: EtlConfig, provider: P, factory: F, connection: ConnectionInfo) -> Self {
        let executor = Executor::new(factory).with_max_concurrency(config.max_concurrency);
        Self {
            registry: configured_registry(&config),
            config,
            provider,
            executor,
            connection,
            states: StateTracker::new(),
        }
    }

    pub fn with_registry(mut self, registry: TransformRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn config(&self) -> &EtlConfig {
        &self.config
    }

    pub fn registry(&self) -> &TransformRegistry {
        &self.registry
    }

    pub fn executor(&self) -> &Executor<F> {
        &self.executor
    }

    pub fn states(&self) -> &StateTracker {
        &self.states
    }

    pub fn state(&self, version: &str, site: &str) -> Option<LifecycleState> {
        self.states.get(version, site)
    }

    /// Record states established outside this orchestrator
    pub fn assume_state(&mut self, version: &str, sites: &[String], state: LifecycleState) {
        for site in sites {
            self.states.set(version, site, state);
        }
    }

    fn roles(&self) -> Roles {
        Roles {
            owner: self.config.owner_role.clone(),
            staff: self.config.staff_role.clone(),
        }
    }

    fn site_schema(&self, site: &str) -> String {
        site_data_schema(site, &self.config.model_name)
    }

    /// Connection to the version database with the site's data schema first
    /// on the search path
    pub fn site_target(&self, database: &str, site: &str) -> SiteTarget {
        let connection = self
            .connection
            .clone()
            .with_database(database)
            .with_search_path(&[self.site_schema(site), VOCABULARY_SCHEMA.to_string()]);
        SiteTarget::new(site, connection)
    }

    async fn metadata(&self, version: &str) -> Result<SchemaMetadata, LifecycleError> {
        let metadata = self
            .provider
            .load_metadata(&self.config.model_name, version)
            .await?;
        Ok(metadata.with_vocabulary(&self.config.vocabulary_tables))
    }

    fn check_sites(step: LifecycleStep, sites: &[String]) -> Result<(), LifecycleError> {
        if sites.is_empty() {
            return Err(LifecycleError::NoSites {
                step: step.name().to_string(),
            });
        }
        Ok(())
    }

    fn index_definitions(
        &self,
        metadata: &SchemaMetadata,
        version: &str,
        scope: TableScope,
    ) -> Result<Vec<Definition>, LifecycleError> {
        Ok(plan_indexes(metadata, version, &self.registry, scope)?
            .into_iter()
            .map(Definition::from)
            .collect())
    }

    /// Creates the planned indexes, then removes retired ones
    fn index_statements(
        &self,
        metadata: &SchemaMetadata,
        version: &str,
        scope: TableScope,
        sensitivity: ErrorSensitivity,
    ) -> Result<Vec<Statement>, LifecycleError> {
        let mut statements =
            generate_create(&self.index_definitions(metadata, version, scope)?, sensitivity)?;
        let retired = plan_dropped_indexes(metadata, version, &self.registry, scope)?;
        statements.extend(generate_index_removal(&retired, sensitivity));
        Ok(statements)
    }

    fn constraint_definitions(
        &self,
        metadata: &SchemaMetadata,
        version: &str,
        scope: TableScope,
    ) -> Result<Vec<Definition>, LifecycleError> {
        Ok(plan_constraints(metadata, version, &self.registry, scope)?
            .into_iter()
            .map(Definition::from)
            .collect())
    }

    fn transform_plans(
        &self,
        metadata: &SchemaMetadata,
        version: &str,
        sites: &[String],
        sensitivity: ErrorSensitivity,
    ) -> Result<Vec<(String, Vec<Statement>)>, LifecycleError> {
        sites
            .iter()
            .map(|site| {
                let ctx = TransformContext::new(site, version);
                let statements = transform_statements(
                    &ctx,
                    metadata,
                    &self.registry,
                    &self.site_schema(site),
                    &self.config.owner_role,
                    sensitivity,
                )?;
                Ok((site.clone(), statements))
            })
            .collect()
    }

    /// Run admitted sites' statements and advance the ones that succeeded.
    ///
    /// Sites whose known state is too early for `step` are reported as
    /// cancelled; sites that already took a non-repeatable step are
    /// reported as successful no-ops.
    async fn execute_step(
        &mut self,
        version: &str,
        step: LifecycleStep,
        site_statements: Vec<(String, Vec<Statement>)>,
        sensitivity: ErrorSensitivity,
        mode: ExecutionMode,
    ) -> Result<RunReport, LifecycleError> {
        let database = database_name(&self.config.database_prefix, version)?;
        let mut plans = Vec::new();
        let mut skipped = Vec::new();
        for (site, statements) in site_statements {
            match self.states.admit(version, &site, step) {
                Admission::Run => {
                    plans.push(SitePlan::new(self.site_target(&database, &site), statements));
                }
                Admission::AlreadyDone => {
                    info!(site = %site, step = step.name(), "Step already applied, skipping");
                    skipped.push(OperationResult::new(&site, Outcome::Success));
                }
                Admission::Refused { state } => {
                    warn!(site = %site, step = step.name(), %state, "Site not ready for step");
                    skipped.push(OperationResult::cancelled(
                        &site,
                        format!("site is {state}, {step} needs {}", step.requires()),
                    ));
                }
            }
        }

        let mut report = if plans.is_empty() {
            RunReport::new(step.name())
        } else {
            let span = info_span!("lifecycle_step", step = step.name(), version);
            self.executor
                .execute_plans(step.name(), plans, sensitivity, mode)
                .instrument(span)
                .await?
        };
        for result in skipped {
            report.insert(result);
        }
        for site in report.succeeded_sites() {
            self.states.advance(version, site, step);
        }
        Ok(report)
    }

    /// Create the version database, then every site's schemas and the
    /// vocabulary schema with their grants. `update` skips the database
    /// creation for an existing database.
    ///
    /// Returns the report of each step run; schemas are not attempted when
    /// the database step failed.
    pub async fn run_prepdb(
        &mut self,
        version: &str,
        sites: &[String],
        update: bool,
    ) -> Result<Vec<RunReport>, LifecycleError> {
        Self::check_sites(LifecycleStep::CreateSchemas, sites)?;
        let database = database_name(&self.config.database_prefix, version)?;
        let roles = self.roles();
        let sensitivity = self.config.sensitivity;
        let kind = self.config.database_kind;
        info!(version, database = %database, %kind, update, "Preparing database");

        let server = SiteTarget::new(&database, self.connection.clone());
        let create = create_database_statements(&database, &roles, update, sensitivity);
        let created = self
            .executor
            .execute_plans(
                LifecycleStep::CreateDatabase.name(),
                vec![SitePlan::new(server, create)],
                sensitivity,
                ExecutionMode::Sequential,
            )
            .instrument(info_span!("lifecycle_step", step = "create_database", version))
            .await?;
        if created.all_failed() {
            warn!(database = %database, "Database step failed, not creating schemas");
            return Ok(vec![created]);
        }
        for site in sites {
            self.states.advance(version, site, LifecycleStep::CreateDatabase);
        }

        let in_database = self.connection.clone().with_database(&database);
        let mut plans = vec![SitePlan::new(
            SiteTarget::new(VOCABULARY_SCHEMA, in_database.clone()),
            vocabulary_schema_statements(kind, &roles, sensitivity),
        )];
        let mut skipped = Vec::new();
        for site in sites {
            match self.states.admit(version, site, LifecycleStep::CreateSchemas) {
                Admission::Refused { state } => skipped.push(OperationResult::cancelled(
                    site,
                    format!("site is {state}, create_schemas needs database_created"),
                )),
                _ => plans.push(SitePlan::new(
                    SiteTarget::new(site, in_database.clone()),
                    site_schema_statements(site, kind, &roles, sensitivity),
                )),
            }
        }
        let mut schemas = self
            .executor
            .execute_plans(
                LifecycleStep::CreateSchemas.name(),
                plans,
                sensitivity,
                self.config.execution_mode(),
            )
            .instrument(info_span!("lifecycle_step", step = "create_schemas", version))
            .await?;
        for result in skipped {
            schemas.insert(result);
        }
        for site in sites {
            if schemas.get(site).is_some_and(OperationResult::is_success) {
                self.states.advance(version, site, LifecycleStep::CreateSchemas);
            }
        }
        Ok(vec![created, schemas])
    }

    /// Rebuild each site's data tables through the transform registry
    pub async fn run_transform(
        &mut self,
        version: &str,
        sites: &[String],
        sensitivity: ErrorSensitivity,
        mode: ExecutionMode,
    ) -> Result<RunReport, LifecycleError> {
        Self::check_sites(LifecycleStep::Transform, sites)?;
        let metadata = self.metadata(version).await?;
        let plans = self.transform_plans(&metadata, version, sites, sensitivity)?;
        self.execute_step(version, LifecycleStep::Transform, plans, sensitivity, mode)
            .await
    }

    /// Create the same ordered statements at every site
    async fn run_uniform(
        &mut self,
        version: &str,
        sites: &[String],
        step: LifecycleStep,
        statements: Vec<Statement>,
        sensitivity: ErrorSensitivity,
        mode: ExecutionMode,
    ) -> Result<RunReport, LifecycleError> {
        let plans = sites
            .iter()
            .map(|site| (site.clone(), statements.clone()))
            .collect();
        self.execute_step(version, step, plans, sensitivity, mode).await
    }

    /// Statements for the data and vocabulary halves of the configured scope
    fn scoped_statements(
        &self,
        statements_for: impl Fn(TableScope) -> Result<Vec<Statement>, LifecycleError>,
    ) -> Result<ScopedStatements, LifecycleError> {
        let scope = self.config.table_scope;
        Ok(ScopedStatements {
            data: scope
                .covers_data()
                .then(|| statements_for(TableScope::Data))
                .transpose()?,
            vocabulary: scope
                .covers_vocabulary()
                .then(|| statements_for(TableScope::Vocabulary))
                .transpose()?,
        })
    }

    /// Data statements run at every site; vocabulary statements run once in
    /// the shared vocabulary schema, reported under that schema's name
    async fn run_scoped(
        &mut self,
        version: &str,
        sites: &[String],
        step: LifecycleStep,
        statements: ScopedStatements,
        sensitivity: ErrorSensitivity,
        mode: ExecutionMode,
    ) -> Result<RunReport, LifecycleError> {
        let mut report = match statements.data {
            Some(data) => {
                self.run_uniform(version, sites, step, data, sensitivity, mode)
                    .await?
            }
            None => RunReport::new(step.name()),
        };
        if let Some(vocabulary) = statements.vocabulary {
            let database = database_name(&self.config.database_prefix, version)?;
            let connection = self
                .connection
                .clone()
                .with_database(&database)
                .with_search_path(&[VOCABULARY_SCHEMA.to_string()]);
            let plan = SitePlan::new(SiteTarget::new(VOCABULARY_SCHEMA, connection), vocabulary);
            let span = info_span!("lifecycle_step", step = step.name(), version, scope = "vocabulary");
            let vocabulary_report = self
                .executor
                .execute_plans(step.name(), vec![plan], sensitivity, ExecutionMode::Sequential)
                .instrument(span)
                .await?;
            for result in vocabulary_report.results.into_values() {
                report.insert(result);
            }
        }
        Ok(report)
    }

    fn check_scoped_sites(&self, step: LifecycleStep, sites: &[String]) -> Result<(), LifecycleError> {
        if self.config.table_scope.covers_data() {
            Self::check_sites(step, sites)?;
        }
        Ok(())
    }

    /// Create planned indexes for the configured table scope
    pub async fn run_add_indexes(
        &mut self,
        version: &str,
        sites: &[String],
        sensitivity: ErrorSensitivity,
        mode: ExecutionMode,
    ) -> Result<RunReport, LifecycleError> {
        let step = LifecycleStep::AddIndexes;
        self.check_scoped_sites(step, sites)?;
        let metadata = self.metadata(version).await?;
        let statements = self.scoped_statements(|scope| {
            self.index_statements(&metadata, version, scope, sensitivity)
        })?;
        self.run_scoped(version, sites, step, statements, sensitivity, mode)
            .await
    }

    pub async fn run_undo_indexes(
        &mut self,
        version: &str,
        sites: &[String],
        sensitivity: ErrorSensitivity,
        mode: ExecutionMode,
    ) -> Result<RunReport, LifecycleError> {
        let step = LifecycleStep::UndoIndexes;
        self.check_scoped_sites(step, sites)?;
        let metadata = self.metadata(version).await?;
        let statements = self.scoped_statements(|scope| {
            Ok(generate_drop(&self.index_definitions(&metadata, version, scope)?, sensitivity)?)
        })?;
        self.run_scoped(version, sites, step, statements, sensitivity, mode)
            .await
    }

    /// Add planned keys and NOT NULL constraints for the configured table scope
    pub async fn run_add_constraints(
        &mut self,
        version: &str,
        sites: &[String],
        sensitivity: ErrorSensitivity,
        mode: ExecutionMode,
    ) -> Result<RunReport, LifecycleError> {
        let step = LifecycleStep::AddConstraints;
        self.check_scoped_sites(step, sites)?;
        let metadata = self.metadata(version).await?;
        let statements = self.scoped_statements(|scope| {
            Ok(generate_create(
                &self.constraint_definitions(&metadata, version, scope)?,
                sensitivity,
            )?)
        })?;
        self.run_scoped(version, sites, step, statements, sensitivity, mode)
            .await
    }

    pub async fn run_undo_constraints(
        &mut self,
        version: &str,
        sites: &[String],
        sensitivity: ErrorSensitivity,
        mode: ExecutionMode,
    ) -> Result<RunReport, LifecycleError> {
        let step = LifecycleStep::UndoConstraints;
        self.check_scoped_sites(step, sites)?;
        let metadata = self.metadata(version).await?;
        let statements = self.scoped_statements(|scope| {
            let definitions = self.constraint_definitions(&metadata, version, scope)?;
            Ok(undo_constraint_statements(&metadata, &definitions, sensitivity)?)
        })?;
        self.run_scoped(version, sites, step, statements, sensitivity, mode)
            .await
    }

    /// Put stock tables back in place of transformed ones.
    ///
    /// Sites known to have indexes or constraints get them dropped first;
    /// otherwise dropping the transformed tables with CASCADE removes them.
    pub async fn run_undo_transforms(
        &mut self,
        version: &str,
        sites: &[String],
        sensitivity: ErrorSensitivity,
        mode: ExecutionMode,
    ) -> Result<RunReport, LifecycleError> {
        Self::check_sites(LifecycleStep::UndoTransform, sites)?;
        let metadata = self.metadata(version).await?;
        let constraint_drops = undo_constraint_statements(
            &metadata,
            &self.constraint_definitions(&metadata, version, TableScope::Data)?,
            sensitivity,
        )?;
        let index_drops = generate_drop(
            &self.index_definitions(&metadata, version, TableScope::Data)?,
            sensitivity,
        )?;

        let plans = sites
            .iter()
            .map(|site| {
                let mut statements = Vec::new();
                let state = self.states.get(version, site);
                if state >= Some(LifecycleState::ConstraintsAdded) {
                    statements.extend(constraint_drops.iter().cloned());
                }
                if state >= Some(LifecycleState::IndexesAdded) {
                    statements.extend(index_drops.iter().cloned());
                }
                statements.extend(undo_transform_statements(
                    &metadata,
                    &self.site_schema(site),
                    &self.config.owner_role,
                    sensitivity,
                ));
                (site.clone(), statements)
            })
            .collect();
        self.execute_step(version, LifecycleStep::UndoTransform, plans, sensitivity, mode)
            .await
    }

    /// Move primary keys onto `update_tmp_<table>` replacements using the
    /// configured policy
    pub async fn run_move_primary_keys(
        &mut self,
        version: &str,
        sites: &[String],
        sensitivity: ErrorSensitivity,
        mode: ExecutionMode,
    ) -> Result<RunReport, LifecycleError> {
        Self::check_sites(LifecycleStep::MovePrimaryKeys, sites)?;
        let metadata = self.metadata(version).await?;
        let policy = self.config.primary_key_move;
        info!(version, %policy, "Moving primary keys");
        let statements = move_primary_key_statements(&metadata, policy, sensitivity);
        self.run_uniform(
            version,
            sites,
            LifecycleStep::MovePrimaryKeys,
            statements,
            sensitivity,
            mode,
        )
        .await
    }

    /// Invoke an external derivation once per ready site
    pub async fn run_derivation(
        &mut self,
        version: &str,
        sites: &[String],
        derivation: Arc<dyn Derivation>,
        mode: ExecutionMode,
    ) -> Result<RunReport, LifecycleError> {
        Self::check_sites(LifecycleStep::Derivation, sites)?;
        let database = database_name(&self.config.database_prefix, version)?;
        let mut targets = Vec::new();
        let mut refused = Vec::new();
        for site in sites {
            match self.states.admit(version, site, LifecycleStep::Derivation) {
                Admission::Refused { state } => refused.push(OperationResult::cancelled(
                    site,
                    format!("site is {state}, derivations need transformed"),
                )),
                _ => targets.push(self.site_target(&database, site)),
            }
        }
        let mut report = if targets.is_empty() {
            RunReport::new(&derivation_step(derivation.as_ref()))
        } else {
            run_derivation(derivation, targets, version, mode, self.config.max_concurrency)
                .await?
        };
        for result in refused {
            report.insert(result);
        }
        Ok(report)
    }

    fn plan_forward(
        &self,
        metadata: &SchemaMetadata,
        version: &str,
        sites: &[String],
    ) -> Result<ForwardPlan, LifecycleError> {
        let sensitivity = self.config.sensitivity;
        Ok(ForwardPlan {
            transforms: self.transform_plans(metadata, version, sites, sensitivity)?,
            indexes: self.index_statements(metadata, version, TableScope::Data, sensitivity)?,
            constraints: generate_create(
                &self.constraint_definitions(metadata, version, TableScope::Data)?,
                sensitivity,
            )?,
        })
    }

    /// Prepare, transform, index and constrain `sites` with the configured
    /// sensitivity and mode.
    ///
    /// Every step is planned first. A step every site fails halts the run;
    /// sites that failed an earlier step are cancelled in later ones.
    pub async fn run_all(
        &mut self,
        version: &str,
        sites: &[String],
    ) -> Result<LifecycleReport, LifecycleError> {
        Self::check_sites(LifecycleStep::CreateDatabase, sites)?;
        let started_at = Utc::now();
        let metadata = self.metadata(version).await?;
        let plan = self.plan_forward(&metadata, version, sites)?;
        let sensitivity = self.config.sensitivity;
        let mode = self.config.execution_mode();
        info!(
            version,
            sites = sites.len(),
            %sensitivity,
            %mode,
            "Starting lifecycle run"
        );

        let mut reports = self.run_prepdb(version, sites, false).await?;
        let mut halted_at = reports
            .iter()
            .find(|r| r.all_failed())
            .and_then(|r| r.step.parse::<LifecycleStep>().ok());

        if halted_at.is_none() {
            let steps = [
                (LifecycleStep::Transform, None),
                (LifecycleStep::AddIndexes, Some(plan.indexes)),
                (LifecycleStep::AddConstraints, Some(plan.constraints)),
            ];
            let mut transforms = Some(plan.transforms);
            for (step, uniform) in steps {
                let site_statements = match uniform {
                    Some(statements) => sites
                        .iter()
                        .map(|site| (site.clone(), statements.clone()))
                        .collect(),
                    None => transforms.take().unwrap_or_default(),
                };
                let report = self
                    .execute_step(version, step, site_statements, sensitivity, mode)
                    .await?;
                let failed = report.all_failed();
                reports.push(report);
                if failed {
                    warn!(version, step = step.name(), "Every site failed, halting");
                    halted_at = Some(step);
                    break;
                }
            }
        }

        let report = LifecycleReport {
            version: version.to_string(),
            started_at,
            finished_at: Utc::now(),
            reports,
            halted_at,
        };
        info!(
            version,
            steps = report.reports.len(),
            completed = report.completed(),
            "Lifecycle run finished"
        );
        Ok(report)
    }
}

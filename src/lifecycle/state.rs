//! Lifecycle states and steps
//!
//! Each (version, site) pair moves forward through
//! `Uninitialized -> DatabaseCreated -> SchemaCreated -> Transformed ->
//! IndexesAdded -> ConstraintsAdded` and back down through the undo steps.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    #[default]
    Uninitialized,
    DatabaseCreated,
    SchemaCreated,
    Transformed,
    IndexesAdded,
    ConstraintsAdded,
}

impl LifecycleState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::DatabaseCreated => "database_created",
            Self::SchemaCreated => "schema_created",
            Self::Transformed => "transformed",
            Self::IndexesAdded => "indexes_added",
            Self::ConstraintsAdded => "constraints_added",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One orchestrated step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleStep {
    CreateDatabase,
    CreateSchemas,
    Transform,
    AddIndexes,
    AddConstraints,
    UndoConstraints,
    UndoIndexes,
    UndoTransform,
    MovePrimaryKeys,
    Derivation,
}

impl LifecycleStep {
    /// Forward steps in execution order
    pub fn forward() -> Vec<Self> {
        vec![
            Self::CreateDatabase,
            Self::CreateSchemas,
            Self::Transform,
            Self::AddIndexes,
            Self::AddConstraints,
        ]
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::CreateDatabase => "create_database",
            Self::CreateSchemas => "create_schemas",
            Self::Transform => "transform",
            Self::AddIndexes => "add_indexes",
            Self::AddConstraints => "add_constraints",
            Self::UndoConstraints => "undo_constraints",
            Self::UndoIndexes => "undo_indexes",
            Self::UndoTransform => "undo_transform",
            Self::MovePrimaryKeys => "move_primary_keys",
            Self::Derivation => "derivation",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::CreateDatabase => "Create the version database",
            Self::CreateSchemas => "Create site and vocabulary schemas",
            Self::Transform => "Rebuild site tables through the transforms",
            Self::AddIndexes => "Add stock and transform indexes",
            Self::AddConstraints => "Add stock and transform constraints",
            Self::UndoConstraints => "Drop planned constraints",
            Self::UndoIndexes => "Drop planned indexes",
            Self::UndoTransform => "Restore stock tables from the backup schema",
            Self::MovePrimaryKeys => "Move primary keys onto replacement tables",
            Self::Derivation => "Run an external derivation",
        }
    }

    /// Lowest state a site must be in for this step to run
    pub fn requires(&self) -> LifecycleState {
        match self {
            Self::CreateDatabase => LifecycleState::Uninitialized,
            Self::CreateSchemas => LifecycleState::DatabaseCreated,
            Self::Transform | Self::MovePrimaryKeys => LifecycleState::SchemaCreated,
            Self::AddIndexes | Self::UndoIndexes | Self::UndoTransform | Self::Derivation => {
                LifecycleState::Transformed
            }
            Self::AddConstraints => LifecycleState::IndexesAdded,
            Self::UndoConstraints => LifecycleState::ConstraintsAdded,
        }
    }

    /// State of a site after this step succeeded there
    pub fn next_state(&self, current: LifecycleState) -> LifecycleState {
        match self {
            Self::CreateDatabase => current.max(LifecycleState::DatabaseCreated),
            Self::CreateSchemas => current.max(LifecycleState::SchemaCreated),
            Self::Transform => current.max(LifecycleState::Transformed),
            Self::AddIndexes => current.max(LifecycleState::IndexesAdded),
            Self::AddConstraints => current.max(LifecycleState::ConstraintsAdded),
            Self::UndoConstraints => current.min(LifecycleState::IndexesAdded),
            Self::UndoIndexes => current.min(LifecycleState::Transformed),
            Self::UndoTransform => current.min(LifecycleState::SchemaCreated),
            Self::MovePrimaryKeys | Self::Derivation => current,
        }
    }
}

impl fmt::Display for LifecycleStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for LifecycleStep {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "create_database" => Ok(Self::CreateDatabase),
            "create_schemas" => Ok(Self::CreateSchemas),
            "transform" => Ok(Self::Transform),
            "add_indexes" => Ok(Self::AddIndexes),
            "add_constraints" => Ok(Self::AddConstraints),
            "undo_constraints" => Ok(Self::UndoConstraints),
            "undo_indexes" => Ok(Self::UndoIndexes),
            "undo_transform" => Ok(Self::UndoTransform),
            "move_primary_keys" => Ok(Self::MovePrimaryKeys),
            "derivation" => Ok(Self::Derivation),
            _ => Err(format!("Unknown lifecycle step: {s}")),
        }
    }
}

/// Whether a site may take a step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Run,
    /// The step's effect is already in place
    AlreadyDone,
    Refused { state: LifecycleState },
}

/// Known states of (version, site) pairs.
///
/// A pair never seen is admitted to any step, since the database may have
/// been prepared by an earlier process.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateTracker {
    states: BTreeMap<String, BTreeMap<String, LifecycleState>>,
}

impl StateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, version: &str, site: &str) -> Option<LifecycleState> {
        self.states.get(version).and_then(|s| s.get(site)).copied()
    }

    pub fn set(&mut self, version: &str, site: &str, state: LifecycleState) {
        self.states
            .entry(version.to_string())
            .or_default()
            .insert(site.to_string(), state);
    }

    pub fn admit(&self, version: &str, site: &str, step: LifecycleStep) -> Admission {
        let Some(state) = self.get(version, site) else {
            return Admission::Run;
        };
        if state < step.requires() {
            return Admission::Refused { state };
        }
        // Transforming twice would stack the rewrite on transformed tables
        if step == LifecycleStep::Transform && state >= LifecycleState::Transformed {
            return Admission::AlreadyDone;
        }
        Admission::Run
    }

    /// Record a success of `step` at `site`
    pub fn advance(&mut self, version: &str, site: &str, step: LifecycleStep) -> LifecycleState {
        let current = self.get(version, site).unwrap_or_default();
        let next = step.next_state(current);
        self.set(version, site, next);
        next
    }
}

//! ETL configuration

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::database::ErrorSensitivity;
use crate::executor::{DEFAULT_MAX_CONCURRENCY, ExecutionMode};
use crate::lifecycle::PrimaryKeyMove;
use crate::model::VOCABULARY_TABLES;
use crate::naming::DatabaseKind;
use crate::planner::TableScope;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error with {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Could not parse configuration: {0}")]
    Parse(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl ConfigError {
    /// Get a user-friendly error message for CLI output
    pub fn user_message(&self) -> String {
        match self {
            Self::Io { path, .. } => format!(
                "{self}\n\nHint: Check that {} exists and is readable.",
                path.display()
            ),
            Self::Parse(_) => format!("{self}\n\nHint: The configuration file must be TOML."),
            Self::Invalid(_) => self.to_string(),
        }
    }
}

/// Main ETL configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EtlConfig {
    /// Data model name, used for metadata lookup and site schema names
    pub model_name: String,
    /// Prefix of per-version database names
    pub database_prefix: String,
    /// Role owning created databases and schemas
    pub owner_role: String,
    /// Role granted create on new databases
    pub staff_role: String,
    /// Sites to operate on
    pub sites: Vec<String>,
    pub vocabulary_tables: Vec<String>,
    pub sensitivity: ErrorSensitivity,
    /// Run sites concurrently
    pub parallel: bool,
    pub max_concurrency: usize,
    pub database_kind: DatabaseKind,
    /// Prefix of the mapped id column
    pub id_name: String,
    /// Schema shared by every site holding the last-id counters
    pub id_counter_schema: String,
    /// Tables the index and constraint steps cover
    pub table_scope: TableScope,
    pub primary_key_move: PrimaryKeyMove,
    /// Root of `<model>/<version>.{json,yaml}` metadata documents
    pub metadata_dir: PathBuf,
}

impl Default for EtlConfig {
    fn default() -> Self {
        Self {
            model_name: "pedsnet".to_string(),
            database_prefix: "pedsnet_dcc_v".to_string(),
            owner_role: "dcc_owner".to_string(),
            staff_role: "peds_staff".to_string(),
            sites: Vec::new(),
            vocabulary_tables: VOCABULARY_TABLES.iter().map(|t| t.to_string()).collect(),
            sensitivity: ErrorSensitivity::Normal,
            parallel: true,
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            database_kind: DatabaseKind::Internal,
            id_name: "dcc".to_string(),
            id_counter_schema: "public".to_string(),
            table_scope: TableScope::Data,
            primary_key_move: PrimaryKeyMove::default(),
            metadata_dir: PathBuf::from("metadata"),
        }
    }
}

impl EtlConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: Self =
            toml::from_str(contents).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        Self::from_toml_str(&contents)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn with_model_name(mut self, name: impl Into<String>) -> Self {
        self.model_name = name.into();
        self
    }

    /// Set sites from a comma-separated list, ignoring blanks
    pub fn with_site_list(mut self, sites: &str) -> Self {
        self.sites = parse_site_list(sites);
        self
    }

    pub fn with_sites(mut self, sites: Vec<String>) -> Self {
        self.sites = sites;
        self
    }

    pub fn with_sensitivity(mut self, sensitivity: ErrorSensitivity) -> Self {
        self.sensitivity = sensitivity;
        self
    }

    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max;
        self
    }

    pub fn with_database_kind(mut self, kind: DatabaseKind) -> Self {
        self.database_kind = kind;
        self
    }

    pub fn with_primary_key_move(mut self, policy: PrimaryKeyMove) -> Self {
        self.primary_key_move = policy;
        self
    }

    pub fn with_table_scope(mut self, scope: TableScope) -> Self {
        self.table_scope = scope;
        self
    }

    pub fn with_metadata_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.metadata_dir = path.into();
        self
    }

    pub fn execution_mode(&self) -> ExecutionMode {
        ExecutionMode::from(self.parallel)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.model_name.trim().is_empty() {
            return Err(ConfigError::Invalid("model_name must not be empty".to_string()));
        }
        if self.max_concurrency == 0 {
            return Err(ConfigError::Invalid(
                "max_concurrency must be at least 1".to_string(),
            ));
        }
        if self.id_name.trim().is_empty() {
            return Err(ConfigError::Invalid("id_name must not be empty".to_string()));
        }
        if self.id_counter_schema.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "id_counter_schema must not be empty".to_string(),
            ));
        }
        let mut seen = BTreeSet::new();
        for site in &self.sites {
            if site.trim().is_empty() {
                return Err(ConfigError::Invalid("site names must not be empty".to_string()));
            }
            if !seen.insert(site.as_str()) {
                return Err(ConfigError::Invalid(format!("site {site} is listed twice")));
            }
        }
        Ok(())
    }
}

/// Split a comma-separated site list
pub fn parse_site_list(sites: &str) -> Vec<String> {
    sites
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

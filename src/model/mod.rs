//! Metadata providers
//!
//! Supply the stock [`SchemaMetadata`] for a data model version. Loading is
//! expected to be deterministic per (model, version).

pub mod loader;

pub use loader::FileMetadataProvider;

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use thiserror::Error;

use crate::models::SchemaMetadata;

/// Tables shared by every site and never transformed
pub const VOCABULARY_TABLES: &[&str] = &[
    "vocabulary",
    "concept",
    "concept_ancestor",
    "concept_class",
    "concept_relationship",
    "concept_synonym",
    "domain",
    "drug_strength",
    "relationship",
    "source_to_concept_map",
];

#[derive(Error, Debug)]
pub enum MetadataError {
    #[error("No metadata for {model} version {version}")]
    NotFound { model: String, version: String },

    #[error("IO error with {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Could not parse {path}: {message}")]
    Parse { path: PathBuf, message: String },

    /// The document loaded but describes something inconsistent
    #[error("Invalid metadata for {model} version {version}: {message}")]
    Invalid {
        model: String,
        version: String,
        message: String,
    },
}

impl MetadataError {
    pub fn invalid(model: &str, version: &str, message: impl Into<String>) -> Self {
        Self::Invalid {
            model: model.to_string(),
            version: version.to_string(),
            message: message.into(),
        }
    }

    /// Get a user-friendly error message for CLI output
    pub fn user_message(&self) -> String {
        match self {
            Self::NotFound { model, version } => format!(
                "{self}\n\nHint: Expected a {model}/{version}.json or .yaml document in the metadata directory."
            ),
            Self::Io { .. } => format!("{self}\n\nHint: Check the metadata directory permissions."),
            Self::Parse { .. } | Self::Invalid { .. } => self.to_string(),
        }
    }
}

/// Source of stock metadata
#[async_trait]
pub trait MetadataProvider: Send + Sync {
    async fn load_metadata(
        &self,
        model_name: &str,
        version: &str,
    ) -> Result<SchemaMetadata, MetadataError>;
}

/// Structural checks every provider applies before handing metadata out
pub fn check_metadata(
    metadata: &SchemaMetadata,
    model_name: &str,
    version: &str,
) -> Result<(), MetadataError> {
    if metadata.model_name != model_name || metadata.version != version {
        return Err(MetadataError::invalid(
            model_name,
            version,
            format!(
                "document declares {} version {}",
                metadata.model_name, metadata.version
            ),
        ));
    }
    let mut names = BTreeSet::new();
    for table in &metadata.tables {
        if !names.insert(table.name.as_str()) {
            return Err(MetadataError::invalid(
                model_name,
                version,
                format!("table {} is declared twice", table.name),
            ));
        }
        let key_columns = table
            .primary_key
            .iter()
            .chain(table.unique_keys.iter())
            .flat_map(|k| k.columns.iter())
            .chain(table.foreign_keys.iter().flat_map(|fk| fk.columns.iter()));
        for column in key_columns {
            if !table.has_column(column) {
                return Err(MetadataError::invalid(
                    model_name,
                    version,
                    format!("key column {}.{column} is not declared", table.name),
                ));
            }
        }
    }
    Ok(())
}

/// Metadata held in memory, keyed by (model, version)
#[derive(Debug, Clone, Default)]
pub struct InMemoryMetadataProvider {
    documents: BTreeMap<(String, String), SchemaMetadata>,
}

impl InMemoryMetadataProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_metadata(mut self, metadata: SchemaMetadata) -> Self {
        self.documents.insert(
            (metadata.model_name.clone(), metadata.version.clone()),
            metadata,
        );
        self
    }
}

#[async_trait]
impl MetadataProvider for InMemoryMetadataProvider {
    async fn load_metadata(
        &self,
        model_name: &str,
        version: &str,
    ) -> Result<SchemaMetadata, MetadataError> {
        let metadata = self
            .documents
            .get(&(model_name.to_string(), version.to_string()))
            .cloned()
            .ok_or_else(|| MetadataError::NotFound {
                model: model_name.to_string(),
                version: version.to_string(),
            })?;
        check_metadata(&metadata, model_name, version)?;
        Ok(metadata)
    }
}

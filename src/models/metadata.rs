//! Structural description of one data-model version

use super::table::Table;
use serde::{Deserialize, Serialize};

/// Immutable schema description for a (model, version) pair.
///
/// Built once per operation by a metadata provider and only read afterwards;
/// transforms receive per-site information through a `TransformContext`
/// rather than by annotating this value.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaMetadata {
    pub model_name: String,
    pub version: String,
    #[serde(default)]
    pub tables: Vec<Table>,
}

impl SchemaMetadata {
    pub fn new(model_name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            model_name: model_name.into(),
            version: version.into(),
            tables: Vec::new(),
        }
    }

    pub fn with_table(mut self, table: Table) -> Self {
        self.tables.push(table);
        self
    }

    pub fn table(&self, name: &str) -> Option<&Table> {
        self.tables.iter().find(|t| t.name == name)
    }

    pub fn contains_table(&self, name: &str) -> bool {
        self.table(name).is_some()
    }

    pub fn is_vocabulary(&self, name: &str) -> bool {
        self.table(name).is_some_and(|t| t.vocabulary)
    }

    /// Site data tables, in declaration order
    pub fn data_tables(&self) -> impl Iterator<Item = &Table> {
        self.tables.iter().filter(|t| !t.vocabulary)
    }

    pub fn vocabulary_tables(&self) -> impl Iterator<Item = &Table> {
        self.tables.iter().filter(|t| t.vocabulary)
    }

    /// Returns a copy with the named tables flagged as vocabulary tables
    pub fn with_vocabulary<S: AsRef<str>>(mut self, names: &[S]) -> Self {
        for table in &mut self.tables {
            if names.iter().any(|n| n.as_ref() == table.name) {
                table.vocabulary = true;
            }
        }
        self
    }
}

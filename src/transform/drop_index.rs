//! Retired indexes
//!
//! Names indexes that should no longer exist once tables are transformed.
//! They are left out of index plans and removed by the index step. Unlike
//! the other transforms this one also covers vocabulary tables.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::{TableTransform, TransformContext, TransformError, require_table};
use crate::models::{ConstraintDefinition, IndexDefinition, SchemaMetadata, Select, Table};

const DEFAULT_DROPS: &[(&str, &[(&str, &str)])] = &[
    ("adt_occurrence", &[("next_adt_occurrence_id", "idx_adt_next_id")]),
    ("concept", &[("domain_id", "idx_concept_domain_id")]),
    (
        "fact_relationship",
        &[
            ("domain_concept_id_1", "idx_fact_relationship_id_1"),
            ("domain_concept_id_2", "idx_fact_relationship_id_2"),
        ],
    ),
    ("procedure_occurrence", &[("provider_id", "idx_procedure_provider_id")]),
];

/// One retired single-column index
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetiredIndex {
    pub column: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DropIndexTransform {
    pub indexes_by_table: BTreeMap<String, Vec<RetiredIndex>>,
}

impl Default for DropIndexTransform {
    fn default() -> Self {
        let indexes_by_table = DEFAULT_DROPS
            .iter()
            .map(|(table, indexes)| {
                let retired = indexes
                    .iter()
                    .map(|(column, name)| RetiredIndex {
                        column: column.to_string(),
                        name: name.to_string(),
                    })
                    .collect();
                (table.to_string(), retired)
            })
            .collect();
        Self { indexes_by_table }
    }
}

impl DropIndexTransform {
    pub fn new(indexes_by_table: BTreeMap<String, Vec<RetiredIndex>>) -> Self {
        Self { indexes_by_table }
    }

    pub fn retire(
        mut self,
        table: impl Into<String>,
        column: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        self.indexes_by_table
            .entry(table.into())
            .or_default()
            .push(RetiredIndex {
                column: column.into(),
                name: name.into(),
            });
        self
    }
}

impl TableTransform for DropIndexTransform {
    fn name(&self) -> &'static str {
        "drop_index"
    }

    fn modify_select(
        &self,
        _ctx: &TransformContext,
        metadata: &SchemaMetadata,
        table_name: &str,
        select: &Select,
    ) -> Result<Select, TransformError> {
        require_table(metadata, table_name)?;
        Ok(select.clone())
    }

    fn new_indexes(&self, _table: &Table) -> Vec<IndexDefinition> {
        Vec::new()
    }

    fn new_constraints(&self, _table: &Table) -> Vec<ConstraintDefinition> {
        Vec::new()
    }

    /// Columns the table does not have are skipped
    fn dropped_indexes(&self, table: &Table) -> Vec<IndexDefinition> {
        let Some(retired) = self.indexes_by_table.get(&table.name) else {
            return Vec::new();
        };
        retired
            .iter()
            .filter(|r| table.has_column(&r.column))
            .map(|r| IndexDefinition::on_column(&r.name, &table.name, &r.column))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Column;

    #[test]
    fn test_defaults_cover_data_and_vocabulary_tables() {
        let transform = DropIndexTransform::default();
        let concept = Table::new(
            "concept",
            vec![Column::new("concept_id", "INTEGER"), Column::new("domain_id", "VARCHAR(20)")],
        );
        let dropped = transform.dropped_indexes(&concept);
        assert_eq!(dropped.len(), 1);
        assert_eq!(dropped[0].name, "idx_concept_domain_id");
        assert_eq!(dropped[0].columns, vec!["domain_id"]);

        let procedure = Table::new("procedure_occurrence", vec![Column::new("provider_id", "BIGINT")]);
        assert_eq!(
            transform.dropped_indexes(&procedure)[0].name,
            "idx_procedure_provider_id"
        );
    }

    #[test]
    fn test_missing_columns_are_skipped() {
        let fact = Table::new("fact_relationship", vec![Column::new("domain_concept_id_1", "INTEGER")]);
        let names: Vec<String> = DropIndexTransform::default()
            .dropped_indexes(&fact)
            .into_iter()
            .map(|i| i.name)
            .collect();
        assert_eq!(names, vec!["idx_fact_relationship_id_1"]);
    }
}

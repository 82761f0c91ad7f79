//! Extra query indexes
//!
//! Leaves the selection alone and contributes single-column indexes on
//! commonly filtered columns.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::{TableTransform, TransformContext, TransformError, require_table};
use crate::models::{ConstraintDefinition, IndexDefinition, SchemaMetadata, Select, Table};
use crate::naming::index_name;

const DEFAULT_COLUMNS: &[(&str, &[&str])] = &[
    ("adt_occurrence", &["person_id", "adt_date"]),
    ("care_site", &["place_of_service_concept_id", "specialty_concept_id"]),
    ("condition_occurrence", &["condition_start_date", "condition_type_concept_id"]),
    ("device_exposure", &["device_type_concept_id", "device_exposure_start_date"]),
    ("drug_exposure", &["drug_type_concept_id", "drug_exposure_start_date"]),
    ("fact_relationship", &["fact_id_1", "fact_id_2"]),
    ("location", &["zip", "state"]),
    (
        "measurement",
        &[
            "measurement_date",
            "measurement_type_concept_id",
            "value_as_concept_id",
            "value_as_number",
        ],
    ),
    (
        "measurement_organism",
        &["organism_concept_id", "person_id", "visit_occurrence_id", "measurement_id"],
    ),
    (
        "observation_period",
        &["observation_period_start_date", "observation_period_end_date"],
    ),
    (
        "person",
        &["birth_datetime", "ethnicity_concept_id", "race_concept_id", "gender_concept_id"],
    ),
    ("procedure_occurrence", &["procedure_date"]),
    ("provider", &["specialty_concept_id"]),
    ("visit_occurrence", &["care_site_id", "provider_id", "visit_start_date"]),
    ("visit_payer", &["plan_type"]),
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddIndexTransform {
    /// Columns to index, by table
    pub columns_by_table: BTreeMap<String, Vec<String>>,
}

impl Default for AddIndexTransform {
    fn default() -> Self {
        let columns_by_table = DEFAULT_COLUMNS
            .iter()
            .map(|(table, columns)| {
                (
                    table.to_string(),
                    columns.iter().map(|c| c.to_string()).collect(),
                )
            })
            .collect();
        Self { columns_by_table }
    }
}

impl AddIndexTransform {
    pub fn new(columns_by_table: BTreeMap<String, Vec<String>>) -> Self {
        Self { columns_by_table }
    }
}

impl TableTransform for AddIndexTransform {
    fn name(&self) -> &'static str {
        "add_index"
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

    /// Columns the table does not have are skipped, so one configuration
    /// serves several data model versions
    fn new_indexes(&self, table: &Table) -> Vec<IndexDefinition> {
        let Some(columns) = self.columns_by_table.get(&table.name) else {
            return Vec::new();
        };
        columns
            .iter()
            .filter(|c| table.has_column(c))
            .map(|c| IndexDefinition::on_column(index_name(&table.name, c), &table.name, c))
            .collect()
    }

    fn new_constraints(&self, _table: &Table) -> Vec<ConstraintDefinition> {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Column;

    #[test]
    fn test_indexes_existing_configured_columns() {
        let person = Table::new(
            "person",
            vec![
                Column::new("person_id", "BIGINT"),
                Column::new("gender_concept_id", "INTEGER"),
                Column::new("race_concept_id", "INTEGER"),
            ],
        );
        let indexes = AddIndexTransform::default().new_indexes(&person);
        let columns: Vec<&str> = indexes.iter().map(|i| i.columns[0].as_str()).collect();
        assert_eq!(columns, vec!["race_concept_id", "gender_concept_id"]);
        assert!(indexes.iter().all(|i| i.name.len() <= crate::naming::INDEX_NAME_LIMIT));
    }

    #[test]
    fn test_unconfigured_table() {
        let table = Table::new("specimen", vec![Column::new("specimen_id", "BIGINT")]);
        assert!(AddIndexTransform::default().new_indexes(&table).is_empty());
    }
}

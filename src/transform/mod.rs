//! Table transforms
//!
//! A transform rewrites the selection that produces a table and declares the
//! indexes and constraints the rewritten table needs. Transforms are pure:
//! they never touch a database. Anything that must exist before the rewritten
//! selection can run (mapping tables, SQL functions) is returned as
//! pre-transform statements for the caller to execute.
//!
//! The set of variants is closed ([`Transform`]); each variant implements the
//! shared [`TableTransform`] capability.

pub mod add_index;
pub mod age;
pub mod concept_name;
pub mod context;
pub mod drop_index;
pub mod error;
pub mod id_mapping;
pub mod registry;
pub mod site_name;

pub use add_index::AddIndexTransform;
pub use age::{AgeAnchor, AgeColumn, AgeTransform};
pub use concept_name::ConceptNameTransform;
pub use context::TransformContext;
pub use drop_index::{DropIndexTransform, RetiredIndex};
pub use error::TransformError;
pub use id_mapping::IdMappingTransform;
pub use registry::TransformRegistry;
pub use site_name::SiteNameTransform;

use serde::{Deserialize, Serialize};

use crate::database::ErrorSensitivity;
use crate::models::{ConstraintDefinition, IndexDefinition, SchemaMetadata, Select, Table};
use crate::statements::Statement;

/// Capabilities every transform variant provides
pub trait TableTransform {
    fn name(&self) -> &'static str;

    /// Returns a rewritten copy of `select`, which reads `table_name`.
    ///
    /// Fails with [`TransformError::UnknownTable`] when `metadata` does not
    /// declare `table_name`.
    fn modify_select(
        &self,
        ctx: &TransformContext,
        metadata: &SchemaMetadata,
        table_name: &str,
        select: &Select,
    ) -> Result<Select, TransformError>;

    /// Indexes the rewritten `table` needs. Every definition targets `table`.
    fn new_indexes(&self, table: &Table) -> Vec<IndexDefinition>;

    /// Constraints the rewritten `table` needs. Every definition targets `table`.
    fn new_constraints(&self, table: &Table) -> Vec<ConstraintDefinition>;

    /// Indexes on `table` that must not exist after the transform
    fn dropped_indexes(&self, _table: &Table) -> Vec<IndexDefinition> {
        Vec::new()
    }

    /// Statements to run once per site before any rewritten selection
    fn pre_transform(
        &self,
        _metadata: &SchemaMetadata,
        _sensitivity: ErrorSensitivity,
    ) -> Vec<Statement> {
        Vec::new()
    }
}

pub(crate) fn require_table<'a>(
    metadata: &'a SchemaMetadata,
    table_name: &str,
) -> Result<&'a Table, TransformError> {
    metadata
        .table(table_name)
        .ok_or_else(|| TransformError::UnknownTable(table_name.to_string()))
}

/// A configured transform
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Transform {
    IdMapping(IdMappingTransform),
    ConceptName(ConceptNameTransform),
    Age(AgeTransform),
    SiteName(SiteNameTransform),
    AddIndex(AddIndexTransform),
    DropIndex(DropIndexTransform),
}

impl Transform {
    fn inner(&self) -> &dyn TableTransform {
        match self {
            Self::IdMapping(t) => t,
            Self::ConceptName(t) => t,
            Self::Age(t) => t,
            Self::SiteName(t) => t,
            Self::AddIndex(t) => t,
            Self::DropIndex(t) => t,
        }
    }
}

impl TableTransform for Transform {
    fn name(&self) -> &'static str {
        self.inner().name()
    }

    fn modify_select(
        &self,
        ctx: &TransformContext,
        metadata: &SchemaMetadata,
        table_name: &str,
        select: &Select,
    ) -> Result<Select, TransformError> {
        self.inner().modify_select(ctx, metadata, table_name, select)
    }

    fn new_indexes(&self, table: &Table) -> Vec<IndexDefinition> {
        self.inner().new_indexes(table)
    }

    fn new_constraints(&self, table: &Table) -> Vec<ConstraintDefinition> {
        self.inner().new_constraints(table)
    }

    fn dropped_indexes(&self, table: &Table) -> Vec<IndexDefinition> {
        self.inner().dropped_indexes(table)
    }

    fn pre_transform(
        &self,
        metadata: &SchemaMetadata,
        sensitivity: ErrorSensitivity,
    ) -> Vec<Statement> {
        self.inner().pre_transform(metadata, sensitivity)
    }
}

impl From<IdMappingTransform> for Transform {
    fn from(t: IdMappingTransform) -> Self {
        Self::IdMapping(t)
    }
}

impl From<ConceptNameTransform> for Transform {
    fn from(t: ConceptNameTransform) -> Self {
        Self::ConceptName(t)
    }
}

impl From<AgeTransform> for Transform {
    fn from(t: AgeTransform) -> Self {
        Self::Age(t)
    }
}

impl From<SiteNameTransform> for Transform {
    fn from(t: SiteNameTransform) -> Self {
        Self::SiteName(t)
    }
}

impl From<AddIndexTransform> for Transform {
    fn from(t: AddIndexTransform) -> Self {
        Self::AddIndex(t)
    }
}

impl From<DropIndexTransform> for Transform {
    fn from(t: DropIndexTransform) -> Self {
        Self::DropIndex(t)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Column, ForeignKey};

    fn metadata() -> SchemaMetadata {
        SchemaMetadata::new("pedsnet", "2.3.0")
            .with_table(
                Table::new(
                    "person",
                    vec![
                        Column::new("person_id", "BIGINT").not_null(),
                        Column::new("gender_concept_id", "INTEGER"),
                        Column::new("birth_datetime", "TIMESTAMP"),
                    ],
                )
                .with_primary_key("xpk_person", vec!["person_id".to_string()]),
            )
            .with_table(
                Table::new(
                    "visit_occurrence",
                    vec![
                        Column::new("visit_occurrence_id", "BIGINT").not_null(),
                        Column::new("person_id", "BIGINT").not_null(),
                        Column::new("visit_start_datetime", "TIMESTAMP").not_null(),
                    ],
                )
                .with_primary_key("xpk_visit", vec!["visit_occurrence_id".to_string()])
                .with_foreign_key(ForeignKey::single(
                    "fpk_visit_person",
                    "person_id",
                    "person",
                    "person_id",
                )),
            )
            .with_table(Table::new(
                "concept",
                vec![
                    Column::new("concept_id", "INTEGER").not_null(),
                    Column::new("concept_name", "VARCHAR(255)"),
                ],
            ))
            .with_vocabulary(&["concept"])
    }

    fn all_variants() -> Vec<Transform> {
        vec![
            IdMappingTransform::default().into(),
            ConceptNameTransform::default().into(),
            AgeTransform::default().into(),
            SiteNameTransform::default().into(),
            AddIndexTransform::default().into(),
            DropIndexTransform::default().into(),
        ]
    }

    #[test]
    fn test_contributions_target_their_table() {
        let md = metadata();
        for transform in all_variants() {
            for table in &md.tables {
                for index in transform.new_indexes(table) {
                    assert_eq!(index.table, table.name, "{} index", transform.name());
                }
                for constraint in transform.new_constraints(table) {
                    assert_eq!(constraint.table, table.name, "{} constraint", transform.name());
                }
            }
        }
    }

    #[test]
    fn test_unknown_table_for_every_variant() {
        let md = metadata();
        let stock = Select::stock(md.table("person").unwrap(), None);
        let ctx = TransformContext::new("siteA", "2.3.0");
        for transform in all_variants() {
            let err = transform
                .modify_select(&ctx, &md, "no_such_table", &stock)
                .unwrap_err();
            assert_eq!(err, TransformError::UnknownTable("no_such_table".to_string()));
        }
    }

    #[test]
    fn test_modify_select_leaves_input_untouched() {
        let md = metadata();
        let stock = Select::stock(md.table("visit_occurrence").unwrap(), Some("sitea_pedsnet"));
        let before = stock.clone();
        let ctx = TransformContext::new("siteA", "2.3.0");
        for transform in all_variants() {
            transform
                .modify_select(&ctx, &md, "visit_occurrence", &stock)
                .unwrap();
        }
        assert_eq!(stock, before);
    }

    #[test]
    fn test_serde_tagged_variants() {
        let json = serde_json::to_string(&Transform::from(SiteNameTransform::default())).unwrap();
        assert_eq!(json, r#"{"kind":"site_name","column":"site"}"#);
        let parsed: Transform = serde_json::from_str(r#"{"kind":"site_name"}"#).unwrap();
        assert_eq!(parsed.name(), "site_name");
    }
}

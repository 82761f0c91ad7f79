//! Index and constraint planning
//!
//! Combines the stock definitions declared by the metadata with what each
//! transform contributes. Structurally identical definitions collapse into
//! one; a name defined two different ways is a [`PlanningError::Conflict`].

pub mod error;

pub use error::PlanningError;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Display;
use tracing::debug;

use crate::models::{ConstraintDefinition, Definition, IndexDefinition, SchemaMetadata, Table};
use crate::transform::TransformRegistry;

/// Which tables a plan covers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TableScope {
    /// Site data tables, with transform contributions
    #[default]
    Data,
    /// Vocabulary tables, stock definitions only
    Vocabulary,
    All,
}

impl TableScope {
    fn includes(&self, table: &Table) -> bool {
        match self {
            Self::Data => !table.vocabulary,
            Self::Vocabulary => table.vocabulary,
            Self::All => true,
        }
    }

    pub fn covers_data(&self) -> bool {
        matches!(self, Self::Data | Self::All)
    }

    pub fn covers_vocabulary(&self) -> bool {
        matches!(self, Self::Vocabulary | Self::All)
    }
}

/// Definitions keyed by name, keeping first-seen order
struct Deduplicated<T> {
    items: Vec<T>,
    positions: BTreeMap<String, usize>,
}

impl<T: PartialEq + Display> Deduplicated<T> {
    fn new() -> Self {
        Self {
            items: Vec::new(),
            positions: BTreeMap::new(),
        }
    }

    fn push(&mut self, name: &str, item: T) -> Result<(), PlanningError> {
        match self.positions.get(name) {
            Some(&pos) if self.items[pos] == item => {
                debug!(name, "Dropping duplicate definition");
                Ok(())
            }
            Some(&pos) => Err(PlanningError::conflict(name, &self.items[pos], &item)),
            None => {
                self.positions.insert(name.to_string(), self.items.len());
                self.items.push(item);
                Ok(())
            }
        }
    }
}

fn check_version(metadata: &SchemaMetadata, version: &str) -> Result<(), PlanningError> {
    if metadata.version != version {
        return Err(PlanningError::VersionMismatch {
            expected: version.to_string(),
            found: metadata.version.clone(),
        });
    }
    Ok(())
}

/// Indexes `table` needs: its stock indexes then transform contributions,
/// minus any index a transform retires
pub fn table_indexes(table: &Table, transforms: &TransformRegistry) -> Vec<IndexDefinition> {
    let mut indexes = table.indexes.clone();
    if !table.vocabulary {
        indexes.extend(transforms.new_indexes(table));
    }
    let dropped = transforms.dropped_indexes(table);
    indexes.retain(|i| dropped.iter().all(|d| d.name != i.name));
    indexes
}

/// Constraints `table` needs: its declared constraints then transform
/// contributions
pub fn table_constraints(
    table: &Table,
    transforms: &TransformRegistry,
) -> Vec<ConstraintDefinition> {
    let mut constraints = table.declared_constraints();
    if !table.vocabulary {
        constraints.extend(transforms.new_constraints(table));
    }
    constraints
}

pub fn plan_indexes(
    metadata: &SchemaMetadata,
    version: &str,
    transforms: &TransformRegistry,
    scope: TableScope,
) -> Result<Vec<IndexDefinition>, PlanningError> {
    check_version(metadata, version)?;
    let mut planned = Deduplicated::new();
    for table in metadata.tables.iter().filter(|t| scope.includes(t)) {
        for index in table_indexes(table, transforms) {
            planned.push(&index.name.clone(), index)?;
        }
    }
    debug!(version, count = planned.items.len(), ?scope, "Planned indexes");
    Ok(planned.items)
}

/// Retired indexes on the tables in `scope`, for removal
pub fn plan_dropped_indexes(
    metadata: &SchemaMetadata,
    version: &str,
    transforms: &TransformRegistry,
    scope: TableScope,
) -> Result<Vec<IndexDefinition>, PlanningError> {
    check_version(metadata, version)?;
    let mut planned = Deduplicated::new();
    for table in metadata.tables.iter().filter(|t| scope.includes(t)) {
        for index in transforms.dropped_indexes(table) {
            planned.push(&index.name.clone(), index)?;
        }
    }
    debug!(version, count = planned.items.len(), ?scope, "Planned index removals");
    Ok(planned.items)
}

pub fn plan_constraints(
    metadata: &SchemaMetadata,
    version: &str,
    transforms: &TransformRegistry,
    scope: TableScope,
) -> Result<Vec<ConstraintDefinition>, PlanningError> {
    check_version(metadata, version)?;
    let mut planned = Deduplicated::new();
    for table in metadata.tables.iter().filter(|t| scope.includes(t)) {
        for constraint in table_constraints(table, transforms) {
            if let Some((referred, _)) = constraint.reference()
                && !metadata.contains_table(referred)
            {
                return Err(PlanningError::UnresolvedReference {
                    constraint: constraint.name.clone(),
                    table: referred.to_string(),
                });
            }
            planned.push(&constraint.name.clone(), constraint)?;
        }
    }
    debug!(version, count = planned.items.len(), ?scope, "Planned constraints");
    Ok(planned.items)
}

/// Both plans as generator input, indexes first
pub fn plan_definitions(
    metadata: &SchemaMetadata,
    version: &str,
    transforms: &TransformRegistry,
    scope: TableScope,
) -> Result<Vec<Definition>, PlanningError> {
    let mut definitions: Vec<Definition> = plan_indexes(metadata, version, transforms, scope)?
        .into_iter()
        .map(Definition::from)
        .collect();
    definitions.extend(
        plan_constraints(metadata, version, transforms, scope)?
            .into_iter()
            .map(Definition::from),
    );
    Ok(definitions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Column, ForeignKey};
    use crate::naming::index_name;
    use crate::transform::{AddIndexTransform, DropIndexTransform, SiteNameTransform};

    fn metadata() -> SchemaMetadata {
        SchemaMetadata::new("pedsnet", "2.3.0")
            .with_table(
                Table::new(
                    "person",
                    vec![
                        Column::new("person_id", "BIGINT").not_null(),
                        Column::new("site", "VARCHAR(32)").not_null(),
                    ],
                )
                .with_primary_key("xpk_person", vec!["person_id".to_string()])
                .with_index(IndexDefinition::on_column(
                    index_name("person", "site"),
                    "person",
                    "site",
                )),
            )
            .with_table(
                Table::new(
                    "visit_occurrence",
                    vec![
                        Column::new("visit_occurrence_id", "BIGINT").not_null(),
                        Column::new("person_id", "BIGINT").not_null(),
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
            .with_table(
                Table::new("concept", vec![Column::new("concept_id", "INTEGER").not_null()])
                    .with_primary_key("xpk_concept", vec!["concept_id".to_string()]),
            )
            .with_vocabulary(&["concept"])
    }

    #[test]
    fn test_identical_contribution_is_merged() {
        let md = metadata();
        let registry = TransformRegistry::new(vec![SiteNameTransform::default().into()]);
        let indexes = plan_indexes(&md, "2.3.0", &registry, TableScope::Data).unwrap();

        let person_site: Vec<_> = indexes
            .iter()
            .filter(|i| i.table == "person" && i.columns == vec!["site"])
            .collect();
        assert_eq!(person_site.len(), 1);
        assert!(indexes.iter().any(|i| i.table == "visit_occurrence"));
        assert!(indexes.iter().all(|i| i.table != "concept"));

        let constraints = plan_constraints(&md, "2.3.0", &registry, TableScope::Data).unwrap();
        let site_not_null = constraints
            .iter()
            .filter(|c| c.name == "person_site_not_null")
            .count();
        assert_eq!(site_not_null, 1);
    }

    #[test]
    fn test_conflicting_contribution() {
        let mut md = metadata();
        // stock index squatting on the name the contribution generates
        let squatter =
            IndexDefinition::on_column(index_name("person", "person_id"), "person", "site");
        md.tables[0].indexes.push(squatter);

        let mut columns = BTreeMap::new();
        columns.insert("person".to_string(), vec!["person_id".to_string()]);
        let registry = TransformRegistry::new(vec![AddIndexTransform::new(columns).into()]);
        let err = plan_indexes(&md, "2.3.0", &registry, TableScope::Data).unwrap_err();
        assert!(matches!(err, PlanningError::Conflict { .. }));
    }

    #[test]
    fn test_scope_and_version() {
        let md = metadata();
        let registry = TransformRegistry::standard();
        let vocab = plan_constraints(&md, "2.3.0", &registry, TableScope::Vocabulary).unwrap();
        assert!(vocab.iter().all(|c| c.table == "concept"));
        assert!(vocab.iter().any(|c| c.name == "xpk_concept"));

        let err = plan_indexes(&md, "2.4.0", &registry, TableScope::All).unwrap_err();
        assert!(matches!(err, PlanningError::VersionMismatch { .. }));
    }

    #[test]
    fn test_retired_index_is_planned_for_removal_only() {
        let md = metadata();
        let retired = index_name("person", "site");
        let registry = TransformRegistry::new(vec![
            SiteNameTransform::default().into(),
            DropIndexTransform::new(BTreeMap::new())
                .retire("person", "site", &retired)
                .into(),
        ]);
        let indexes = plan_indexes(&md, "2.3.0", &registry, TableScope::Data).unwrap();
        assert!(indexes.iter().all(|i| i.name != retired));

        let dropped = plan_dropped_indexes(&md, "2.3.0", &registry, TableScope::Data).unwrap();
        assert_eq!(dropped.len(), 1);
        assert_eq!(dropped[0].name, retired);
        assert!(
            plan_dropped_indexes(&md, "2.3.0", &registry, TableScope::Vocabulary)
                .unwrap()
                .is_empty()
        );
    }

    #[test]
    fn test_unresolved_reference() {
        let md = SchemaMetadata::new("pedsnet", "2.3.0").with_table(
            Table::new("visit_occurrence", vec![Column::new("person_id", "BIGINT")])
                .with_foreign_key(ForeignKey::single("fk_person", "person_id", "person", "person_id")),
        );
        let err = plan_constraints(&md, "2.3.0", &TransformRegistry::default(), TableScope::All)
            .unwrap_err();
        assert_eq!(
            err,
            PlanningError::UnresolvedReference {
                constraint: "fk_person".to_string(),
                table: "person".to_string()
            }
        );
    }
}

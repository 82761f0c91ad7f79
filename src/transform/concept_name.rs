//! Concept name substitution

use serde::{Deserialize, Serialize};

use super::{TableTransform, TransformContext, TransformError, require_table};
use crate::models::{
    ConstraintDefinition, Expr, IndexDefinition, Join, JoinKind, SchemaMetadata, Select,
    SelectItem, Table, TableRef,
};
use crate::naming::VOCABULARY_SCHEMA;

const CONCEPT_ID_SUFFIX: &str = "_concept_id";

/// For every selected `*_concept_id` column, adds the matching
/// `*_concept_name` looked up in `concept`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConceptNameTransform {
    /// Schema holding `concept`; `None` resolves through the search path
    #[serde(default)]
    pub concept_schema: Option<String>,
}

impl Default for ConceptNameTransform {
    fn default() -> Self {
        Self {
            concept_schema: Some(VOCABULARY_SCHEMA.to_string()),
        }
    }
}

impl ConceptNameTransform {
    pub fn new(concept_schema: Option<String>) -> Self {
        Self { concept_schema }
    }
}

impl TableTransform for ConceptNameTransform {
    fn name(&self) -> &'static str {
        "concept_name"
    }

    fn modify_select(
        &self,
        _ctx: &TransformContext,
        metadata: &SchemaMetadata,
        table_name: &str,
        select: &Select,
    ) -> Result<Select, TransformError> {
        require_table(metadata, table_name)?;
        let concept = require_table(metadata, "concept")?;
        for column in ["concept_id", "concept_name"] {
            if !concept.has_column(column) {
                return Err(TransformError::unknown_column("concept", column));
            }
        }

        let concept_items: Vec<(String, Expr)> = select
            .items
            .iter()
            .filter_map(|item| {
                let name = item.output_name()?;
                let stem = name.strip_suffix(CONCEPT_ID_SUFFIX)?;
                Some((stem.to_string(), item.expr.clone()))
            })
            .collect();

        let mut result = select.clone();
        for (stem, id_expr) in concept_items {
            let alias = format!("{stem}_concept");
            let target = format!("{stem}_concept_name");
            if result.has_join_alias(&alias) {
                continue;
            }
            let mut concept_ref = TableRef::new("concept").aliased(&alias);
            if let Some(schema) = &self.concept_schema {
                concept_ref = concept_ref.in_schema(schema);
            }
            result = result
                .with_join(Join::new(
                    JoinKind::LeftOuter,
                    concept_ref,
                    Expr::column(&alias, "concept_id"),
                    id_expr,
                ))
                .with_replaced_item(
                    &target,
                    SelectItem::aliased(Expr::column(&alias, "concept_name"), &target),
                );
        }
        Ok(result)
    }

    fn new_indexes(&self, _table: &Table) -> Vec<IndexDefinition> {
        Vec::new()
    }

    fn new_constraints(&self, _table: &Table) -> Vec<ConstraintDefinition> {
        Vec::new()
    }
}

//! Ordered set of transforms applied together

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{
    AgeTransform, ConceptNameTransform, IdMappingTransform, SiteNameTransform, TableTransform,
    Transform, TransformContext, TransformError, require_table,
};
use crate::database::ErrorSensitivity;
use crate::models::{ConstraintDefinition, IndexDefinition, SchemaMetadata, Select, Table};
use crate::statements::Statement;

/// Transforms in application order.
///
/// Each transform sees the selection produced by the ones before it.
/// Index and constraint contributions are concatenated in the same order;
/// duplicates are left for the planner to resolve.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransformRegistry {
    pub transforms: Vec<Transform>,
}

impl TransformRegistry {
    pub fn new(transforms: Vec<Transform>) -> Self {
        Self { transforms }
    }

    /// Age, concept name, site name, then id mapping
    pub fn standard() -> Self {
        Self::new(vec![
            AgeTransform::default().into(),
            ConceptNameTransform::default().into(),
            SiteNameTransform::default().into(),
            IdMappingTransform::default().into(),
        ])
    }

    pub fn with(mut self, transform: impl Into<Transform>) -> Self {
        self.transforms.push(transform.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.transforms.is_empty()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.transforms.iter().map(|t| t.name()).collect()
    }

    /// Selection producing the transformed `table_name`, reading the stock
    /// table from `schema`. Vocabulary tables come back untransformed.
    pub fn transformed_select(
        &self,
        ctx: &TransformContext,
        metadata: &SchemaMetadata,
        table_name: &str,
        schema: Option<&str>,
    ) -> Result<Select, TransformError> {
        let table = require_table(metadata, table_name)?;
        let mut select = Select::stock(table, schema);
        if table.vocabulary {
            return Ok(select);
        }
        for transform in &self.transforms {
            select = transform.modify_select(ctx, metadata, table_name, &select)?;
        }
        debug!(
            table = table_name,
            site = %ctx.site,
            transforms = ?self.names(),
            "Built transformed selection"
        );
        Ok(select)
    }

    pub fn new_indexes(&self, table: &Table) -> Vec<IndexDefinition> {
        self.transforms
            .iter()
            .flat_map(|t| t.new_indexes(table))
            .collect()
    }

    pub fn new_constraints(&self, table: &Table) -> Vec<ConstraintDefinition> {
        self.transforms
            .iter()
            .flat_map(|t| t.new_constraints(table))
            .collect()
    }

    /// Retired indexes of `table`, vocabulary tables included
    pub fn dropped_indexes(&self, table: &Table) -> Vec<IndexDefinition> {
        self.transforms
            .iter()
            .flat_map(|t| t.dropped_indexes(table))
            .collect()
    }

    pub fn pre_transform(
        &self,
        metadata: &SchemaMetadata,
        sensitivity: ErrorSensitivity,
    ) -> Vec<Statement> {
        self.transforms
            .iter()
            .flat_map(|t| t.pre_transform(metadata, sensitivity))
            .collect()
    }
}

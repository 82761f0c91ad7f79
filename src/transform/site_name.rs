//! Site name injection

use serde::{Deserialize, Serialize};

use super::{TableTransform, TransformContext, TransformError, require_table};
use crate::models::{
    ConstraintDefinition, Expr, IndexDefinition, SchemaMetadata, Select, SelectItem, Table,
};
use crate::naming::index_name;

pub const SITE_COLUMN: &str = "site";

/// Adds a literal column holding the context's site name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteNameTransform {
    #[serde(default = "default_column")]
    pub column: String,
}

fn default_column() -> String {
    SITE_COLUMN.to_string()
}

impl Default for SiteNameTransform {
    fn default() -> Self {
        Self {
            column: default_column(),
        }
    }
}

impl TableTransform for SiteNameTransform {
    fn name(&self) -> &'static str {
        "site_name"
    }

    fn modify_select(
        &self,
        ctx: &TransformContext,
        metadata: &SchemaMetadata,
        table_name: &str,
        select: &Select,
    ) -> Result<Select, TransformError> {
        require_table(metadata, table_name)?;
        if !ctx.has_site() {
            return Err(TransformError::MissingContext(
                "site name is required to tag rows".to_string(),
            ));
        }
        let literal = Expr::text(&ctx.site).cast("varchar(32)");
        Ok(select
            .clone()
            .with_replaced_item(&self.column, SelectItem::aliased(literal, &self.column)))
    }

    fn new_indexes(&self, table: &Table) -> Vec<IndexDefinition> {
        if table.vocabulary {
            return Vec::new();
        }
        vec![IndexDefinition::on_column(
            index_name(&table.name, &self.column),
            &table.name,
            &self.column,
        )]
    }

    fn new_constraints(&self, table: &Table) -> Vec<ConstraintDefinition> {
        if table.vocabulary {
            return Vec::new();
        }
        vec![ConstraintDefinition::not_null(&table.name, &self.column)]
    }
}

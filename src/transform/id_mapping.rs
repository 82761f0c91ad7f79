//! Identifier mapping
//!
//! Site primary keys are replaced by warehouse-wide ids kept in one map
//! table per data table (`<table>_ids`, columns `site_id` and
//! `<id_name>_id`). The site's own value survives as `site_id`. Foreign keys
//! into other data tables are rewritten through the referenced table's map;
//! foreign keys into vocabulary tables are left alone since vocabulary ids
//! are shared by every site.
//!
//! New warehouse ids are drawn from one counter table per data table
//! (`<id_name>_<table>_id`, a single `last_id` row) in a schema every site
//! shares. Each site reserves a whole range by advancing the counter in the
//! statement that fills its map, so concurrent sites get disjoint ranges.

use serde::{Deserialize, Serialize};

use super::{TableTransform, TransformContext, TransformError, require_table};
use crate::database::ErrorSensitivity;
use crate::models::{
    ConstraintDefinition, Expr, IndexDefinition, Join, JoinKind, SchemaMetadata, Select,
    SelectItem, Table, TableRef,
};
use crate::naming::{id_map_table, index_name};
use crate::statements::{DdlAction, Statement, quote_identifier};

pub const SITE_ID_COLUMN: &str = "site_id";

fn default_counter_schema() -> String {
    "public".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdMappingTransform {
    /// Prefix of the mapped id column, `dcc` giving `dcc_id`
    pub id_name: String,
    /// Type site keys are compared as when joining a map
    pub site_id_type: String,
    /// Schema holding the map tables; `None` reads them next to the data
    #[serde(default)]
    pub map_schema: Option<String>,
    /// Schema shared by every site holding the last-id counters
    #[serde(default = "default_counter_schema")]
    pub counter_schema: String,
}

impl Default for IdMappingTransform {
    fn default() -> Self {
        Self {
            id_name: "dcc".to_string(),
            site_id_type: "BIGINT".to_string(),
            map_schema: None,
            counter_schema: default_counter_schema(),
        }
    }
}

impl IdMappingTransform {
    pub fn new(id_name: impl Into<String>) -> Self {
        Self {
            id_name: id_name.into(),
            ..Self::default()
        }
    }

    pub fn with_map_schema(mut self, schema: impl Into<String>) -> Self {
        self.map_schema = Some(schema.into());
        self
    }

    pub fn with_counter_schema(mut self, schema: impl Into<String>) -> Self {
        self.counter_schema = schema.into();
        self
    }

    /// Counter table holding the last warehouse id handed out for `table`
    pub fn counter_table(&self, table: &str) -> String {
        format!("{}_{table}_id", self.id_name)
    }

    /// Column of a map table holding the warehouse id
    pub fn mapped_column(&self) -> String {
        format!("{}_id", self.id_name)
    }

    fn map_ref(&self, table: &str, alias: &str, select: &Select) -> TableRef {
        let map = TableRef::new(id_map_table(table)).aliased(alias);
        match self.map_schema.as_ref().or(select.from.schema.as_ref()) {
            Some(schema) => map.in_schema(schema),
            None => map,
        }
    }

    fn map_table_sql(&self, table: &str) -> String {
        let map = id_map_table(table);
        match &self.map_schema {
            Some(schema) => format!("{}.{}", quote_identifier(schema), quote_identifier(&map)),
            None => quote_identifier(&map),
        }
    }

    fn primary_key<'a>(&self, table: &'a Table) -> Result<Option<&'a str>, TransformError> {
        match &table.primary_key {
            None => Ok(None),
            Some(pk) if pk.columns.len() == 1 => Ok(Some(pk.columns[0].as_str())),
            Some(pk) => Err(TransformError::invalid(
                self.name(),
                format!(
                    "table {} has a composite primary key ({})",
                    table.name,
                    pk.columns.join(", ")
                ),
            )),
        }
    }
}

impl TableTransform for IdMappingTransform {
    fn name(&self) -> &'static str {
        "id_mapping"
    }

    fn modify_select(
        &self,
        _ctx: &TransformContext,
        metadata: &SchemaMetadata,
        table_name: &str,
        select: &Select,
    ) -> Result<Select, TransformError> {
        let table = require_table(metadata, table_name)?;
        if table.vocabulary {
            return Ok(select.clone());
        }
        let base = select.base_name().to_string();
        let mapped = self.mapped_column();
        let mut result = select.clone();

        if let Some(pk) = self.primary_key(table)? {
            let alias = format!("{pk}_map");
            result = result
                .with_join(Join::new(
                    JoinKind::Inner,
                    self.map_ref(table_name, &alias, select),
                    Expr::column(&alias, SITE_ID_COLUMN),
                    Expr::column(&base, pk),
                ))
                .with_replaced_item(pk, SelectItem::aliased(Expr::column(&alias, &mapped), pk))
                .with_replaced_item(
                    SITE_ID_COLUMN,
                    SelectItem::aliased(Expr::column(&base, pk), SITE_ID_COLUMN),
                );
        }

        for fk in &table.foreign_keys {
            let referred = require_table(metadata, &fk.referred_table)?;
            if referred.vocabulary {
                continue;
            }
            let [column] = fk.columns.as_slice() else {
                return Err(TransformError::invalid(
                    self.name(),
                    format!("foreign key {} on {table_name} spans several columns", fk.name),
                ));
            };
            if result.item(column).is_none() {
                continue;
            }
            let nullable = table
                .column(column)
                .ok_or_else(|| TransformError::unknown_column(table_name, column))?
                .nullable;
            let alias = format!("{column}_map");
            let kind = if nullable {
                JoinKind::LeftOuter
            } else {
                JoinKind::Inner
            };
            result = result
                .with_join(Join::new(
                    kind,
                    self.map_ref(&referred.name, &alias, select),
                    Expr::column(&alias, SITE_ID_COLUMN),
                    Expr::column(&base, column).cast(&self.site_id_type),
                ))
                .with_replaced_item(
                    column,
                    SelectItem::aliased(Expr::column(&alias, &mapped), column),
                );
        }
        Ok(result)
    }

    fn new_indexes(&self, table: &Table) -> Vec<IndexDefinition> {
        if table.vocabulary || table.single_primary_key().is_none() {
            return Vec::new();
        }
        vec![IndexDefinition::on_column(
            index_name(&table.name, SITE_ID_COLUMN),
            &table.name,
            SITE_ID_COLUMN,
        )]
    }

    fn new_constraints(&self, table: &Table) -> Vec<ConstraintDefinition> {
        if table.vocabulary || table.single_primary_key().is_none() {
            return Vec::new();
        }
        vec![ConstraintDefinition::not_null(&table.name, SITE_ID_COLUMN)]
    }

    /// Creates missing counters and map tables, then maps every unmapped
    /// site id into a range reserved on the shared counter
    fn pre_transform(
        &self,
        metadata: &SchemaMetadata,
        sensitivity: ErrorSensitivity,
    ) -> Vec<Statement> {
        let mapped = quote_identifier(&self.mapped_column());
        let mut statements = Vec::new();
        for table in metadata.data_tables() {
            let Some(pk) = table.single_primary_key() else {
                continue;
            };
            let counter_table = self.counter_table(&table.name);
            let counter = format!(
                "{}.{}",
                quote_identifier(&self.counter_schema),
                quote_identifier(&counter_table)
            );
            statements.push(Statement::raw(
                format!(
                    "CREATE TABLE IF NOT EXISTS {counter} \
                     (one_row BOOLEAN PRIMARY KEY DEFAULT TRUE CHECK (one_row), last_id BIGINT NOT NULL)"
                ),
                format!("create id counter {counter}"),
                sensitivity,
            ));
            statements.push(Statement::raw(
                format!("INSERT INTO {counter} (last_id) VALUES (0) ON CONFLICT DO NOTHING"),
                format!("seed id counter {counter}"),
                sensitivity,
            ));

            let map = self.map_table_sql(&table.name);
            statements.push(Statement::raw(
                format!(
                    "CREATE TABLE IF NOT EXISTS {map} (site_id {} NOT NULL, {mapped} BIGINT NOT NULL)",
                    self.site_id_type
                ),
                format!("create id map {map}"),
                sensitivity,
            ));
            statements.push(Statement::new(
                DdlAction::MapNewIds {
                    table: table.name.clone(),
                    key: pk.to_string(),
                    map_schema: self.map_schema.clone(),
                    map_table: id_map_table(&table.name),
                    id_column: self.mapped_column(),
                    site_id_type: self.site_id_type.clone(),
                    counter_schema: self.counter_schema.clone(),
                    counter_table,
                },
                sensitivity,
            ));
            statements.push(Statement::raw(
                format!(
                    "CREATE INDEX IF NOT EXISTS {} ON {map} (site_id)",
                    quote_identifier(&format!("{}_maps_idx_site", table.name))
                ),
                format!("index id map {map}"),
                sensitivity,
            ));
        }
        statements
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
                    ],
                )
                .with_primary_key("xpk_person", vec!["person_id".to_string()])
                .with_foreign_key(ForeignKey::single(
                    "fpk_person_gender",
                    "gender_concept_id",
                    "concept",
                    "concept_id",
                )),
            )
            .with_table(
                Table::new(
                    "visit_occurrence",
                    vec![
                        Column::new("visit_occurrence_id", "BIGINT").not_null(),
                        Column::new("person_id", "BIGINT").not_null(),
                        Column::new("preceding_visit_id", "BIGINT"),
                    ],
                )
                .with_primary_key("xpk_visit", vec!["visit_occurrence_id".to_string()])
                .with_foreign_key(ForeignKey::single(
                    "fpk_visit_person",
                    "person_id",
                    "person",
                    "person_id",
                ))
                .with_foreign_key(ForeignKey::single(
                    "fpk_visit_preceding",
                    "preceding_visit_id",
                    "visit_occurrence",
                    "visit_occurrence_id",
                )),
            )
            .with_table(Table::new("concept", vec![Column::new("concept_id", "INTEGER")]))
            .with_vocabulary(&["concept"])
    }

    fn ctx() -> TransformContext {
        TransformContext::new("siteA", "2.3.0")
    }

    #[test]
    fn test_maps_primary_key() {
        let md = metadata();
        let stock = Select::stock(md.table("person").unwrap(), Some("sitea_pedsnet"));
        let select = IdMappingTransform::default()
            .modify_select(&ctx(), &md, "person", &stock)
            .unwrap();
        let sql = select.to_sql();

        assert!(sql.contains("person_id_map.dcc_id AS person_id"));
        assert!(sql.contains("person.person_id AS site_id"));
        assert!(sql.contains(
            "JOIN sitea_pedsnet.person_ids AS person_id_map ON person_id_map.site_id = person.person_id"
        ));
        // vocabulary foreign key stays as is
        assert!(sql.contains("person.gender_concept_id"));
        assert_eq!(select.joins.len(), 1);
    }

    #[test]
    fn test_maps_foreign_keys_by_nullability() {
        let md = metadata();
        let stock = Select::stock(md.table("visit_occurrence").unwrap(), Some("sitea_pedsnet"));
        let select = IdMappingTransform::default()
            .modify_select(&ctx(), &md, "visit_occurrence", &stock)
            .unwrap();
        let kinds: Vec<(JoinKind, &str)> = select
            .joins
            .iter()
            .map(|j| (j.kind, j.table.reference_name()))
            .collect();
        assert_eq!(
            kinds,
            vec![
                (JoinKind::Inner, "visit_occurrence_id_map"),
                (JoinKind::Inner, "person_id_map"),
                (JoinKind::LeftOuter, "preceding_visit_id_map"),
            ]
        );
        assert!(select.to_sql().contains(
            "preceding_visit_id_map.site_id = visit_occurrence.preceding_visit_id::BIGINT"
        ));
        assert_eq!(
            select.output_names(),
            vec!["visit_occurrence_id", "person_id", "preceding_visit_id", "site_id"]
        );
    }

    #[test]
    fn test_composite_key_is_rejected() {
        let md = SchemaMetadata::new("pedsnet", "2.3.0").with_table(
            Table::new(
                "fact_relationship",
                vec![Column::new("fact_id_1", "BIGINT"), Column::new("fact_id_2", "BIGINT")],
            )
            .with_primary_key(
                "xpk_fact",
                vec!["fact_id_1".to_string(), "fact_id_2".to_string()],
            ),
        );
        let stock = Select::stock(md.table("fact_relationship").unwrap(), None);
        let err = IdMappingTransform::default()
            .modify_select(&ctx(), &md, "fact_relationship", &stock)
            .unwrap_err();
        assert!(matches!(err, TransformError::InvalidConfiguration { .. }));
    }

    #[test]
    fn test_contributions_and_pre_transform() {
        let md = metadata();
        let transform = IdMappingTransform::default();
        let person = md.table("person").unwrap();
        assert_eq!(
            transform.new_constraints(person),
            vec![ConstraintDefinition::not_null("person", "site_id")]
        );
        assert_eq!(transform.new_indexes(person)[0].columns, vec!["site_id"]);
        assert!(transform.new_indexes(md.table("concept").unwrap()).is_empty());

        let statements = transform.pre_transform(&md, ErrorSensitivity::Normal);
        assert_eq!(statements.len(), 10);
        assert!(statements[0].sql.starts_with("CREATE TABLE IF NOT EXISTS public.dcc_person_id"));
        assert!(statements[2].sql.starts_with("CREATE TABLE IF NOT EXISTS person_ids"));
        assert!(statements[4].sql.starts_with("CREATE INDEX IF NOT EXISTS person_maps_idx_site"));
    }

    #[test]
    fn test_new_ids_come_from_the_shared_counter() {
        let md = metadata();
        let transform = IdMappingTransform::default().with_counter_schema("id_counters");
        let statements = transform.pre_transform(&md, ErrorSensitivity::Normal);
        let map = &statements[3];
        assert!(matches!(
            &map.action,
            DdlAction::MapNewIds { counter_table, .. } if counter_table == "dcc_person_id"
        ));
        assert!(map.sql.contains(
            "UPDATE id_counters.dcc_person_id SET last_id = last_id + (SELECT count(*) FROM new_ids)"
        ));
        assert!(map.sql.contains("r.first_id + row_number() OVER (ORDER BY n.site_id)"));
        assert!(!map.sql.contains("max("));
    }
}

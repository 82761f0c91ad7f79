//! Age computation
//!
//! Derives fractional ages in months from date/time columns using the
//! `months_in_interval` SQL function, which is installed by the
//! pre-transform step.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use super::{TableTransform, TransformContext, TransformError, require_table};
use crate::database::ErrorSensitivity;
use crate::models::{
    ConstraintDefinition, Expr, IndexDefinition, Join, JoinKind, SchemaMetadata, Select,
    SelectItem, Table, TableRef,
};
use crate::naming::index_name;
use crate::statements::Statement;

pub const AGE_COLUMN_TYPE: &str = "DOUBLE PRECISION";

/// Alias of the person relation joined for birth-anchored ages
const PERSON_ALIAS: &str = "age_person";

/// SQL functions the derived columns call
pub const AGE_FUNCTIONS: &[(&str, &str)] = &[
    (
        "last_month_of_interval",
        "create or replace function last_month_of_interval(timestamp, timestamp)
     returns timestamp strict immutable language sql as $$
       select $1 + interval '1 year' * extract(years from age($2, $1)) + interval '1 month' * extract(months from age($2, $1))
$$",
    ),
    (
        "month_after_last_month_of_interval",
        "create or replace function month_after_last_month_of_interval(timestamp, timestamp)
     returns timestamp strict immutable language sql as $$
       select $1 + interval '1 year' * extract(years from age($2, $1)) + interval '1 month' * (extract(months from age($2, $1)) + 1)
$$",
    ),
    (
        "days_in_last_month_of_interval",
        "create or replace function days_in_last_month_of_interval(timestamp, timestamp)
     returns double precision strict immutable language sql as $$
       select extract(days from month_after_last_month_of_interval($1, $2) - last_month_of_interval($1, $2))
$$",
    ),
    (
        "months_in_interval",
        "create or replace function months_in_interval(timestamp, timestamp)
     returns double precision strict immutable language sql as $$
       select extract(years from age($2, $1)) * 12 + extract(months from age($2, $1)) + extract(days from age($2, $1))/days_in_last_month_of_interval($1, $2)
$$",
    ),
];

/// What an age is measured from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum AgeAnchor {
    /// Months from the person's birth column to the source column
    PersonBirth { column: String },
    /// Months from the source column to a fixed date
    ReferenceDate { date: NaiveDate },
}

/// One derived age column
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgeColumn {
    pub table: String,
    pub source: String,
    pub target: String,
    pub anchor: AgeAnchor,
}

impl AgeColumn {
    /// Birth-anchored age named after the source column,
    /// `visit_start_datetime` becoming `visit_start_age_in_months`
    pub fn from_birth(table: impl Into<String>, source: impl Into<String>) -> Self {
        let source = source.into();
        let target = match source.strip_suffix("_datetime") {
            Some(stem) => format!("{stem}_age_in_months"),
            None => format!("{source}_age_in_months"),
        };
        Self {
            table: table.into(),
            source,
            target,
            anchor: AgeAnchor::PersonBirth {
                column: "birth_datetime".to_string(),
            },
        }
    }

    pub fn relative_to(
        table: impl Into<String>,
        source: impl Into<String>,
        target: impl Into<String>,
        date: NaiveDate,
    ) -> Self {
        Self {
            table: table.into(),
            source: source.into(),
            target: target.into(),
            anchor: AgeAnchor::ReferenceDate { date },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgeTransform {
    pub columns: Vec<AgeColumn>,
}

impl Default for AgeTransform {
    fn default() -> Self {
        let columns = [
            ("condition_occurrence", "condition_start_datetime"),
            ("death", "death_datetime"),
            ("drug_exposure", "drug_exposure_start_datetime"),
            ("measurement", "measurement_datetime"),
            ("measurement", "measurement_result_datetime"),
            ("procedure_occurrence", "procedure_datetime"),
            ("visit_occurrence", "visit_start_datetime"),
            ("observation", "observation_datetime"),
        ]
        .into_iter()
        .map(|(table, column)| AgeColumn::from_birth(table, column))
        .collect();
        Self { columns }
    }
}

impl AgeTransform {
    pub fn new(columns: Vec<AgeColumn>) -> Self {
        Self { columns }
    }

    fn columns_for<'a>(&'a self, table: &'a str) -> impl Iterator<Item = &'a AgeColumn> + 'a {
        self.columns.iter().filter(move |c| c.table == table)
    }
}

impl TableTransform for AgeTransform {
    fn name(&self) -> &'static str {
        "age"
    }

    fn modify_select(
        &self,
        _ctx: &TransformContext,
        metadata: &SchemaMetadata,
        table_name: &str,
        select: &Select,
    ) -> Result<Select, TransformError> {
        let table = require_table(metadata, table_name)?;
        let mut result = select.clone();
        let base = select.base_name().to_string();

        for age in self.columns_for(table_name) {
            if !table.has_column(&age.source) {
                return Err(TransformError::unknown_column(table_name, &age.source));
            }
            let source = Expr::column(&base, &age.source);
            let expr = match &age.anchor {
                AgeAnchor::ReferenceDate { date } => Expr::call(
                    "months_in_interval",
                    vec![source, Expr::text(date.to_string()).cast("timestamp")],
                ),
                AgeAnchor::PersonBirth { column } if table_name == "person" => {
                    if !table.has_column(column) {
                        return Err(TransformError::unknown_column("person", column));
                    }
                    Expr::call(
                        "months_in_interval",
                        vec![Expr::column(&base, column), source],
                    )
                }
                AgeAnchor::PersonBirth { column } => {
                    let person = require_table(metadata, "person")?;
                    if !person.has_column(column) {
                        return Err(TransformError::unknown_column("person", column));
                    }
                    if !table.has_column("person_id") {
                        return Err(TransformError::invalid(
                            self.name(),
                            format!("table {table_name} has no person_id column to join person"),
                        ));
                    }
                    if !result.has_join_alias(PERSON_ALIAS) {
                        let mut person_ref = TableRef::new("person").aliased(PERSON_ALIAS);
                        if let Some(schema) = &select.from.schema {
                            person_ref = person_ref.in_schema(schema);
                        }
                        result = result.with_join(Join::new(
                            JoinKind::LeftOuter,
                            person_ref,
                            Expr::column(PERSON_ALIAS, "person_id"),
                            Expr::column(&base, "person_id"),
                        ));
                    }
                    Expr::call(
                        "months_in_interval",
                        vec![Expr::column(PERSON_ALIAS, column), source],
                    )
                }
            };
            result = result.with_replaced_item(&age.target, SelectItem::aliased(expr, &age.target));
        }
        Ok(result)
    }

    fn new_indexes(&self, table: &Table) -> Vec<IndexDefinition> {
        if table.vocabulary {
            return Vec::new();
        }
        self.columns_for(&table.name)
            .filter(|age| table.has_column(&age.source))
            .map(|age| {
                IndexDefinition::on_column(
                    index_name(&table.name, &age.target),
                    &table.name,
                    &age.target,
                )
            })
            .collect()
    }

    fn new_constraints(&self, table: &Table) -> Vec<ConstraintDefinition> {
        if table.vocabulary {
            return Vec::new();
        }
        // Birth-anchored ages also depend on the person row, which is not
        // visible here, so only reference-date ages inherit NOT NULL.
        self.columns_for(&table.name)
            .filter(|age| matches!(age.anchor, AgeAnchor::ReferenceDate { .. }))
            .filter(|age| table.column(&age.source).is_some_and(|c| !c.nullable))
            .map(|age| ConstraintDefinition::not_null(&table.name, &age.target))
            .collect()
    }

    fn pre_transform(
        &self,
        _metadata: &SchemaMetadata,
        sensitivity: ErrorSensitivity,
    ) -> Vec<Statement> {
        if self.columns.is_empty() {
            return Vec::new();
        }
        AGE_FUNCTIONS
            .iter()
            .map(|(name, sql)| Statement::raw(*sql, format!("install function {name}"), sensitivity))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Column;

    fn reference() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()
    }

    fn metadata() -> SchemaMetadata {
        SchemaMetadata::new("pedsnet", "2.3.0")
            .with_table(Table::new(
                "person",
                vec![
                    Column::new("person_id", "BIGINT").not_null(),
                    Column::new("birth_date", "DATE").not_null(),
                    Column::new("birth_datetime", "TIMESTAMP"),
                ],
            ))
            .with_table(Table::new(
                "visit_occurrence",
                vec![
                    Column::new("visit_occurrence_id", "BIGINT").not_null(),
                    Column::new("person_id", "BIGINT").not_null(),
                    Column::new("visit_start_datetime", "TIMESTAMP").not_null(),
                ],
            ))
    }

    #[test]
    fn test_reference_date_age_on_person() {
        let md = metadata();
        let age = AgeTransform::new(vec![AgeColumn::relative_to(
            "person",
            "birth_date",
            "age",
            reference(),
        )]);
        let stock = Select::stock(md.table("person").unwrap(), Some("sitea_pedsnet"));
        let select = age
            .modify_select(&TransformContext::new("siteA", "2.3.0"), &md, "person", &stock)
            .unwrap();

        assert!(select.output_names().contains(&"age"));
        assert!(select.to_sql().contains(
            "months_in_interval(person.birth_date, '2024-01-01'::timestamp) AS age"
        ));

        let person = md.table("person").unwrap();
        assert_eq!(
            age.new_constraints(person),
            vec![ConstraintDefinition::not_null("person", "age")]
        );
        let indexes = age.new_indexes(person);
        assert_eq!(indexes.len(), 1);
        assert_eq!(indexes[0].columns, vec!["age"]);
    }

    #[test]
    fn test_birth_anchor_joins_person_once() {
        let md = metadata();
        let age = AgeTransform::new(vec![
            AgeColumn::from_birth("visit_occurrence", "visit_start_datetime"),
            AgeColumn {
                target: "visit_start_age_again".to_string(),
                ..AgeColumn::from_birth("visit_occurrence", "visit_start_datetime")
            },
        ]);
        let stock = Select::stock(md.table("visit_occurrence").unwrap(), Some("sitea_pedsnet"));
        let select = age
            .modify_select(
                &TransformContext::new("siteA", "2.3.0"),
                &md,
                "visit_occurrence",
                &stock,
            )
            .unwrap();
        assert_eq!(select.joins.len(), 1);
        assert!(select.output_names().contains(&"visit_start_age_in_months"));
        assert!(select.to_sql().contains("LEFT OUTER JOIN sitea_pedsnet.person AS age_person"));
        assert!(age.new_constraints(md.table("visit_occurrence").unwrap()).is_empty());
    }

    #[test]
    fn test_unknown_source_column() {
        let md = metadata();
        let age = AgeTransform::new(vec![AgeColumn::from_birth("person", "death_datetime")]);
        let stock = Select::stock(md.table("person").unwrap(), None);
        let err = age
            .modify_select(&TransformContext::new("siteA", "2.3.0"), &md, "person", &stock)
            .unwrap_err();
        assert_eq!(err, TransformError::unknown_column("person", "death_datetime"));
    }

    #[test]
    fn test_pre_transform_installs_functions() {
        let stmts = AgeTransform::default().pre_transform(&metadata(), ErrorSensitivity::Normal);
        assert_eq!(stmts.len(), AGE_FUNCTIONS.len());
        assert!(stmts.last().unwrap().sql.contains("months_in_interval"));
    }
}

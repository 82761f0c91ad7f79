//! Transform tests

use chrono::NaiveDate;
use dcc_etl::models::{Column, ForeignKey, SchemaMetadata, Table};
use dcc_etl::transform::{
    AddIndexTransform, AgeColumn, AgeTransform, ConceptNameTransform, DropIndexTransform,
    IdMappingTransform, SiteNameTransform, TableTransform, Transform, TransformContext, TransformError,
    TransformRegistry,
};
use dcc_etl::{ConstraintKind, Select};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;

fn person() -> Table {
    Table::new(
        "person",
        vec![
            Column::new("person_id", "BIGINT").not_null(),
            Column::new("birth_date", "DATE").not_null(),
            Column::new("birth_datetime", "TIMESTAMP"),
            Column::new("gender_concept_id", "INTEGER"),
        ],
    )
    .with_primary_key("xpk_person", vec!["person_id".to_string()])
}

fn visit() -> Table {
    Table::new(
        "visit_occurrence",
        vec![
            Column::new("visit_occurrence_id", "BIGINT").not_null(),
            Column::new("person_id", "BIGINT").not_null(),
            Column::new("visit_start_datetime", "TIMESTAMP").not_null(),
            Column::new("visit_concept_id", "INTEGER"),
        ],
    )
    .with_primary_key("xpk_visit_occurrence", vec!["visit_occurrence_id".to_string()])
    .with_foreign_key(ForeignKey::single(
        "fpk_visit_person",
        "person_id",
        "person",
        "person_id",
    ))
}

fn concept() -> Table {
    Table::new(
        "concept",
        vec![
            Column::new("concept_id", "INTEGER").not_null(),
            Column::new("concept_name", "VARCHAR(255)"),
        ],
    )
    .with_primary_key("xpk_concept", vec!["concept_id".to_string()])
}

fn metadata() -> SchemaMetadata {
    SchemaMetadata::new("pedsnet", "2.3.0")
        .with_table(person())
        .with_table(visit())
        .with_table(concept())
        .with_vocabulary(&["concept"])
}

fn all_variants() -> Vec<Transform> {
    vec![
        AgeTransform::default().into(),
        ConceptNameTransform::default().into(),
        SiteNameTransform::default().into(),
        IdMappingTransform::default().into(),
        AddIndexTransform::default().into(),
        DropIndexTransform::default().into(),
    ]
}

fn parses(sql: &str) -> bool {
    Parser::parse_sql(&PostgreSqlDialect {}, sql).is_ok()
}

mod age_tests {
    use super::*;

    #[test]
    fn test_age_relative_to_reference_date() {
        let md = SchemaMetadata::new("pedsnet", "2.3.0").with_table(
            Table::new(
                "person",
                vec![
                    Column::new("person_id", "BIGINT").not_null(),
                    Column::new("birth_date", "DATE").not_null(),
                ],
            ),
        );
        let date = NaiveDate::from_ymd_opt(2020, 1, 1).unwrap();
        let age = AgeTransform::new(vec![AgeColumn::relative_to(
            "person",
            "birth_date",
            "age",
            date,
        )]);
        let ctx = TransformContext::new("siteA", "2.3.0");
        let stock = Select::stock(md.table("person").unwrap(), None);

        let select = age.modify_select(&ctx, &md, "person", &stock).unwrap();
        assert_eq!(select.output_names(), vec!["person_id", "birth_date", "age"]);
        let sql = select.to_sql();
        assert!(sql.contains("months_in_interval(person.birth_date, '2020-01-01'::timestamp) AS age"));
        assert!(parses(&sql), "{sql}");

        let constraints = age.new_constraints(md.table("person").unwrap());
        assert_eq!(constraints.len(), 1);
        assert_eq!(constraints[0].kind, ConstraintKind::NotNull);
        assert_eq!(constraints[0].columns, vec!["age"]);
        assert_eq!(constraints[0].table, "person");
    }

    #[test]
    fn test_birth_anchored_age_joins_person_once() {
        let md = metadata();
        let ctx = TransformContext::new("siteA", "2.3.0");
        let age = AgeTransform::new(vec![
            AgeColumn::from_birth("visit_occurrence", "visit_start_datetime"),
            AgeColumn {
                target: "visit_age_copy".to_string(),
                ..AgeColumn::from_birth("visit_occurrence", "visit_start_datetime")
            },
        ]);
        let stock = Select::stock(md.table("visit_occurrence").unwrap(), Some("sitea_pedsnet"));
        let select = age
            .modify_select(&ctx, &md, "visit_occurrence", &stock)
            .unwrap();
        assert_eq!(select.joins.len(), 1);
        assert!(parses(&select.to_sql()));
    }
}

mod registry_tests {
    use super::*;

    #[test]
    fn test_contributions_target_their_own_table() {
        let md = metadata();
        for transform in all_variants() {
            for table in &md.tables {
                for index in transform.new_indexes(table) {
                    assert_eq!(index.table, table.name, "{}", transform.name());
                }
                for constraint in transform.new_constraints(table) {
                    assert_eq!(constraint.table, table.name, "{}", transform.name());
                }
            }
        }
    }

    #[test]
    fn test_unknown_table_for_every_variant() {
        let md = metadata();
        let ctx = TransformContext::new("siteA", "2.3.0");
        let stock = Select::stock(md.table("person").unwrap(), None);
        for transform in all_variants() {
            let err = transform
                .modify_select(&ctx, &md, "observation", &stock)
                .unwrap_err();
            assert_eq!(err, TransformError::UnknownTable("observation".to_string()));
        }
    }

    #[test]
    fn test_standard_pipeline_renders_valid_sql() {
        let md = metadata();
        let ctx = TransformContext::new("siteA", "2.3.0");
        let registry = TransformRegistry::standard();
        for table in md.data_tables() {
            let select = registry
                .transformed_select(&ctx, &md, &table.name, Some("sitea_pedsnet"))
                .unwrap();
            let sql = select.to_sql();
            assert!(parses(&sql), "{sql}");
            assert!(select.output_names().contains(&"site"));
            assert!(select.output_names().contains(&"site_id"));
        }
    }

    #[test]
    fn test_vocabulary_tables_pass_through() {
        let md = metadata();
        let ctx = TransformContext::new("siteA", "2.3.0");
        let select = TransformRegistry::standard()
            .transformed_select(&ctx, &md, "concept", Some("vocabulary"))
            .unwrap();
        assert_eq!(select, Select::stock(md.table("concept").unwrap(), Some("vocabulary")));
    }

    #[test]
    fn test_registry_round_trips_through_json() {
        let registry = TransformRegistry::standard()
            .with(AddIndexTransform::default())
            .with(DropIndexTransform::default().retire("visit_occurrence", "person_id", "idx_visit_person"));
        let json = serde_json::to_string(&registry).unwrap();
        let back: TransformRegistry = serde_json::from_str(&json).unwrap();
        assert_eq!(back, registry);
        assert_eq!(
            back.names(),
            vec!["age", "concept_name", "site_name", "id_mapping", "add_index", "drop_index"]
        );
    }

    #[test]
    fn test_drop_index_leaves_selection_unchanged() {
        let md = metadata();
        let ctx = TransformContext::new("siteA", "2.3.0");
        let stock = Select::stock(md.table("visit_occurrence").unwrap(), Some("sitea_pedsnet"));
        let drop = DropIndexTransform::default().retire("visit_occurrence", "person_id", "idx_visit_person");
        let select = drop.modify_select(&ctx, &md, "visit_occurrence", &stock).unwrap();
        assert_eq!(select, stock);

        let registry = TransformRegistry::new(vec![drop.into()]);
        let dropped = registry.dropped_indexes(md.table("visit_occurrence").unwrap());
        assert_eq!(dropped.len(), 1);
        assert_eq!(dropped[0].name, "idx_visit_person");
        assert!(registry.dropped_indexes(md.table("person").unwrap()).is_empty());
    }
}

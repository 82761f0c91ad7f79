//! PostgreSQL rendering for DDL actions
//!
//! # Security
//!
//! Identifiers are emitted bare only when they are plain lower-case names
//! that are not reserved words; anything else is double-quoted with internal
//! quotes doubled. Text literals are single-quoted with internal quotes
//! doubled.

use super::statement::DdlAction;
use crate::models::{ConstraintDefinition, ConstraintKind, IndexDefinition};

const RESERVED: &[&str] = &[
    "all", "analyse", "analyze", "and", "any", "array", "as", "asc", "both", "case", "cast",
    "check", "collate", "column", "constraint", "create", "current_date", "current_role",
    "current_time", "current_timestamp", "current_user", "default", "desc", "distinct", "do",
    "else", "end", "except", "false", "fetch", "for", "foreign", "from", "grant", "group",
    "having", "in", "initially", "intersect", "into", "leading", "limit", "localtime", "not",
    "null", "offset", "on", "only", "or", "order", "placing", "primary", "references",
    "returning", "select", "session_user", "some", "symmetric", "table", "then", "to",
    "trailing", "true", "union", "unique", "user", "using", "variadic", "when", "where",
    "window", "with",
];

/// Quote an identifier for PostgreSQL when required
pub fn quote_identifier(identifier: &str) -> String {
    let plain = identifier
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_lowercase() || c == '_')
        && identifier
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if plain && !RESERVED.contains(&identifier) {
        identifier.to_string()
    } else {
        format!("\"{}\"", identifier.replace('"', "\"\""))
    }
}

pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn qualified(schema: Option<&str>, name: &str) -> String {
    match schema {
        Some(schema) => format!("{}.{}", quote_identifier(schema), quote_identifier(name)),
        None => quote_identifier(name),
    }
}

fn column_list(columns: &[String]) -> String {
    columns
        .iter()
        .map(|c| quote_identifier(c))
        .collect::<Vec<_>>()
        .join(", ")
}

fn create_index(index: &IndexDefinition) -> String {
    let unique = if index.unique { "UNIQUE " } else { "" };
    let target = match &index.expression {
        Some(expr) => expr.clone(),
        None => column_list(&index.columns),
    };
    format!(
        "CREATE {unique}INDEX {} ON {} ({target})",
        quote_identifier(&index.name),
        quote_identifier(&index.table)
    )
}

fn add_constraint(constraint: &ConstraintDefinition) -> String {
    let table = quote_identifier(&constraint.table);
    let name = quote_identifier(&constraint.name);
    let columns = column_list(&constraint.columns);
    match &constraint.kind {
        ConstraintKind::PrimaryKey => {
            format!("ALTER TABLE {table} ADD CONSTRAINT {name} PRIMARY KEY ({columns})")
        }
        ConstraintKind::Unique => {
            format!("ALTER TABLE {table} ADD CONSTRAINT {name} UNIQUE ({columns})")
        }
        ConstraintKind::ForeignKey {
            referred_table,
            referred_columns,
        } => format!(
            "ALTER TABLE {table} ADD CONSTRAINT {name} FOREIGN KEY ({columns}) REFERENCES {} ({})",
            quote_identifier(referred_table),
            column_list(referred_columns)
        ),
        ConstraintKind::NotNull => format!(
            "ALTER TABLE {table} ALTER COLUMN {columns} SET NOT NULL"
        ),
    }
}

fn drop_constraint(constraint: &ConstraintDefinition, cascade: bool) -> String {
    let table = quote_identifier(&constraint.table);
    match constraint.kind {
        ConstraintKind::NotNull => format!(
            "ALTER TABLE {table} ALTER COLUMN {} DROP NOT NULL",
            column_list(&constraint.columns)
        ),
        _ => format!(
            "ALTER TABLE {table} DROP CONSTRAINT {}{}",
            quote_identifier(&constraint.name),
            if cascade { " CASCADE" } else { "" }
        ),
    }
}

/// Render one action as a single PostgreSQL statement
pub fn render(action: &DdlAction) -> String {
    match action {
        DdlAction::CreateDatabase { name, owner } => {
            let mut sql = format!("CREATE DATABASE {}", quote_identifier(name));
            if let Some(owner) = owner {
                sql.push_str(&format!(" OWNER {}", quote_identifier(owner)));
            }
            sql.push_str(" TEMPLATE template0 ENCODING 'UTF8' LC_COLLATE 'C' LC_CTYPE 'C'");
            sql
        }
        DdlAction::CreateSchema { name, owner } => match owner {
            Some(owner) => format!(
                "CREATE SCHEMA {} AUTHORIZATION {}",
                quote_identifier(name),
                quote_identifier(owner)
            ),
            None => format!("CREATE SCHEMA {}", quote_identifier(name)),
        },
        DdlAction::DropSchema {
            name,
            if_exists,
            cascade,
        } => format!(
            "DROP SCHEMA {}{}{}",
            if *if_exists { "IF EXISTS " } else { "" },
            quote_identifier(name),
            if *cascade { " CASCADE" } else { "" }
        ),
        DdlAction::CreateIndex(index) => create_index(index),
        DdlAction::DropIndex {
            name, if_exists, ..
        } => format!(
            "DROP INDEX {}{}",
            if *if_exists { "IF EXISTS " } else { "" },
            quote_identifier(name)
        ),
        DdlAction::AddConstraint(constraint) => add_constraint(constraint),
        DdlAction::DropConstraint {
            constraint,
            cascade,
        } => drop_constraint(constraint, *cascade),
        DdlAction::RenameConstraint { table, from, to } => format!(
            "ALTER TABLE {} RENAME CONSTRAINT {} TO {}",
            quote_identifier(table),
            quote_identifier(from),
            quote_identifier(to)
        ),
        DdlAction::CreateTableAs {
            schema,
            table,
            select,
            unlogged,
        } => format!(
            "CREATE {}TABLE {} AS {}",
            if *unlogged { "UNLOGGED " } else { "" },
            qualified(Some(schema), table),
            select.to_sql()
        ),
        DdlAction::SetLogged { schema, table } => {
            format!("ALTER TABLE {} SET LOGGED", qualified(Some(schema), table))
        }
        DdlAction::DropTable {
            schema,
            table,
            cascade,
        } => format!(
            "DROP TABLE {}{}",
            qualified(Some(schema), table),
            if *cascade { " CASCADE" } else { "" }
        ),
        DdlAction::SetSchema {
            schema,
            table,
            new_schema,
        } => format!(
            "ALTER TABLE {} SET SCHEMA {}",
            qualified(Some(schema), table),
            quote_identifier(new_schema)
        ),
        DdlAction::Grant {
            privileges,
            object,
            role,
        } => format!("GRANT {privileges} ON {object} TO {}", quote_identifier(role)),
        DdlAction::MapNewIds {
            table,
            key,
            map_schema,
            map_table,
            id_column,
            site_id_type,
            counter_schema,
            counter_table,
        } => {
            let map = qualified(map_schema.as_deref(), map_table);
            let counter = qualified(Some(counter_schema.as_str()), counter_table);
            let key = quote_identifier(key);
            format!(
                "WITH new_ids AS (\
                 SELECT d.{key} AS site_id FROM {} AS d \
                 LEFT OUTER JOIN {map} AS m ON m.site_id = d.{key}::{site_id_type} \
                 WHERE m.site_id IS NULL), \
                 reserved AS (\
                 UPDATE {counter} SET last_id = last_id + (SELECT count(*) FROM new_ids) \
                 RETURNING last_id - (SELECT count(*) FROM new_ids) AS first_id) \
                 INSERT INTO {map} (site_id, {}) \
                 SELECT n.site_id, r.first_id + row_number() OVER (ORDER BY n.site_id) \
                 FROM new_ids AS n CROSS JOIN reserved AS r",
                quote_identifier(table),
                quote_identifier(id_column)
            )
        }
        DdlAction::Raw(sql) => sql.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::ErrorSensitivity;
    use crate::statements::generate_index_removal;

    #[test]
    fn test_quote_identifier() {
        assert_eq!(quote_identifier("person_id"), "person_id");
        assert_eq!(quote_identifier("Person"), "\"Person\"");
        assert_eq!(quote_identifier("user"), "\"user\"");
        assert_eq!(quote_identifier("1abc"), "\"1abc\"");
        assert_eq!(quote_identifier("a\"b"), "\"a\"\"b\"");
    }

    #[test]
    fn test_quote_literal() {
        assert_eq!(quote_literal("O'Hare"), "'O''Hare'");
    }

    #[test]
    fn test_render_constraints() {
        let fk = ConstraintDefinition::foreign_key(
            "fpk_visit_person",
            "visit_occurrence",
            vec!["person_id".into()],
            "person",
            vec!["person_id".into()],
        );
        assert_eq!(
            render(&DdlAction::AddConstraint(fk.clone())),
            "ALTER TABLE visit_occurrence ADD CONSTRAINT fpk_visit_person \
             FOREIGN KEY (person_id) REFERENCES person (person_id)"
        );
        assert_eq!(
            render(&DdlAction::DropConstraint {
                constraint: fk,
                cascade: false
            }),
            "ALTER TABLE visit_occurrence DROP CONSTRAINT fpk_visit_person"
        );

        let nn = ConstraintDefinition::not_null("person", "age");
        assert_eq!(
            render(&DdlAction::AddConstraint(nn)),
            "ALTER TABLE person ALTER COLUMN age SET NOT NULL"
        );
    }

    #[test]
    fn test_render_index() {
        let idx = IndexDefinition::on_column("idx_person_id", "person", "person_id");
        assert_eq!(
            render(&DdlAction::CreateIndex(idx)),
            "CREATE INDEX idx_person_id ON person (person_id)"
        );
        let fidx = IndexDefinition::on_expression("con_lcn_ix", "concept", "lower(concept_name)");
        assert_eq!(
            render(&DdlAction::CreateIndex(fidx)),
            "CREATE INDEX con_lcn_ix ON concept (lower(concept_name))"
        );
        let removal = generate_index_removal(
            &[IndexDefinition::on_column("idx_concept_domain_id", "concept", "domain_id")],
            ErrorSensitivity::Strict,
        );
        assert_eq!(removal[0].sql, "DROP INDEX IF EXISTS idx_concept_domain_id");
    }
}

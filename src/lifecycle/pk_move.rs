//! Moving primary keys onto replacement tables
//!
//! Tables rebuilt out of band land next to the original as
//! `update_tmp_<table>`. Before the replacement can be swapped in it needs
//! the original's primary key, and the name can only be held by one table.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::database::ErrorSensitivity;
use crate::models::{ConstraintDefinition, SchemaMetadata};
use crate::statements::{DdlAction, Statement};

pub const UPDATE_TABLE_PREFIX: &str = "update_tmp_";

/// What happens to the original table's key
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrimaryKeyMove {
    /// Drop it, cascading to foreign keys that use it
    #[default]
    Drop,
    /// Keep it as `<name>_old`
    Rename,
}

impl PrimaryKeyMove {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Drop => "drop",
            Self::Rename => "rename",
        }
    }
}

impl fmt::Display for PrimaryKeyMove {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for PrimaryKeyMove {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "drop" => Ok(Self::Drop),
            "rename" => Ok(Self::Rename),
            _ => Err(format!("Unknown primary key move policy: {s}")),
        }
    }
}

pub fn update_table(table: &str) -> String {
    format!("{UPDATE_TABLE_PREFIX}{table}")
}

/// Statements moving every data table's primary key to its replacement
pub fn move_primary_key_statements(
    metadata: &SchemaMetadata,
    policy: PrimaryKeyMove,
    sensitivity: ErrorSensitivity,
) -> Vec<Statement> {
    let mut statements = Vec::new();
    for table in metadata.data_tables() {
        let Some(pk) = &table.primary_key else {
            continue;
        };
        let original =
            ConstraintDefinition::primary_key(&pk.name, &table.name, pk.columns.clone());
        let release = match policy {
            PrimaryKeyMove::Drop => DdlAction::DropConstraint {
                constraint: original.clone(),
                cascade: true,
            },
            PrimaryKeyMove::Rename => DdlAction::RenameConstraint {
                table: table.name.clone(),
                from: pk.name.clone(),
                to: format!("{}_old", pk.name),
            },
        };
        statements.push(Statement::new(release, sensitivity));
        statements.push(Statement::new(
            DdlAction::AddConstraint(ConstraintDefinition {
                table: update_table(&table.name),
                ..original
            }),
            sensitivity,
        ));
    }
    statements
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Column, Table};

    fn metadata() -> SchemaMetadata {
        SchemaMetadata::new("pedsnet", "2.3.0")
            .with_table(
                Table::new("person", vec![Column::new("person_id", "BIGINT")])
                    .with_primary_key("xpk_person", vec!["person_id".to_string()]),
            )
            .with_table(
                Table::new("concept", vec![Column::new("concept_id", "INTEGER")])
                    .with_primary_key("xpk_concept", vec!["concept_id".to_string()])
                    .as_vocabulary(),
            )
            .with_table(Table::new("fact", vec![Column::new("a", "INTEGER")]))
    }

    #[test]
    fn test_drop_policy() {
        let statements =
            move_primary_key_statements(&metadata(), PrimaryKeyMove::Drop, ErrorSensitivity::Normal);
        assert_eq!(statements.len(), 2);
        assert!(matches!(
            &statements[0].action,
            DdlAction::DropConstraint { constraint, cascade: true }
                if constraint.table == "person" && constraint.name == "xpk_person"
        ));
        assert!(matches!(
            &statements[1].action,
            DdlAction::AddConstraint(c)
                if c.table == "update_tmp_person" && c.name == "xpk_person"
        ));
    }

    #[test]
    fn test_rename_policy() {
        let statements = move_primary_key_statements(
            &metadata(),
            PrimaryKeyMove::Rename,
            ErrorSensitivity::Strict,
        );
        assert!(matches!(
            &statements[0].action,
            DdlAction::RenameConstraint { to, .. } if to == "xpk_person_old"
        ));
        assert!(statements.iter().all(|s| s.sensitivity == ErrorSensitivity::Strict));
    }

    #[test]
    fn test_policy_parsing() {
        assert_eq!("RENAME".parse::<PrimaryKeyMove>().unwrap(), PrimaryKeyMove::Rename);
        assert!("keep".parse::<PrimaryKeyMove>().is_err());
    }
}

//! Executable statements

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use super::sql;
use crate::database::ErrorSensitivity;
use crate::models::{ConstraintDefinition, IndexDefinition, Select};

/// A single DDL-level change to a site database
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "action")]
pub enum DdlAction {
    CreateDatabase {
        name: String,
        owner: Option<String>,
    },
    CreateSchema {
        name: String,
        owner: Option<String>,
    },
    DropSchema {
        name: String,
        if_exists: bool,
        cascade: bool,
    },
    CreateIndex(IndexDefinition),
    DropIndex {
        name: String,
        table: String,
        #[serde(default)]
        if_exists: bool,
    },
    AddConstraint(ConstraintDefinition),
    DropConstraint {
        constraint: ConstraintDefinition,
        cascade: bool,
    },
    RenameConstraint {
        table: String,
        from: String,
        to: String,
    },
    CreateTableAs {
        schema: String,
        table: String,
        select: Select,
        unlogged: bool,
    },
    SetLogged {
        schema: String,
        table: String,
    },
    DropTable {
        schema: String,
        table: String,
        cascade: bool,
    },
    SetSchema {
        schema: String,
        table: String,
        new_schema: String,
    },
    Grant {
        privileges: String,
        object: String,
        role: String,
    },
    /// Give every unmapped key of `table` a warehouse id. The ids come from
    /// a range reserved on the shared counter in the same statement, so
    /// sites mapping at the same time never hand out the same id.
    MapNewIds {
        table: String,
        key: String,
        /// Schema of the map table; `None` resolves it through the search path
        map_schema: Option<String>,
        map_table: String,
        id_column: String,
        site_id_type: String,
        counter_schema: String,
        counter_table: String,
    },
    /// Statement text the generator does not model structurally
    Raw(String),
}

impl DdlAction {
    /// Short human-readable summary used in logs and reports
    pub fn describe(&self) -> String {
        match self {
            Self::CreateDatabase { name, .. } => format!("create database {name}"),
            Self::CreateSchema { name, .. } => format!("create schema {name}"),
            Self::DropSchema { name, .. } => format!("drop schema {name}"),
            Self::CreateIndex(index) => format!("create {index}"),
            Self::DropIndex { name, table, .. } => format!("drop index {name} on {table}"),
            Self::AddConstraint(constraint) => format!("add {constraint}"),
            Self::DropConstraint { constraint, .. } => format!("drop {constraint}"),
            Self::RenameConstraint { table, from, to } => {
                format!("rename constraint {from} on {table} to {to}")
            }
            Self::CreateTableAs { schema, table, .. } => {
                format!("create table {schema}.{table} as select")
            }
            Self::SetLogged { schema, table } => format!("set {schema}.{table} logged"),
            Self::DropTable { schema, table, .. } => format!("drop table {schema}.{table}"),
            Self::SetSchema {
                schema,
                table,
                new_schema,
            } => format!("move {schema}.{table} to schema {new_schema}"),
            Self::Grant {
                privileges,
                object,
                role,
            } => format!("grant {privileges} on {object} to {role}"),
            Self::MapNewIds {
                table,
                counter_schema,
                counter_table,
                ..
            } => format!("map new {table} ids from {counter_schema}.{counter_table}"),
            Self::Raw(sql) => {
                let first = sql.lines().next().unwrap_or_default().trim();
                format!("execute {first}")
            }
        }
    }
}

/// An action plus the error policy to apply when executing it
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Statement {
    pub id: Uuid,
    pub action: DdlAction,
    pub sql: String,
    pub description: String,
    pub sensitivity: ErrorSensitivity,
}

impl Statement {
    pub fn new(action: DdlAction, sensitivity: ErrorSensitivity) -> Self {
        Self {
            id: Uuid::new_v4(),
            sql: sql::render(&action),
            description: action.describe(),
            action,
            sensitivity,
        }
    }

    /// Raw SQL with an explicit description
    pub fn raw(
        sql: impl Into<String>,
        description: impl Into<String>,
        sensitivity: ErrorSensitivity,
    ) -> Self {
        let sql = sql.into();
        Self {
            id: Uuid::new_v4(),
            action: DdlAction::Raw(sql.clone()),
            sql,
            description: description.into(),
            sensitivity,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.description, self.sql)
    }
}

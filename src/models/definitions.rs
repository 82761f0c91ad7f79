//! Index and constraint definitions
//!
//! These are value objects: two definitions are the same object when their
//! name, table, columns and kind match. The planner relies on this to fold
//! duplicate contributions and to detect conflicting ones.

use serde::{Deserialize, Serialize};
use std::fmt;

/// An index on a table, either over plain columns or over an expression
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct IndexDefinition {
    pub name: String,
    pub table: String,
    #[serde(default)]
    pub columns: Vec<String>,
    /// Functional index expression, rendered in place of the column list
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expression: Option<String>,
    #[serde(default)]
    pub unique: bool,
}

impl IndexDefinition {
    pub fn new(name: impl Into<String>, table: impl Into<String>, columns: Vec<String>) -> Self {
        Self {
            name: name.into(),
            table: table.into(),
            columns,
            expression: None,
            unique: false,
        }
    }

    /// Single-column index shorthand
    pub fn on_column(
        name: impl Into<String>,
        table: impl Into<String>,
        column: impl Into<String>,
    ) -> Self {
        Self::new(name, table, vec![column.into()])
    }

    /// Functional index over an expression
    pub fn on_expression(
        name: impl Into<String>,
        table: impl Into<String>,
        expression: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            table: table.into(),
            columns: Vec::new(),
            expression: Some(expression.into()),
            unique: false,
        }
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }
}

impl fmt::Display for IndexDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let target = match &self.expression {
            Some(expr) => expr.clone(),
            None => self.columns.join(", "),
        };
        let kind = if self.unique { "unique index" } else { "index" };
        write!(f, "{kind} {} on {}({target})", self.name, self.table)
    }
}

/// Constraint kinds supported by the statement generator
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum ConstraintKind {
    PrimaryKey,
    ForeignKey {
        referred_table: String,
        referred_columns: Vec<String>,
    },
    Unique,
    NotNull,
}

impl ConstraintKind {
    pub fn label(&self) -> &'static str {
        match self {
            Self::PrimaryKey => "primary key",
            Self::ForeignKey { .. } => "foreign key",
            Self::Unique => "unique",
            Self::NotNull => "not null",
        }
    }

    /// Whether other constraints may reference this one
    pub fn is_key(&self) -> bool {
        matches!(self, Self::PrimaryKey | Self::Unique)
    }
}

/// A table constraint
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ConstraintDefinition {
    pub name: String,
    pub table: String,
    pub columns: Vec<String>,
    pub kind: ConstraintKind,
}

impl ConstraintDefinition {
    pub fn primary_key(
        name: impl Into<String>,
        table: impl Into<String>,
        columns: Vec<String>,
    ) -> Self {
        Self {
            name: name.into(),
            table: table.into(),
            columns,
            kind: ConstraintKind::PrimaryKey,
        }
    }

    pub fn foreign_key(
        name: impl Into<String>,
        table: impl Into<String>,
        columns: Vec<String>,
        referred_table: impl Into<String>,
        referred_columns: Vec<String>,
    ) -> Self {
        Self {
            name: name.into(),
            table: table.into(),
            columns,
            kind: ConstraintKind::ForeignKey {
                referred_table: referred_table.into(),
                referred_columns,
            },
        }
    }

    pub fn unique(name: impl Into<String>, table: impl Into<String>, columns: Vec<String>) -> Self {
        Self {
            name: name.into(),
            table: table.into(),
            columns,
            kind: ConstraintKind::Unique,
        }
    }

    /// NOT NULL on a single column. PostgreSQL does not name these, so the
    /// name is synthesized from the table and column.
    pub fn not_null(table: impl Into<String>, column: impl Into<String>) -> Self {
        let table = table.into();
        let column = column.into();
        Self {
            name: format!("{table}_{column}_not_null"),
            table,
            columns: vec![column],
            kind: ConstraintKind::NotNull,
        }
    }

    /// Returns the referenced table and columns for foreign keys
    pub fn reference(&self) -> Option<(&str, &[String])> {
        match &self.kind {
            ConstraintKind::ForeignKey {
                referred_table,
                referred_columns,
            } => Some((referred_table.as_str(), referred_columns.as_slice())),
            _ => None,
        }
    }
}

impl fmt::Display for ConstraintDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} on {}({})",
            self.kind.label(),
            self.name,
            self.table,
            self.columns.join(", ")
        )?;
        if let Some((table, columns)) = self.reference() {
            write!(f, " -> {table}({})", columns.join(", "))?;
        }
        Ok(())
    }
}

/// Anything the statement generator can create or drop
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Definition {
    Index(IndexDefinition),
    Constraint(ConstraintDefinition),
}

impl Definition {
    pub fn name(&self) -> &str {
        match self {
            Self::Index(index) => &index.name,
            Self::Constraint(constraint) => &constraint.name,
        }
    }

    pub fn table(&self) -> &str {
        match self {
            Self::Index(index) => &index.table,
            Self::Constraint(constraint) => &constraint.table,
        }
    }
}

impl fmt::Display for Definition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Index(index) => index.fmt(f),
            Self::Constraint(constraint) => constraint.fmt(f),
        }
    }
}

impl From<IndexDefinition> for Definition {
    fn from(index: IndexDefinition) -> Self {
        Self::Index(index)
    }
}

impl From<ConstraintDefinition> for Definition {
    fn from(constraint: ConstraintDefinition) -> Self {
        Self::Constraint(constraint)
    }
}

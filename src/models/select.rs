//! Selection expression model
//!
//! A small, immutable description of the `SELECT ... FROM ... JOIN ...` used to
//! build each transformed table. Transforms never edit a `Select` in place:
//! every builder method consumes `self` and returns the extended value, so a
//! caller holding the stock selection can always fall back to it.

use crate::statements::sql::{quote_identifier, quote_literal};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::table::Table;

/// Scalar expression in a select list or join condition
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Expr {
    Column {
        relation: Option<String>,
        column: String,
    },
    /// Text literal, rendered single-quoted
    Text(String),
    Cast {
        expr: Box<Expr>,
        data_type: String,
    },
    Call {
        function: String,
        args: Vec<Expr>,
    },
}

impl Expr {
    pub fn column(relation: impl Into<String>, column: impl Into<String>) -> Self {
        Self::Column {
            relation: Some(relation.into()),
            column: column.into(),
        }
    }

    pub fn text(value: impl Into<String>) -> Self {
        Self::Text(value.into())
    }

    pub fn cast(self, data_type: impl Into<String>) -> Self {
        Self::Cast {
            expr: Box::new(self),
            data_type: data_type.into(),
        }
    }

    pub fn call(function: impl Into<String>, args: Vec<Expr>) -> Self {
        Self::Call {
            function: function.into(),
            args,
        }
    }

    /// Column name when this is a bare column reference
    pub fn column_name(&self) -> Option<&str> {
        match self {
            Self::Column { column, .. } => Some(column),
            _ => None,
        }
    }

    pub fn to_sql(&self) -> String {
        match self {
            Self::Column {
                relation: Some(relation),
                column,
            } => format!("{}.{}", quote_identifier(relation), quote_identifier(column)),
            Self::Column {
                relation: None,
                column,
            } => quote_identifier(column),
            Self::Text(value) => quote_literal(value),
            Self::Cast { expr, data_type } => format!("{}::{data_type}", expr.to_sql()),
            Self::Call { function, args } => {
                let args: Vec<String> = args.iter().map(Expr::to_sql).collect();
                format!("{function}({})", args.join(", "))
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SelectItem {
    pub expr: Expr,
    pub alias: Option<String>,
}

impl SelectItem {
    pub fn new(expr: Expr) -> Self {
        Self { expr, alias: None }
    }

    pub fn aliased(expr: Expr, alias: impl Into<String>) -> Self {
        Self {
            expr,
            alias: Some(alias.into()),
        }
    }

    /// Name of the column this item produces
    pub fn output_name(&self) -> Option<&str> {
        self.alias.as_deref().or_else(|| self.expr.column_name())
    }

    fn to_sql(&self) -> String {
        let expr = self.expr.to_sql();
        match &self.alias {
            Some(alias) if Some(alias.as_str()) != self.expr.column_name() => {
                format!("{expr} AS {}", quote_identifier(alias))
            }
            _ => expr,
        }
    }
}

/// Possibly schema-qualified, possibly aliased relation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TableRef {
    pub schema: Option<String>,
    pub name: String,
    pub alias: Option<String>,
}

impl TableRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            schema: None,
            name: name.into(),
            alias: None,
        }
    }

    pub fn in_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    pub fn aliased(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    /// The name other expressions use to refer to this relation
    pub fn reference_name(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }

    fn to_sql(&self) -> String {
        let mut sql = match &self.schema {
            Some(schema) => format!("{}.{}", quote_identifier(schema), quote_identifier(&self.name)),
            None => quote_identifier(&self.name),
        };
        if let Some(alias) = &self.alias {
            sql.push_str(" AS ");
            sql.push_str(&quote_identifier(alias));
        }
        sql
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JoinKind {
    Inner,
    LeftOuter,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Join {
    pub kind: JoinKind,
    pub table: TableRef,
    /// Equality pairs, combined with AND
    pub on: Vec<(Expr, Expr)>,
}

impl Join {
    pub fn new(kind: JoinKind, table: TableRef, left: Expr, right: Expr) -> Self {
        Self {
            kind,
            table,
            on: vec![(left, right)],
        }
    }

    fn to_sql(&self) -> String {
        let keyword = match self.kind {
            JoinKind::Inner => "JOIN",
            JoinKind::LeftOuter => "LEFT OUTER JOIN",
        };
        let conditions: Vec<String> = self
            .on
            .iter()
            .map(|(l, r)| format!("{} = {}", l.to_sql(), r.to_sql()))
            .collect();
        format!(
            "{keyword} {} ON {}",
            self.table.to_sql(),
            conditions.join(" AND ")
        )
    }
}

/// A selection over one base relation plus joins
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Select {
    pub from: TableRef,
    pub items: Vec<SelectItem>,
    #[serde(default)]
    pub joins: Vec<Join>,
}

impl Select {
    pub fn new(from: TableRef) -> Self {
        Self {
            from,
            items: Vec::new(),
            joins: Vec::new(),
        }
    }

    /// Selection of every stock column of `table`, read from `schema`
    pub fn stock(table: &Table, schema: Option<&str>) -> Self {
        let mut from = TableRef::new(&table.name);
        if let Some(schema) = schema {
            from = from.in_schema(schema);
        }
        let items = table
            .columns
            .iter()
            .map(|c| SelectItem::new(Expr::column(&table.name, &c.name)))
            .collect();
        Self {
            from,
            items,
            joins: Vec::new(),
        }
    }

    /// Name used to qualify columns of the base relation
    pub fn base_name(&self) -> &str {
        self.from.reference_name()
    }

    pub fn output_names(&self) -> Vec<&str> {
        self.items.iter().filter_map(SelectItem::output_name).collect()
    }

    pub fn item(&self, output_name: &str) -> Option<&SelectItem> {
        self.items
            .iter()
            .find(|i| i.output_name() == Some(output_name))
    }

    pub fn has_join_alias(&self, alias: &str) -> bool {
        self.joins
            .iter()
            .any(|j| j.table.reference_name() == alias)
    }

    pub fn with_item(mut self, item: SelectItem) -> Self {
        self.items.push(item);
        self
    }

    /// Replaces the item producing `output_name`; appends when absent
    pub fn with_replaced_item(mut self, output_name: &str, item: SelectItem) -> Self {
        match self
            .items
            .iter()
            .position(|i| i.output_name() == Some(output_name))
        {
            Some(pos) => self.items[pos] = item,
            None => self.items.push(item),
        }
        self
    }

    pub fn with_join(mut self, join: Join) -> Self {
        self.joins.push(join);
        self
    }

    pub fn to_sql(&self) -> String {
        let items: Vec<String> = self.items.iter().map(SelectItem::to_sql).collect();
        let mut sql = format!("SELECT {} FROM {}", items.join(", "), self.from.to_sql());
        for join in &self.joins {
            sql.push(' ');
            sql.push_str(&join.to_sql());
        }
        sql
    }
}

impl fmt::Display for Select {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_sql())
    }
}

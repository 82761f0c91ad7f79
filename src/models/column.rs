//! Column model

use serde::{Deserialize, Serialize};

/// Foreign key from one table's columns to another table's key columns
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForeignKey {
    /// Constraint name
    pub name: String,
    /// Referencing columns on the owning table
    pub columns: Vec<String>,
    /// Referenced table name
    pub referred_table: String,
    /// Referenced columns, positionally matching `columns`
    pub referred_columns: Vec<String>,
}

impl ForeignKey {
    pub fn new(
        name: impl Into<String>,
        columns: Vec<String>,
        referred_table: impl Into<String>,
        referred_columns: Vec<String>,
    ) -> Self {
        Self {
            name: name.into(),
            columns,
            referred_table: referred_table.into(),
            referred_columns,
        }
    }

    /// Single-column foreign key shorthand
    pub fn single(
        name: impl Into<String>,
        column: impl Into<String>,
        referred_table: impl Into<String>,
        referred_column: impl Into<String>,
    ) -> Self {
        Self::new(
            name,
            vec![column.into()],
            referred_table,
            vec![referred_column.into()],
        )
    }
}

/// Column model representing a field in a table
///
/// # Example
///
/// ```rust
/// use dcc_etl::models::Column;
///
/// let col = Column::new("person_id", "BIGINT").not_null();
/// assert!(!col.nullable);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Column {
    /// Column name
    pub name: String,
    /// Database type (e.g., "BIGINT", "VARCHAR(256)", "TIMESTAMP")
    pub data_type: String,
    /// Whether the column allows NULL values (default: true)
    #[serde(default = "default_true")]
    pub nullable: bool,
}

fn default_true() -> bool {
    true
}

impl Column {
    /// Create a new nullable column with the given name and data type
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: normalize_data_type(&data_type.into()),
            nullable: true,
        }
    }

    /// Mark the column NOT NULL
    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }
}

fn normalize_data_type(data_type: &str) -> String {
    data_type.trim().to_uppercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_column_defaults() {
        let col = Column::new("birth_date", "date");
        assert_eq!(col.data_type, "DATE");
        assert!(col.nullable);
        assert!(!col.not_null().nullable);
    }

    #[test]
    fn test_column_deserialize_nullable_default() {
        let col: Column = serde_json::from_str(r#"{"name": "x", "data_type": "INT"}"#).unwrap();
        assert!(col.nullable);
    }
}

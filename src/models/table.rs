//! Table model

use super::column::{Column, ForeignKey};
use super::definitions::{ConstraintDefinition, IndexDefinition};
use serde::{Deserialize, Serialize};

/// Named primary or unique key
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KeyConstraint {
    pub name: String,
    pub columns: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Table {
    pub name: String,
    pub columns: Vec<Column>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_key: Option<KeyConstraint>,
    #[serde(default)]
    pub foreign_keys: Vec<ForeignKey>,
    #[serde(default)]
    pub unique_keys: Vec<KeyConstraint>,
    #[serde(default)]
    pub indexes: Vec<IndexDefinition>,
    /// Vocabulary tables are shared reference data and never transformed
    #[serde(default)]
    pub vocabulary: bool,
}

impl Table {
    pub fn new(name: impl Into<String>, columns: Vec<Column>) -> Self {
        Self {
            name: name.into(),
            columns,
            primary_key: None,
            foreign_keys: Vec::new(),
            unique_keys: Vec::new(),
            indexes: Vec::new(),
            vocabulary: false,
        }
    }

    pub fn with_primary_key(mut self, name: impl Into<String>, columns: Vec<String>) -> Self {
        self.primary_key = Some(KeyConstraint {
            name: name.into(),
            columns,
        });
        self
    }

    pub fn with_foreign_key(mut self, foreign_key: ForeignKey) -> Self {
        self.foreign_keys.push(foreign_key);
        self
    }

    pub fn with_unique_key(mut self, name: impl Into<String>, columns: Vec<String>) -> Self {
        self.unique_keys.push(KeyConstraint {
            name: name.into(),
            columns,
        });
        self
    }

    pub fn with_index(mut self, index: IndexDefinition) -> Self {
        self.indexes.push(index);
        self
    }

    pub fn as_vocabulary(mut self) -> Self {
        self.vocabulary = true;
        self
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column(name).is_some()
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    /// The primary key column when the key is a single column
    pub fn single_primary_key(&self) -> Option<&str> {
        match &self.primary_key {
            Some(pk) if pk.columns.len() == 1 => Some(pk.columns[0].as_str()),
            _ => None,
        }
    }

    /// Stock constraints declared by the data model: primary key, unique
    /// keys, foreign keys and one NOT NULL per non-nullable column.
    pub fn declared_constraints(&self) -> Vec<ConstraintDefinition> {
        let mut constraints = Vec::new();
        if let Some(pk) = &self.primary_key {
            constraints.push(ConstraintDefinition::primary_key(
                &pk.name,
                &self.name,
                pk.columns.clone(),
            ));
        }
        for key in &self.unique_keys {
            constraints.push(ConstraintDefinition::unique(
                &key.name,
                &self.name,
                key.columns.clone(),
            ));
        }
        for fk in &self.foreign_keys {
            constraints.push(ConstraintDefinition::foreign_key(
                &fk.name,
                &self.name,
                fk.columns.clone(),
                &fk.referred_table,
                fk.referred_columns.clone(),
            ));
        }
        for column in self.columns.iter().filter(|c| !c.nullable) {
            constraints.push(ConstraintDefinition::not_null(&self.name, &column.name));
        }
        constraints
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn person() -> Table {
        Table::new(
            "person",
            vec![
                Column::new("person_id", "BIGINT").not_null(),
                Column::new("birth_date", "DATE"),
                Column::new("care_site_id", "BIGINT"),
            ],
        )
        .with_primary_key("xpk_person", vec!["person_id".into()])
        .with_foreign_key(ForeignKey::single(
            "fpk_person_care_site",
            "care_site_id",
            "care_site",
            "care_site_id",
        ))
    }

    #[test]
    fn test_single_primary_key() {
        assert_eq!(person().single_primary_key(), Some("person_id"));
        let composite = Table::new("cohort", vec![])
            .with_primary_key("xpk_cohort", vec!["a".into(), "b".into()]);
        assert_eq!(composite.single_primary_key(), None);
    }

    #[test]
    fn test_declared_constraints() {
        let constraints = person().declared_constraints();
        let names: Vec<_> = constraints.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "xpk_person",
                "fpk_person_care_site",
                "person_person_id_not_null"
            ]
        );
    }
}

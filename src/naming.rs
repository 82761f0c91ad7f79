//! Naming conventions for databases, schemas and generated indexes

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Longest identifier generated for an index
pub const INDEX_NAME_LIMIT: usize = 30;

pub const VOCABULARY_SCHEMA: &str = "vocabulary";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NamingError {
    #[error("Version string must look like X.Y or X.Y.Z, not '{0}'")]
    InvalidVersion(String),

    #[error("Unknown database kind '{0}' (expected internal or prod)")]
    UnknownDatabaseKind(String),
}

/// Which family of roles and schemas a warehouse database is built for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseKind {
    #[default]
    Internal,
    Prod,
}

impl DatabaseKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Internal => "internal",
            Self::Prod => "prod",
        }
    }
}

impl fmt::Display for DatabaseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DatabaseKind {
    type Err = NamingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "internal" => Ok(Self::Internal),
            "prod" | "production" => Ok(Self::Prod),
            _ => Err(NamingError::UnknownDatabaseKind(s.to_string())),
        }
    }
}

/// `"2.3.0"` and `"2.3"` both become `"23"`
pub fn version_shorthand(version: &str) -> Result<String, NamingError> {
    let parts: Vec<&str> = version.split('.').collect();
    let valid = matches!(parts.len(), 2 | 3)
        && parts
            .iter()
            .all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()));
    if !valid {
        return Err(NamingError::InvalidVersion(version.to_string()));
    }
    Ok(format!("{}{}", parts[0], parts[1]))
}

pub fn database_name(prefix: &str, version: &str) -> Result<String, NamingError> {
    Ok(format!("{prefix}{}", version_shorthand(version)?))
}

/// Schema holding a site's data for the main model
pub fn site_data_schema(site: &str, model_name: &str) -> String {
    format!("{site}_{model_name}")
}

/// All schemas prepared for one site
pub fn site_schemas(site: &str, kind: DatabaseKind) -> Vec<String> {
    let mut schemas = vec![
        format!("{site}_pedsnet"),
        format!("{site}_pcornet"),
        format!("{site}_harvest"),
    ];
    if kind == DatabaseKind::Internal {
        schemas.push(format!("{site}_achilles"));
    }
    schemas
}

pub fn transformed_schema(schema: &str) -> String {
    format!("{schema}_transformed")
}

pub fn backup_schema(schema: &str) -> String {
    format!("{schema}_backup")
}

pub fn undo_schema(schema: &str) -> String {
    format!("{schema}_undo")
}

/// Identifier map table for a data table
pub fn id_map_table(table: &str) -> String {
    format!("{table}_ids")
}

/// Deterministic, bounded index name for a table/column pair.
///
/// `provider.gender_source_concept_name` becomes `pro_gscn_<hash>_ix` where the
/// hash is a SHA-256 hex prefix sized so the whole name is
/// [`INDEX_NAME_LIMIT`] characters. Similar column names on different tables
/// therefore never collide.
pub fn index_name(table: &str, column: &str) -> String {
    let table_abbrev: String = table.chars().take(3).collect();
    let column_abbrev: String = column
        .split('_')
        .filter_map(|part| part.chars().next())
        .collect();
    let digest = format!("{:x}", Sha256::digest(format!("{table}.{column}").as_bytes()));
    // Lengths in characters; the digest is ASCII so slicing it by count is safe
    let fixed = table_abbrev.chars().count() + column_abbrev.chars().count() + 3 + "ix".len();
    let hash_len = INDEX_NAME_LIMIT.saturating_sub(fixed).max(4);
    let name = format!(
        "{table_abbrev}_{column_abbrev}_{}_ix",
        &digest[..hash_len.min(digest.len())]
    );
    if name.chars().count() <= INDEX_NAME_LIMIT {
        name
    } else {
        // Very long column names: drop the initials rather than the hash
        let hash_len = INDEX_NAME_LIMIT - table_abbrev.chars().count() - 4;
        format!("{table_abbrev}_{}_ix", &digest[..hash_len])
    }
}

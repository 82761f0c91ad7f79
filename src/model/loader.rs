//! File-backed metadata loading
//!
//! Reads `<root>/<model>/<version>.json`, `.yaml` or `.yml`, in that order
//! of preference. The document is a serialized [`SchemaMetadata`].

use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::{MetadataError, MetadataProvider, VOCABULARY_TABLES, check_metadata};
use crate::models::SchemaMetadata;

const EXTENSIONS: &[&str] = &["json", "yaml", "yml"];

/// Loads metadata documents from a directory tree
#[derive(Debug, Clone)]
pub struct FileMetadataProvider {
    root: PathBuf,
    vocabulary_tables: Vec<String>,
}

impl FileMetadataProvider {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            vocabulary_tables: VOCABULARY_TABLES.iter().map(|t| t.to_string()).collect(),
        }
    }

    /// Replace the list of tables flagged as vocabulary after loading
    pub fn with_vocabulary_tables(mut self, tables: Vec<String>) -> Self {
        self.vocabulary_tables = tables;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn candidates(&self, model_name: &str, version: &str) -> Vec<PathBuf> {
        EXTENSIONS
            .iter()
            .map(|ext| self.root.join(model_name).join(format!("{version}.{ext}")))
            .collect()
    }

    fn parse(path: &Path, contents: &str) -> Result<SchemaMetadata, MetadataError> {
        let is_json = path.extension().is_some_and(|e| e == "json");
        let parsed = if is_json {
            serde_json::from_str(contents).map_err(|e| e.to_string())
        } else {
            serde_yaml::from_str(contents).map_err(|e| e.to_string())
        };
        parsed.map_err(|message| MetadataError::Parse {
            path: path.to_path_buf(),
            message,
        })
    }
}

#[async_trait]
impl MetadataProvider for FileMetadataProvider {
    async fn load_metadata(
        &self,
        model_name: &str,
        version: &str,
    ) -> Result<SchemaMetadata, MetadataError> {
        for path in self.candidates(model_name, version) {
            let contents = match tokio::fs::read_to_string(&path).await {
                Ok(contents) => contents,
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    debug!(path = %path.display(), "No metadata document here");
                    continue;
                }
                Err(source) => return Err(MetadataError::Io { path, source }),
            };
            let metadata = Self::parse(&path, &contents)?.with_vocabulary(&self.vocabulary_tables);
            check_metadata(&metadata, model_name, version)?;
            info!(
                path = %path.display(),
                tables = metadata.tables.len(),
                vocabulary = metadata.vocabulary_tables().count(),
                "Loaded metadata"
            );
            return Ok(metadata);
        }
        Err(MetadataError::NotFound {
            model: model_name.to_string(),
            version: version.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const YAML: &str = r#"
model_name: pedsnet
version: 2.3.0
tables:
  - name: person
    columns:
      - { name: person_id, data_type: bigint, nullable: false }
      - { name: birth_date, data_type: date }
    primary_key: { name: xpk_person, columns: [person_id] }
  - name: concept
    columns:
      - { name: concept_id, data_type: integer, nullable: false }
"#;

    #[tokio::test]
    async fn test_loads_yaml_and_flags_vocabulary() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("pedsnet")).unwrap();
        std::fs::write(dir.path().join("pedsnet/2.3.0.yaml"), YAML).unwrap();

        let md = FileMetadataProvider::new(dir.path())
            .load_metadata("pedsnet", "2.3.0")
            .await
            .unwrap();
        assert_eq!(md.tables.len(), 2);
        assert!(md.is_vocabulary("concept"));
        assert!(!md.is_vocabulary("person"));
        assert!(!md.table("person").unwrap().column("person_id").unwrap().nullable);
    }

    #[tokio::test]
    async fn test_missing_and_broken_documents() {
        let dir = TempDir::new().unwrap();
        let provider = FileMetadataProvider::new(dir.path());
        assert!(matches!(
            provider.load_metadata("pedsnet", "9.9.0").await,
            Err(MetadataError::NotFound { .. })
        ));

        std::fs::create_dir_all(dir.path().join("pedsnet")).unwrap();
        std::fs::write(dir.path().join("pedsnet/2.3.0.json"), "{ not json").unwrap();
        assert!(matches!(
            provider.load_metadata("pedsnet", "2.3.0").await,
            Err(MetadataError::Parse { .. })
        ));
    }
}

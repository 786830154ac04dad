//! Definition repository backed by a JSON file on disk.
//!
//! Writes go to a sibling temp file that is then renamed over the target, so a
//! crash mid-write leaves either the old document or the new one, never a
//! truncated file.

use std::path::{Path, PathBuf};

use stepwise_core::repository::DefinitionRepository;
use stepwise_types::error::RepositoryError;
use uuid::Uuid;

/// Stores the definition document at a fixed path.
#[derive(Debug, Clone)]
pub struct JsonFileDefinitionRepository {
    path: PathBuf,
}

impl JsonFileDefinitionRepository {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "definitions".to_string());
        self.path
            .with_file_name(format!(".{name}.{}.tmp", Uuid::now_v7().simple()))
    }
}

impl DefinitionRepository for JsonFileDefinitionRepository {
    async fn read_document(&self) -> Result<Option<String>, RepositoryError> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(RepositoryError::Query(format!(
                "read {}: {e}",
                self.path.display()
            ))),
        }
    }

    async fn write_document(&self, contents: &str) -> Result<(), RepositoryError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                RepositoryError::Query(format!("create {}: {e}", parent.display()))
            })?;
        }

        let temp = self.temp_path();
        if let Err(e) = tokio::fs::write(&temp, contents).await {
            return Err(RepositoryError::Query(format!(
                "write {}: {e}",
                temp.display()
            )));
        }
        if let Err(e) = tokio::fs::rename(&temp, &self.path).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(RepositoryError::Query(format!(
                "replace {}: {e}",
                self.path.display()
            )));
        }

        tracing::debug!(path = %self.path.display(), bytes = contents.len(), "definition document written");
        Ok(())
    }
}

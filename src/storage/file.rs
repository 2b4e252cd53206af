use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::Value;

use super::{validate_key, Storage};
use crate::error::{Result, SessionError};

/// JSON-file backed store: one file per record under `root`.
#[derive(Clone)]
pub struct FileStorage {
    root: PathBuf,
}

impl FileStorage {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn build_dir(&self, keys: &[&str]) -> Result<PathBuf> {
        let mut path = self.root.clone();
        for key in keys {
            validate_key(key)?;
            path.push(key);
        }
        Ok(path)
    }

    fn build_path(&self, keys: &[&str]) -> Result<PathBuf> {
        let Some((last, parents)) = keys.split_last() else {
            return Err(SessionError::InvalidArgument("storage keys empty".into()));
        };
        let mut path = self.build_dir(parents)?;
        validate_key(last)?;
        path.push(format!("{last}.json"));
        Ok(path)
    }

    async fn ensure_parent_dir(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|error| {
                SessionError::Storage(format!(
                    "failed to create storage directory {}: {error}",
                    parent.display()
                ))
            })?;
        }
        Ok(())
    }
}

#[async_trait]
impl Storage for FileStorage {
    async fn write(&self, keys: &[&str], data: &Value) -> Result<()> {
        let path = self.build_path(keys)?;
        Self::ensure_parent_dir(&path).await?;
        let serialized = serde_json::to_vec_pretty(data)?;
        // Write-then-rename: readers never observe a torn record.
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serialized).await.map_err(|error| {
            SessionError::Storage(format!(
                "failed to write storage file {}: {error}",
                tmp.display()
            ))
        })?;
        tokio::fs::rename(&tmp, &path).await.map_err(|error| {
            SessionError::Storage(format!(
                "failed to commit storage file {}: {error}",
                path.display()
            ))
        })?;
        Ok(())
    }

    async fn read(&self, keys: &[&str]) -> Result<Option<Value>> {
        let path = self.build_path(keys)?;
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(error) => {
                return Err(SessionError::Storage(format!(
                    "failed to read storage file {}: {error}",
                    path.display()
                )))
            }
        };
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    async fn list(&self, prefix: &[&str]) -> Result<Vec<String>> {
        let dir = self.build_dir(prefix)?;
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(error) => return Err(error.into()),
        };
        let mut keys = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(stem) = name.strip_suffix(".json") {
                keys.push(stem.to_string());
            }
        }
        keys.sort();
        Ok(keys)
    }

    async fn remove(&self, keys: &[&str]) -> Result<()> {
        let path = self.build_path(keys)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(error) => Err(error.into()),
        }
    }
}

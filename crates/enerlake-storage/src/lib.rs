//! Blob-store abstraction over the lake plus the local-filesystem
//! implementation used in deployment and tests.
//!
//! Layout: `bronze/<entity>/<file>.json` for raw ingestion documents
//! (degree-days partitioned as `bronze/degreedays/<year>/<month>/...`), and
//! `silver/<entity>/<entity>.parquet` for the derived snapshots.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;

pub const CRATE_NAME: &str = "enerlake-storage";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage io at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid blob path: {0}")]
    InvalidPath(String),
}

impl StorageError {
    fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io { path: path.into(), source }
    }
}

/// One entry under a listed prefix. `name` is the full lake path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobEntry {
    pub name: String,
    pub is_directory: bool,
}

impl BlobEntry {
    /// Last path segment, e.g. `building_000001.json`.
    pub fn file_name(&self) -> &str {
        self.name.rsplit('/').next().unwrap_or(&self.name)
    }
}

/// Minimal contract the lake needs from its object storage: overwriting
/// `put`, `get` distinguishing absence from failure, best-effort `delete`,
/// and a recursive `list` that tells files from directory markers.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, path: &str, bytes: &[u8]) -> Result<(), StorageError>;
    async fn get(&self, path: &str) -> Result<Option<Vec<u8>>, StorageError>;
    async fn delete(&self, path: &str) -> Result<bool, StorageError>;
    async fn list(&self, prefix: &str) -> Result<Vec<BlobEntry>, StorageError>;
}

pub fn bronze_file(entity: &str, file_name: &str) -> String {
    format!("bronze/{entity}/{file_name}")
}

/// Filesystem-backed store rooted at a data directory. Writes go through a
/// temp file and a rename so readers never observe a partial snapshot.
#[derive(Debug, Clone)]
pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, StorageError> {
        if path.is_empty()
            || path.starts_with('/')
            || path.split('/').any(|segment| segment == ".." || segment.is_empty())
        {
            return Err(StorageError::InvalidPath(path.to_string()));
        }
        Ok(self.root.join(path))
    }

    fn relative_name(&self, absolute: &Path) -> String {
        absolute
            .strip_prefix(&self.root)
            .unwrap_or(absolute)
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/")
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn put(&self, path: &str, bytes: &[u8]) -> Result<(), StorageError> {
        let absolute = self.resolve(path)?;
        let parent = absolute
            .parent()
            .ok_or_else(|| StorageError::InvalidPath(path.to_string()))?;
        fs::create_dir_all(parent)
            .await
            .map_err(|e| StorageError::io(path, e))?;

        let temp_path = parent.join(format!(".{}.tmp", Uuid::new_v4()));
        let mut file = fs::File::create(&temp_path)
            .await
            .map_err(|e| StorageError::io(path, e))?;
        file.write_all(bytes)
            .await
            .map_err(|e| StorageError::io(path, e))?;
        file.flush().await.map_err(|e| StorageError::io(path, e))?;
        drop(file);

        match fs::rename(&temp_path, &absolute).await {
            Ok(()) => {
                debug!(path, bytes = bytes.len(), "blob written");
                Ok(())
            }
            Err(e) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(StorageError::io(path, e))
            }
        }
    }

    async fn get(&self, path: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let absolute = self.resolve(path)?;
        match fs::read(&absolute).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::io(path, e)),
        }
    }

    async fn delete(&self, path: &str) -> Result<bool, StorageError> {
        let absolute = self.resolve(path)?;
        match fs::remove_file(&absolute).await {
            Ok(()) => {
                debug!(path, "blob deleted");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StorageError::io(path, e)),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<BlobEntry>, StorageError> {
        let start = self.resolve(prefix)?;
        if !start.is_dir() {
            return Ok(Vec::new());
        }

        let mut entries = Vec::new();
        let mut pending = vec![start];
        while let Some(dir) = pending.pop() {
            let mut read_dir = fs::read_dir(&dir)
                .await
                .map_err(|e| StorageError::io(prefix, e))?;
            while let Some(entry) = read_dir
                .next_entry()
                .await
                .map_err(|e| StorageError::io(prefix, e))?
            {
                let file_type = entry
                    .file_type()
                    .await
                    .map_err(|e| StorageError::io(prefix, e))?;
                let name = self.relative_name(&entry.path());
                if file_type.is_dir() {
                    entries.push(BlobEntry { name, is_directory: true });
                    pending.push(entry.path());
                } else {
                    entries.push(BlobEntry { name, is_directory: false });
                }
            }
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }
}

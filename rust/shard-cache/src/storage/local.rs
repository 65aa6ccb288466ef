// rust/shard-cache/src/storage/local.rs

//! Local filesystem storage backend implementation.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};

use super::traits::StorageBackend;
use crate::config::StorageConfig;
use crate::error::{CacheError, Result};

/// Local filesystem storage backend.
///
/// Stores objects as files under the configured cache directory using
/// tokio's async filesystem operations.
#[derive(Debug, Clone)]
pub struct LocalStorage {
    /// Base path for all storage operations.
    base_path: PathBuf,
    /// Buffer size for buffered writes.
    buffer_size: usize,
}

impl LocalStorage {
    /// Creates a new `LocalStorage` rooted at `config.cache_dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if the base path cannot be created.
    pub async fn new(config: &StorageConfig) -> Result<Self> {
        let base_path = config.cache_dir.clone();

        fs::create_dir_all(&base_path).await.map_err(|e| {
            CacheError::storage_with_source(&base_path, "failed to create cache directory", e)
        })?;

        Ok(Self {
            base_path,
            buffer_size: config.buffer_size,
        })
    }

    /// Resolves a path relative to the base path.
    fn resolve_path(&self, path: &Path) -> PathBuf {
        self.base_path.join(path)
    }

    async fn ensure_parent(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| {
                CacheError::storage_with_source(parent, "failed to create parent directories", e)
            })?;
        }
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for LocalStorage {
    async fn exists(&self, path: &Path) -> Result<bool> {
        let full_path = self.resolve_path(path);
        fs::try_exists(&full_path).await.map_err(|e| {
            CacheError::storage_with_source(&full_path, "failed to check existence", e)
        })
    }

    async fn read(&self, path: &Path) -> Result<Bytes> {
        let full_path = self.resolve_path(path);
        let data = fs::read(&full_path).await.map_err(|e| {
            CacheError::storage_with_source(&full_path, "failed to read file", e)
        })?;
        Ok(Bytes::from(data))
    }

    async fn write(&self, path: &Path, data: &[u8]) -> Result<()> {
        let full_path = self.resolve_path(path);
        self.ensure_parent(&full_path).await?;

        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&full_path)
            .await
            .map_err(|e| {
                CacheError::storage_with_source(&full_path, "failed to create file", e)
            })?;

        let mut writer = BufWriter::with_capacity(self.buffer_size, file);
        writer.write_all(data).await.map_err(|e| {
            CacheError::storage_with_source(&full_path, "failed to write file", e)
        })?;
        writer.flush().await.map_err(|e| {
            CacheError::storage_with_source(&full_path, "failed to flush file", e)
        })?;
        writer.get_ref().sync_all().await.map_err(|e| {
            CacheError::storage_with_source(&full_path, "failed to sync file", e)
        })
    }

    async fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        let from_path = self.resolve_path(from);
        let to_path = self.resolve_path(to);
        self.ensure_parent(&to_path).await?;

        fs::rename(&from_path, &to_path).await.map_err(|e| {
            CacheError::storage_with_source(
                &from_path,
                format!("failed to rename to {}", to_path.display()),
                e,
            )
        })
    }

    async fn copy(&self, from: &Path, to: &Path) -> Result<()> {
        let from_path = self.resolve_path(from);
        let to_path = self.resolve_path(to);
        self.ensure_parent(&to_path).await?;

        fs::copy(&from_path, &to_path).await.map_err(|e| {
            CacheError::storage_with_source(
                &from_path,
                format!("failed to copy to {}", to_path.display()),
                e,
            )
        })?;

        Ok(())
    }
}

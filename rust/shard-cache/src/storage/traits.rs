// rust/shard-cache/src/storage/traits.rs

//! Storage abstraction trait for the shard cache.
//!
//! Everything the cache persists (chunk files, shard progress, the ledger)
//! goes through this trait, with paths relative to the cache root.

use std::path::Path;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;

/// The core async storage backend trait.
///
/// Implementations must make `rename` atomic with respect to readers: a
/// reader of `to` sees either the previous object or the complete new one.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Checks if an object exists at the given path.
    ///
    /// # Errors
    ///
    /// Returns an error if the existence check fails (e.g., permission denied).
    async fn exists(&self, path: &Path) -> Result<bool>;

    /// Reads the entire object into memory.
    ///
    /// # Errors
    ///
    /// Returns an error if the object doesn't exist or cannot be read.
    async fn read(&self, path: &Path) -> Result<Bytes>;

    /// Writes `data` to `path`, replacing any existing object, and syncs it
    /// to durable storage before returning.
    ///
    /// Parent directories are created if they don't exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the object cannot be created or written.
    async fn write(&self, path: &Path, data: &[u8]) -> Result<()>;

    /// Renames/moves an object from one path to another, replacing `to`.
    ///
    /// # Errors
    ///
    /// Returns an error if the source doesn't exist or the rename fails.
    async fn rename(&self, from: &Path, to: &Path) -> Result<()>;

    /// Copies an object from one path to another.
    ///
    /// # Errors
    ///
    /// Returns an error if the source doesn't exist or the copy fails.
    async fn copy(&self, from: &Path, to: &Path) -> Result<()>;
}

// rust/shard-cache/src/storage/commit.rs

//! Crash-safe replacement of small JSON documents.
//!
//! A commit writes the new version next to the target (`<name>.tmp`), copies
//! the current version aside (`<name>.bak`) if there is one, then renames the
//! temp file over the target. A crash at any point leaves either the previous
//! document or the new one in place, never a partial write.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::traits::StorageBackend;
use crate::error::{CacheError, Result};

/// Path of the temporary file used while committing `path`.
pub fn temp_path(path: &Path) -> PathBuf {
    with_suffix(path, ".tmp")
}

/// Path of the backup kept of the previous version of `path`.
pub fn backup_path(path: &Path) -> PathBuf {
    with_suffix(path, ".bak")
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

/// Atomically replaces the document at `path` with `value` serialized as JSON.
///
/// # Errors
///
/// Returns an error if serialization or any storage step fails. The target is
/// left untouched in that case.
pub async fn commit_json<T>(storage: &dyn StorageBackend, path: &Path, value: &T) -> Result<()>
where
    T: Serialize + ?Sized,
{
    let data = serde_json::to_vec_pretty(value).map_err(|e| {
        CacheError::serialization_with_source(format!("failed to encode {}", path.display()), e)
    })?;

    let tmp = temp_path(path);
    storage.write(&tmp, &data).await?;

    if storage.exists(path).await? {
        storage.copy(path, &backup_path(path)).await?;
    }

    storage.rename(&tmp, path).await?;
    tracing::trace!("committed {} ({} bytes)", path.display(), data.len());
    Ok(())
}

/// Loads the JSON document at `path`, or `None` if it does not exist.
///
/// # Errors
///
/// Returns an error if the document exists but cannot be read or decoded.
pub async fn load_json<T>(storage: &dyn StorageBackend, path: &Path) -> Result<Option<T>>
where
    T: DeserializeOwned,
{
    if !storage.exists(path).await? {
        return Ok(None);
    }

    let data = storage.read(path).await?;
    let value = serde_json::from_slice(&data).map_err(|e| {
        CacheError::serialization_with_source(format!("failed to decode {}", path.display()), e)
    })?;
    Ok(Some(value))
}

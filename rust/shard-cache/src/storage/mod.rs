// rust/shard-cache/src/storage/mod.rs

//! Storage abstraction for the shard cache.
//!
//! The cache reaches storage only through [`StorageBackend`], an async trait
//! whose paths are relative to the cache root. [`LocalStorage`] implements it
//! on the local filesystem.
//!
//! Documents that are rewritten in place (shard progress and the ledger) go
//! through [`commit_json`], which never exposes a half-written file.
//!
//! # Example
//!
//! ```no_run
//! use shard_cache::config::StorageConfig;
//! use shard_cache::storage::{commit_json, load_json, LocalStorage};
//! use std::path::Path;
//!
//! # async fn example() -> shard_cache::Result<()> {
//! let storage = LocalStorage::new(&StorageConfig::default()).await?;
//!
//! commit_json(&storage, Path::new("notes.json"), &vec![1, 2, 3]).await?;
//! let notes: Option<Vec<u32>> = load_json(&storage, Path::new("notes.json")).await?;
//! assert_eq!(notes, Some(vec![1, 2, 3]));
//! # Ok(())
//! # }
//! ```

mod commit;
mod local;
mod traits;

pub use commit::{backup_path, commit_json, load_json, temp_path};
pub use local::LocalStorage;
pub use traits::StorageBackend;

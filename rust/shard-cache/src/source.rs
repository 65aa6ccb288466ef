// rust/shard-cache/src/source.rs

//! Raw input shards.
//!
//! A [`ShardSource`] names the shards of a corpus and opens any of them at a
//! row offset. Row iteration is blocking; shard workers drive it from the
//! blocking thread pool.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use crate::error::{CacheError, Result};

/// Lazy, finite sequence of raw records from one shard.
pub type RowIter<T> = Box<dyn Iterator<Item = Result<T>> + Send>;

/// Enumerates and opens raw input shards.
pub trait ShardSource: Send + Sync + 'static {
    /// Raw record type yielded by the shards.
    type Record: Send + 'static;

    /// Shard names, in the order that fixes the global chunk order.
    fn shard_names(&self) -> Vec<String>;

    /// Opens `shard` positioned at `row` (0-based).
    ///
    /// Opening past the end of the shard yields an empty sequence.
    ///
    /// # Errors
    ///
    /// Returns an error if the shard is unknown or cannot be opened.
    fn open_shard_at_row(&self, shard: &str, row: u64) -> Result<RowIter<Self::Record>>;
}

/// Source with one newline-delimited text file per shard.
///
/// Every regular file in the directory is a shard named after its file name
/// without extension. Each line is one record.
#[derive(Debug, Clone)]
pub struct LineShardSource {
    shards: Vec<(String, PathBuf)>,
}

impl LineShardSource {
    /// Scans `dir` for shard files, sorted by name.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be read or two files map to
    /// the same shard name.
    pub fn from_dir(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let entries = std::fs::read_dir(dir).map_err(|e| {
            CacheError::storage_with_source(dir, "failed to read shard directory", e)
        })?;

        let mut shards = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| {
                CacheError::storage_with_source(dir, "failed to read directory entry", e)
            })?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if name.starts_with('.') {
                continue;
            }
            shards.push((name.to_string(), path));
        }

        shards.sort();
        if let Some(pair) = shards.windows(2).find(|w| w[0].0 == w[1].0) {
            return Err(CacheError::config(format!(
                "duplicate shard name '{}' in {}",
                pair[0].0,
                dir.display()
            )));
        }

        Ok(Self { shards })
    }

    /// Creates a source from explicit `(name, path)` pairs, keeping their order.
    pub fn from_files(shards: Vec<(String, PathBuf)>) -> Self {
        Self { shards }
    }

    fn path_of(&self, shard: &str) -> Result<&Path> {
        self.shards
            .iter()
            .find(|(name, _)| name == shard)
            .map(|(_, path)| path.as_path())
            .ok_or_else(|| CacheError::config(format!("unknown shard '{shard}'")))
    }
}

impl ShardSource for LineShardSource {
    type Record = String;

    fn shard_names(&self) -> Vec<String> {
        self.shards.iter().map(|(name, _)| name.clone()).collect()
    }

    fn open_shard_at_row(&self, shard: &str, row: u64) -> Result<RowIter<String>> {
        let path = self.path_of(shard)?.to_path_buf();
        let file = File::open(&path).map_err(|e| {
            CacheError::storage_with_source(&path, "failed to open shard", e)
        })?;

        let lines = BufReader::new(file)
            .lines()
            .skip(row as usize)
            .map(move |line| {
                line.map_err(|e| CacheError::storage_with_source(&path, "failed to read line", e))
            });
        Ok(Box::new(lines))
    }
}

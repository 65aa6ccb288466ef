// rust/shard-cache/src/metadata.rs

//! Documents describing a cache: chunks, per-shard progress, the ledger and
//! build metrics.
//!
//! All of these serialize as JSON. Field counts use ordered maps so that two
//! builds of the same input produce byte-identical documents.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{CacheError, Result};
use crate::storage::{backup_path, temp_path};

/// File name of the ledger, relative to the cache root.
pub const LEDGER_FILE_NAME: &str = "cache_ledger.json";

/// Extension of chunk payload files.
pub const CHUNK_FILE_EXTENSION: &str = "chunk";

/// Element counts per output field (e.g. number of tokens in `input_ids`).
pub type FieldCounts = BTreeMap<String, u64>;

/// Metadata of one stored chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    /// `<shard>/chunk-<n>`, unique within a cache.
    pub name: String,
    /// Number of source rows in the chunk.
    pub num_rows: u64,
    pub field_counts: FieldCounts,
}

impl ChunkMetadata {
    pub fn new(shard: &str, index: usize, num_rows: u64, field_counts: FieldCounts) -> Self {
        Self {
            name: chunk_name(shard, index),
            num_rows,
            field_counts,
        }
    }

    /// Path of the chunk payload file, relative to the cache root.
    pub fn file_path(&self) -> PathBuf {
        PathBuf::from(format!("{}.{CHUNK_FILE_EXTENSION}", self.name))
    }

    /// Name of the shard that produced this chunk.
    pub fn shard_name(&self) -> &str {
        self.name
            .rsplit_once("/chunk-")
            .map_or(self.name.as_str(), |(shard, _)| shard)
    }
}

/// Name of the `index`-th chunk of `shard`.
pub fn chunk_name(shard: &str, index: usize) -> String {
    format!("{shard}/chunk-{index}")
}

/// Path of the progress document of `shard`, relative to the cache root.
pub fn shard_progress_path(shard: &str) -> PathBuf {
    PathBuf::from(format!("{shard}.json"))
}

/// Checks that every shard stays inside the cache root and owns its files.
///
/// A shard owns its progress document (with its temporary and backup
/// copies) and the directory holding its chunk files. No two shards may
/// share any of these, and none may touch the ledger or its temporary and
/// backup copies.
///
/// # Errors
///
/// Returns a configuration error naming the first offending shard.
pub fn validate_shard_names(shards: &[String]) -> Result<()> {
    let ledger = PathBuf::from(LEDGER_FILE_NAME);
    let mut owners: HashMap<PathBuf, &str> = HashMap::new();
    for path in [temp_path(&ledger), backup_path(&ledger), ledger] {
        owners.insert(path, "the cache ledger");
    }

    for shard in shards {
        if !is_relative_name(shard) {
            return Err(CacheError::config(format!(
                "shard name '{shard}' must be a non-empty relative path without '.' or '..'"
            )));
        }

        let progress = shard_progress_path(shard);
        let owned = [
            progress.clone(),
            temp_path(&progress),
            backup_path(&progress),
            PathBuf::from(shard),
        ];
        for path in owned {
            if let Some(owner) = owners.insert(path.clone(), shard.as_str()) {
                if owner == shard.as_str() {
                    return Err(CacheError::config(format!("duplicate shard name '{shard}'")));
                }
                return Err(CacheError::config(format!(
                    "shard '{shard}' would overwrite {} owned by {owner}",
                    path.display()
                )));
            }
        }
    }
    Ok(())
}

fn is_relative_name(name: &str) -> bool {
    let path = Path::new(name);
    !name.is_empty()
        && path
            .components()
            .all(|component| matches!(component, Component::Normal(_)))
}

/// Durable record of what a shard worker has produced so far.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardProgress {
    pub chunks: Vec<ChunkMetadata>,
    pub is_finished: bool,
}

impl ShardProgress {
    /// Rows already reflected in stored chunks; the resume offset.
    pub fn rows_written(&self) -> u64 {
        self.chunks.iter().map(|c| c.num_rows).sum()
    }

    /// Sequence number of the next chunk this shard will write.
    pub fn next_chunk_index(&self) -> usize {
        self.chunks.len()
    }
}

/// Final, ordered chunk sequence of a completed cache.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheLedger {
    pub chunks: Vec<ChunkMetadata>,
}

impl CacheLedger {
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn total_rows(&self) -> u64 {
        self.chunks.iter().map(|c| c.num_rows).sum()
    }

    /// Metrics of the completed build this ledger records.
    pub fn metrics(&self) -> InProgressMetrics {
        let mut metrics = InProgressMetrics {
            is_finished: true,
            ..Default::default()
        };
        let mut shards = BTreeSet::new();
        for chunk in &self.chunks {
            metrics.record_chunk(chunk);
            shards.insert(chunk.shard_name());
        }
        metrics.shards_finished = shards.len() as u64;
        metrics
    }
}

/// Snapshot of build progress.
///
/// A new snapshot replaces the previous one wholesale on every update.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InProgressMetrics {
    pub rows_finished: u64,
    pub chunks_finished: u64,
    pub shards_finished: u64,
    pub field_counts: FieldCounts,
    pub is_finished: bool,
}

impl InProgressMetrics {
    /// Adds a produced chunk to the running totals.
    pub fn record_chunk(&mut self, chunk: &ChunkMetadata) {
        self.chunks_finished += 1;
        self.rows_finished += chunk.num_rows;
        for (field, count) in &chunk.field_counts {
            *self.field_counts.entry(field.clone()).or_insert(0) += count;
        }
    }
}

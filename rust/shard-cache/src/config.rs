// rust/shard-cache/src/config.rs

//! Configuration management for shard cache builds.
//!
//! This module provides configuration parsing from TOML files, environment
//! variable overrides, and validation of configuration values.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::error::{CacheError, Result};

/// Default number of rows per chunk.
pub const DEFAULT_ROWS_PER_CHUNK: usize = 32 * 1024;

// Top-level cache configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub storage: StorageConfig,
    pub build: BuildConfig,
    pub chunk: ChunkConfig,
    pub reader: ReaderConfig,
}

// Storage configuration options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    // Root directory of the cache: chunk files, shard progress and the ledger.
    pub cache_dir: PathBuf,
    // Buffer size in bytes for file writes.
    pub buffer_size: usize,
}

/// Build (producer side) options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    /// Rows per chunk. The last chunk of a shard may be smaller.
    pub rows_per_chunk: usize,
    /// CPU slots shared by all processor calls.
    pub processor_slots: usize,
    /// GPU slots shared by processor calls that ask for GPUs. Processors
    /// asking for more GPUs than this fail their shard.
    pub gpu_slots: usize,
    /// Maximum number of chunks a shard may have sent but not yet emitted
    /// in the global order before its worker pauses. Unbounded if unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_buffered_chunks: Option<usize>,
}

// Chunk file encoding options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkConfig {
    // Compression algorithm: "none", "lz4", or "zstd".
    pub compression: String,
    // Compression level (algorithm-specific).
    pub compression_level: i32,
    // Whether reads verify the payload checksum.
    pub verify_checksums: bool,
}

// Reader options.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaderConfig {
    // Default wait for a not-yet-available chunk, in milliseconds. Waits
    // forever if unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_timeout_ms: Option<u64>,
}

impl ReaderConfig {
    pub fn batch_timeout(&self) -> Option<Duration> {
        self.batch_timeout_ms.map(Duration::from_millis)
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from("./cache"),
            buffer_size: 64 * 1024, // 64 KB
        }
    }
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            rows_per_chunk: DEFAULT_ROWS_PER_CHUNK,
            processor_slots: 4,
            gpu_slots: 0,
            max_buffered_chunks: None,
        }
    }
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            compression: "zstd".to_string(),
            compression_level: 3,
            verify_checksums: true,
        }
    }
}

impl FromStr for CacheConfig {
    type Err = CacheError;

    /// Parse configuration from a TOML string.
    fn from_str(s: &str) -> Result<Self> {
        toml::from_str(s)
            .map_err(|e| CacheError::config_with_source("failed to parse TOML config", e))
    }
}

impl CacheConfig {
    /// Creates a default configuration rooted at `cache_dir`.
    pub fn for_dir(cache_dir: impl Into<PathBuf>) -> Self {
        let mut config = Self::default();
        config.storage.cache_dir = cache_dir.into();
        config
    }

    // Load configuration from a TOML file.
    //
    // # Errors
    //
    // Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            CacheError::storage_with_source(path, "failed to read config file", e)
        })?;
        let config: Self = content.parse()?;
        config.validate()?;
        Ok(config)
    }

    // Apply environment variable overrides.
    //
    // Environment variables are prefixed with `SHC_` and use underscores
    // to separate nested fields. For example:
    // - `SHC_STORAGE_CACHE_DIR` overrides `storage.cache_dir`
    // - `SHC_BUILD_ROWS_PER_CHUNK` overrides `build.rows_per_chunk`
    // - `SHC_CHUNK_COMPRESSION` overrides `chunk.compression`
    // - `SHC_READER_BATCH_TIMEOUT_MS` overrides `reader.batch_timeout_ms`
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        // Storage overrides
        if let Ok(val) = std::env::var("SHC_STORAGE_CACHE_DIR") {
            self.storage.cache_dir = PathBuf::from(val);
        }
        if let Ok(val) = std::env::var("SHC_STORAGE_BUFFER_SIZE") {
            if let Ok(v) = val.parse() {
                self.storage.buffer_size = v;
            }
        }

        // Build overrides
        if let Ok(val) = std::env::var("SHC_BUILD_ROWS_PER_CHUNK") {
            if let Ok(v) = val.parse() {
                self.build.rows_per_chunk = v;
            }
        }
        if let Ok(val) = std::env::var("SHC_BUILD_PROCESSOR_SLOTS") {
            if let Ok(v) = val.parse() {
                self.build.processor_slots = v;
            }
        }
        if let Ok(val) = std::env::var("SHC_BUILD_GPU_SLOTS") {
            if let Ok(v) = val.parse() {
                self.build.gpu_slots = v;
            }
        }
        if let Ok(val) = std::env::var("SHC_BUILD_MAX_BUFFERED_CHUNKS") {
            if let Ok(v) = val.parse() {
                self.build.max_buffered_chunks = Some(v);
            }
        }

        // Chunk overrides
        if let Ok(val) = std::env::var("SHC_CHUNK_COMPRESSION") {
            self.chunk.compression = val;
        }
        if let Ok(val) = std::env::var("SHC_CHUNK_COMPRESSION_LEVEL") {
            if let Ok(v) = val.parse() {
                self.chunk.compression_level = v;
            }
        }
        if let Ok(val) = std::env::var("SHC_CHUNK_VERIFY_CHECKSUMS") {
            if let Ok(v) = val.parse() {
                self.chunk.verify_checksums = v;
            }
        }

        // Reader overrides
        if let Ok(val) = std::env::var("SHC_READER_BATCH_TIMEOUT_MS") {
            if let Ok(v) = val.parse() {
                self.reader.batch_timeout_ms = Some(v);
            }
        }

        self
    }

    // Validate all configuration values.
    //
    // # Errors
    //
    // Returns an error if any configuration value is invalid.
    pub fn validate(&self) -> Result<()> {
        if self.storage.buffer_size == 0 {
            return Err(CacheError::config(
                "storage.buffer_size must be greater than 0",
            ));
        }

        if self.build.rows_per_chunk == 0 {
            return Err(CacheError::config(
                "build.rows_per_chunk must be greater than 0",
            ));
        }
        if self.build.processor_slots == 0 {
            return Err(CacheError::config(
                "build.processor_slots must be greater than 0",
            ));
        }
        if self.build.max_buffered_chunks == Some(0) {
            return Err(CacheError::config(
                "build.max_buffered_chunks must be greater than 0 when set",
            ));
        }

        let valid_compression = ["none", "lz4", "zstd"];
        if !valid_compression.contains(&self.chunk.compression.as_str()) {
            return Err(CacheError::config(format!(
                "chunk.compression must be one of: {}",
                valid_compression.join(", ")
            )));
        }

        if self.reader.batch_timeout_ms == Some(0) {
            return Err(CacheError::config(
                "reader.batch_timeout_ms must be greater than 0 when set",
            ));
        }

        Ok(())
    }
}

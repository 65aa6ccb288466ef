// rust/shard-cache/src/lib.rs

//! Shard Cache - Core Library
//!
//! Builds a deterministically ordered, resumable cache of preprocessed
//! chunks from a set of raw input shards. One worker per shard turns rows
//! into chunk files and persists its progress after every chunk; a single
//! builder interleaves the shards' chunks round robin; readers consume
//! chunks through [`ShardCache`] as soon as they exist, even while the
//! build is still running.

pub mod config;
pub mod error;
pub mod storage;

// Re-export commonly used types for convenience
pub use config::CacheConfig;
pub use error::{CacheError, Result, ShardFailure};
pub use storage::{LocalStorage, StorageBackend};

pub mod chunk;
pub mod metadata;
pub use chunk::{ChunkCodec, ChunkHeader, ChunkStore};
pub use metadata::{CacheLedger, ChunkMetadata, InProgressMetrics, ShardProgress};

pub mod processor;
pub mod source;
pub use processor::{BatchProcessor, ProcessedBatch, ResourceHints, WhitespaceTokenizer};
pub use source::{LineShardSource, RowIter, ShardSource};

mod builder;
mod worker;

pub mod broker;
pub mod cache;
pub mod monitor;
pub use broker::{BuildStatus, CacheBroker, MetricsSubscription};
pub use cache::ShardCache;
pub use monitor::{
    JsonFileMetricsMonitor, LoggingMetricsMonitor, MetricsMonitor, ProgressBarMetricsMonitor,
};

use std::sync::Arc;
use std::time::Duration;

/// Builds or loads the cache described by `config` and attaches `monitors`.
///
/// If `await_finished` is set, waits up to that long for the build to
/// finish; running out of time is not an error and the build carries on
/// in the background.
///
/// # Errors
///
/// Returns an error if the cache cannot be opened, or if the build fails
/// while being waited for.
pub async fn cache_dataset<S, P>(
    config: &CacheConfig,
    source: S,
    processor: P,
    monitors: Vec<Arc<dyn MetricsMonitor>>,
    await_finished: Option<Duration>,
) -> Result<ShardCache>
where
    S: ShardSource,
    P: BatchProcessor<S::Record>,
{
    let cache = ShardCache::build_or_load(config, source, processor).await?;
    if cache.is_finished() {
        tracing::info!("Cache already finished. Skipping.");
        return Ok(cache);
    }

    for monitor in monitors {
        cache.attach_metrics_monitor(monitor).await;
    }

    if let Some(timeout) = await_finished {
        match cache.await_finished(Some(timeout)).await {
            Err(e) if e.is_timeout() => {
                tracing::debug!("Cache still building after {:?}", timeout);
            }
            other => other?,
        }
    }

    Ok(cache)
}

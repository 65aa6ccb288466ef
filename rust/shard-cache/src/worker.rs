// rust/shard-cache/src/worker.rs

//! Shard workers: one task per input shard.
//!
//! A worker resumes from the shard's persisted progress, turns the remaining
//! rows into chunk files and reports every chunk to the cache builder. Its
//! progress document is committed after each chunk, so a restarted build
//! never reprocesses rows that already made it into a stored chunk.

use std::sync::Arc;

use crate::builder::{BuilderHandle, ShardGate};
use crate::chunk::ChunkStore;
use crate::config::BuildConfig;
use crate::error::{CacheError, Result, ShardFailure};
use crate::metadata::{shard_progress_path, ChunkMetadata, ShardProgress};
use crate::processor::{BatchProcessor, ProcessorPool};
use crate::source::{RowIter, ShardSource};
use crate::storage::{commit_json, load_json, StorageBackend};

/// Everything the workers of one build share.
pub(crate) struct BuildContext<S: ShardSource, P> {
    pub source: Arc<S>,
    pub processor: Arc<P>,
    pub storage: Arc<dyn StorageBackend>,
    pub chunks: ChunkStore,
    pub pool: ProcessorPool,
    pub config: BuildConfig,
}

impl<S: ShardSource, P> Clone for BuildContext<S, P> {
    fn clone(&self) -> Self {
        Self {
            source: self.source.clone(),
            processor: self.processor.clone(),
            storage: self.storage.clone(),
            chunks: self.chunks.clone(),
            pool: self.pool.clone(),
            config: self.config.clone(),
        }
    }
}

pub(crate) struct ShardWorker<S: ShardSource, P> {
    shard: String,
    ctx: BuildContext<S, P>,
    builder: BuilderHandle,
    gate: Option<Arc<ShardGate>>,
}

impl<S, P> ShardWorker<S, P>
where
    S: ShardSource,
    P: BatchProcessor<S::Record>,
{
    pub fn new(
        shard: String,
        ctx: BuildContext<S, P>,
        builder: BuilderHandle,
        gate: Option<Arc<ShardGate>>,
    ) -> Self {
        Self {
            shard,
            ctx,
            builder,
            gate,
        }
    }

    /// Runs the shard to completion or failure.
    ///
    /// On failure the builder is told before the error is returned.
    pub async fn run(self) -> Result<()> {
        match self.produce().await {
            Ok(()) => Ok(()),
            Err(e) => {
                let failure = ShardFailure::capture(&self.shard, &e);
                tracing::error!("{}", failure);
                if let Some(backtrace) = &failure.backtrace {
                    tracing::debug!("Backtrace for shard '{}':\n{}", self.shard, backtrace);
                }
                self.builder.shard_failed(&self.shard, failure);
                Err(e)
            }
        }
    }

    async fn produce(&self) -> Result<()> {
        let mut progress = self.load_progress().await;

        if !progress.chunks.is_empty() {
            tracing::info!(
                "Resuming shard {} with {} chunks ({} rows)",
                self.shard,
                progress.chunks.len(),
                progress.rows_written()
            );
            self.send_chunks(progress.chunks.clone());
        }

        if progress.is_finished {
            self.builder.shard_finished(&self.shard);
            return Ok(());
        }

        let rows_per_chunk = self.ctx.config.rows_per_chunk;
        let mut rows = self.open_rows(progress.rows_written()).await?;

        loop {
            if let Some(gate) = &self.gate {
                gate.wait_for_capacity().await;
            }

            let (rest, batch) = next_batch(rows, rows_per_chunk).await?;
            rows = rest;
            let exhausted = batch.len() < rows_per_chunk;

            if !batch.is_empty() {
                let chunk = self.write_chunk(progress.next_chunk_index(), batch).await?;
                self.send_chunks(vec![chunk.clone()]);
                progress.chunks.push(chunk);
                self.commit(&progress).await?;
            }

            if exhausted {
                break;
            }
        }

        progress.is_finished = true;
        self.commit(&progress).await?;
        tracing::info!(
            "Shard {} finished: {} chunks, {} rows",
            self.shard,
            progress.chunks.len(),
            progress.rows_written()
        );
        self.builder.shard_finished(&self.shard);
        Ok(())
    }

    /// Loads persisted progress. Missing or unreadable progress restarts the
    /// shard from scratch.
    async fn load_progress(&self) -> ShardProgress {
        let path = shard_progress_path(&self.shard);
        match load_json::<ShardProgress>(self.ctx.storage.as_ref(), &path).await {
            Ok(Some(progress)) => progress,
            Ok(None) => ShardProgress::default(),
            Err(e) => {
                tracing::warn!(
                    "Ignoring unreadable progress for shard {}, starting over: {}",
                    self.shard,
                    e
                );
                ShardProgress::default()
            }
        }
    }

    async fn open_rows(&self, row: u64) -> Result<RowIter<S::Record>> {
        let source = self.ctx.source.clone();
        let shard = self.shard.clone();
        tokio::task::spawn_blocking(move || source.open_shard_at_row(&shard, row))
            .await
            .map_err(|e| {
                CacheError::processing(&self.shard, format!("shard open task failed: {e}"))
            })?
    }

    async fn write_chunk(&self, index: usize, batch: Vec<S::Record>) -> Result<ChunkMetadata> {
        let encoded = self
            .ctx
            .pool
            .run(
                &self.shard,
                self.ctx.processor.clone(),
                self.ctx.chunks.codec().clone(),
                batch,
            )
            .await?;

        let chunk = ChunkMetadata::new(&self.shard, index, encoded.num_rows, encoded.field_counts);
        self.ctx.chunks.write_encoded(&chunk, &encoded.data).await?;
        tracing::debug!("Wrote {} ({} rows)", chunk.name, chunk.num_rows);
        Ok(chunk)
    }

    async fn commit(&self, progress: &ShardProgress) -> Result<()> {
        let path = shard_progress_path(&self.shard);
        commit_json(self.ctx.storage.as_ref(), &path, progress).await
    }

    fn send_chunks(&self, chunks: Vec<ChunkMetadata>) {
        if let Some(gate) = &self.gate {
            gate.acquire(chunks.len());
        }
        self.builder.new_chunks(&self.shard, chunks);
    }
}

/// Pulls up to `size` rows on the blocking pool.
///
/// Returns fewer than `size` rows only when the shard is exhausted.
async fn next_batch<T: Send + 'static>(
    mut rows: RowIter<T>,
    size: usize,
) -> Result<(RowIter<T>, Vec<T>)> {
    tokio::task::spawn_blocking(move || {
        let mut batch = Vec::with_capacity(size.min(4096));
        while batch.len() < size {
            match rows.next() {
                Some(row) => batch.push(row?),
                None => break,
            }
        }
        Ok::<_, CacheError>((rows, batch))
    })
    .await
    .map_err(|e| CacheError::invalid_state(format!("shard reader task failed: {e}")))?
}

// rust/shard-cache/src/processor.rs

//! Batch processors and the slot pool that runs them.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;

use crate::chunk::ChunkCodec;
use crate::error::{CacheError, Result};
use crate::metadata::FieldCounts;

/// Resources one processor call needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceHints {
    pub num_cpus: u32,
    pub num_gpus: u32,
}

impl Default for ResourceHints {
    fn default() -> Self {
        Self {
            num_cpus: 1,
            num_gpus: 0,
        }
    }
}

/// Output of a processor call for one batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessedBatch {
    /// Element counts per output field.
    pub field_counts: FieldCounts,
    /// Encoded rows; stored verbatim (after compression) as the chunk payload.
    pub payload: Vec<u8>,
}

/// Turns a batch of raw records into an encoded chunk payload.
///
/// Calls are blocking and may be CPU heavy; they run on the blocking pool.
pub trait BatchProcessor<T>: Send + Sync + 'static {
    /// Processes `batch`.
    ///
    /// # Errors
    ///
    /// Any error fails the shard the batch came from.
    fn process(&self, batch: &[T]) -> Result<ProcessedBatch>;

    fn resources(&self) -> ResourceHints {
        ResourceHints::default()
    }
}

/// Whitespace tokenizer for line records.
///
/// The payload is a JSON array with one array of tokens per line;
/// `input_ids` counts tokens.
#[derive(Debug, Clone, Copy, Default)]
pub struct WhitespaceTokenizer;

impl BatchProcessor<String> for WhitespaceTokenizer {
    fn process(&self, batch: &[String]) -> Result<ProcessedBatch> {
        let rows: Vec<Vec<&str>> = batch
            .iter()
            .map(|line| line.split_whitespace().collect())
            .collect();
        let tokens: u64 = rows.iter().map(|r| r.len() as u64).sum();

        let payload = serde_json::to_vec(&rows).map_err(|e| {
            CacheError::serialization_with_source("failed to encode token rows", e)
        })?;

        let mut field_counts = FieldCounts::new();
        field_counts.insert("input_ids".to_string(), tokens);
        Ok(ProcessedBatch {
            field_counts,
            payload,
        })
    }
}

/// Output of [`ProcessorPool::run`]: processed counts plus the encoded
/// chunk file bytes.
#[derive(Debug)]
pub(crate) struct EncodedChunk {
    pub num_rows: u64,
    pub field_counts: FieldCounts,
    pub data: Vec<u8>,
}

/// Bounds how many processor calls run at once.
///
/// Each call holds as many CPU slots as its processor's `num_cpus` (at least
/// one, at most the pool size) and exactly `num_gpus` GPU slots for its
/// duration.
#[derive(Debug, Clone)]
pub(crate) struct ProcessorPool {
    cpu_slots: Arc<Semaphore>,
    cpu_size: u32,
    gpu_slots: Arc<Semaphore>,
    gpu_size: u32,
}

impl ProcessorPool {
    pub fn new(cpu_slots: usize, gpu_slots: usize) -> Self {
        let cpu_slots = cpu_slots.max(1);
        Self {
            cpu_slots: Arc::new(Semaphore::new(cpu_slots)),
            cpu_size: u32::try_from(cpu_slots).unwrap_or(u32::MAX),
            gpu_slots: Arc::new(Semaphore::new(gpu_slots)),
            gpu_size: u32::try_from(gpu_slots).unwrap_or(u32::MAX),
        }
    }

    /// Processes `batch` and encodes the result as a chunk file on the
    /// blocking pool.
    ///
    /// # Errors
    ///
    /// Fails without running the processor if it asks for more GPUs than
    /// the pool has.
    pub async fn run<T, P>(
        &self,
        shard: &str,
        processor: Arc<P>,
        codec: ChunkCodec,
        batch: Vec<T>,
    ) -> Result<EncodedChunk>
    where
        T: Send + 'static,
        P: BatchProcessor<T> + ?Sized,
    {
        let hints = processor.resources();
        if hints.num_gpus > self.gpu_size {
            return Err(CacheError::processing(
                shard,
                format!(
                    "processor needs {} GPUs but only {} GPU slots are configured",
                    hints.num_gpus, self.gpu_size
                ),
            ));
        }

        let wanted = hints.num_cpus.clamp(1, self.cpu_size);
        let _cpu_permit = self
            .cpu_slots
            .acquire_many(wanted)
            .await
            .map_err(|_| CacheError::invalid_state("processor pool closed"))?;
        let _gpu_permit = if hints.num_gpus > 0 {
            Some(
                self.gpu_slots
                    .acquire_many(hints.num_gpus)
                    .await
                    .map_err(|_| CacheError::invalid_state("processor pool closed"))?,
            )
        } else {
            None
        };

        let num_rows = batch.len() as u64;
        let task_shard = shard.to_string();
        let (field_counts, data) = tokio::task::spawn_blocking(move || {
            let processed = processor.process(&batch).map_err(|e| match e {
                e @ CacheError::Processing { .. } => e,
                other => CacheError::processing_with_source(
                    task_shard.clone(),
                    "processor failed",
                    other,
                ),
            })?;
            let data = codec.encode(&processed.payload)?;
            Ok::<_, CacheError>((processed.field_counts, data))
        })
        .await
        .map_err(|e| CacheError::processing(shard, format!("processor task failed: {e}")))??;

        Ok(EncodedChunk {
            num_rows,
            field_counts,
            data,
        })
    }
}

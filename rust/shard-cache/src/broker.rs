// rust/shard-cache/src/broker.rs

//! The cache broker: canonical chunk list of a cache and the only thing
//! readers talk to.
//!
//! While a build runs, the broker's chunk list grows as the builder emits
//! chunks. Readers asking for an index that does not exist yet park a
//! one-shot waiter keyed by that index; the waiter is resolved when the
//! chunk is emitted, with "end of data" when the build finishes short of
//! it, or with the failure if the build aborts.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use tokio::sync::{oneshot, watch, Mutex};

use crate::builder;
use crate::chunk::{ChunkCodec, ChunkStore};
use crate::config::CacheConfig;
use crate::error::{CacheError, Result, ShardFailure};
use crate::metadata::{CacheLedger, ChunkMetadata, InProgressMetrics, LEDGER_FILE_NAME};
use crate::processor::{BatchProcessor, ProcessorPool};
use crate::source::ShardSource;
use crate::storage::{commit_json, load_json, StorageBackend};
use crate::worker::BuildContext;

/// Lifecycle of a cache build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildStatus {
    Building,
    /// The ledger is written; the chunk list is final.
    Finished,
    /// A shard failed; no further chunks will ever be served.
    Failed(ShardFailure),
}

type ChunkWaiter = oneshot::Sender<std::result::Result<Option<ChunkMetadata>, ShardFailure>>;

#[derive(Default)]
struct BrokerState {
    chunks: Vec<ChunkMetadata>,
    pending: HashMap<usize, Vec<ChunkWaiter>>,
}

pub struct CacheBroker {
    storage: Arc<dyn StorageBackend>,
    state: Mutex<BrokerState>,
    // Both watches are only written while `state` is locked.
    status: watch::Sender<BuildStatus>,
    metrics: watch::Sender<InProgressMetrics>,
}

impl CacheBroker {
    /// Opens the cache stored in `storage`.
    ///
    /// If a ledger exists the broker starts finished and nothing is built.
    /// Otherwise a builder and one worker per shard are started, resuming
    /// from whatever progress earlier runs persisted.
    ///
    /// # Errors
    ///
    /// Returns an error if an existing ledger cannot be read or the source
    /// lists a shard name that is duplicated, leaves the cache directory, or
    /// collides with the ledger's files.
    pub async fn open<S, P>(
        storage: Arc<dyn StorageBackend>,
        source: Arc<S>,
        processor: Arc<P>,
        config: &CacheConfig,
    ) -> Result<Arc<Self>>
    where
        S: ShardSource,
        P: BatchProcessor<S::Record>,
    {
        if let Some(ledger) = load_ledger(storage.as_ref()).await? {
            tracing::info!("Found existing cache ledger with {} chunks", ledger.len());
            return Ok(Arc::new(Self::from_ledger(storage, ledger)));
        }

        let broker = Arc::new(Self::building(storage.clone()));
        let ctx = BuildContext {
            source,
            processor,
            chunks: ChunkStore::new(storage.clone(), ChunkCodec::new(&config.chunk)),
            storage,
            pool: ProcessorPool::new(config.build.processor_slots, config.build.gpu_slots),
            config: config.build.clone(),
        };
        builder::spawn(broker.clone(), ctx)?;
        Ok(broker)
    }

    /// A finished broker serving `ledger`.
    pub fn from_ledger(storage: Arc<dyn StorageBackend>, ledger: CacheLedger) -> Self {
        let (status, _) = watch::channel(BuildStatus::Finished);
        let (metrics, _) = watch::channel(ledger.metrics());
        Self {
            storage,
            state: Mutex::new(BrokerState {
                chunks: ledger.chunks,
                pending: HashMap::new(),
            }),
            status,
            metrics,
        }
    }

    /// An empty broker waiting for a builder.
    pub(crate) fn building(storage: Arc<dyn StorageBackend>) -> Self {
        let (status, _) = watch::channel(BuildStatus::Building);
        let (metrics, _) = watch::channel(InProgressMetrics::default());
        Self {
            storage,
            state: Mutex::new(BrokerState::default()),
            status,
            metrics,
        }
    }

    /// Returns chunk `index`, waiting for it if it has not been emitted yet.
    ///
    /// Returns `Ok(None)` if the cache is finished with fewer chunks.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::ShardFailed`] if the build failed, whether
    /// before or while waiting.
    pub async fn get_chunk(&self, index: usize) -> Result<Option<ChunkMetadata>> {
        let waiter = {
            let mut state = self.state.lock().await;
            match self.status() {
                BuildStatus::Failed(failure) => return Err(failure.into()),
                BuildStatus::Finished => return Ok(state.chunks.get(index).cloned()),
                BuildStatus::Building => {}
            }
            if let Some(chunk) = state.chunks.get(index) {
                return Ok(Some(chunk.clone()));
            }

            let (tx, rx) = oneshot::channel();
            let waiters = state.pending.entry(index).or_default();
            // Drop waiters whose readers gave up (timed out).
            waiters.retain(|w| !w.is_closed());
            waiters.push(tx);
            rx
        };

        match waiter.await {
            Ok(Ok(chunk)) => Ok(chunk),
            Ok(Err(failure)) => Err(failure.into()),
            Err(_) => Err(CacheError::invalid_state("cache broker dropped a pending chunk request")),
        }
    }

    /// Number of chunks, once the cache is finished.
    pub async fn final_chunk_count(&self) -> Option<usize> {
        let state = self.state.lock().await;
        match self.status() {
            BuildStatus::Finished => Some(state.chunks.len()),
            _ => None,
        }
    }

    /// Snapshot of the chunks emitted so far.
    pub async fn chunks(&self) -> Vec<ChunkMetadata> {
        self.state.lock().await.chunks.clone()
    }

    pub fn status(&self) -> BuildStatus {
        self.status.borrow().clone()
    }

    pub fn is_finished(&self) -> bool {
        matches!(*self.status.borrow(), BuildStatus::Finished)
    }

    pub fn latest_metrics(&self) -> InProgressMetrics {
        self.metrics.borrow().clone()
    }

    /// Waits until the build finishes.
    ///
    /// # Errors
    ///
    /// Returns the build failure if it aborts instead.
    pub async fn await_finished(&self) -> Result<()> {
        let mut status = self.status.subscribe();
        let outcome = status
            .wait_for(|s| *s != BuildStatus::Building)
            .await
            .map_err(|_| CacheError::invalid_state("cache broker closed"))?
            .clone();

        match outcome {
            BuildStatus::Failed(failure) => Err(failure.into()),
            _ => Ok(()),
        }
    }

    /// Waits for the next metrics update and returns it.
    ///
    /// Returns the final metrics immediately once the build is finished.
    ///
    /// # Errors
    ///
    /// Returns the build failure if it aborts.
    pub async fn updated_metrics(&self) -> Result<InProgressMetrics> {
        self.subscribe().next().await
    }

    /// Subscribes to metrics updates. Only updates published after this
    /// call are observed.
    pub fn subscribe(&self) -> MetricsSubscription {
        MetricsSubscription {
            status: self.status.subscribe(),
            metrics: self.metrics.subscribe(),
        }
    }

    /// Appends emitted chunks and resolves readers waiting for them.
    pub(crate) async fn append_chunks(&self, chunks: Vec<ChunkMetadata>) {
        let mut state = self.state.lock().await;
        if self.status() != BuildStatus::Building {
            tracing::warn!("Dropping {} chunks appended after the build ended", chunks.len());
            return;
        }

        for chunk in chunks {
            let index = state.chunks.len();
            if let Some(waiters) = state.pending.remove(&index) {
                for waiter in waiters {
                    let _ = waiter.send(Ok(Some(chunk.clone())));
                }
            }
            state.chunks.push(chunk);
        }
    }

    pub(crate) async fn new_metrics(&self, metrics: InProgressMetrics) {
        let _state = self.state.lock().await;
        if self.status() == BuildStatus::Building {
            self.metrics.send_replace(metrics);
        }
    }

    /// Aborts the build: every pending and future read fails with `failure`.
    pub(crate) async fn writer_exception(&self, failure: ShardFailure) {
        let mut state = self.state.lock().await;
        if self.status() != BuildStatus::Building {
            return;
        }

        let rejected: usize = state.pending.values().map(Vec::len).sum();
        for (_, waiters) in state.pending.drain() {
            for waiter in waiters {
                let _ = waiter.send(Err(failure.clone()));
            }
        }
        tracing::warn!("Cache build failed, rejected {} pending reads: {}", rejected, failure);
        self.status.send_replace(BuildStatus::Failed(failure));
    }

    /// Persists the ledger, then marks the cache finished.
    ///
    /// The ledger is on disk before any reader can observe the finished
    /// state, so a reader that reopens the cache sees all of it or none.
    pub(crate) async fn finalize(&self, metrics: InProgressMetrics) -> Result<()> {
        let ledger = CacheLedger {
            chunks: self.state.lock().await.chunks.clone(),
        };
        commit_json(self.storage.as_ref(), Path::new(LEDGER_FILE_NAME), &ledger).await?;

        let mut state = self.state.lock().await;
        if self.status() != BuildStatus::Building {
            return Ok(());
        }
        for (_, waiters) in state.pending.drain() {
            for waiter in waiters {
                let _ = waiter.send(Ok(None));
            }
        }
        self.metrics.send_replace(metrics);
        self.status.send_replace(BuildStatus::Finished);

        tracing::info!(
            "Cache finished: {} chunks, {} rows",
            ledger.len(),
            ledger.total_rows()
        );
        Ok(())
    }
}

/// Loads the ledger of the cache in `storage`, if the cache is finished.
pub async fn load_ledger(storage: &dyn StorageBackend) -> Result<Option<CacheLedger>> {
    load_json(storage, Path::new(LEDGER_FILE_NAME)).await
}

/// Per-subscriber view of metrics updates.
pub struct MetricsSubscription {
    status: watch::Receiver<BuildStatus>,
    metrics: watch::Receiver<InProgressMetrics>,
}

impl MetricsSubscription {
    /// Waits for the next metrics snapshot.
    ///
    /// Once the build is finished this returns the final snapshot (with
    /// `is_finished` set) without waiting.
    ///
    /// # Errors
    ///
    /// Returns the build failure if the build aborts.
    pub async fn next(&mut self) -> Result<InProgressMetrics> {
        loop {
            let status = self.status.borrow_and_update().clone();
            match status {
                BuildStatus::Failed(failure) => return Err(failure.into()),
                BuildStatus::Finished => return Ok(self.metrics.borrow_and_update().clone()),
                BuildStatus::Building => {}
            }

            tokio::select! {
                changed = self.metrics.changed() => {
                    changed.map_err(|_| CacheError::invalid_state("cache broker closed"))?;
                    return Ok(self.metrics.borrow_and_update().clone());
                }
                changed = self.status.changed() => {
                    changed.map_err(|_| CacheError::invalid_state("cache broker closed"))?;
                }
            }
        }
    }
}

// rust/shard-cache/src/cache.rs

//! Read-side facade over a shard cache.
//!
//! A [`ShardCache`] reads a finished cache from its ledger or a cache that is
//! still being built from its live broker, through the same API. Reads of
//! chunks that do not exist yet wait for them.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::broker::{load_ledger, BuildStatus, CacheBroker, MetricsSubscription};
use crate::chunk::{ChunkCodec, ChunkStore};
use crate::config::CacheConfig;
use crate::error::{CacheError, Result};
use crate::metadata::{ChunkMetadata, InProgressMetrics, LEDGER_FILE_NAME};
use crate::monitor::MetricsMonitor;
use crate::processor::BatchProcessor;
use crate::source::ShardSource;
use crate::storage::{LocalStorage, StorageBackend};

type MonitorList = Arc<Mutex<Vec<Arc<dyn MetricsMonitor>>>>;

pub struct ShardCache {
    broker: Arc<CacheBroker>,
    chunks: ChunkStore,
    default_timeout: Option<Duration>,
    monitors: MonitorList,
    monitor_task: Mutex<Option<JoinHandle<()>>>,
}

impl ShardCache {
    /// Opens a finished cache.
    ///
    /// # Errors
    ///
    /// Returns an error if the cache directory holds no ledger.
    pub async fn load(config: &CacheConfig) -> Result<Self> {
        config.validate()?;
        let storage: Arc<dyn StorageBackend> = Arc::new(LocalStorage::new(&config.storage).await?);

        let Some(ledger) = load_ledger(storage.as_ref()).await? else {
            return Err(CacheError::storage(
                config.storage.cache_dir.join(LEDGER_FILE_NAME),
                "no finished cache found",
            ));
        };
        tracing::info!(
            "Loaded finished cache at {} with {} chunks",
            config.storage.cache_dir.display(),
            ledger.len()
        );

        let broker = Arc::new(CacheBroker::from_ledger(storage.clone(), ledger));
        Ok(Self::new(broker, storage, config))
    }

    /// Opens the cache in `config.storage.cache_dir`, starting or resuming a
    /// build over `source` if it is not finished.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the cache
    /// directory cannot be opened.
    pub async fn build_or_load<S, P>(config: &CacheConfig, source: S, processor: P) -> Result<Self>
    where
        S: ShardSource,
        P: BatchProcessor<S::Record>,
    {
        config.validate()?;
        let storage: Arc<dyn StorageBackend> = Arc::new(LocalStorage::new(&config.storage).await?);
        Self::build_or_load_with_storage(storage, Arc::new(source), Arc::new(processor), config)
            .await
    }

    /// Like [`ShardCache::build_or_load`], over an arbitrary storage backend.
    pub async fn build_or_load_with_storage<S, P>(
        storage: Arc<dyn StorageBackend>,
        source: Arc<S>,
        processor: Arc<P>,
        config: &CacheConfig,
    ) -> Result<Self>
    where
        S: ShardSource,
        P: BatchProcessor<S::Record>,
    {
        let broker = CacheBroker::open(storage.clone(), source, processor, config).await?;
        Ok(Self::new(broker, storage, config))
    }

    fn new(broker: Arc<CacheBroker>, storage: Arc<dyn StorageBackend>, config: &CacheConfig) -> Self {
        Self {
            broker,
            chunks: ChunkStore::new(storage, ChunkCodec::new(&config.chunk)),
            default_timeout: config.reader.batch_timeout(),
            monitors: Arc::new(Mutex::new(Vec::new())),
            monitor_task: Mutex::new(None),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.broker.is_finished()
    }

    pub fn status(&self) -> BuildStatus {
        self.broker.status()
    }

    /// Number of chunks, once the cache is finished.
    pub async fn final_chunk_count(&self) -> Option<usize> {
        self.broker.final_chunk_count().await
    }

    pub fn latest_metrics(&self) -> InProgressMetrics {
        self.broker.latest_metrics()
    }

    /// Waits for the build to finish, up to `timeout` if given.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Timeout`] on expiry, or the build failure.
    pub async fn await_finished(&self, timeout: Option<Duration>) -> Result<()> {
        with_timeout("await_finished", timeout, self.broker.await_finished()).await
    }

    /// Returns the metadata of chunk `index`, waiting for it if needed.
    ///
    /// Waits up to `timeout`, or the configured reader timeout if `None`.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::ChunkOutOfRange`] if the finished cache has
    /// fewer chunks, [`CacheError::Timeout`] on expiry, or the build failure.
    pub async fn get_chunk(&self, index: usize, timeout: Option<Duration>) -> Result<ChunkMetadata> {
        let timeout = timeout.or(self.default_timeout);
        let chunk = with_timeout(
            format!("get_chunk({index})"),
            timeout,
            self.broker.get_chunk(index),
        )
        .await?;

        match chunk {
            Some(chunk) => Ok(chunk),
            None => {
                let total = self.broker.final_chunk_count().await.unwrap_or(index);
                Err(CacheError::out_of_range(index, total))
            }
        }
    }

    /// Reads the payload of chunk `index`.
    pub async fn read_chunk(&self, index: usize) -> Result<Bytes> {
        let chunk = self.get_chunk(index, None).await?;
        self.chunks.read(&chunk).await
    }

    /// Streams chunks `offset, offset + stride, ...`.
    ///
    /// Readers using the same `stride` with offsets `0..stride` see disjoint
    /// chunks that together cover the whole cache. With `looping` set, the
    /// stream wraps around modulo the chunk count instead of ending, which
    /// requires the cache to be finished at the wrap point.
    ///
    /// # Errors
    ///
    /// Returns an error if `stride` is zero. Read errors end the stream
    /// after being yielded.
    pub fn iter_chunks(
        &self,
        offset: usize,
        stride: usize,
        looping: bool,
    ) -> Result<BoxStream<'static, Result<ChunkMetadata>>> {
        if stride == 0 {
            return Err(CacheError::config("chunk stride must be at least 1"));
        }

        let broker = self.broker.clone();
        let timeout = self.default_timeout;
        let chunks = stream::try_unfold(offset, move |index| {
            next_strided(broker.clone(), index, stride, looping, timeout)
        });
        Ok(chunks.boxed())
    }

    /// Streams chunk payloads in the order of [`ShardCache::iter_chunks`].
    pub fn iter_payloads(
        &self,
        offset: usize,
        stride: usize,
        looping: bool,
    ) -> Result<BoxStream<'static, Result<Bytes>>> {
        let store = self.chunks.clone();
        let payloads = self.iter_chunks(offset, stride, looping)?.then(move |chunk| {
            let store = store.clone();
            async move { store.read(&chunk?).await }
        });
        Ok(payloads.boxed())
    }

    /// Calls `monitor` with every metrics update of the build.
    ///
    /// On a finished cache the monitor is called once, right away, with the
    /// final metrics.
    pub async fn attach_metrics_monitor(&self, monitor: Arc<dyn MetricsMonitor>) {
        match self.broker.status() {
            BuildStatus::Finished => {
                monitor.on_metrics(&self.broker.latest_metrics());
                return;
            }
            BuildStatus::Failed(failure) => {
                tracing::warn!("Not attaching metrics monitor to failed build: {}", failure);
                return;
            }
            BuildStatus::Building => {}
        }

        self.monitors.lock().await.push(monitor);

        let mut task = self.monitor_task.lock().await;
        if task.is_none() {
            let subscription = self.broker.subscribe();
            *task = Some(tokio::spawn(run_monitors(subscription, self.monitors.clone())));
        }
    }

    /// Waits until the monitor task has delivered the final update.
    pub async fn join_metrics_monitors(&self) {
        let task = self.monitor_task.lock().await.take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::warn!("Metrics monitor task failed: {}", e);
            }
        }
    }
}

impl Drop for ShardCache {
    fn drop(&mut self) {
        if let Ok(mut task) = self.monitor_task.try_lock() {
            if let Some(task) = task.take() {
                task.abort();
            }
        }
    }
}

async fn run_monitors(mut subscription: MetricsSubscription, monitors: MonitorList) {
    loop {
        match subscription.next().await {
            Ok(metrics) => {
                for monitor in monitors.lock().await.iter() {
                    monitor.on_metrics(&metrics);
                }
                if metrics.is_finished {
                    break;
                }
            }
            Err(e) => {
                tracing::warn!("Stopping metrics monitors: {}", e);
                break;
            }
        }
    }
}

async fn next_strided(
    broker: Arc<CacheBroker>,
    mut index: usize,
    stride: usize,
    looping: bool,
    timeout: Option<Duration>,
) -> Result<Option<(ChunkMetadata, usize)>> {
    loop {
        let chunk =
            with_timeout(format!("get_chunk({index})"), timeout, broker.get_chunk(index)).await?;
        if let Some(chunk) = chunk {
            tracing::trace!("Reading chunk {} ({})", index, chunk.name);
            return Ok(Some((chunk, index + stride)));
        }
        if !looping {
            return Ok(None);
        }

        let total = broker.final_chunk_count().await.ok_or_else(|| {
            CacheError::invalid_state("cannot loop over a cache that is not finished")
        })?;
        if total == 0 {
            return Ok(None);
        }
        index %= total;
    }
}

async fn with_timeout<T, F>(
    operation: impl Into<String>,
    timeout: Option<Duration>,
    future: F,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match timeout {
        Some(limit) => tokio::time::timeout(limit, future)
            .await
            .map_err(|_| CacheError::timeout(operation, limit))?,
        None => future.await,
    }
}

// rust/shard-cache/src/builder.rs

//! The cache builder: single ordering authority of a cache build.
//!
//! Shard workers report to the builder through an unbounded mailbox. One
//! task drains it, so notifications are handled one at a time and in the
//! order each worker sent them. After every notification the builder
//! releases buffered chunks in round-robin order over the static shard list:
//!
//! ```text
//! while round_robin not empty:
//!     name = round_robin.front()
//!     if shard_status[name].finished: pop_front; continue   // retire
//!     chunk = shard_status[name].pop_buffered_chunk()
//!     if chunk is None: break                               // head not ready
//!     rotate; emit(chunk)
//! ```
//!
//! The emitted order therefore depends only on the shard list and each
//! shard's own chunk sequence, never on which worker happens to be faster.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

use crate::broker::CacheBroker;
use crate::error::{CacheError, Result, ShardFailure};
use crate::metadata::{validate_shard_names, ChunkMetadata, InProgressMetrics, LEDGER_FILE_NAME};
use crate::processor::BatchProcessor;
use crate::source::ShardSource;
use crate::worker::{BuildContext, ShardWorker};

/// Notification from a shard worker.
#[derive(Debug)]
pub(crate) enum BuilderMessage {
    NewChunks {
        shard: String,
        chunks: Vec<ChunkMetadata>,
    },
    ShardFinished {
        shard: String,
    },
    ShardFailed {
        shard: String,
        failure: ShardFailure,
    },
}

/// Sending side of the builder mailbox. Notifications never block.
#[derive(Debug, Clone)]
pub(crate) struct BuilderHandle {
    tx: mpsc::UnboundedSender<BuilderMessage>,
}

impl BuilderHandle {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<BuilderMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn new_chunks(&self, shard: &str, chunks: Vec<ChunkMetadata>) {
        self.send(BuilderMessage::NewChunks {
            shard: shard.to_string(),
            chunks,
        });
    }

    pub fn shard_finished(&self, shard: &str) {
        self.send(BuilderMessage::ShardFinished {
            shard: shard.to_string(),
        });
    }

    pub fn shard_failed(&self, shard: &str, failure: ShardFailure) {
        self.send(BuilderMessage::ShardFailed {
            shard: shard.to_string(),
            failure,
        });
    }

    fn send(&self, message: BuilderMessage) {
        if self.tx.send(message).is_err() {
            tracing::debug!("Cache builder stopped; dropping shard notification");
        }
    }
}

/// Bounds how far one shard may run ahead of the global order.
///
/// Counts chunks a worker has sent that the builder has not yet emitted.
/// The worker waits for capacity before producing each chunk; the builder
/// releases one unit per emitted chunk. The shard at the head of the
/// rotation never has unemitted chunks, so it can always make progress.
#[derive(Debug)]
pub(crate) struct ShardGate {
    limit: usize,
    in_flight: AtomicUsize,
    closed: AtomicBool,
    released: Notify,
}

impl ShardGate {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            in_flight: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            released: Notify::new(),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn acquire(&self, chunks: usize) {
        self.in_flight.fetch_add(chunks, Ordering::SeqCst);
    }

    pub fn release(&self, chunks: usize) {
        self.in_flight.fetch_sub(chunks, Ordering::SeqCst);
        self.released.notify_waiters();
    }

    /// Lets every current and future wait through.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.released.notify_waiters();
    }

    pub async fn wait_for_capacity(&self) {
        loop {
            let released = self.released.notified();
            if self.closed.load(Ordering::SeqCst) || self.in_flight() < self.limit {
                return;
            }
            released.await;
        }
    }
}

/// Builder-side view of one shard.
struct ShardStatus {
    /// Worker task; `None` once the shard reported completion.
    producer: Option<JoinHandle<Result<()>>>,
    /// Chunks emitted into the global order so far.
    sent_count: usize,
    /// Chunks received but not yet emitted.
    buffered: VecDeque<ChunkMetadata>,
    gate: Option<Arc<ShardGate>>,
}

impl ShardStatus {
    fn new(producer: JoinHandle<Result<()>>, gate: Option<Arc<ShardGate>>) -> Self {
        Self {
            producer: Some(producer),
            sent_count: 0,
            buffered: VecDeque::new(),
            gate,
        }
    }

    fn is_finished(&self) -> bool {
        self.producer.is_none() && self.buffered.is_empty()
    }

    fn pop_chunk_to_send(&mut self) -> Option<ChunkMetadata> {
        let chunk = self.buffered.pop_front()?;
        self.sent_count += 1;
        if let Some(gate) = &self.gate {
            gate.release(1);
        }
        Some(chunk)
    }
}

pub(crate) struct CacheBuilder {
    broker: Arc<CacheBroker>,
    round_robin: VecDeque<String>,
    statuses: HashMap<String, ShardStatus>,
    metrics: InProgressMetrics,
    finished: bool,
    failed: bool,
}

/// Starts one worker per shard and the builder task that orders their output.
///
/// # Errors
///
/// Returns an error, before starting anything, if the source lists the same
/// shard twice or a shard name would escape the cache root or clash with
/// the ledger or another shard's files.
pub(crate) fn spawn<S, P>(
    broker: Arc<CacheBroker>,
    ctx: BuildContext<S, P>,
) -> Result<JoinHandle<()>>
where
    S: ShardSource,
    P: BatchProcessor<S::Record>,
{
    let shard_names = ctx.source.shard_names();
    validate_shard_names(&shard_names)?;

    tracing::info!("Starting cache build over {} shards", shard_names.len());

    let (handle, rx) = BuilderHandle::channel();
    let mut statuses = HashMap::with_capacity(shard_names.len());
    for name in &shard_names {
        let gate = ctx
            .config
            .max_buffered_chunks
            .map(|limit| Arc::new(ShardGate::new(limit)));
        let worker = ShardWorker::new(name.clone(), ctx.clone(), handle.clone(), gate.clone());
        let producer = tokio::spawn(worker.run());
        statuses.insert(name.clone(), ShardStatus::new(producer, gate));
    }
    drop(handle);

    let builder = CacheBuilder::new(broker, shard_names, statuses);
    Ok(tokio::spawn(builder.run(rx)))
}

impl CacheBuilder {
    fn new(
        broker: Arc<CacheBroker>,
        shard_names: Vec<String>,
        statuses: HashMap<String, ShardStatus>,
    ) -> Self {
        Self {
            broker,
            round_robin: shard_names.into_iter().collect(),
            statuses,
            metrics: InProgressMetrics::default(),
            finished: false,
            failed: false,
        }
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<BuilderMessage>) {
        // A build over zero shards finishes right away.
        self.flush().await;

        while !self.finished && !self.failed {
            match rx.recv().await {
                Some(message) => self.handle(message).await,
                None => {
                    self.workers_vanished().await;
                    break;
                }
            }
        }
    }

    async fn handle(&mut self, message: BuilderMessage) {
        match message {
            BuilderMessage::NewChunks { shard, chunks } => self.new_chunks(&shard, chunks).await,
            BuilderMessage::ShardFinished { shard } => self.shard_finished(&shard).await,
            BuilderMessage::ShardFailed { shard, failure } => {
                self.shard_failed(&shard, failure).await;
                return;
            }
        }
        self.flush().await;
    }

    async fn new_chunks(&mut self, shard: &str, chunks: Vec<ChunkMetadata>) {
        let Some(status) = self.statuses.get_mut(shard) else {
            tracing::warn!("Ignoring chunks from unknown shard {}", shard);
            return;
        };
        if status.producer.is_none() {
            tracing::warn!("Ignoring chunks from shard {} after it finished", shard);
            return;
        }
        if chunks.is_empty() {
            return;
        }

        for chunk in &chunks {
            self.metrics.record_chunk(chunk);
        }
        status.buffered.extend(chunks);
        self.broker.new_metrics(self.metrics.clone()).await;
    }

    async fn shard_finished(&mut self, shard: &str) {
        let Some(status) = self.statuses.get_mut(shard) else {
            tracing::warn!("Ignoring completion of unknown shard {}", shard);
            return;
        };
        if status.producer.take().is_none() {
            tracing::warn!("Shard {} reported completion twice", shard);
            return;
        }

        tracing::debug!(
            "Shard {} done producing; {} chunks emitted, {} buffered",
            shard,
            status.sent_count,
            status.buffered.len()
        );
        self.metrics.shards_finished += 1;
        self.broker.new_metrics(self.metrics.clone()).await;
    }

    async fn shard_failed(&mut self, shard: &str, failure: ShardFailure) {
        tracing::error!("Aborting cache build: {}", failure);
        self.failed = true;
        for status in self.statuses.values() {
            if let Some(gate) = &status.gate {
                gate.close();
            }
        }
        if !self.statuses.contains_key(shard) {
            tracing::warn!("Failure reported by unknown shard {}", shard);
        }
        self.broker.writer_exception(failure).await;
    }

    /// The mailbox closed while shards were still producing, which means
    /// their workers are gone without reporting.
    async fn workers_vanished(&mut self) {
        let shard = self
            .round_robin
            .iter()
            .find(|name| self.statuses.get(*name).is_some_and(|s| s.producer.is_some()))
            .cloned()
            .unwrap_or_default();
        let error = CacheError::invalid_state("shard worker exited without reporting completion");
        let failure = ShardFailure::capture(shard.as_str(), &error);
        self.shard_failed(&shard, failure).await;
    }

    /// Emits every chunk the round robin can release, then finalizes once
    /// every shard has retired.
    async fn flush(&mut self) {
        let mut emitted = Vec::new();

        while let Some(name) = self.round_robin.front().cloned() {
            let Some(status) = self.statuses.get_mut(&name) else {
                self.round_robin.pop_front();
                continue;
            };

            if status.is_finished() {
                tracing::debug!("Shard {} retired from rotation", name);
                self.round_robin.pop_front();
                continue;
            }

            let Some(chunk) = status.pop_chunk_to_send() else {
                break;
            };
            self.round_robin.rotate_left(1);
            emitted.push(chunk);
        }

        if !emitted.is_empty() {
            tracing::debug!("Emitting {} chunks", emitted.len());
            self.broker.append_chunks(emitted).await;
        }

        if self.round_robin.is_empty() && !self.finished {
            self.finish().await;
        }
    }

    async fn finish(&mut self) {
        self.finished = true;
        self.metrics.is_finished = true;

        if let Err(e) = self.broker.finalize(self.metrics.clone()).await {
            tracing::error!("Failed to write cache ledger: {}", e);
            self.failed = true;
            self.broker
                .writer_exception(ShardFailure::capture(LEDGER_FILE_NAME, &e))
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::BuildStatus;
    use crate::config::StorageConfig;
    use crate::storage::{LocalStorage, StorageBackend};
    use std::time::Duration;
    use tempfile::TempDir;

    async fn broker() -> (Arc<CacheBroker>, TempDir) {
        let temp = TempDir::new().unwrap();
        let storage = LocalStorage::new(&StorageConfig {
            cache_dir: temp.path().to_path_buf(),
            ..Default::default()
        })
        .await
        .unwrap();
        let storage: Arc<dyn StorageBackend> = Arc::new(storage);
        (Arc::new(CacheBroker::building(storage)), temp)
    }

    fn idle_producer() -> JoinHandle<Result<()>> {
        tokio::spawn(async { Ok(()) })
    }

    fn builder_for(broker: Arc<CacheBroker>, shards: &[&str]) -> CacheBuilder {
        let names: Vec<String> = shards.iter().map(|s| s.to_string()).collect();
        let statuses = names
            .iter()
            .map(|n| (n.clone(), ShardStatus::new(idle_producer(), None)))
            .collect();
        CacheBuilder::new(broker, names, statuses)
    }

    fn chunk(shard: &str, index: usize) -> ChunkMetadata {
        ChunkMetadata::new(shard, index, 10, Default::default())
    }

    fn new_chunks(shard: &str, range: std::ops::Range<usize>) -> BuilderMessage {
        BuilderMessage::NewChunks {
            shard: shard.to_string(),
            chunks: range.map(|i| chunk(shard, i)).collect(),
        }
    }

    fn finished(shard: &str) -> BuilderMessage {
        BuilderMessage::ShardFinished {
            shard: shard.to_string(),
        }
    }

    async fn emitted_names(broker: &CacheBroker) -> Vec<String> {
        broker.chunks().await.into_iter().map(|c| c.name).collect()
    }

    #[tokio::test]
    async fn test_round_robin_retires_exhausted_shards() {
        let (broker, _temp) = broker().await;
        let mut builder = builder_for(broker.clone(), &["A", "B", "C"]);

        // Arrival order differs from the emitted order on purpose.
        builder.handle(new_chunks("B", 0..4)).await;
        builder.handle(finished("B")).await;
        builder.handle(new_chunks("C", 0..1)).await;
        builder.handle(finished("C")).await;
        assert!(emitted_names(&broker).await.is_empty());

        builder.handle(new_chunks("A", 0..2)).await;
        builder.handle(finished("A")).await;

        assert_eq!(
            emitted_names(&broker).await,
            vec![
                "A/chunk-0", "B/chunk-0", "C/chunk-0", "A/chunk-1", "B/chunk-1", "B/chunk-2",
                "B/chunk-3"
            ]
        );
        assert!(builder.finished);
        assert!(broker.is_finished());
    }

    #[tokio::test]
    async fn test_slow_head_stalls_emission() {
        let (broker, _temp) = broker().await;
        let mut builder = builder_for(broker.clone(), &["A", "B"]);

        builder.handle(new_chunks("B", 0..3)).await;
        assert!(emitted_names(&broker).await.is_empty());

        builder.handle(new_chunks("A", 0..1)).await;
        assert_eq!(emitted_names(&broker).await, vec!["A/chunk-0", "B/chunk-0"]);
        assert!(!builder.finished);
    }

    #[tokio::test]
    async fn test_zero_shards_finalize_immediately() {
        let (broker, temp) = broker().await;
        let (_handle, rx) = BuilderHandle::channel();
        let builder = builder_for(broker.clone(), &[]);

        tokio::time::timeout(Duration::from_secs(5), builder.run(rx))
            .await
            .unwrap();

        assert!(broker.is_finished());
        assert_eq!(broker.final_chunk_count().await, Some(0));
        assert!(temp.path().join(LEDGER_FILE_NAME).exists());
    }

    #[tokio::test]
    async fn test_metrics_track_arrivals() {
        let (broker, _temp) = broker().await;
        let mut builder = builder_for(broker.clone(), &["A", "B"]);

        builder.handle(new_chunks("B", 0..2)).await;
        builder.handle(finished("B")).await;

        let metrics = broker.latest_metrics();
        assert_eq!(metrics.chunks_finished, 2);
        assert_eq!(metrics.rows_finished, 20);
        assert_eq!(metrics.shards_finished, 1);
        assert!(!metrics.is_finished);
    }

    #[tokio::test]
    async fn test_notifications_after_finish_are_ignored() {
        let (broker, _temp) = broker().await;
        let mut builder = builder_for(broker.clone(), &["A", "B"]);

        builder.handle(finished("A")).await;
        builder.handle(new_chunks("A", 0..1)).await;
        builder.handle(new_chunks("Z", 0..1)).await;

        assert_eq!(builder.metrics.chunks_finished, 0);
        assert!(emitted_names(&broker).await.is_empty());
    }

    #[tokio::test]
    async fn test_failure_stops_emission() {
        let (broker, _temp) = broker().await;
        let mut builder = builder_for(broker.clone(), &["A", "B"]);

        builder.handle(new_chunks("A", 0..1)).await;
        builder.handle(new_chunks("B", 0..1)).await;
        let failure = ShardFailure {
            shard: "A".to_string(),
            kind: "processing".to_string(),
            message: "boom".to_string(),
            causes: Vec::new(),
            backtrace: None,
        };
        builder
            .handle(BuilderMessage::ShardFailed {
                shard: "A".to_string(),
                failure: failure.clone(),
            })
            .await;

        assert!(builder.failed);
        assert_eq!(broker.status(), BuildStatus::Failed(failure));
    }

    #[tokio::test]
    async fn test_closed_mailbox_fails_build() {
        let (broker, _temp) = broker().await;
        let (handle, rx) = BuilderHandle::channel();
        drop(handle);
        let builder = builder_for(broker.clone(), &["A"]);

        builder.run(rx).await;

        match broker.status() {
            BuildStatus::Failed(failure) => {
                assert_eq!(failure.shard, "A");
                assert_eq!(failure.kind, "invalid_state");
            }
            other => panic!("unexpected status: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_gate_releases_on_emit() {
        let gate = Arc::new(ShardGate::new(1));
        gate.acquire(1);

        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.wait_for_capacity().await })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        let mut status = ShardStatus::new(idle_producer(), Some(gate.clone()));
        status.buffered.push_back(chunk("A", 0));
        assert!(status.pop_chunk_to_send().is_some());
        assert_eq!(gate.in_flight(), 0);

        tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_closed_gate_never_blocks() {
        let gate = ShardGate::new(1);
        gate.acquire(5);
        gate.close();
        tokio::time::timeout(Duration::from_secs(5), gate.wait_for_capacity())
            .await
            .unwrap();
    }
}

// rust/shard-cache/tests/cache_build.rs

//! End-to-end cache builds: ordering, resume, failure and reader behavior.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::TryStreamExt;
use shard_cache::metadata::{shard_progress_path, LEDGER_FILE_NAME};
use shard_cache::{
    BatchProcessor, BuildStatus, CacheConfig, CacheError, CacheLedger, ProcessedBatch, Result,
    RowIter, ShardCache, ShardProgress, ShardSource, WhitespaceTokenizer,
};
use tempfile::TempDir;

const WAIT: Duration = Duration::from_secs(10);

/// In-memory shards; one shard can be held back until released.
#[derive(Clone)]
struct MemorySource {
    shards: BTreeMap<String, Vec<String>>,
    held: Option<(String, Arc<AtomicBool>)>,
}

impl MemorySource {
    fn new(shards: &[(&str, usize)]) -> Self {
        let shards = shards
            .iter()
            .map(|(name, rows)| {
                let rows = (0..*rows).map(|i| format!("{name} row {i}")).collect();
                (name.to_string(), rows)
            })
            .collect();
        Self { shards, held: None }
    }

    fn holding(mut self, shard: &str) -> (Self, Arc<AtomicBool>) {
        let release = Arc::new(AtomicBool::new(false));
        self.held = Some((shard.to_string(), release.clone()));
        (self, release)
    }

    fn with_row(mut self, shard: &str, index: usize, row: &str) -> Self {
        if let Some(rows) = self.shards.get_mut(shard) {
            rows[index] = row.to_string();
        }
        self
    }
}

impl ShardSource for MemorySource {
    type Record = String;

    fn shard_names(&self) -> Vec<String> {
        self.shards.keys().cloned().collect()
    }

    fn open_shard_at_row(&self, shard: &str, row: u64) -> Result<RowIter<String>> {
        let rows = self
            .shards
            .get(shard)
            .ok_or_else(|| CacheError::config(format!("unknown shard '{shard}'")))?
            .clone();
        let release = match &self.held {
            Some((name, release)) if name == shard => Some(release.clone()),
            _ => None,
        };

        let iter = rows.into_iter().skip(row as usize).map(move |row| {
            if let Some(release) = &release {
                while !release.load(Ordering::SeqCst) {
                    std::thread::sleep(Duration::from_millis(5));
                }
            }
            Ok(row)
        });
        Ok(Box::new(iter))
    }
}

/// Tokenizes, counting calls; fails on rows containing "poison" and slows
/// down shards listed in `slow`.
#[derive(Default)]
struct TestProcessor {
    calls: AtomicUsize,
    slow: Vec<String>,
}

impl BatchProcessor<String> for TestProcessor {
    fn process(&self, batch: &[String]) -> Result<ProcessedBatch> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if batch.iter().any(|row| row.contains("poison")) {
            return Err(CacheError::serialization("poisoned row"));
        }
        if batch.iter().any(|row| self.slow.iter().any(|s| row.starts_with(s.as_str()))) {
            std::thread::sleep(Duration::from_millis(20));
        }
        WhitespaceTokenizer.process(batch)
    }
}

fn config(dir: &Path, rows_per_chunk: usize) -> CacheConfig {
    let mut config = CacheConfig::for_dir(dir);
    config.build.rows_per_chunk = rows_per_chunk;
    config
}

fn ledger(dir: &Path) -> CacheLedger {
    let data = std::fs::read(dir.join(LEDGER_FILE_NAME)).unwrap();
    serde_json::from_slice(&data).unwrap()
}

fn progress(dir: &Path, shard: &str) -> Option<ShardProgress> {
    let data = std::fs::read(dir.join(shard_progress_path(shard))).ok()?;
    serde_json::from_slice(&data).ok()
}

fn names(ledger: &CacheLedger) -> Vec<&str> {
    ledger.chunks.iter().map(|c| c.name.as_str()).collect()
}

async fn build(
    dir: &Path,
    rows_per_chunk: usize,
    source: MemorySource,
    processor: TestProcessor,
) -> Result<ShardCache> {
    let cache = ShardCache::build_or_load(&config(dir, rows_per_chunk), source, processor).await?;
    cache.await_finished(Some(WAIT)).await?;
    Ok(cache)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_round_robin_order_and_ledger() {
    let temp = TempDir::new().unwrap();
    let source = MemorySource::new(&[("A", 4), ("B", 8), ("C", 2)]);

    let cache = build(temp.path(), 2, source, TestProcessor::default()).await.unwrap();

    let ledger = ledger(temp.path());
    assert_eq!(
        names(&ledger),
        vec!["A/chunk-0", "B/chunk-0", "C/chunk-0", "A/chunk-1", "B/chunk-1", "B/chunk-2", "B/chunk-3"]
    );
    assert_eq!(cache.final_chunk_count().await, Some(7));
    assert_eq!(ledger.total_rows(), 14);

    let metrics = cache.latest_metrics();
    assert!(metrics.is_finished);
    assert_eq!(metrics.shards_finished, 3);
    assert_eq!(metrics.rows_finished, 14);
    // Three tokens per row.
    assert_eq!(metrics.field_counts.get("input_ids"), Some(&42));

    let payload = cache.read_chunk(1).await.unwrap();
    let rows: Vec<Vec<String>> = serde_json::from_slice(&payload).unwrap();
    assert_eq!(rows[0], vec!["B", "row", "0"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_order_independent_of_worker_speed() {
    let shards = [("s0", 5), ("s1", 3), ("s2", 7)];

    let fast = TempDir::new().unwrap();
    build(fast.path(), 2, MemorySource::new(&shards), TestProcessor::default())
        .await
        .unwrap();

    let skewed = TempDir::new().unwrap();
    let processor = TestProcessor {
        slow: vec!["s0".to_string()],
        ..Default::default()
    };
    build(skewed.path(), 2, MemorySource::new(&shards), processor)
        .await
        .unwrap();

    assert_eq!(ledger(fast.path()), ledger(skewed.path()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_failure_then_resume_matches_clean_build() {
    let shards = [("a", 6), ("b", 6)];

    let clean = TempDir::new().unwrap();
    build(clean.path(), 2, MemorySource::new(&shards), TestProcessor::default())
        .await
        .unwrap();

    let resumed = TempDir::new().unwrap();
    let poisoned = MemorySource::new(&shards).with_row("b", 4, "poison");
    let cache = ShardCache::build_or_load(
        &config(resumed.path(), 2),
        poisoned,
        TestProcessor::default(),
    )
    .await
    .unwrap();

    match cache.await_finished(Some(WAIT)).await {
        Err(CacheError::ShardFailed(failure)) => {
            assert_eq!(failure.shard, "b");
            assert!(failure.causes.iter().any(|c| c.contains("poisoned row")));
        }
        other => panic!("unexpected result: {other:?}"),
    }
    assert!(matches!(cache.status(), BuildStatus::Failed(_)));
    assert!(cache.get_chunk(0, None).await.is_err());
    assert!(!resumed.path().join(LEDGER_FILE_NAME).exists());

    // Shard b keeps the chunks it wrote before the poisoned batch.
    let b = progress(resumed.path(), "b").unwrap();
    assert_eq!(b.chunks.len(), 2);
    assert!(!b.is_finished);
    drop(cache);

    // Let shard a's worker finish persisting its progress.
    tokio::time::timeout(WAIT, async {
        while !progress(resumed.path(), "a").is_some_and(|p| p.is_finished) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    let processor = Arc::new(TestProcessor::default());
    let storage = Arc::new(
        shard_cache::LocalStorage::new(&config(resumed.path(), 2).storage)
            .await
            .unwrap(),
    );
    let cache = ShardCache::build_or_load_with_storage(
        storage,
        Arc::new(MemorySource::new(&shards)),
        processor.clone(),
        &config(resumed.path(), 2),
    )
    .await
    .unwrap();
    cache.await_finished(Some(WAIT)).await.unwrap();

    // Only b's last batch is processed again.
    assert_eq!(processor.calls.load(Ordering::SeqCst), 1);
    assert_eq!(ledger(clean.path()), ledger(resumed.path()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_finished_cache_is_loaded_not_rebuilt() {
    let temp = TempDir::new().unwrap();
    let shards = [("a", 3)];
    build(temp.path(), 2, MemorySource::new(&shards), TestProcessor::default())
        .await
        .unwrap();

    let processor = Arc::new(TestProcessor::default());
    let storage = Arc::new(
        shard_cache::LocalStorage::new(&config(temp.path(), 2).storage)
            .await
            .unwrap(),
    );
    let cache = ShardCache::build_or_load_with_storage(
        storage,
        Arc::new(MemorySource::new(&shards)),
        processor.clone(),
        &config(temp.path(), 2),
    )
    .await
    .unwrap();

    assert!(cache.is_finished());
    assert_eq!(cache.final_chunk_count().await, Some(2));
    assert_eq!(processor.calls.load(Ordering::SeqCst), 0);

    let loaded = ShardCache::load(&config(temp.path(), 2)).await.unwrap();
    assert_eq!(loaded.final_chunk_count().await, Some(2));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_zero_shards() {
    let temp = TempDir::new().unwrap();
    let cache = build(temp.path(), 2, MemorySource::new(&[]), TestProcessor::default())
        .await
        .unwrap();

    assert_eq!(cache.final_chunk_count().await, Some(0));
    assert!(ledger(temp.path()).is_empty());
    let looped: Vec<_> = cache.iter_chunks(0, 1, true).unwrap().try_collect().await.unwrap();
    assert!(looped.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_shard_named_after_ledger_is_rejected() {
    let temp = TempDir::new().unwrap();
    let source = MemorySource::new(&[("a", 2), ("cache_ledger", 2)]);
    let result =
        ShardCache::build_or_load(&config(temp.path(), 1), source, TestProcessor::default()).await;
    let err = match result {
        Ok(_) => panic!("shard 'cache_ledger' must be rejected"),
        Err(e) => e,
    };

    assert_eq!(err.kind(), "config");
    assert!(err.to_string().contains(LEDGER_FILE_NAME));
    assert!(!temp.path().join(LEDGER_FILE_NAME).exists());
    assert!(progress(temp.path(), "a").is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_shard_outside_cache_dir_is_rejected() {
    let temp = TempDir::new().unwrap();
    for shard in ["../escape", "/tmp/escape"] {
        let source = MemorySource::new(&[(shard, 1)]);
        let result =
            ShardCache::build_or_load(&config(temp.path(), 1), source, TestProcessor::default()).await;
        match result {
            Ok(_) => panic!("shard '{shard}' must be rejected"),
            Err(e) => assert_eq!(e.kind(), "config"),
        }
    }
    assert!(!temp.path().join(LEDGER_FILE_NAME).exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_strided_readers_partition_chunks() {
    let temp = TempDir::new().unwrap();
    let (source, release) = MemorySource::new(&[("a", 3), ("b", 2)]).holding("b");
    let cache =
        ShardCache::build_or_load(&config(temp.path(), 1), source, TestProcessor::default())
            .await
            .unwrap();

    // Readers start while shard b is still held back.
    let even = tokio::spawn(cache.iter_chunks(0, 2, false).unwrap().try_collect::<Vec<_>>());
    let odd = tokio::spawn(cache.iter_chunks(1, 2, false).unwrap().try_collect::<Vec<_>>());

    let first = cache.get_chunk(0, Some(WAIT)).await.unwrap();
    assert_eq!(first.name, "a/chunk-0");
    assert!(!cache.is_finished());
    release.store(true, Ordering::SeqCst);

    let even = even.await.unwrap().unwrap();
    let odd = odd.await.unwrap().unwrap();
    let even: Vec<_> = even.iter().map(|c| c.name.as_str()).collect();
    let odd: Vec<_> = odd.iter().map(|c| c.name.as_str()).collect();

    // Global order: a0 b0 a1 b1 a2.
    assert_eq!(even, vec!["a/chunk-0", "a/chunk-1", "a/chunk-2"]);
    assert_eq!(odd, vec!["b/chunk-0", "b/chunk-1"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_backpressure_bounds_run_ahead() {
    let temp = TempDir::new().unwrap();
    let (source, release) = MemorySource::new(&[("a", 1), ("b", 10)]).holding("a");
    let mut config = config(temp.path(), 1);
    config.build.max_buffered_chunks = Some(2);

    let cache = ShardCache::build_or_load(&config, source, TestProcessor::default())
        .await
        .unwrap();

    // b runs ahead of the held head shard until the gate closes on it.
    tokio::time::timeout(WAIT, async {
        while progress(temp.path(), "b").map_or(0, |p| p.chunks.len()) < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(progress(temp.path(), "b").unwrap().chunks.len(), 2);

    release.store(true, Ordering::SeqCst);
    cache.await_finished(Some(WAIT)).await.unwrap();
    assert_eq!(cache.final_chunk_count().await, Some(11));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_loop_mode_wraps() {
    let temp = TempDir::new().unwrap();
    let cache = build(temp.path(), 1, MemorySource::new(&[("a", 3)]), TestProcessor::default())
        .await
        .unwrap();

    let names: Vec<String> = futures::StreamExt::take(cache.iter_chunks(2, 1, true).unwrap(), 4)
        .map_ok(|c| c.name)
        .try_collect()
        .await
        .unwrap();
    assert_eq!(names, vec!["a/chunk-2", "a/chunk-0", "a/chunk-1", "a/chunk-2"]);
}

//! Shard Cache command line front-end
//!
//! Builds a shard cache from a directory of newline-delimited text files
//! (one shard per file, one record per line) and inspects finished caches.
//!
//! # Usage
//!
//! ```bash
//! # Build (or resume building) a cache
//! shard-cache build --input ./corpus --cache-dir ./cache
//!
//! # Build with a configuration file and smaller chunks
//! shard-cache build --input ./corpus --cache-dir ./cache --config cache.toml --rows-per-chunk 1024
//!
//! # Summarize a finished cache
//! shard-cache inspect --cache-dir ./cache
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use futures::StreamExt;
use serde_json::json;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use shard_cache::{
    CacheConfig, JsonFileMetricsMonitor, LineShardSource, LoggingMetricsMonitor, MetricsMonitor,
    ProgressBarMetricsMonitor, ShardCache, ShardSource, WhitespaceTokenizer,
};

/// Shard cache builder
#[derive(Parser, Debug)]
#[command(name = "shard-cache")]
#[command(about = "Build and inspect resumable shard caches")]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Build a cache, resuming any earlier partial build
    Build {
        /// Directory of shard files
        #[arg(short, long)]
        input: PathBuf,

        /// Cache directory
        #[arg(long)]
        cache_dir: PathBuf,

        /// Configuration file path
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Rows per chunk (overrides the configuration file)
        #[arg(long)]
        rows_per_chunk: Option<usize>,

        /// Also write build metrics to this JSON file
        #[arg(long)]
        metrics_file: Option<PathBuf>,

        /// Log progress lines instead of drawing a progress bar
        #[arg(long)]
        no_progress: bool,
    },
    /// Print a summary of a finished cache
    Inspect {
        /// Cache directory
        #[arg(long)]
        cache_dir: PathBuf,

        /// Read and decode every chunk
        #[arg(long)]
        verify: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Initialize logging
    let filter = tracing_subscriber::filter::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::filter::EnvFilter::new(&args.log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    match args.command {
        Command::Build {
            input,
            cache_dir,
            config,
            rows_per_chunk,
            metrics_file,
            no_progress,
        } => {
            let config = build_config(config.as_deref(), cache_dir, rows_per_chunk)?;
            build(&input, &config, metrics_file, !no_progress).await?;
        }
        Command::Inspect { cache_dir, verify } => {
            let config = CacheConfig::for_dir(cache_dir).with_env_overrides();
            let summary = inspect(&config, verify).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
    }

    Ok(())
}

fn build_config(
    path: Option<&Path>,
    cache_dir: PathBuf,
    rows_per_chunk: Option<usize>,
) -> shard_cache::Result<CacheConfig> {
    let mut config = match path {
        Some(path) => CacheConfig::from_file(path)?,
        None => CacheConfig::default(),
    }
    .with_env_overrides();

    config.storage.cache_dir = cache_dir;
    if let Some(rows) = rows_per_chunk {
        config.build.rows_per_chunk = rows;
    }
    config.validate()?;
    Ok(config)
}

async fn build(
    input: &Path,
    config: &CacheConfig,
    metrics_file: Option<PathBuf>,
    progress: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let source = LineShardSource::from_dir(input)?;
    let num_shards = source.shard_names().len() as u64;
    tracing::info!("Building cache at {}", config.storage.cache_dir.display());
    tracing::info!("  Input: {}", input.display());
    tracing::info!("  Rows per chunk: {}", config.build.rows_per_chunk);
    tracing::info!("  Compression: {}", config.chunk.compression);

    let cache = ShardCache::build_or_load(config, source, WhitespaceTokenizer).await?;

    let mut monitors: Vec<Arc<dyn MetricsMonitor>> = if progress {
        vec![Arc::new(ProgressBarMetricsMonitor::new(num_shards))]
    } else {
        vec![Arc::new(LoggingMetricsMonitor::default())]
    };
    if let Some(path) = metrics_file {
        monitors.push(Arc::new(JsonFileMetricsMonitor::new(path)));
    }
    for monitor in monitors {
        cache.attach_metrics_monitor(monitor).await;
    }

    tokio::select! {
        result = cache.await_finished(None) => {
            result?;
            cache.join_metrics_monitors().await;
            tracing::info!(
                "Cache complete with {} chunks",
                cache.final_chunk_count().await.unwrap_or_default()
            );
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupted; rerun to resume the build");
        }
    }

    Ok(())
}

async fn inspect(config: &CacheConfig, verify: bool) -> shard_cache::Result<serde_json::Value> {
    let cache = ShardCache::load(config).await?;
    let metrics = cache.latest_metrics();

    let mut summary = json!({
        "cache_dir": config.storage.cache_dir.display().to_string(),
        "shards": metrics.shards_finished,
        "chunks": metrics.chunks_finished,
        "rows": metrics.rows_finished,
        "field_counts": metrics.field_counts,
    });

    if verify {
        let mut payloads = cache.iter_payloads(0, 1, false)?;
        let mut bytes = 0u64;
        while let Some(payload) = payloads.next().await {
            bytes += payload?.len() as u64;
        }
        summary["payload_bytes"] = json!(bytes);
    }

    Ok(summary)
}

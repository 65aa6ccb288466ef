// rust/shard-cache/src/monitor.rs

//! Callbacks that observe build metrics.

use std::fmt::Write;
use std::path::PathBuf;

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};

use crate::metadata::InProgressMetrics;

/// Receives every metrics snapshot of a cache build, ending with the
/// snapshot whose `is_finished` is set.
pub trait MetricsMonitor: Send + Sync {
    fn on_metrics(&self, metrics: &InProgressMetrics);
}

impl<F> MetricsMonitor for F
where
    F: Fn(&InProgressMetrics) + Send + Sync,
{
    fn on_metrics(&self, metrics: &InProgressMetrics) {
        self(metrics)
    }
}

/// Logs progress through `tracing`.
#[derive(Debug, Clone)]
pub struct LoggingMetricsMonitor {
    prefix: String,
}

impl LoggingMetricsMonitor {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }
}

impl Default for LoggingMetricsMonitor {
    fn default() -> Self {
        Self::new("")
    }
}

impl MetricsMonitor for LoggingMetricsMonitor {
    fn on_metrics(&self, metrics: &InProgressMetrics) {
        let state = if metrics.is_finished { "done" } else { "in progress" };
        tracing::info!(
            "{}{}: Shards: {} | Chunks: {} | Docs: {}",
            self.prefix,
            state,
            metrics.shards_finished,
            metrics.chunks_finished,
            metrics.rows_finished
        );
    }
}

/// Rewrites a JSON document with the latest snapshot on every update.
///
/// Write errors are logged and otherwise ignored.
#[derive(Debug, Clone)]
pub struct JsonFileMetricsMonitor {
    path: PathBuf,
}

impl JsonFileMetricsMonitor {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    fn write(&self, metrics: &InProgressMetrics) -> std::io::Result<()> {
        let json = serde_json::to_vec_pretty(metrics)?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = crate::storage::temp_path(&self.path);
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.path)
    }
}

impl MetricsMonitor for JsonFileMetricsMonitor {
    fn on_metrics(&self, metrics: &InProgressMetrics) {
        if let Err(e) = self.write(metrics) {
            tracing::warn!("Failed to write metrics to {}: {}", self.path.display(), e);
        }
    }
}

/// Draws a terminal progress bar over the shards of a build.
///
/// The bar advances once per finished shard; its message carries the chunk,
/// row and per-field totals.
#[derive(Clone)]
pub struct ProgressBarMetricsMonitor {
    bar: ProgressBar,
}

impl ProgressBarMetricsMonitor {
    /// A bar drawn to stderr for a build over `num_shards` shards.
    pub fn new(num_shards: u64) -> Self {
        Self::with_draw_target(num_shards, ProgressDrawTarget::stderr())
    }

    /// A bar that tracks progress without drawing anything.
    pub fn hidden(num_shards: u64) -> Self {
        Self::with_draw_target(num_shards, ProgressDrawTarget::hidden())
    }

    fn with_draw_target(num_shards: u64, target: ProgressDrawTarget) -> Self {
        let style = ProgressStyle::with_template("{prefix} [{bar:25}] {pos}/{len} shards  {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=>-");
        let bar = ProgressBar::with_draw_target(Some(num_shards), target);
        bar.set_style(style);
        bar.set_prefix("Caching");
        Self { bar }
    }

    pub fn bar(&self) -> &ProgressBar {
        &self.bar
    }
}

impl MetricsMonitor for ProgressBarMetricsMonitor {
    fn on_metrics(&self, metrics: &InProgressMetrics) {
        let mut message = format!(
            "{} chunks, {} docs",
            metrics.chunks_finished, metrics.rows_finished
        );
        for (field, count) in &metrics.field_counts {
            let _ = write!(message, ", {field}: {count}");
        }

        // A loaded cache may report more shards than the caller expected.
        if self.bar.length().is_some_and(|len| metrics.shards_finished > len) {
            self.bar.set_length(metrics.shards_finished);
        }
        self.bar.set_position(metrics.shards_finished);

        if metrics.is_finished {
            self.bar.finish_with_message(message);
        } else {
            self.bar.set_message(message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use tempfile::TempDir;

    #[test]
    fn test_closure_monitor() {
        let seen = AtomicU64::new(0);
        let monitor = |m: &InProgressMetrics| {
            seen.store(m.rows_finished, Ordering::SeqCst);
        };
        monitor.on_metrics(&InProgressMetrics {
            rows_finished: 7,
            ..Default::default()
        });
        assert_eq!(seen.load(Ordering::SeqCst), 7);
    }

    #[test]
    fn test_json_file_monitor_overwrites() {
        let temp = TempDir::new().unwrap();
        let monitor = JsonFileMetricsMonitor::new(temp.path().join("stats/metrics.json"));

        monitor.on_metrics(&InProgressMetrics {
            chunks_finished: 1,
            ..Default::default()
        });
        let last = InProgressMetrics {
            chunks_finished: 2,
            is_finished: true,
            ..Default::default()
        };
        monitor.on_metrics(&last);

        let data = std::fs::read(monitor.path()).unwrap();
        let loaded: InProgressMetrics = serde_json::from_slice(&data).unwrap();
        assert_eq!(loaded, last);
        assert!(!temp.path().join("stats/metrics.json.tmp").exists());
    }

    #[test]
    fn test_progress_bar_monitor_tracks_shards() {
        let monitor = ProgressBarMetricsMonitor::hidden(3);

        monitor.on_metrics(&InProgressMetrics {
            chunks_finished: 4,
            rows_finished: 40,
            shards_finished: 1,
            field_counts: [("input_ids".to_string(), 120)].into_iter().collect(),
            ..Default::default()
        });
        assert_eq!(monitor.bar().position(), 1);
        assert_eq!(monitor.bar().message(), "4 chunks, 40 docs, input_ids: 120");
        assert!(!monitor.bar().is_finished());

        monitor.on_metrics(&InProgressMetrics {
            chunks_finished: 9,
            rows_finished: 90,
            shards_finished: 3,
            is_finished: true,
            ..Default::default()
        });
        assert_eq!(monitor.bar().position(), 3);
        assert!(monitor.bar().is_finished());
    }

    #[test]
    fn test_progress_bar_monitor_grows_past_expected_shards() {
        let monitor = ProgressBarMetricsMonitor::hidden(1);
        monitor.on_metrics(&InProgressMetrics {
            shards_finished: 2,
            is_finished: true,
            ..Default::default()
        });
        assert_eq!(monitor.bar().length(), Some(2));
        assert_eq!(monitor.bar().position(), 2);
    }
}

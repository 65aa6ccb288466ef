// rust/shard-cache/src/error.rs

use std::backtrace::{Backtrace, BacktraceStatus};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheError {

    #[error("Storage error at '{path}': {message}")]
    Storage {
        path: PathBuf,
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("Configuration error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Serialization error: {message}")]
    Serialization {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Chunk format error: {message}")]
    ChunkFormat {
        message: String,
    },

    #[error("Processing error in shard '{shard}': {message}")]
    Processing {
        shard: String,
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Cache build failed: {0}")]
    ShardFailed(ShardFailure),

    #[error("Chunk {index} out of range (total chunks: {total})")]
    ChunkOutOfRange {
        index: usize,
        total: usize,
    },

    #[error("Timed out after {timeout:?} waiting for {operation}")]
    Timeout {
        operation: String,
        timeout: Duration,
    },

    #[error("Invalid cache state: {message}")]
    InvalidState {
        message: String,
    },
}

pub type Result<T> = std::result::Result<T, CacheError>;

// Convenience constructors
impl CacheError {

    pub fn storage(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Storage {
            path: path.into(),
            message: message.into(),
            source: None,
        }
    }

    pub fn storage_with_source(
        path: impl Into<PathBuf>,
        message: impl Into<String>,
        source: std::io::Error,
    ) -> Self {
        Self::Storage {
            path: path.into(),
            message: message.into(),
            source: Some(source),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    pub fn config_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Config {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
            source: None,
        }
    }

    pub fn serialization_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Serialization {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn chunk_format(message: impl Into<String>) -> Self {
        Self::ChunkFormat {
            message: message.into(),
        }
    }

    pub fn processing(shard: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Processing {
            shard: shard.into(),
            message: message.into(),
            source: None,
        }
    }

    pub fn processing_with_source(
        shard: impl Into<String>,
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Processing {
            shard: shard.into(),
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn out_of_range(index: usize, total: usize) -> Self {
        Self::ChunkOutOfRange { index, total }
    }

    pub fn timeout(operation: impl Into<String>, timeout: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout,
        }
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState {
            message: message.into(),
        }
    }

    /// Short, stable name of the error category.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Storage { .. } => "storage",
            Self::Config { .. } => "config",
            Self::Serialization { .. } => "serialization",
            Self::ChunkFormat { .. } => "chunk_format",
            Self::Processing { .. } => "processing",
            Self::ShardFailed(_) => "shard_failed",
            Self::ChunkOutOfRange { .. } => "chunk_out_of_range",
            Self::Timeout { .. } => "timeout",
            Self::InvalidState { .. } => "invalid_state",
        }
    }

    /// Returns true if this error is a reader timeout rather than a failure.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Captured context of the error that terminated a shard worker.
///
/// `CacheError` wraps I/O errors and boxed trait objects, so it cannot be
/// cloned. A single failure has to reject every pending reader, so the worker
/// flattens the error into this cloneable record before reporting it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardFailure {
    /// Shard whose worker failed.
    pub shard: String,
    /// Category of the original error (see [`CacheError::kind`]).
    pub kind: String,
    /// Display text of the original error.
    pub message: String,
    /// Display text of each error in the source chain, outermost first.
    pub causes: Vec<String>,
    /// Stack of the worker where the failure was captured, when backtraces
    /// are enabled through `RUST_BACKTRACE` or `RUST_LIB_BACKTRACE`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backtrace: Option<String>,
}

impl ShardFailure {
    /// Captures the identity and source chain of `error` for `shard`, plus
    /// the current stack if backtraces are enabled.
    pub fn capture(shard: impl Into<String>, error: &CacheError) -> Self {
        Self::capture_with_backtrace(shard, error, &Backtrace::capture())
    }

    fn capture_with_backtrace(
        shard: impl Into<String>,
        error: &CacheError,
        backtrace: &Backtrace,
    ) -> Self {
        let mut causes = Vec::new();
        let mut source = std::error::Error::source(error);
        while let Some(cause) = source {
            causes.push(cause.to_string());
            source = cause.source();
        }

        Self {
            shard: shard.into(),
            kind: error.kind().to_string(),
            message: error.to_string(),
            causes,
            backtrace: match backtrace.status() {
                BacktraceStatus::Captured => Some(backtrace.to_string()),
                _ => None,
            },
        }
    }
}

impl fmt::Display for ShardFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "shard '{}' failed ({}): {}", self.shard, self.kind, self.message)?;
        for cause in &self.causes {
            write!(f, ": {cause}")?;
        }
        Ok(())
    }
}

impl From<ShardFailure> for CacheError {
    fn from(failure: ShardFailure) -> Self {
        Self::ShardFailed(failure)
    }
}

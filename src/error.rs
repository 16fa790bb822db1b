use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error kind persisted on a failed checkpoint record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureKind {
    Blocked,
    Timeout,
    Transport,
    ParseError,
    /// The worker handling the item panicked.
    WorkerPanic,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Blocked => "blocked",
            FailureKind::Timeout => "timeout",
            FailureKind::Transport => "transport",
            FailureKind::ParseError => "parse-error",
            FailureKind::WorkerPanic => "worker-panic",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Fetch ──

#[derive(Debug, Clone, Error)]
pub enum FetchError {
    #[error("blocked fetching {url} (status {status:?})")]
    Blocked { url: String, status: Option<u16> },

    #[error("timed out after {}s fetching {url}", elapsed.as_secs_f64())]
    Timeout { url: String, elapsed: Duration },

    #[error("transport failure fetching {url}: {message}")]
    Transport { url: String, message: String },
}

impl FetchError {
    pub fn transport(url: &str, err: impl fmt::Display) -> Self {
        FetchError::Transport {
            url: url.to_string(),
            message: err.to_string(),
        }
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            FetchError::Blocked { .. } => FailureKind::Blocked,
            FetchError::Timeout { .. } => FailureKind::Timeout,
            FetchError::Transport { .. } => FailureKind::Transport,
        }
    }
}

// ── Parse ──

#[derive(Debug, Clone, Error)]
pub enum ParseError {
    #[error("payload is empty")]
    Empty,

    #[error("pdf could not be decoded: {0}")]
    Pdf(String),

    #[error("no extractable text in {0} bytes")]
    NoText(usize),
}

// ── Integrity ──

/// Failures that make a step refuse to trust or publish what it read or wrote.
#[derive(Debug, Error)]
pub enum IntegrityError {
    #[error("checkpoint shard {path} is corrupt: {source}")]
    CorruptShard {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("checkpoint pointer {path} is corrupt: {source}")]
    CorruptPointer {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("checkpoint pointer names missing shard {0}")]
    MissingShard(PathBuf),

    #[error("export re-read {actual} rows, expected {expected}")]
    RowCountMismatch { expected: usize, actual: usize },

    #[error("export contains duplicate key {category}/{document_id}")]
    DuplicateKey {
        category: String,
        document_id: String,
    },

    #[error("export is missing {0} record(s)")]
    MissingKeys(usize),

    #[error("record store holds {actual} rows, expected {expected}")]
    StoreMismatch { expected: usize, actual: usize },
}

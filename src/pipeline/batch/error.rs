//! Error types for the resumable batch processor.
//!
//! Two layers:
//! - `OperationError`: one record's external call. Never aborts a batch;
//!   the runner folds it into a `RecordOutcome`.
//! - `BatchError`: run-level. Aborts the run (a checkpoint that cannot be
//!   written leaves no safe way to continue).

use std::path::PathBuf;

use thiserror::Error;

use crate::config::ConfigError;

/// Failure of a per-record external call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OperationError {
    /// Network failure, timeout, 5xx/429 status or malformed response body.
    #[error("transport error: {0}")]
    Transport(String),

    /// The record failed an acceptance predicate. A skip, not a failure.
    #[error("content rejected: {0}")]
    ContentRejected(String),

    /// Malformed URL, 4xx status, unsupported content, unreadable file.
    #[error("permanent input error: {0}")]
    PermanentInput(String),
}

impl OperationError {
    /// Only transport errors consume retry budget.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

#[derive(Error, Debug)]
pub enum BatchError {
    #[error("cannot write checkpoint {path}: {source}")]
    Persistence {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot read dataset {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed dataset {path}: {reason}")]
    MalformedInput { path: PathBuf, reason: String },

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("cannot start worker pool: {0}")]
    WorkerPool(#[from] rayon::ThreadPoolBuildError),
}

impl BatchError {
    pub fn malformed(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::MalformedInput {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

//! Trait definitions for the batch processor.
//!
//! Three seams keep the processor independent of any one pipeline stage:
//! - RecordOperation: the per-record external call (download, caption, OCR)
//! - DatasetStore: checkpoint persistence (save / load)
//! - Sleeper: pacing and backoff delays, swapped out in tests

use std::time::Duration;

use super::error::BatchError;
use super::types::{Dataset, RecordOutcome, RecordRef};

/// The per-record work of one pipeline stage.
///
/// Implementations apply their own retry policy and always return an
/// outcome. They must not panic on bad input.
pub trait RecordOperation: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Process one record.
    fn process(&self, record: RecordRef<'_>) -> RecordOutcome;
}

/// Persistence for a dataset and its checkpoints.
pub trait DatasetStore: Send + Sync {
    /// Load the last checkpoint. `Ok(None)` when none exists yet.
    fn load(&self) -> Result<Option<Dataset>, BatchError>;

    /// Overwrite the checkpoint with the full dataset.
    fn save(&self, dataset: &Dataset) -> Result<(), BatchError>;

    /// Whether a checkpoint has been written.
    fn exists(&self) -> bool;

    /// Human-readable location for logs.
    fn describe(&self) -> String;
}

/// Blocking delay source.
pub trait Sleeper: Send + Sync {
    fn sleep(&self, duration: Duration);
}

/// Real sleeper backed by `std::thread::sleep`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        if !duration.is_zero() {
            std::thread::sleep(duration);
        }
    }
}

/// Sleeper that records requested delays instead of blocking. For tests.
#[derive(Debug, Default)]
pub struct RecordingSleeper {
    delays: std::sync::Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn delays(&self) -> Vec<Duration> {
        match self.delays.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl Sleeper for RecordingSleeper {
    fn sleep(&self, duration: Duration) {
        match self.delays.lock() {
            Ok(mut guard) => guard.push(duration),
            Err(poisoned) => poisoned.into_inner().push(duration),
        }
    }
}

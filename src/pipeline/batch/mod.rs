//! Resumable Batch Processor
//!
//! Walks a CSV-backed dataset, calls one external operation per record and
//! checkpoints the whole dataset every N records, so a crashed or
//! interrupted run picks up where it stopped.
//!
//! ## Layout
//! ```text
//! store (load checkpoint) → runner (pending records) → op + retry → store (save)
//!                                   └─ pool (rayon pool of `workers` threads, Parallel schedule)
//! ```
//!
//! ## Rules
//! - A record is done once its result cell is non-empty; done records are
//!   never recomputed.
//! - Per-record failures are written as sentinels and never abort a run.
//! - A checkpoint that cannot be written aborts the run.

pub mod error;
pub mod types;
pub mod traits;
pub mod retry;
pub mod store;
pub mod pool;
pub mod runner;

pub use error::{BatchError, OperationError};
pub use types::*;
pub use traits::*;
pub use retry::RetryPolicy;
pub use store::{backup_once, read_csv, write_atomic, CsvDatasetStore, MemoryStore};
pub use pool::{run_bounded, WorkerPool};
pub use runner::{new_run_id, BatchProcessor};

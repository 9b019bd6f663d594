//! Core types for the resumable batch processor.
//!
//! These types model one run:
//! Dataset → pending Records → RecordOutcome → checkpoint → BatchSummary.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::error::{BatchError, OperationError};

/// Result cell written when a record fails permanently or exhausts its retries.
pub const FAILED_SENTINEL: &str = "[failed]";

/// Result cell written when a record is rejected by a filter.
pub const SKIPPED_SENTINEL: &str = "[skipped]";

/// Status cell written on success.
pub const STATUS_OK: &str = "ok";

/// Default name of the status column every stage carries.
pub const STATUS_COLUMN: &str = "status";

// ═══════════════════════════════════════════
// Records & Dataset
// ═══════════════════════════════════════════

/// One row of a dataset. `index` is its row position and never changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub index: usize,
    pub values: Vec<String>,
}

/// Read-only view of a record with column lookup, handed to operations.
#[derive(Debug, Clone, Copy)]
pub struct RecordRef<'a> {
    columns: &'a [String],
    record: &'a Record,
}

impl<'a> RecordRef<'a> {
    pub fn new(columns: &'a [String], record: &'a Record) -> Self {
        Self { columns, record }
    }

    pub fn index(&self) -> usize {
        self.record.index
    }

    /// Trimmed value of `column`. `None` when the column is absent or the cell blank.
    pub fn get(&self, column: &str) -> Option<&'a str> {
        let pos = self.columns.iter().position(|c| c == column)?;
        let value = self.record.values.get(pos)?.trim();
        if value.is_empty() {
            None
        } else {
            Some(value)
        }
    }

    pub fn get_or_empty(&self, column: &str) -> &'a str {
        self.get(column).unwrap_or("")
    }
}

/// An ordered table of records with a fixed column set.
///
/// Row order is preserved across load/save. Columns are only added by
/// `ensure_column`, which the processor calls before any record is touched.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Dataset {
    columns: Vec<String>,
    records: Vec<Record>,
}

impl Dataset {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            records: Vec::new(),
        }
    }

    /// Build a dataset from raw rows. Every row must match the header width.
    pub fn from_rows(columns: Vec<String>, rows: Vec<Vec<String>>) -> Result<Self, BatchError> {
        let mut dataset = Self::new(columns);
        for row in rows {
            dataset.push_row(row)?;
        }
        Ok(dataset)
    }

    pub fn push_row(&mut self, values: Vec<String>) -> Result<usize, BatchError> {
        if values.len() != self.columns.len() {
            return Err(BatchError::malformed(
                "<memory>",
                format!(
                    "row {} has {} fields, expected {}",
                    self.records.len(),
                    values.len(),
                    self.columns.len()
                ),
            ));
        }
        let index = self.records.len();
        self.records.push(Record { index, values });
        Ok(index)
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// Return the index of `name`, appending an empty column if it is missing.
    pub fn ensure_column(&mut self, name: &str) -> usize {
        if let Some(idx) = self.column_index(name) {
            return idx;
        }
        self.columns.push(name.to_string());
        for record in &mut self.records {
            record.values.push(String::new());
        }
        self.columns.len() - 1
    }

    pub fn record(&self, index: usize) -> Option<RecordRef<'_>> {
        self.records
            .get(index)
            .map(|r| RecordRef::new(&self.columns, r))
    }

    pub fn iter(&self) -> impl Iterator<Item = RecordRef<'_>> {
        self.records
            .iter()
            .map(move |r| RecordRef::new(&self.columns, r))
    }

    pub fn value(&self, index: usize, column: usize) -> &str {
        self.records
            .get(index)
            .and_then(|r| r.values.get(column))
            .map(String::as_str)
            .unwrap_or("")
    }

    pub fn set_value(&mut self, index: usize, column: usize, value: impl Into<String>) {
        if let Some(cell) = self
            .records
            .get_mut(index)
            .and_then(|r| r.values.get_mut(column))
        {
            *cell = value.into();
        }
    }
}

// ═══════════════════════════════════════════
// Per-record outcome
// ═══════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    Succeeded,
    Skipped,
    Failed,
}

/// What an operation produced for one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordOutcome {
    Success(String),
    Skipped(String),
    Failed(String),
}

impl RecordOutcome {
    /// Fold an operation error into an outcome: filter rejections skip, the rest fail.
    pub fn from_error(err: OperationError) -> Self {
        match err {
            OperationError::ContentRejected(reason) => Self::Skipped(reason),
            OperationError::Transport(reason) | OperationError::PermanentInput(reason) => {
                Self::Failed(reason)
            }
        }
    }

    pub fn from_result(result: Result<String, OperationError>) -> Self {
        match result {
            Ok(value) => Self::Success(value),
            Err(e) => Self::from_error(e),
        }
    }

    /// A blank success would leave the record looking pending on resume.
    pub fn normalized(self) -> Self {
        match self {
            Self::Success(value) if value.trim().is_empty() => {
                Self::Failed("operation returned an empty result".into())
            }
            other => other,
        }
    }

    pub fn kind(&self) -> OutcomeKind {
        match self {
            Self::Success(_) => OutcomeKind::Succeeded,
            Self::Skipped(_) => OutcomeKind::Skipped,
            Self::Failed(_) => OutcomeKind::Failed,
        }
    }

    pub fn result_cell(&self) -> &str {
        match self {
            Self::Success(value) => value,
            Self::Skipped(_) => SKIPPED_SENTINEL,
            Self::Failed(_) => FAILED_SENTINEL,
        }
    }

    pub fn status_cell(&self) -> String {
        match self {
            Self::Success(_) => STATUS_OK.to_string(),
            Self::Skipped(reason) => format!("skipped: {}", one_line(reason)),
            Self::Failed(reason) => format!("failed: {}", one_line(reason)),
        }
    }
}

fn one_line(reason: &str) -> String {
    reason.split_whitespace().collect::<Vec<_>>().join(" ")
}

// ═══════════════════════════════════════════
// Scheduling
// ═══════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Schedule {
    /// One record at a time, in index order.
    #[default]
    Sequential,
    /// Chunks of `save_interval` records spread across a fixed pool.
    Parallel { workers: usize },
}

/// Knobs for one processor run.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessorOptions {
    pub result_column: String,
    pub status_column: String,
    pub save_interval: usize,
    pub rate_limit_delay: Duration,
    pub schedule: Schedule,
    pub retry_failed: bool,
    /// Columns the loaded dataset must carry, checkpoint or fresh input alike.
    pub required_columns: Vec<String>,
}

impl ProcessorOptions {
    pub fn new(result_column: &str) -> Self {
        Self {
            result_column: result_column.to_string(),
            status_column: STATUS_COLUMN.to_string(),
            save_interval: 10,
            rate_limit_delay: Duration::ZERO,
            schedule: Schedule::Sequential,
            retry_failed: false,
            required_columns: Vec::new(),
        }
    }

    pub fn with_save_interval(mut self, interval: usize) -> Self {
        self.save_interval = interval.max(1);
        self
    }

    pub fn with_rate_limit_delay(mut self, delay: Duration) -> Self {
        self.rate_limit_delay = delay;
        self
    }

    pub fn with_schedule(mut self, schedule: Schedule) -> Self {
        self.schedule = schedule;
        self
    }

    pub fn with_retry_failed(mut self, retry_failed: bool) -> Self {
        self.retry_failed = retry_failed;
        self
    }

    pub fn with_required_columns(mut self, columns: &[&str]) -> Self {
        self.required_columns = columns.iter().map(|c| c.to_string()).collect();
        self
    }
}

// ═══════════════════════════════════════════
// Run summary & progress events
// ═══════════════════════════════════════════

/// Result of a full processor run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub run_id: String,
    pub total: usize,
    pub already_done: usize,
    pub succeeded: usize,
    pub skipped: usize,
    pub failed: usize,
    pub checkpoints: usize,
    pub resumed: bool,
    pub duration_ms: u64,
}

impl BatchSummary {
    pub fn empty(run_id: String) -> Self {
        Self {
            run_id,
            total: 0,
            already_done: 0,
            succeeded: 0,
            skipped: 0,
            failed: 0,
            checkpoints: 0,
            resumed: false,
            duration_ms: 0,
        }
    }

    pub fn processed(&self) -> usize {
        self.succeeded + self.skipped + self.failed
    }

    pub(crate) fn record(&mut self, kind: OutcomeKind) {
        match kind {
            OutcomeKind::Succeeded => self.succeeded += 1,
            OutcomeKind::Skipped => self.skipped += 1,
            OutcomeKind::Failed => self.failed += 1,
        }
    }
}

/// Event delivered to the optional progress callback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BatchStatusEvent {
    Started {
        run_id: String,
        total: usize,
        pending: usize,
    },
    Progress {
        completed: usize,
        pending: usize,
        index: usize,
        outcome: OutcomeKind,
    },
    Checkpointed {
        processed: usize,
    },
    Completed {
        succeeded: usize,
        skipped: usize,
        failed: usize,
        duration_ms: u64,
    },
}

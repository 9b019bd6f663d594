//! BatchProcessor: resumable, checkpointed pass over a dataset.
//!
//! Load checkpoint (or input) → find pending records → process → checkpoint
//! every `save_interval` records → pace → final checkpoint.
//!
//! A record is pending while its result cell is blank. Populated cells are
//! never recomputed, which makes a rerun against the processor's own output
//! a no-op.

use std::sync::Arc;
use std::time::Instant;

use uuid::Uuid;

use super::error::BatchError;
use super::pool::WorkerPool;
use super::traits::{DatasetStore, RecordOperation, Sleeper, ThreadSleeper};
use super::types::*;

/// Orchestrates one resumable run.
pub struct BatchProcessor {
    store: Box<dyn DatasetStore>,
    sleeper: Arc<dyn Sleeper>,
    options: ProcessorOptions,
}

/// Column positions resolved once per run.
#[derive(Debug, Clone, Copy)]
struct OutputColumns {
    result: usize,
    status: usize,
}

impl BatchProcessor {
    pub fn new(store: Box<dyn DatasetStore>, options: ProcessorOptions) -> Self {
        Self {
            store,
            sleeper: Arc::new(ThreadSleeper),
            options,
        }
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn options(&self) -> &ProcessorOptions {
        &self.options
    }

    /// Process every pending record of the checkpoint, or of `input` when no
    /// checkpoint exists yet. `input` is only called in the latter case.
    pub fn run<F>(
        &self,
        input: F,
        op: &dyn RecordOperation,
        progress_fn: Option<&dyn Fn(BatchStatusEvent)>,
    ) -> Result<(Dataset, BatchSummary), BatchError>
    where
        F: FnOnce() -> Result<Dataset, BatchError>,
    {
        let start = Instant::now();
        let mut summary = BatchSummary::empty(new_run_id());

        let (mut dataset, resumed) = match self.store.load()? {
            Some(checkpoint) => (checkpoint, true),
            None => (input()?, false),
        };
        summary.resumed = resumed;

        if let Some(missing) = self
            .options
            .required_columns
            .iter()
            .find(|column| dataset.column_index(column).is_none())
        {
            return Err(BatchError::malformed(
                self.store.describe(),
                format!("missing required column {missing:?}"),
            ));
        }

        let columns = OutputColumns {
            result: dataset.ensure_column(&self.options.result_column),
            status: dataset.ensure_column(&self.options.status_column),
        };

        if self.options.retry_failed {
            let cleared = clear_failed(&mut dataset, columns);
            if cleared > 0 {
                tracing::info!(cleared, "Cleared failed records for another attempt");
            }
        }

        let pending: Vec<usize> = (0..dataset.len())
            .filter(|&idx| dataset.value(idx, columns.result).trim().is_empty())
            .collect();

        summary.total = dataset.len();
        summary.already_done = dataset.len() - pending.len();

        tracing::info!(
            run_id = %summary.run_id,
            operation = op.name(),
            store = %self.store.describe(),
            total = summary.total,
            pending = pending.len(),
            resumed,
            "Batch run starting"
        );

        if pending.is_empty() {
            if !self.store.exists() {
                self.store.save(&dataset)?;
                summary.checkpoints += 1;
            }
            summary.duration_ms = start.elapsed().as_millis() as u64;
            tracing::info!(run_id = %summary.run_id, "Nothing pending, batch already complete");
            return Ok((dataset, summary));
        }

        if let Some(progress) = progress_fn {
            progress(BatchStatusEvent::Started {
                run_id: summary.run_id.clone(),
                total: summary.total,
                pending: pending.len(),
            });
        }

        match self.options.schedule {
            Schedule::Sequential => {
                self.run_sequential(&mut dataset, &pending, columns, op, &mut summary, progress_fn)?
            }
            Schedule::Parallel { workers } => self.run_parallel(
                &mut dataset,
                &pending,
                columns,
                op,
                workers,
                &mut summary,
                progress_fn,
            )?,
        }

        summary.duration_ms = start.elapsed().as_millis() as u64;

        tracing::info!(
            run_id = %summary.run_id,
            succeeded = summary.succeeded,
            skipped = summary.skipped,
            failed = summary.failed,
            checkpoints = summary.checkpoints,
            duration_ms = summary.duration_ms,
            "Batch run completed"
        );

        if let Some(progress) = progress_fn {
            progress(BatchStatusEvent::Completed {
                succeeded: summary.succeeded,
                skipped: summary.skipped,
                failed: summary.failed,
                duration_ms: summary.duration_ms,
            });
        }

        Ok((dataset, summary))
    }

    fn run_sequential(
        &self,
        dataset: &mut Dataset,
        pending: &[usize],
        columns: OutputColumns,
        op: &dyn RecordOperation,
        summary: &mut BatchSummary,
        progress_fn: Option<&dyn Fn(BatchStatusEvent)>,
    ) -> Result<(), BatchError> {
        let interval = self.options.save_interval.max(1);

        for (n, &idx) in pending.iter().enumerate() {
            let outcome = match dataset.record(idx) {
                Some(record) => op.process(record),
                None => continue,
            };
            self.apply(dataset, idx, outcome, columns, op, summary, pending.len(), progress_fn);

            let processed = n + 1;
            let is_last = processed == pending.len();
            if processed % interval == 0 || is_last {
                self.checkpoint(dataset, summary, progress_fn)?;
            }
            if !is_last {
                self.pace();
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn run_parallel(
        &self,
        dataset: &mut Dataset,
        pending: &[usize],
        columns: OutputColumns,
        op: &dyn RecordOperation,
        workers: usize,
        summary: &mut BatchSummary,
        progress_fn: Option<&dyn Fn(BatchStatusEvent)>,
    ) -> Result<(), BatchError> {
        let interval = self.options.save_interval.max(1);
        let chunks: Vec<&[usize]> = pending.chunks(interval).collect();
        let pool = WorkerPool::new(workers)?;

        for (c, chunk) in chunks.iter().enumerate() {
            let snapshot: &Dataset = dataset;
            let outcomes = pool.map(chunk.to_vec(), |idx| {
                let outcome = snapshot
                    .record(idx)
                    .map(|record| op.process(record))
                    .unwrap_or_else(|| RecordOutcome::Failed("record vanished".into()));
                (idx, outcome)
            });

            for (idx, outcome) in outcomes {
                self.apply(dataset, idx, outcome, columns, op, summary, pending.len(), progress_fn);
            }
            self.checkpoint(dataset, summary, progress_fn)?;

            if c + 1 < chunks.len() {
                self.pace();
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn apply(
        &self,
        dataset: &mut Dataset,
        idx: usize,
        outcome: RecordOutcome,
        columns: OutputColumns,
        op: &dyn RecordOperation,
        summary: &mut BatchSummary,
        pending_total: usize,
        progress_fn: Option<&dyn Fn(BatchStatusEvent)>,
    ) {
        let outcome = outcome.normalized();
        match &outcome {
            RecordOutcome::Success(_) => {
                tracing::debug!(operation = op.name(), index = idx, "Record processed");
            }
            RecordOutcome::Skipped(reason) => {
                tracing::info!(operation = op.name(), index = idx, reason = %reason, "Record skipped");
            }
            RecordOutcome::Failed(reason) => {
                tracing::warn!(operation = op.name(), index = idx, reason = %reason, "Record failed");
            }
        }

        dataset.set_value(idx, columns.result, outcome.result_cell());
        dataset.set_value(idx, columns.status, outcome.status_cell());
        summary.record(outcome.kind());

        if let Some(progress) = progress_fn {
            progress(BatchStatusEvent::Progress {
                completed: summary.processed(),
                pending: pending_total,
                index: idx,
                outcome: outcome.kind(),
            });
        }
    }

    fn pace(&self) {
        if !self.options.rate_limit_delay.is_zero() {
            self.sleeper.sleep(self.options.rate_limit_delay);
        }
    }

    fn checkpoint(
        &self,
        dataset: &Dataset,
        summary: &mut BatchSummary,
        progress_fn: Option<&dyn Fn(BatchStatusEvent)>,
    ) -> Result<(), BatchError> {
        self.store.save(dataset).inspect_err(|e| {
            tracing::error!(store = %self.store.describe(), error = %e, "Checkpoint failed, aborting run");
        })?;
        summary.checkpoints += 1;
        tracing::info!(
            processed = summary.processed(),
            store = %self.store.describe(),
            "Saved progress"
        );
        if let Some(progress) = progress_fn {
            progress(BatchStatusEvent::Checkpointed {
                processed: summary.processed(),
            });
        }
        Ok(())
    }
}

fn clear_failed(dataset: &mut Dataset, columns: OutputColumns) -> usize {
    let failed: Vec<usize> = (0..dataset.len())
        .filter(|&idx| dataset.value(idx, columns.result) == FAILED_SENTINEL)
        .collect();
    for &idx in &failed {
        dataset.set_value(idx, columns.result, "");
        dataset.set_value(idx, columns.status, "");
    }
    failed.len()
}

pub fn new_run_id() -> String {
    Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::batch::store::{CsvDatasetStore, MemoryStore};
    use crate::pipeline::batch::traits::RecordingSleeper;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Returns "ok-<index>" and counts calls per record.
    struct CountingOp {
        calls: Mutex<HashMap<usize, usize>>,
        fail_on: Vec<usize>,
    }

    impl CountingOp {
        fn new() -> Self {
            Self {
                calls: Mutex::new(HashMap::new()),
                fail_on: Vec::new(),
            }
        }

        fn failing_on(indices: &[usize]) -> Self {
            Self {
                calls: Mutex::new(HashMap::new()),
                fail_on: indices.to_vec(),
            }
        }

        fn calls_for(&self, idx: usize) -> usize {
            self.calls.lock().unwrap().get(&idx).copied().unwrap_or(0)
        }

        fn total_calls(&self) -> usize {
            self.calls.lock().unwrap().values().sum()
        }
    }

    impl RecordOperation for CountingOp {
        fn name(&self) -> &str {
            "counting"
        }

        fn process(&self, record: RecordRef<'_>) -> RecordOutcome {
            *self.calls.lock().unwrap().entry(record.index()).or_insert(0) += 1;
            if self.fail_on.contains(&record.index()) {
                RecordOutcome::Failed("upstream kept failing".into())
            } else {
                RecordOutcome::Success(format!("ok-{}", record.index()))
            }
        }
    }

    fn dataset(rows: usize) -> Dataset {
        Dataset::from_rows(
            vec!["original_url".into(), "caption".into()],
            (0..rows)
                .map(|i| vec![format!("http://img/{i}.jpg"), String::new()])
                .collect(),
        )
        .unwrap()
    }

    fn results(ds: &Dataset) -> Vec<String> {
        let col = ds.column_index("caption").unwrap();
        (0..ds.len()).map(|i| ds.value(i, col).to_string()).collect()
    }

    fn processor(store: Box<dyn DatasetStore>, interval: usize) -> (BatchProcessor, Arc<RecordingSleeper>) {
        let sleeper = Arc::new(RecordingSleeper::new());
        let options = ProcessorOptions::new("caption")
            .with_save_interval(interval)
            .with_rate_limit_delay(Duration::from_millis(250));
        let processor = BatchProcessor::new(store, options).with_sleeper(sleeper.clone());
        (processor, sleeper)
    }

    /// Store wrapper that exposes its inner MemoryStore to the test.
    struct SharedStore(Arc<MemoryStore>);

    impl DatasetStore for SharedStore {
        fn load(&self) -> Result<Option<Dataset>, BatchError> {
            self.0.load()
        }
        fn save(&self, dataset: &Dataset) -> Result<(), BatchError> {
            self.0.save(dataset)
        }
        fn exists(&self) -> bool {
            self.0.exists()
        }
        fn describe(&self) -> String {
            self.0.describe()
        }
    }

    #[test]
    fn five_rows_interval_two_checkpoints_after_1_3_4() {
        let memory = Arc::new(MemoryStore::new());
        let (processor, _) = processor(Box::new(SharedStore(memory.clone())), 2);
        let op = CountingOp::new();

        let (out, summary) = processor.run(|| Ok(dataset(5)), &op, None).unwrap();

        assert_eq!(results(&out), vec!["ok-0", "ok-1", "ok-2", "ok-3", "ok-4"]);
        assert_eq!(summary.checkpoints, 3);

        let snapshots = memory.snapshots();
        assert_eq!(snapshots.len(), 3);
        // Checkpoint 1 is taken right after row 1, checkpoint 2 after row 3.
        assert_eq!(results(&snapshots[0]), vec!["ok-0", "ok-1", "", "", ""]);
        assert_eq!(results(&snapshots[1]), vec!["ok-0", "ok-1", "ok-2", "ok-3", ""]);
        assert_eq!(results(&snapshots[2]), results(&out));
    }

    #[test]
    fn checkpoint_missing_required_column_is_rejected_untouched() {
        let checkpoint = Dataset::from_rows(
            vec!["title".into(), "url".into()],
            vec![vec!["hello".into(), "http://x/1.jpg".into()]],
        )
        .unwrap();
        let memory = Arc::new(MemoryStore::with_checkpoint(checkpoint));
        let options = ProcessorOptions::new("caption").with_required_columns(&["original_url"]);
        let processor = BatchProcessor::new(Box::new(SharedStore(memory.clone())), options)
            .with_sleeper(Arc::new(RecordingSleeper::new()));
        let op = CountingOp::new();

        let err = processor.run(|| Ok(dataset(1)), &op, None).unwrap_err();

        assert!(matches!(err, BatchError::MalformedInput { .. }));
        assert!(err.to_string().contains("original_url"));
        assert_eq!(op.total_calls(), 0);
        assert_eq!(memory.save_count(), 0);
    }

    #[test]
    fn fresh_input_missing_required_column_is_rejected() {
        let options = ProcessorOptions::new("caption").with_required_columns(&["original_url"]);
        let processor = BatchProcessor::new(Box::new(MemoryStore::new()), options);
        let input = Dataset::from_rows(vec!["url".into()], vec![vec!["http://x".into()]]).unwrap();

        let err = processor.run(|| Ok(input), &CountingOp::new(), None).unwrap_err();
        assert!(matches!(err, BatchError::MalformedInput { .. }));
    }

    #[test]
    fn final_record_on_interval_boundary_saves_once() {
        let memory = Arc::new(MemoryStore::new());
        let (processor, _) = processor(Box::new(SharedStore(memory.clone())), 2);

        let (_, summary) = processor.run(|| Ok(dataset(4)), &CountingOp::new(), None).unwrap();

        assert_eq!(summary.checkpoints, 2);
        assert_eq!(memory.save_count(), 2);
    }

    #[test]
    fn pacing_applied_between_records_only() {
        let (processor, sleeper) = processor(Box::new(MemoryStore::new()), 10);
        processor.run(|| Ok(dataset(3)), &CountingOp::new(), None).unwrap();
        assert_eq!(sleeper.delays(), vec![Duration::from_millis(250); 2]);
    }

    #[test]
    fn prepopulated_row_is_never_processed() {
        let mut input = dataset(3);
        let col = input.column_index("caption").unwrap();
        input.set_value(1, col, "hand-written caption");

        let (processor, _) = processor(Box::new(MemoryStore::new()), 2);
        let op = CountingOp::new();
        let (out, summary) = processor.run(|| Ok(input), &op, None).unwrap();

        assert_eq!(op.calls_for(1), 0);
        assert_eq!(out.value(1, col), "hand-written caption");
        assert_eq!(summary.already_done, 1);
        assert_eq!(summary.succeeded, 2);
    }

    #[test]
    fn resumes_from_checkpoint_instead_of_input() {
        let mut checkpoint = dataset(4);
        let col = checkpoint.ensure_column("caption");
        checkpoint.set_value(0, col, "ok-0");
        checkpoint.set_value(1, col, "ok-1");

        let (processor, _) = processor(Box::new(MemoryStore::with_checkpoint(checkpoint)), 10);
        let op = CountingOp::new();
        let (out, summary) = processor
            .run(|| panic!("input must not be read when a checkpoint exists"), &op, None)
            .unwrap();

        assert!(summary.resumed);
        assert_eq!(op.calls_for(0) + op.calls_for(1), 0);
        assert_eq!(op.total_calls(), 2);
        assert_eq!(results(&out), vec!["ok-0", "ok-1", "ok-2", "ok-3"]);
    }

    #[test]
    fn rerun_against_own_output_is_noop() {
        let memory = Arc::new(MemoryStore::new());
        let (first, _) = processor(Box::new(SharedStore(memory.clone())), 3);
        let (done, _) = first.run(|| Ok(dataset(7)), &CountingOp::new(), None).unwrap();
        let saves_after_first = memory.save_count();

        let (second, sleeper) = processor(Box::new(SharedStore(memory.clone())), 3);
        let op = CountingOp::new();
        let (again, summary) = second.run(|| Ok(dataset(7)), &op, None).unwrap();

        assert_eq!(op.total_calls(), 0);
        assert_eq!(again, done);
        assert_eq!(memory.save_count(), saves_after_first);
        assert_eq!(summary.already_done, 7);
        assert!(sleeper.delays().is_empty());
    }

    #[test]
    fn failed_record_does_not_stop_the_batch() {
        let (processor, _) = processor(Box::new(MemoryStore::new()), 2);
        let op = CountingOp::failing_on(&[1]);

        let (out, summary) = processor.run(|| Ok(dataset(3)), &op, None).unwrap();

        assert_eq!(results(&out), vec!["ok-0", FAILED_SENTINEL, "ok-2"]);
        let status = out.column_index(STATUS_COLUMN).unwrap();
        assert_eq!(out.value(1, status), "failed: upstream kept failing");
        assert_eq!(out.value(0, status), STATUS_OK);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.succeeded, 2);
    }

    #[test]
    fn failed_records_stay_failed_unless_retry_requested() {
        let memory = Arc::new(MemoryStore::new());
        let (first, _) = processor(Box::new(SharedStore(memory.clone())), 5);
        first.run(|| Ok(dataset(3)), &CountingOp::failing_on(&[2]), None).unwrap();

        let (plain, _) = processor(Box::new(SharedStore(memory.clone())), 5);
        let op = CountingOp::new();
        plain.run(|| Ok(dataset(3)), &op, None).unwrap();
        assert_eq!(op.total_calls(), 0);

        let options = ProcessorOptions::new("caption").with_retry_failed(true);
        let retrying = BatchProcessor::new(Box::new(SharedStore(memory.clone())), options)
            .with_sleeper(Arc::new(RecordingSleeper::new()));
        let op = CountingOp::new();
        let (out, summary) = retrying.run(|| Ok(dataset(3)), &op, None).unwrap();
        assert_eq!(op.calls_for(2), 1);
        assert_eq!(results(&out)[2], "ok-2");
        assert_eq!(summary.succeeded, 1);
    }

    #[test]
    fn empty_result_is_recorded_as_failure() {
        struct BlankOp;
        impl RecordOperation for BlankOp {
            fn name(&self) -> &str {
                "blank"
            }
            fn process(&self, _: RecordRef<'_>) -> RecordOutcome {
                RecordOutcome::Success(String::new())
            }
        }

        let (processor, _) = processor(Box::new(MemoryStore::new()), 1);
        let (out, summary) = processor.run(|| Ok(dataset(1)), &BlankOp, None).unwrap();
        assert_eq!(results(&out), vec![FAILED_SENTINEL]);
        assert_eq!(summary.failed, 1);
    }

    #[test]
    fn nothing_pending_writes_output_once_when_missing() {
        let mut input = dataset(2);
        let col = input.ensure_column("caption");
        input.set_value(0, col, "a");
        input.set_value(1, col, "b");

        let memory = Arc::new(MemoryStore::new());
        let (processor, _) = processor(Box::new(SharedStore(memory.clone())), 1);
        let (_, summary) = processor.run(|| Ok(input), &CountingOp::new(), None).unwrap();
        assert_eq!(summary.checkpoints, 1);
        assert_eq!(memory.save_count(), 1);
    }

    #[test]
    fn persistence_failure_aborts_run() {
        struct BrokenStore;
        impl DatasetStore for BrokenStore {
            fn load(&self) -> Result<Option<Dataset>, BatchError> {
                Ok(None)
            }
            fn save(&self, _: &Dataset) -> Result<(), BatchError> {
                Err(BatchError::Persistence {
                    path: "/read-only/out.csv".into(),
                    source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only"),
                })
            }
            fn exists(&self) -> bool {
                false
            }
            fn describe(&self) -> String {
                "broken".into()
            }
        }

        let (processor, _) = processor(Box::new(BrokenStore), 2);
        let op = CountingOp::new();
        let err = processor.run(|| Ok(dataset(5)), &op, None).unwrap_err();

        assert!(matches!(err, BatchError::Persistence { .. }));
        // Stopped at the first checkpoint
        assert_eq!(op.total_calls(), 2);
    }

    #[test]
    fn output_file_is_byte_reproducible() {
        let run_once = || {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("captions.csv");
            let (processor, _) = processor(Box::new(CsvDatasetStore::new(&path)), 2);
            processor
                .run(|| Ok(dataset(5)), &CountingOp::failing_on(&[3]), None)
                .unwrap();
            std::fs::read(&path).unwrap()
        };

        assert_eq!(run_once(), run_once());
    }

    #[test]
    fn progress_events_in_order() {
        let events = Mutex::new(Vec::new());
        let record = |e: BatchStatusEvent| events.lock().unwrap().push(e);

        let (processor, _) = processor(Box::new(MemoryStore::new()), 2);
        processor.run(|| Ok(dataset(2)), &CountingOp::new(), Some(&record)).unwrap();

        let events = events.into_inner().unwrap();
        assert!(matches!(events[0], BatchStatusEvent::Started { pending: 2, .. }));
        assert!(matches!(events[1], BatchStatusEvent::Progress { completed: 1, index: 0, .. }));
        assert!(matches!(events[2], BatchStatusEvent::Progress { completed: 2, index: 1, .. }));
        assert!(matches!(events[3], BatchStatusEvent::Checkpointed { processed: 2 }));
        assert!(matches!(events[4], BatchStatusEvent::Completed { succeeded: 2, .. }));
        assert_eq!(events.len(), 5);
    }

    #[test]
    fn parallel_schedule_checkpoints_per_chunk() {
        let memory = Arc::new(MemoryStore::new());
        let sleeper = Arc::new(RecordingSleeper::new());
        let options = ProcessorOptions::new("caption")
            .with_save_interval(4)
            .with_rate_limit_delay(Duration::from_millis(10))
            .with_schedule(Schedule::Parallel { workers: 3 });
        let processor = BatchProcessor::new(Box::new(SharedStore(memory.clone())), options)
            .with_sleeper(sleeper.clone());
        let op = CountingOp::failing_on(&[5]);

        let (out, summary) = processor.run(|| Ok(dataset(10)), &op, None).unwrap();

        let mut expected: Vec<String> = (0..10).map(|i| format!("ok-{i}")).collect();
        expected[5] = FAILED_SENTINEL.to_string();
        assert_eq!(results(&out), expected);
        assert_eq!(summary.checkpoints, 3);
        assert_eq!(memory.save_count(), 3);
        assert_eq!(sleeper.delays().len(), 2);
        assert!((0..10).all(|i| op.calls_for(i) == 1));
    }

    #[test]
    fn parallel_run_matches_sequential_output() {
        let sequential = {
            let (p, _) = processor(Box::new(MemoryStore::new()), 3);
            p.run(|| Ok(dataset(9)), &CountingOp::failing_on(&[4]), None).unwrap().0
        };
        let parallel = {
            let options = ProcessorOptions::new("caption")
                .with_save_interval(3)
                .with_schedule(Schedule::Parallel { workers: 8 });
            let p = BatchProcessor::new(Box::new(MemoryStore::new()), options)
                .with_sleeper(Arc::new(RecordingSleeper::new()));
            p.run(|| Ok(dataset(9)), &CountingOp::failing_on(&[4]), None).unwrap().0
        };
        assert_eq!(sequential, parallel);
    }

    #[test]
    fn run_ids_are_unique() {
        assert_ne!(new_run_id(), new_run_id());
    }
}

//! Augment stage: download each captioned image and write seeded variants.
//!
//! Work is tracked in a ledger dataset (the input plus `local_paths`, the
//! `;`-joined files written for the record). The ledger is processed on the
//! parallel schedule and checkpointed like any other dataset. Once it is
//! complete, it is flattened to one row per saved image.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;

use super::transforms::augment;
use super::{encode_jpeg, input_loader, processor_options, URL_COLUMN};
use crate::config::{BatchConfig, ConfigError};
use crate::pipeline::batch::{
    write_atomic, BatchError, BatchProcessor, BatchStatusEvent, BatchSummary, CsvDatasetStore,
    Dataset, DatasetStore, OperationError, RecordOperation, RecordOutcome, RecordRef,
    RetryPolicy, Schedule, Sleeper, STATUS_COLUMN, STATUS_OK,
};
use crate::pipeline::collaborators::ImageFetcher;

pub const LEDGER_COLUMN: &str = "local_paths";
pub const LEDGER_FILE: &str = "augment_ledger.csv";
pub const AUGMENTED_FILE: &str = "captions_augmented.csv";
pub const IMAGES_DIR: &str = "images";

const PATH_SEPARATOR: char = ';';

/// Columns of the flattened output, in order.
pub const AUGMENTED_COLUMNS: [&str; 6] = [
    "original_url",
    "source_website",
    "resolution",
    "search_query",
    "local_path",
    "short_caption",
];

pub struct AugmentOperation<'a> {
    fetcher: &'a dyn ImageFetcher,
    retry: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
    images_dir: PathBuf,
    variants: u32,
    seed: u64,
}

impl<'a> AugmentOperation<'a> {
    pub fn new(
        fetcher: &'a dyn ImageFetcher,
        retry: RetryPolicy,
        sleeper: Arc<dyn Sleeper>,
        images_dir: &Path,
        variants: u32,
        seed: u64,
    ) -> Self {
        Self {
            fetcher,
            retry,
            sleeper,
            images_dir: images_dir.to_path_buf(),
            variants,
            seed,
        }
    }

    fn save(&self, name: &str, img: &image::RgbImage) -> Result<String, OperationError> {
        let path = self.images_dir.join(name);
        let bytes = encode_jpeg(img)
            .map_err(|e| OperationError::PermanentInput(format!("cannot encode {name}: {e}")))?;
        write_atomic(&path, &bytes)
            .map_err(|e| OperationError::PermanentInput(e.to_string()))?;
        Ok(path.to_string_lossy().into_owned())
    }

    fn augment_record(&self, index: usize, url: &str) -> Result<String, OperationError> {
        let fetched = self
            .retry
            .run(self.sleeper.as_ref(), "fetch", |_| self.fetcher.fetch(url))?;
        let source = image::load_from_memory(&fetched.bytes)
            .map_err(|e| OperationError::PermanentInput(format!("cannot decode image: {e}")))?
            .to_rgb8();

        let mut paths = vec![self.save(&format!("image_{index}.jpg"), &source)?];
        for k in 0..self.variants {
            let variant = augment(&source, self.seed, index, k);
            paths.push(self.save(&format!("image_{index}_aug_{k}.jpg"), &variant)?);
        }
        Ok(paths.join(&PATH_SEPARATOR.to_string()))
    }
}

impl RecordOperation for AugmentOperation<'_> {
    fn name(&self) -> &str {
        "augment"
    }

    fn process(&self, record: RecordRef<'_>) -> RecordOutcome {
        match record.get(URL_COLUMN) {
            Some(url) => RecordOutcome::from_result(self.augment_record(record.index(), url)),
            None => RecordOutcome::Skipped("no image url".into()),
        }
    }
}

/// One output row per saved image of every successful ledger record, in record order.
pub fn flatten_ledger(ledger: &Dataset) -> Result<Dataset, BatchError> {
    let paths_col = ledger
        .column_index(LEDGER_COLUMN)
        .ok_or_else(|| BatchError::malformed(LEDGER_FILE, "ledger has no local_paths column"))?;
    let status_col = ledger.column_index(STATUS_COLUMN);

    let mut flat = Dataset::new(AUGMENTED_COLUMNS.iter().map(|c| c.to_string()).collect());
    for record in ledger.iter() {
        let ok = match status_col {
            Some(col) => ledger.value(record.index(), col) == STATUS_OK,
            None => true,
        };
        if !ok {
            continue;
        }
        for path in ledger
            .value(record.index(), paths_col)
            .split(PATH_SEPARATOR)
            .filter(|p| !p.is_empty())
        {
            let row = AUGMENTED_COLUMNS
                .iter()
                .map(|&column| match column {
                    "local_path" => path.to_string(),
                    other => record.get_or_empty(other).to_string(),
                })
                .collect();
            flat.push_row(row)?;
        }
    }
    Ok(flat)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AugmentSummary {
    pub ledger: BatchSummary,
    pub images: usize,
    pub output: PathBuf,
}

/// Run the ledger over `config.input_path` under `output_dir`, then write the
/// flattened dataset to `config.output_path` (default `captions_augmented.csv`).
pub fn run_augment(
    config: &BatchConfig,
    output_dir: &Path,
    fetcher: &dyn ImageFetcher,
    sleeper: Arc<dyn Sleeper>,
    progress_fn: Option<&dyn Fn(BatchStatusEvent)>,
) -> Result<AugmentSummary, BatchError> {
    let _span = tracing::info_span!("augment").entered();
    let input = config
        .input_path
        .clone()
        .ok_or_else(|| ConfigError::Invalid("input_path is required".into()))?;
    let output = config
        .output_path
        .clone()
        .unwrap_or_else(|| output_dir.join(AUGMENTED_FILE));
    let images_dir = output_dir.join(IMAGES_DIR);

    let op = AugmentOperation::new(
        fetcher,
        config.retry_policy(),
        sleeper.clone(),
        &images_dir,
        config.augment_variants,
        config.augment_seed,
    );
    let options = processor_options(config, LEDGER_COLUMN)
        .with_required_columns(&[URL_COLUMN])
        .with_schedule(Schedule::Parallel {
            workers: config.workers,
        });
    let processor = BatchProcessor::new(
        Box::new(CsvDatasetStore::new(output_dir.join(LEDGER_FILE))),
        options,
    )
    .with_sleeper(sleeper);

    let (ledger, summary) = processor.run(input_loader(&input), &op, progress_fn)?;

    let flat = flatten_ledger(&ledger)?;
    CsvDatasetStore::new(&output).save(&flat)?;

    tracing::info!(
        output = %output.display(),
        records = summary.total,
        images = flat.len(),
        "Augment stage finished"
    );

    Ok(AugmentSummary {
        ledger: summary,
        images: flat.len(),
        output,
    })
}

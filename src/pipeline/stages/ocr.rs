//! OCR stage: asks the remote endpoint about each image URL.

use std::sync::Arc;

use super::{csv_processor, input_loader, processor_options, StagePaths, URL_COLUMN};
use crate::config::BatchConfig;
use crate::pipeline::batch::{
    BatchError, BatchStatusEvent, BatchSummary, RecordOperation, RecordOutcome, RecordRef,
    RetryPolicy, Sleeper,
};
use crate::pipeline::collaborators::OcrClient;

pub const OCR_COLUMN: &str = "caption";

pub struct OcrOperation<'a> {
    client: &'a dyn OcrClient,
    retry: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
}

impl<'a> OcrOperation<'a> {
    pub fn new(client: &'a dyn OcrClient, retry: RetryPolicy, sleeper: Arc<dyn Sleeper>) -> Self {
        Self {
            client,
            retry,
            sleeper,
        }
    }
}

impl RecordOperation for OcrOperation<'_> {
    fn name(&self) -> &str {
        "ocr"
    }

    fn process(&self, record: RecordRef<'_>) -> RecordOutcome {
        let Some(url) = record.get(URL_COLUMN) else {
            return RecordOutcome::Skipped("no image url".into());
        };
        RecordOutcome::from_result(
            self.retry
                .run(self.sleeper.as_ref(), "ocr", |_| self.client.recognize(url)),
        )
    }
}

pub fn run_ocr(
    config: &BatchConfig,
    client: &dyn OcrClient,
    sleeper: Arc<dyn Sleeper>,
    progress_fn: Option<&dyn Fn(BatchStatusEvent)>,
) -> Result<BatchSummary, BatchError> {
    let _span = tracing::info_span!("ocr").entered();
    let paths = StagePaths::resolve(config)?;

    let op = OcrOperation::new(client, config.retry_policy(), sleeper.clone());
    let options = processor_options(config, OCR_COLUMN).with_required_columns(&[URL_COLUMN]);
    let processor = csv_processor(&paths.output, options, sleeper);
    let (_, summary) = processor.run(input_loader(&paths.input), &op, progress_fn)?;

    tracing::info!(
        output = %paths.output.display(),
        recognized = summary.succeeded,
        failed = summary.failed,
        "OCR stage finished"
    );
    Ok(summary)
}

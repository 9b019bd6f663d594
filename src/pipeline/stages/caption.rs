//! Caption stage: one short Vietnamese traffic description per image.

use std::sync::Arc;

use image::imageops::FilterType;

use super::{csv_processor, encode_jpeg, input_loader, processor_options, StagePaths, URL_COLUMN};
use crate::config::BatchConfig;
use crate::pipeline::batch::{
    BatchError, BatchStatusEvent, BatchSummary, OperationError, RecordOperation, RecordOutcome,
    RecordRef, RetryPolicy, Sleeper,
};
use crate::pipeline::collaborators::{ImageFetcher, VisionCaptioner};

pub const CAPTION_COLUMN: &str = "short_caption";

/// Longest side of the image sent to the captioner.
pub const MAX_CAPTION_SIDE: u32 = 800;

pub const DEFAULT_CAPTION_PROMPT: &str = "Mô tả tổng quan nhất về nội dung trong tấm hình, tập trung vào tình hình giao thông hiện tại. Hãy giữ mô tả ngắn gọn(khoảng 10-15 từ trong 1 câu), sao cho cả câu mô tả không được quá 15 từ, để người mù có thể nắm bắt được thông tin nhanh chóng.";

/// Decode, shrink to fit `MAX_CAPTION_SIDE` and re-encode as JPEG.
pub fn prepare_image(bytes: &[u8]) -> Result<Vec<u8>, OperationError> {
    let img = image::load_from_memory(bytes)
        .map_err(|e| OperationError::PermanentInput(format!("cannot decode image: {e}")))?;

    let img = if img.width() > MAX_CAPTION_SIDE || img.height() > MAX_CAPTION_SIDE {
        img.resize(MAX_CAPTION_SIDE, MAX_CAPTION_SIDE, FilterType::Lanczos3)
    } else {
        img
    };

    encode_jpeg(&img.to_rgb8())
        .map_err(|e| OperationError::PermanentInput(format!("cannot encode image: {e}")))
}

pub struct CaptionOperation<'a> {
    fetcher: &'a dyn ImageFetcher,
    captioner: &'a dyn VisionCaptioner,
    retry: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
    prompt: String,
}

impl<'a> CaptionOperation<'a> {
    pub fn new(
        fetcher: &'a dyn ImageFetcher,
        captioner: &'a dyn VisionCaptioner,
        retry: RetryPolicy,
        sleeper: Arc<dyn Sleeper>,
        prompt: &str,
    ) -> Self {
        Self {
            fetcher,
            captioner,
            retry,
            sleeper,
            prompt: prompt.to_string(),
        }
    }

    fn caption_record(&self, url: &str) -> Result<String, OperationError> {
        let fetched = self
            .retry
            .run(self.sleeper.as_ref(), "fetch", |_| self.fetcher.fetch(url))?;
        let jpeg = prepare_image(&fetched.bytes)?;
        self.retry.run(self.sleeper.as_ref(), "caption", |_| {
            self.captioner.caption(&jpeg, "image/jpeg", &self.prompt)
        })
    }
}

impl RecordOperation for CaptionOperation<'_> {
    fn name(&self) -> &str {
        "caption"
    }

    fn process(&self, record: RecordRef<'_>) -> RecordOutcome {
        match record.get(URL_COLUMN) {
            Some(url) => RecordOutcome::from_result(self.caption_record(url)),
            None => RecordOutcome::Skipped("no image url".into()),
        }
    }
}

/// Caption every pending record of `config.input_path`.
pub fn run_caption(
    config: &BatchConfig,
    fetcher: &dyn ImageFetcher,
    captioner: &dyn VisionCaptioner,
    prompt: &str,
    sleeper: Arc<dyn Sleeper>,
    progress_fn: Option<&dyn Fn(BatchStatusEvent)>,
) -> Result<BatchSummary, BatchError> {
    let _span = tracing::info_span!("caption").entered();
    let paths = StagePaths::resolve(config)?;

    let op = CaptionOperation::new(fetcher, captioner, config.retry_policy(), sleeper.clone(), prompt);
    let options = processor_options(config, CAPTION_COLUMN).with_required_columns(&[URL_COLUMN]);
    let processor = csv_processor(&paths.output, options, sleeper);
    let (_, summary) = processor.run(input_loader(&paths.input), &op, progress_fn)?;

    tracing::info!(
        output = %paths.output.display(),
        captioned = summary.succeeded,
        failed = summary.failed,
        "Caption stage finished"
    );
    Ok(summary)
}

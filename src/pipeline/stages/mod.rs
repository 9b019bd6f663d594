//! Dataset-building stages.
//!
//! Each stage is a `RecordOperation` plus a `run_*` entry point that wires
//! it to a `BatchProcessor`:
//! ```text
//! crawl   : queries → search_units.csv → traffic_images_dataset.csv + images/
//! caption : dataset (original_url) → short_caption
//! ocr     : dataset (original_url) → caption
//! augment : dataset → augment_ledger.csv + images/ → captions_augmented.csv
//! ```

pub mod crawl;
pub mod caption;
pub mod ocr;
pub mod augment;
pub mod transforms;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::{BatchConfig, ConfigError};
use crate::pipeline::batch::{
    backup_once, read_csv, BatchError, BatchProcessor, CsvDatasetStore, Dataset, ProcessorOptions,
    Sleeper,
};

pub use crawl::{run_crawl, cleanup_invalid_images, CrawlSummary};
pub use caption::{run_caption, CaptionOperation, DEFAULT_CAPTION_PROMPT};
pub use ocr::{run_ocr, OcrOperation};
pub use augment::{run_augment, AugmentOperation, AugmentSummary};

/// Column every image stage reads its source URL from.
pub const URL_COLUMN: &str = "original_url";

/// JPEG quality for every image this crate writes.
pub const JPEG_QUALITY: u8 = 90;

/// Processor options shared by the stages, from config.
pub fn processor_options(config: &BatchConfig, result_column: &str) -> ProcessorOptions {
    ProcessorOptions::new(result_column)
        .with_save_interval(config.save_interval)
        .with_rate_limit_delay(config.rate_limit_delay())
        .with_retry_failed(config.retry_failed)
}

/// Resolved input and output of a single-file stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagePaths {
    pub input: PathBuf,
    pub output: PathBuf,
}

impl StagePaths {
    /// Both paths are required. An in-place run backs the input up first.
    pub fn resolve(config: &BatchConfig) -> Result<Self, BatchError> {
        let input = config
            .input_path
            .clone()
            .ok_or_else(|| ConfigError::Invalid("input_path is required".into()))?;
        let output = config.output_path.clone().unwrap_or_else(|| input.clone());

        if input == output || config.is_in_place() {
            backup_once(&input)?;
        }
        Ok(Self { input, output })
    }
}

/// Loader for the processor's `input` argument. Required columns are
/// checked by the processor on whichever dataset it ends up loading.
pub fn input_loader(path: &Path) -> impl FnOnce() -> Result<Dataset, BatchError> + '_ {
    move || read_csv(path)
}

/// A CSV-backed processor.
pub fn csv_processor(
    output: &Path,
    options: ProcessorOptions,
    sleeper: Arc<dyn Sleeper>,
) -> BatchProcessor {
    BatchProcessor::new(Box::new(CsvDatasetStore::new(output)), options).with_sleeper(sleeper)
}

/// Encode RGB pixels as JPEG.
pub fn encode_jpeg(img: &image::RgbImage) -> Result<Vec<u8>, image::ImageError> {
    let mut buf = Vec::new();
    image::codecs::jpeg::JpegEncoder::new_with_quality(&mut buf, JPEG_QUALITY).encode_image(img)?;
    Ok(buf)
}

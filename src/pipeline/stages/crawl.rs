//! Crawl stage: image search, then filtered downloads.
//!
//! Two resumable passes over two datasets:
//! 1. search units: one row per (query, page); the result cell holds the
//!    page's descriptors as a JSON array.
//! 2. catalog: one row per descriptor of every successful unit; the result
//!    cell holds the local path of the downloaded image.
//!
//! Each pass is a normal `BatchProcessor` run, so an interrupted crawl
//! resumes at the first unit or image without a result.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;

use super::processor_options;
use crate::config::BatchConfig;
use crate::pipeline::batch::{
    read_csv, write_atomic, BatchError, BatchProcessor, BatchStatusEvent, BatchSummary,
    CsvDatasetStore, Dataset, DatasetStore, OperationError, RecordOperation, RecordOutcome,
    RecordRef, RetryPolicy, Sleeper, STATUS_COLUMN, STATUS_OK,
};
use crate::pipeline::collaborators::{ImageDescriptor, ImageFetcher, ImageSearch};
use crate::pipeline::filter::ImageFilter;

pub const UNITS_FILE: &str = "search_units.csv";
pub const CATALOG_FILE: &str = "traffic_images_dataset.csv";
pub const METADATA_FILE: &str = "metadata.json";
pub const IMAGES_DIR: &str = "images";

/// Longest file stem derived from a query.
pub const MAX_FILENAME_CHARS: usize = 200;

/// Extension used when neither the URL nor the content type names one.
pub const DEFAULT_EXTENSION: &str = ".jpg";

pub const DESCRIPTORS_COLUMN: &str = "descriptors";
pub const LOCAL_PATH_COLUMN: &str = "local_path";

pub const UNIT_COLUMNS: [&str; 4] = ["search_query", "page_number", DESCRIPTORS_COLUMN, STATUS_COLUMN];

pub const CATALOG_COLUMNS: [&str; 9] = [
    "title",
    "original_url",
    "thumbnail_url",
    "source_website",
    "resolution",
    "search_query",
    "page_number",
    LOCAL_PATH_COLUMN,
    STATUS_COLUMN,
];

static INVALID_FILENAME_CHARS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"[<>:"/\\|?*]"#).expect("valid regex"));

// ═══════════════════════════════════════════
// Helpers
// ═══════════════════════════════════════════

/// Drop characters that are invalid in file names and cap the length.
pub fn clean_filename(name: &str) -> String {
    INVALID_FILENAME_CHARS
        .replace_all(name, "")
        .chars()
        .take(MAX_FILENAME_CHARS)
        .collect()
}

/// `.ext` for a downloaded image: from the URL path when it names an image
/// type, else from the content type, else `.jpg`.
pub fn extension_for(url: &str, content_type: Option<&str>) -> String {
    let from_url = reqwest::Url::parse(url).ok().and_then(|u| {
        Path::new(u.path())
            .extension()
            .map(|e| e.to_string_lossy().to_ascii_lowercase())
    });
    if let Some(ext) = from_url {
        let is_image = mime_guess::from_ext(&ext)
            .first()
            .is_some_and(|m| m.type_() == mime_guess::mime::IMAGE);
        if is_image {
            return format!(".{ext}");
        }
    }

    let essence = content_type
        .and_then(|ct| ct.split(';').next())
        .map(|ct| ct.trim().to_ascii_lowercase())
        .unwrap_or_default();
    let known = match essence.as_str() {
        "image/jpeg" | "image/jpg" | "image/pjpeg" => Some("jpg"),
        "image/png" => Some("png"),
        "image/gif" => Some("gif"),
        "image/webp" => Some("webp"),
        "image/bmp" => Some("bmp"),
        "image/tiff" => Some("tiff"),
        _ => None,
    };
    known
        .or_else(|| {
            mime_guess::get_mime_extensions_str(&essence).and_then(|exts| exts.first().copied())
        })
        .map(|ext| format!(".{ext}"))
        .unwrap_or_else(|| DEFAULT_EXTENSION.to_string())
}

/// Parse `"<width>x<height>"`.
pub fn parse_resolution(value: &str) -> Option<(u32, u32)> {
    let (w, h) = value.trim().split_once(['x', 'X'])?;
    Some((w.trim().parse().ok()?, h.trim().parse().ok()?))
}

/// Search queries from a text file: one per line, blank lines and `#`
/// comments ignored, duplicates dropped.
pub fn load_queries(path: &Path) -> Result<Vec<String>, BatchError> {
    let text = std::fs::read_to_string(path).map_err(|e| BatchError::Read {
        path: path.to_path_buf(),
        source: e,
    })?;
    let mut seen = HashSet::new();
    Ok(text
        .lines()
        .map(|line| line.trim().trim_start_matches('\u{feff}'))
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter(|line| seen.insert(line.to_string()))
        .map(str::to_string)
        .collect())
}

// ═══════════════════════════════════════════
// Pass 1: search units
// ═══════════════════════════════════════════

/// One unit per (query, page), pages `0..pages`, queries in the given order.
pub fn build_search_units(queries: &[String], pages: u32) -> Result<Dataset, BatchError> {
    let mut units = Dataset::new(UNIT_COLUMNS.iter().map(|c| c.to_string()).collect());
    for query in queries {
        for page in 0..pages {
            units.push_row(vec![
                query.clone(),
                page.to_string(),
                String::new(),
                String::new(),
            ])?;
        }
    }
    Ok(units)
}

pub struct SearchOperation<'a> {
    search: &'a dyn ImageSearch,
    retry: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
}

impl<'a> SearchOperation<'a> {
    pub fn new(search: &'a dyn ImageSearch, retry: RetryPolicy, sleeper: Arc<dyn Sleeper>) -> Self {
        Self {
            search,
            retry,
            sleeper,
        }
    }
}

impl RecordOperation for SearchOperation<'_> {
    fn name(&self) -> &str {
        "search"
    }

    fn process(&self, record: RecordRef<'_>) -> RecordOutcome {
        let Some(query) = record.get("search_query") else {
            return RecordOutcome::Skipped("no search query".into());
        };
        let Some(page) = record.get("page_number").and_then(|p| p.parse::<u32>().ok()) else {
            return RecordOutcome::Failed("invalid page number".into());
        };

        let results = self
            .retry
            .run(self.sleeper.as_ref(), "search", |_| self.search.search(query, page));
        match results {
            Ok(descriptors) => {
                tracing::info!(query, page, results = descriptors.len(), "Search page fetched");
                match serde_json::to_string(&descriptors) {
                    Ok(cell) => RecordOutcome::Success(cell),
                    Err(e) => RecordOutcome::Failed(format!("cannot encode descriptors: {e}")),
                }
            }
            Err(e) => RecordOutcome::from_error(e),
        }
    }
}

// ═══════════════════════════════════════════
// Pass 2: catalog & downloads
// ═══════════════════════════════════════════

fn catalog_row(descriptor: &ImageDescriptor, query: &str, page: &str) -> Vec<String> {
    vec![
        descriptor.title.clone(),
        descriptor.original_url.clone(),
        descriptor.thumbnail_url.clone(),
        descriptor.source_website.clone(),
        descriptor.resolution(),
        query.to_string(),
        page.to_string(),
        String::new(),
        String::new(),
    ]
}

/// Catalog rows for every successful unit, in unit order.
pub fn expand_catalog(units: &Dataset) -> Result<Dataset, BatchError> {
    let mut catalog = Dataset::new(CATALOG_COLUMNS.iter().map(|c| c.to_string()).collect());
    for unit in units.iter() {
        if unit.get(STATUS_COLUMN) != Some(STATUS_OK) {
            continue;
        }
        let descriptors: Vec<ImageDescriptor> =
            serde_json::from_str(unit.get_or_empty(DESCRIPTORS_COLUMN))?;
        for descriptor in &descriptors {
            catalog.push_row(catalog_row(
                descriptor,
                unit.get_or_empty("search_query"),
                unit.get_or_empty("page_number"),
            ))?;
        }
    }
    Ok(catalog)
}

/// Append rows of `expanded` whose (query, page) unit is not yet in `existing`.
/// Works for both the unit and the catalog datasets. Returns the number of rows added.
pub fn merge_new_units(existing: &mut Dataset, expanded: &Dataset) -> Result<usize, BatchError> {
    let unit_key = |r: &RecordRef<'_>| {
        (
            r.get_or_empty("search_query").to_string(),
            r.get_or_empty("page_number").to_string(),
        )
    };
    let known: HashSet<(String, String)> = existing.iter().map(|r| unit_key(&r)).collect();

    let columns: Vec<String> = existing.columns().to_vec();
    let mut added = 0;
    for record in expanded.iter() {
        if known.contains(&unit_key(&record)) {
            continue;
        }
        let row = columns
            .iter()
            .map(|c| record.get_or_empty(c).to_string())
            .collect();
        existing.push_row(row)?;
        added += 1;
    }
    Ok(added)
}

pub struct DownloadOperation<'a> {
    fetcher: &'a dyn ImageFetcher,
    filter: ImageFilter,
    retry: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
    images_dir: PathBuf,
    now: DateTime<Utc>,
}

impl<'a> DownloadOperation<'a> {
    pub fn new(
        fetcher: &'a dyn ImageFetcher,
        filter: ImageFilter,
        retry: RetryPolicy,
        sleeper: Arc<dyn Sleeper>,
        images_dir: &Path,
    ) -> Self {
        Self {
            fetcher,
            filter,
            retry,
            sleeper,
            images_dir: images_dir.to_path_buf(),
            now: Utc::now(),
        }
    }

    /// Evaluate the age filter against `now` instead of the wall clock.
    pub fn at(mut self, now: DateTime<Utc>) -> Self {
        self.now = now;
        self
    }

    fn download(&self, record: &RecordRef<'_>) -> Result<String, OperationError> {
        for field in ["title", "original_url", "search_query"] {
            if record.get(field).is_none() {
                return Err(OperationError::ContentRejected(format!(
                    "invalid record: missing {field}"
                )));
            }
        }
        let url = record.get_or_empty("original_url");
        let query = record.get_or_empty("search_query");
        let page = record.get_or_empty("page_number");

        let (width, height) = parse_resolution(record.get_or_empty("resolution")).unwrap_or((0, 0));
        self.filter.check_descriptor(width, height)?;

        let image = self
            .retry
            .run(self.sleeper.as_ref(), "download", |_| self.fetcher.fetch(url))?;
        self.filter
            .check_response(image.content_type.as_deref(), image.last_modified, self.now)?;

        let ext = extension_for(url, image.content_type.as_deref());
        let name = format!("{}_{}_{}{}", clean_filename(query), page, record.index(), ext);
        let path = self.images_dir.join(name);
        write_atomic(&path, &image.bytes)
            .map_err(|e| OperationError::PermanentInput(e.to_string()))?;
        Ok(path.to_string_lossy().into_owned())
    }
}

impl RecordOperation for DownloadOperation<'_> {
    fn name(&self) -> &str {
        "download"
    }

    fn process(&self, record: RecordRef<'_>) -> RecordOutcome {
        RecordOutcome::from_result(self.download(&record))
    }
}

// ═══════════════════════════════════════════
// Maintenance
// ═══════════════════════════════════════════

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub checked: usize,
    pub removed: usize,
}

/// Delete files in `dir` whose bytes are not a recognizable image format.
pub fn cleanup_invalid_images(dir: &Path) -> Result<CleanupReport, BatchError> {
    let read_err = |source: std::io::Error| BatchError::Read {
        path: dir.to_path_buf(),
        source,
    };
    let mut report = CleanupReport::default();
    if !dir.exists() {
        return Ok(report);
    }

    let mut entries: Vec<PathBuf> = std::fs::read_dir(dir)
        .map_err(read_err)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_file())
        .collect();
    entries.sort();

    for path in entries {
        report.checked += 1;
        let valid = match std::fs::read(&path) {
            Ok(bytes) => image::guess_format(&bytes).is_ok(),
            Err(e) => {
                tracing::error!(path = %path.display(), error = %e, "Cannot check file");
                continue;
            }
        };
        if valid {
            continue;
        }
        match std::fs::remove_file(&path) {
            Ok(()) => {
                report.removed += 1;
                tracing::info!(path = %path.display(), "Removed invalid image");
            }
            Err(e) => tracing::error!(path = %path.display(), error = %e, "Cannot remove file"),
        }
    }
    Ok(report)
}

// ═══════════════════════════════════════════
// Orchestration
// ═══════════════════════════════════════════

/// Files of one crawl.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrawlPaths {
    pub units: PathBuf,
    pub catalog: PathBuf,
    pub metadata: PathBuf,
    pub images_dir: PathBuf,
}

impl CrawlPaths {
    pub fn under(dir: &Path) -> Self {
        Self {
            units: dir.join(UNITS_FILE),
            catalog: dir.join(CATALOG_FILE),
            metadata: dir.join(METADATA_FILE),
            images_dir: dir.join(IMAGES_DIR),
        }
    }

    pub fn with_catalog(mut self, catalog: &Path) -> Self {
        self.catalog = catalog.to_path_buf();
        self
    }
}

/// Catalog rows and downloaded images for one query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueryCount {
    pub query: String,
    pub catalogued: usize,
    pub downloaded: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CrawlSummary {
    pub search: BatchSummary,
    pub download: BatchSummary,
    pub catalog: PathBuf,
    /// In query order.
    pub per_query: Vec<QueryCount>,
}

/// Run both crawl passes under `output_dir`. `config.output_path`, when set,
/// replaces the default catalog location.
pub fn run_crawl(
    config: &BatchConfig,
    queries: &[String],
    output_dir: &Path,
    search: &dyn ImageSearch,
    fetcher: &dyn ImageFetcher,
    sleeper: Arc<dyn Sleeper>,
    progress_fn: Option<&dyn Fn(BatchStatusEvent)>,
) -> Result<CrawlSummary, BatchError> {
    let _span = tracing::info_span!("crawl").entered();
    let mut paths = CrawlPaths::under(output_dir);
    if let Some(catalog) = &config.output_path {
        paths = paths.with_catalog(catalog);
    }

    // Pass 1
    let planned = build_search_units(queries, config.search_pages)?;
    let units_store = CsvDatasetStore::new(&paths.units);
    if units_store.exists() {
        let mut existing = read_csv(&paths.units)?;
        let added = merge_new_units(&mut existing, &planned)?;
        if added > 0 {
            tracing::info!(added, "New search units appended to checkpoint");
            units_store.save(&existing)?;
        }
    }

    let search_op = SearchOperation::new(search, config.retry_policy(), sleeper.clone());
    let search_processor = BatchProcessor::new(
        Box::new(units_store),
        processor_options(config, DESCRIPTORS_COLUMN),
    )
    .with_sleeper(sleeper.clone());
    let (units, search_summary) = search_processor.run(|| Ok(planned), &search_op, progress_fn)?;

    // Pass 2
    let expanded = expand_catalog(&units)?;
    let catalog_store = CsvDatasetStore::new(&paths.catalog).with_json_sibling(&paths.metadata);
    if catalog_store.exists() {
        let mut existing = read_csv(&paths.catalog)?;
        let added = merge_new_units(&mut existing, &expanded)?;
        if added > 0 {
            tracing::info!(added, "New search results appended to catalog");
            catalog_store.save(&existing)?;
        }
    }

    let download_op = DownloadOperation::new(
        fetcher,
        ImageFilter::new(config.filter.clone()),
        config.retry_policy(),
        sleeper.clone(),
        &paths.images_dir,
    );
    // Downloads hit many hosts; only the search API is paced.
    let download_options =
        processor_options(config, LOCAL_PATH_COLUMN).with_rate_limit_delay(Duration::ZERO);
    let download_processor = BatchProcessor::new(Box::new(catalog_store), download_options)
        .with_sleeper(sleeper);
    let (catalog, download_summary) =
        download_processor.run(|| Ok(expanded), &download_op, progress_fn)?;

    let per_query = count_per_query(&catalog, queries);
    for count in &per_query {
        tracing::info!(
            query = %count.query,
            catalogued = count.catalogued,
            downloaded = count.downloaded,
            "Query finished"
        );
    }
    tracing::info!(
        catalog = %paths.catalog.display(),
        units = search_summary.total,
        images = download_summary.succeeded + download_summary.already_done,
        skipped = download_summary.skipped,
        failed = download_summary.failed,
        "Crawl stage finished"
    );

    Ok(CrawlSummary {
        search: search_summary,
        download: download_summary,
        catalog: paths.catalog,
        per_query,
    })
}

fn count_per_query(catalog: &Dataset, queries: &[String]) -> Vec<QueryCount> {
    queries
        .iter()
        .map(|query| {
            let rows: Vec<RecordRef<'_>> = catalog
                .iter()
                .filter(|r| r.get("search_query") == Some(query.as_str()))
                .collect();
            QueryCount {
                query: query.clone(),
                catalogued: rows.len(),
                downloaded: rows
                    .iter()
                    .filter(|r| r.get(STATUS_COLUMN) == Some(STATUS_OK))
                    .count(),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::batch::{RecordingSleeper, FAILED_SENTINEL, SKIPPED_SENTINEL};
    use crate::pipeline::collaborators::fetch::sample_png;
    use crate::pipeline::collaborators::{FetchedImage, MockImageFetcher, MockImageSearch};
    use chrono::TimeZone;

    fn descriptor(url: &str, w: u32, h: u32) -> ImageDescriptor {
        ImageDescriptor {
            title: format!("title of {url}"),
            original_url: url.to_string(),
            thumbnail_url: format!("{url}?thumb"),
            source_website: "vnexpress.net".into(),
            width: w,
            height: h,
        }
    }

    fn config() -> BatchConfig {
        BatchConfig {
            search_pages: 2,
            save_interval: 2,
            rate_limit_delay_ms: 5,
            retry_base_delay_ms: 1,
            ..Default::default()
        }
    }

    #[test]
    fn clean_filename_strips_invalid_chars_and_caps_length() {
        assert_eq!(clean_filename("a<b>c:d\"e/f\\g|h?i*j"), "abcdefghij");
        assert_eq!(clean_filename("vỉa hè đường phố"), "vỉa hè đường phố");
        let long = "đ".repeat(500);
        assert_eq!(clean_filename(&long).chars().count(), MAX_FILENAME_CHARS);
    }

    #[test]
    fn extension_prefers_url_then_content_type() {
        assert_eq!(extension_for("https://a/b/photo.PNG?x=1", Some("image/jpeg")), ".png");
        assert_eq!(extension_for("https://a/b/photo", Some("image/webp")), ".webp");
        assert_eq!(extension_for("https://a/view.php?id=3", Some("image/jpeg; q=1")), ".jpg");
        assert_eq!(extension_for("https://a/b/photo", None), DEFAULT_EXTENSION);
    }

    #[test]
    fn parse_resolution_variants() {
        assert_eq!(parse_resolution("1920x1080"), Some((1920, 1080)));
        assert_eq!(parse_resolution(" 800 X 600 "), Some((800, 600)));
        assert_eq!(parse_resolution("NonexNone"), None);
        assert_eq!(parse_resolution(""), None);
    }

    #[test]
    fn load_queries_skips_comments_and_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queries.txt");
        std::fs::write(&path, "\u{feff}# cơ bản\nvỉa hè\n\ncột đèn đường\nvỉa hè\n").unwrap();
        assert_eq!(load_queries(&path).unwrap(), vec!["vỉa hè", "cột đèn đường"]);
    }

    #[test]
    fn units_cover_every_query_page() {
        let units = build_search_units(&["a".into(), "b".into()], 3).unwrap();
        assert_eq!(units.len(), 6);
        assert_eq!(units.value(4, 0), "b");
        assert_eq!(units.value(4, 1), "1");
    }

    #[test]
    fn expand_catalog_uses_successful_units_only() {
        let mut units = build_search_units(&["q".into()], 2).unwrap();
        let cell = serde_json::to_string(&vec![descriptor("https://a/1.jpg", 1000, 800)]).unwrap();
        units.set_value(0, 2, cell);
        units.set_value(0, 3, STATUS_OK);
        units.set_value(1, 2, FAILED_SENTINEL);
        units.set_value(1, 3, "failed: HTTP 500");

        let catalog = expand_catalog(&units).unwrap();
        assert_eq!(catalog.len(), 1);
        assert_eq!(catalog.value(0, 4), "1000x800");
        assert_eq!(catalog.value(0, 5), "q");
        assert_eq!(catalog.value(0, 6), "0");
    }

    #[test]
    fn merge_appends_only_new_catalog_units() {
        let mut existing = Dataset::new(CATALOG_COLUMNS.iter().map(|c| c.to_string()).collect());
        existing
            .push_row(catalog_row(&descriptor("https://a/1.jpg", 900, 700), "q", "0"))
            .unwrap();
        let mut expanded = existing.clone();
        expanded
            .push_row(catalog_row(&descriptor("https://a/2.jpg", 900, 700), "q", "1"))
            .unwrap();

        assert_eq!(merge_new_units(&mut existing, &expanded).unwrap(), 1);
        assert_eq!(existing.len(), 2);
        assert_eq!(merge_new_units(&mut existing, &expanded).unwrap(), 0);
    }

    #[test]
    fn download_rejects_invalid_records_and_small_images() {
        let fetcher = MockImageFetcher::new();
        let dir = tempfile::tempdir().unwrap();
        let op = DownloadOperation::new(
            &fetcher,
            ImageFilter::default(),
            RetryPolicy::none(),
            Arc::new(RecordingSleeper::new()),
            dir.path(),
        );

        let mut catalog = Dataset::new(CATALOG_COLUMNS.iter().map(|c| c.to_string()).collect());
        catalog
            .push_row(catalog_row(&descriptor("https://a/1.jpg", 300, 200), "q", "0"))
            .unwrap();
        let mut untitled = descriptor("https://a/2.jpg", 1000, 800);
        untitled.title.clear();
        catalog.push_row(catalog_row(&untitled, "q", "0")).unwrap();

        assert!(matches!(op.process(catalog.record(0).unwrap()), RecordOutcome::Skipped(_)));
        assert_eq!(
            op.process(catalog.record(1).unwrap()),
            RecordOutcome::Skipped("invalid record: missing title".into())
        );
        assert_eq!(fetcher.call_count(), 0);
    }

    #[test]
    fn download_applies_age_filter() {
        let old = Utc.with_ymd_and_hms(2010, 1, 1, 0, 0, 0).unwrap();
        let fetcher = MockImageFetcher::new().with_image(
            "https://a/old.jpg",
            FetchedImage::new(sample_png(8, 8), "image/png").with_last_modified(old),
        );
        let dir = tempfile::tempdir().unwrap();
        let op = DownloadOperation::new(
            &fetcher,
            ImageFilter::default(),
            RetryPolicy::none(),
            Arc::new(RecordingSleeper::new()),
            dir.path(),
        )
        .at(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());

        let mut catalog = Dataset::new(CATALOG_COLUMNS.iter().map(|c| c.to_string()).collect());
        catalog
            .push_row(catalog_row(&descriptor("https://a/old.jpg", 1000, 800), "q", "0"))
            .unwrap();

        assert!(matches!(op.process(catalog.record(0).unwrap()), RecordOutcome::Skipped(_)));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn full_crawl_writes_catalog_metadata_and_images() {
        let dir = tempfile::tempdir().unwrap();
        let search = MockImageSearch::new()
            .with_page(
                "vỉa hè",
                0,
                vec![
                    descriptor("https://cdn/a.jpg", 1920, 1080),
                    descriptor("https://cdn/small.jpg", 320, 240),
                ],
            )
            .with_page("vỉa hè", 1, vec![descriptor("https://cdn/b", 1024, 768)])
            .with_error("ổ gà", 0, OperationError::PermanentInput("Invalid API key".into()));
        let fetcher = MockImageFetcher::new()
            .with_image("https://cdn/a.jpg", FetchedImage::new(sample_png(4, 4), "image/jpeg"))
            .with_image("https://cdn/b", FetchedImage::new(sample_png(4, 4), "image/png"));
        let sleeper = Arc::new(RecordingSleeper::new());
        let queries = vec!["vỉa hè".to_string(), "ổ gà".to_string()];

        let summary = run_crawl(&config(), &queries, dir.path(), &search, &fetcher, sleeper.clone(), None)
            .unwrap();

        assert_eq!(search.call_count(), 4);
        assert_eq!(summary.search.succeeded, 3);
        assert_eq!(summary.search.failed, 1);
        assert_eq!(summary.download.total, 3);
        assert_eq!(summary.download.succeeded, 2);
        assert_eq!(summary.download.skipped, 1);
        assert_eq!(
            summary.per_query,
            vec![
                QueryCount {
                    query: "vỉa hè".into(),
                    catalogued: 3,
                    downloaded: 2,
                },
                QueryCount {
                    query: "ổ gà".into(),
                    catalogued: 0,
                    downloaded: 0,
                },
            ]
        );
        // Paced between the four search units, never between downloads
        assert_eq!(sleeper.delays(), vec![Duration::from_millis(5); 3]);

        let catalog = read_csv(&dir.path().join(CATALOG_FILE)).unwrap();
        let path_col = catalog.column_index(LOCAL_PATH_COLUMN).unwrap();
        assert!(catalog.value(0, path_col).ends_with("vỉa hè_0_0.jpg"));
        assert_eq!(catalog.value(1, path_col), SKIPPED_SENTINEL);
        assert!(catalog.value(2, path_col).ends_with("vỉa hè_1_2.png"));
        assert!(dir.path().join(IMAGES_DIR).join("vỉa hè_1_2.png").exists());

        let metadata = std::fs::read_to_string(dir.path().join(METADATA_FILE)).unwrap();
        let parsed: Vec<serde_json::Value> = serde_json::from_str(&metadata).unwrap();
        assert_eq!(parsed.len(), 3);
        assert_eq!(parsed[0]["search_query"], "vỉa hè");
    }

    #[test]
    fn rerun_after_complete_crawl_calls_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let search = MockImageSearch::new()
            .with_page("q", 0, vec![descriptor("https://cdn/a.jpg", 1920, 1080)]);
        let fetcher = MockImageFetcher::new()
            .with_fallback(FetchedImage::new(sample_png(4, 4), "image/jpeg"));
        let queries = vec!["q".to_string()];
        let run = || {
            run_crawl(
                &config(),
                &queries,
                dir.path(),
                &search,
                &fetcher,
                Arc::new(RecordingSleeper::new()),
                None,
            )
            .unwrap()
        };

        run();
        let catalog_bytes = std::fs::read(dir.path().join(CATALOG_FILE)).unwrap();
        let second = run();

        assert_eq!(search.call_count(), 2);
        assert_eq!(fetcher.call_count(), 1);
        assert_eq!(second.download.already_done, 1);
        assert_eq!(std::fs::read(dir.path().join(CATALOG_FILE)).unwrap(), catalog_bytes);
    }

    #[test]
    fn rerun_with_added_query_and_pages_searches_only_new_units() {
        let dir = tempfile::tempdir().unwrap();
        let search = MockImageSearch::new()
            .with_page("a", 0, vec![descriptor("https://cdn/a0.jpg", 1920, 1080)])
            .with_page("a", 1, vec![descriptor("https://cdn/a1.jpg", 1920, 1080)])
            .with_page("b", 0, vec![descriptor("https://cdn/b0.jpg", 1920, 1080)]);
        let fetcher = MockImageFetcher::new()
            .with_fallback(FetchedImage::new(sample_png(4, 4), "image/jpeg"));
        let run = |queries: &[String], pages: u32| {
            let config = BatchConfig {
                search_pages: pages,
                ..config()
            };
            run_crawl(
                &config,
                queries,
                dir.path(),
                &search,
                &fetcher,
                Arc::new(RecordingSleeper::new()),
                None,
            )
            .unwrap()
        };

        run(&["a".to_string()], 1);
        assert_eq!(search.call_count(), 1);

        let second = run(&["a".to_string(), "b".to_string()], 2);

        // a/1, b/0 and b/1 are new; a/0 comes from the checkpoint
        assert_eq!(search.call_count(), 4);
        assert_eq!(second.search.total, 4);
        assert_eq!(second.search.already_done, 1);
        assert_eq!(second.download.already_done, 1);
        assert_eq!(second.download.succeeded, 2);
        assert_eq!(fetcher.call_count(), 3);
        assert_eq!(
            second
                .per_query
                .iter()
                .map(|c| (c.query.as_str(), c.downloaded))
                .collect::<Vec<_>>(),
            vec![("a", 2), ("b", 1)]
        );

        let units = read_csv(&dir.path().join(UNITS_FILE)).unwrap();
        assert_eq!(units.len(), 4);
        let catalog = read_csv(&dir.path().join(CATALOG_FILE)).unwrap();
        assert_eq!(catalog.len(), 3);
    }

    #[test]
    fn cleanup_removes_non_images() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("good.png"), sample_png(4, 4)).unwrap();
        std::fs::write(dir.path().join("bad.jpg"), b"<html>403 Forbidden</html>").unwrap();

        let report = cleanup_invalid_images(dir.path()).unwrap();
        assert_eq!(report, CleanupReport { checked: 2, removed: 1 });
        assert!(dir.path().join("good.png").exists());
        assert!(!dir.path().join("bad.jpg").exists());
    }

    #[test]
    fn cleanup_of_missing_dir_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let report = cleanup_invalid_images(&dir.path().join("nope")).unwrap();
        assert_eq!(report, CleanupReport::default());
    }
}

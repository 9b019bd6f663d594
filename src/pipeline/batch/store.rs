//! Dataset persistence: CSV checkpoints with an optional JSON sibling.
//!
//! Files are UTF-8 with a byte-order mark so spreadsheets open them with the
//! right encoding. Every save goes through a temp file in the target
//! directory and an atomic rename, so an interrupted save never leaves a
//! truncated checkpoint behind.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde_json::{Map, Value};

use super::error::BatchError;
use super::traits::DatasetStore;
use super::types::Dataset;

const UTF8_BOM: &str = "\u{feff}";

/// CSV-backed checkpoint store.
pub struct CsvDatasetStore {
    path: PathBuf,
    json_sibling: Option<PathBuf>,
}

impl CsvDatasetStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            json_sibling: None,
        }
    }

    /// Also write the records as a JSON array of objects on every save.
    pub fn with_json_sibling(mut self, path: impl Into<PathBuf>) -> Self {
        self.json_sibling = Some(path.into());
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl DatasetStore for CsvDatasetStore {
    fn load(&self) -> Result<Option<Dataset>, BatchError> {
        if !self.path.exists() {
            return Ok(None);
        }
        read_csv(&self.path).map(Some)
    }

    fn save(&self, dataset: &Dataset) -> Result<(), BatchError> {
        let bytes = encode_csv(dataset).map_err(|e| BatchError::Persistence {
            path: self.path.clone(),
            source: e,
        })?;
        write_atomic(&self.path, &bytes)?;

        if let Some(json_path) = &self.json_sibling {
            let json = encode_json(dataset)?;
            write_atomic(json_path, json.as_bytes())?;
        }

        tracing::debug!(path = %self.path.display(), rows = dataset.len(), "Checkpoint saved");
        Ok(())
    }

    fn exists(&self) -> bool {
        self.path.exists()
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// Read a CSV file with a header row. A leading BOM is ignored.
pub fn read_csv(path: &Path) -> Result<Dataset, BatchError> {
    let bytes = fs::read(path).map_err(|e| BatchError::Read {
        path: path.to_path_buf(),
        source: e,
    })?;
    let text = String::from_utf8(bytes)
        .map_err(|e| BatchError::malformed(path, format!("not valid UTF-8: {e}")))?;
    let text = text.strip_prefix(UTF8_BOM).unwrap_or(&text);

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_reader(text.as_bytes());

    let columns: Vec<String> = reader
        .headers()
        .map_err(|e| BatchError::malformed(path, e.to_string()))?
        .iter()
        .map(str::to_string)
        .collect();
    if columns.is_empty() || columns.iter().all(|c| c.is_empty()) {
        return Err(BatchError::malformed(path, "missing header row"));
    }

    let mut dataset = Dataset::new(columns);
    for (row, record) in reader.records().enumerate() {
        let record = record.map_err(|e| BatchError::malformed(path, format!("row {row}: {e}")))?;
        dataset
            .push_row(record.iter().map(str::to_string).collect())
            .map_err(|e| BatchError::malformed(path, e.to_string()))?;
    }
    Ok(dataset)
}

/// Encode a dataset as BOM-prefixed CSV.
pub fn encode_csv(dataset: &Dataset) -> Result<Vec<u8>, std::io::Error> {
    let mut buf = Vec::with_capacity(UTF8_BOM.len() + dataset.len() * 64);
    buf.extend_from_slice(UTF8_BOM.as_bytes());
    {
        let mut writer = csv::Writer::from_writer(&mut buf);
        writer.write_record(dataset.columns()).map_err(std::io::Error::other)?;
        for record in dataset.records() {
            writer.write_record(&record.values).map_err(std::io::Error::other)?;
        }
        writer.flush()?;
    }
    Ok(buf)
}

/// Encode records as a pretty JSON array of `{column: value}` objects.
pub fn encode_json(dataset: &Dataset) -> Result<String, BatchError> {
    let rows: Vec<Value> = dataset
        .records()
        .iter()
        .map(|record| {
            let object: Map<String, Value> = dataset
                .columns()
                .iter()
                .zip(&record.values)
                .map(|(column, value)| (column.clone(), Value::String(value.clone())))
                .collect();
            Value::Object(object)
        })
        .collect();
    Ok(serde_json::to_string_pretty(&rows)?)
}

/// Replace `path` with `bytes` via a temp file in the same directory.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), BatchError> {
    let persistence = |source: std::io::Error| BatchError::Persistence {
        path: path.to_path_buf(),
        source,
    };

    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&dir).map_err(persistence)?;

    let mut tmp = tempfile::NamedTempFile::new_in(&dir).map_err(persistence)?;
    tmp.write_all(bytes).map_err(persistence)?;
    tmp.flush().map_err(persistence)?;
    tmp.persist(path).map_err(|e| persistence(e.error))?;
    Ok(())
}

/// Copy `input` to `<stem>_backup.<ext>` unless that backup already exists.
/// Returns the backup path when one was written.
pub fn backup_once(input: &Path) -> Result<Option<PathBuf>, BatchError> {
    let backup = backup_path(input);
    if backup.exists() || !input.exists() {
        return Ok(None);
    }
    let bytes = fs::read(input).map_err(|e| BatchError::Read {
        path: input.to_path_buf(),
        source: e,
    })?;
    write_atomic(&backup, &bytes)?;
    tracing::info!(backup = %backup.display(), "Created backup of input dataset");
    Ok(Some(backup))
}

pub fn backup_path(input: &Path) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "dataset".to_string());
    let name = match input.extension() {
        Some(ext) => format!("{stem}_backup.{}", ext.to_string_lossy()),
        None => format!("{stem}_backup"),
    };
    input.with_file_name(name)
}

/// In-memory store that keeps every saved snapshot.
#[derive(Debug, Default)]
pub struct MemoryStore {
    initial: Option<Dataset>,
    snapshots: Mutex<Vec<Dataset>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start with an existing checkpoint, as if a previous run had saved it.
    pub fn with_checkpoint(dataset: Dataset) -> Self {
        Self {
            initial: Some(dataset),
            snapshots: Mutex::new(Vec::new()),
        }
    }

    pub fn snapshots(&self) -> Vec<Dataset> {
        match self.snapshots.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn save_count(&self) -> usize {
        self.snapshots().len()
    }

    pub fn latest(&self) -> Option<Dataset> {
        self.snapshots().pop().or_else(|| self.initial.clone())
    }
}

impl DatasetStore for MemoryStore {
    fn load(&self) -> Result<Option<Dataset>, BatchError> {
        Ok(self.latest())
    }

    fn save(&self, dataset: &Dataset) -> Result<(), BatchError> {
        match self.snapshots.lock() {
            Ok(mut guard) => guard.push(dataset.clone()),
            Err(poisoned) => poisoned.into_inner().push(dataset.clone()),
        }
        Ok(())
    }

    fn exists(&self) -> bool {
        self.initial.is_some() || self.save_count() > 0
    }

    fn describe(&self) -> String {
        "<memory>".to_string()
    }
}

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::pipeline::batch::RetryPolicy;
use crate::pipeline::filter::{
    MAX_ASPECT_RATIO, MAX_IMAGE_AGE_DAYS, MIN_ASPECT_RATIO, MIN_HEIGHT, MIN_WIDTH,
};

/// Application-level constants
pub const APP_NAME: &str = "traffic-dataset";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Prefix of every environment override, e.g. `TRAFFIC_DATASET_SAVE_INTERVAL`.
pub const ENV_PREFIX: &str = "TRAFFIC_DATASET_";

/// Environment variables holding secrets. Read into `Credentials` only.
pub const SERPAPI_KEY_VAR: &str = "SERPAPI_API_KEY";
pub const GEMINI_KEY_VAR: &str = "GEMINI_API_KEY";
pub const OCR_ENDPOINT_VAR: &str = "OCR_ENDPOINT";

/// Default gemini model for captioning
pub const DEFAULT_CAPTION_MODEL: &str = "gemini-1.5-flash";

/// Log filter used when `RUST_LOG` is unset.
pub fn default_log_filter() -> &'static str {
    if cfg!(debug_assertions) {
        "traffic_dataset=debug,warn"
    } else {
        "traffic_dataset=info,warn"
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid value for {key}: {value:?} ({reason})")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("missing secret: set the {0} environment variable")]
    MissingSecret(&'static str),
}

// ═══════════════════════════════════════════
// Batch configuration
// ═══════════════════════════════════════════

/// Acceptance thresholds for crawled images.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    pub min_width: u32,
    pub min_height: u32,
    pub min_aspect_ratio: f64,
    pub max_aspect_ratio: f64,
    pub max_age_days: i64,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            min_width: MIN_WIDTH,
            min_height: MIN_HEIGHT,
            min_aspect_ratio: MIN_ASPECT_RATIO,
            max_aspect_ratio: MAX_ASPECT_RATIO,
            max_age_days: MAX_IMAGE_AGE_DAYS,
        }
    }
}

/// Options shared by every stage. Loaded from an optional JSON file, then
/// `TRAFFIC_DATASET_*` environment overrides, then command-line flags.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub input_path: Option<PathBuf>,
    pub output_path: Option<PathBuf>,
    pub save_interval: usize,
    pub max_retries: u32,
    pub timeout_seconds: u64,
    pub rate_limit_delay_ms: u64,
    pub retry_base_delay_ms: u64,
    pub retry_failed: bool,
    pub workers: usize,
    /// Result pages requested per search query (crawl).
    pub search_pages: u32,
    /// Augmented variants per source image (augment).
    pub augment_variants: u32,
    pub augment_seed: u64,
    pub caption_model: String,
    pub filter: FilterConfig,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            input_path: None,
            output_path: None,
            save_interval: 10,
            max_retries: 3,
            timeout_seconds: 10,
            rate_limit_delay_ms: 2000,
            retry_base_delay_ms: 2000,
            retry_failed: false,
            workers: 8,
            search_pages: 3,
            augment_variants: 3,
            augment_seed: 0,
            caption_model: DEFAULT_CAPTION_MODEL.to_string(),
            filter: FilterConfig::default(),
        }
    }
}

impl BatchConfig {
    /// Defaults, overlaid with `file` when given, then with the process environment.
    pub fn load(file: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match file {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;
        serde_json::from_str(&text).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Apply `TRAFFIC_DATASET_*` overrides read through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| {
            let key = format!("{ENV_PREFIX}{name}");
            lookup(&key).map(|value| (key, value))
        };

        if let Some((_, v)) = get("INPUT_PATH") {
            self.input_path = Some(PathBuf::from(v));
        }
        if let Some((_, v)) = get("OUTPUT_PATH") {
            self.output_path = Some(PathBuf::from(v));
        }
        if let Some((k, v)) = get("SAVE_INTERVAL") {
            self.save_interval = parse_value(&k, &v)?;
        }
        if let Some((k, v)) = get("MAX_RETRIES") {
            self.max_retries = parse_value(&k, &v)?;
        }
        if let Some((k, v)) = get("TIMEOUT_SECONDS") {
            self.timeout_seconds = parse_value(&k, &v)?;
        }
        if let Some((k, v)) = get("RATE_LIMIT_DELAY_MS") {
            self.rate_limit_delay_ms = parse_value(&k, &v)?;
        }
        if let Some((k, v)) = get("RETRY_BASE_DELAY_MS") {
            self.retry_base_delay_ms = parse_value(&k, &v)?;
        }
        if let Some((k, v)) = get("RETRY_FAILED") {
            self.retry_failed = parse_flag(&k, &v)?;
        }
        if let Some((k, v)) = get("WORKERS") {
            self.workers = parse_value(&k, &v)?;
        }
        if let Some((k, v)) = get("SEARCH_PAGES") {
            self.search_pages = parse_value(&k, &v)?;
        }
        if let Some((k, v)) = get("AUGMENT_VARIANTS") {
            self.augment_variants = parse_value(&k, &v)?;
        }
        if let Some((k, v)) = get("AUGMENT_SEED") {
            self.augment_seed = parse_value(&k, &v)?;
        }
        if let Some((_, v)) = get("CAPTION_MODEL") {
            self.caption_model = v;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.save_interval == 0 {
            return Err(ConfigError::Invalid("save_interval must be at least 1".into()));
        }
        if self.max_retries == 0 {
            return Err(ConfigError::Invalid("max_retries must be at least 1".into()));
        }
        if self.timeout_seconds == 0 {
            return Err(ConfigError::Invalid("timeout_seconds must be positive".into()));
        }
        if self.workers == 0 {
            return Err(ConfigError::Invalid("workers must be at least 1".into()));
        }
        if self.caption_model.trim().is_empty() {
            return Err(ConfigError::Invalid("caption_model must not be empty".into()));
        }
        let f = &self.filter;
        if !(f.min_aspect_ratio > 0.0 && f.min_aspect_ratio <= f.max_aspect_ratio) {
            return Err(ConfigError::Invalid(format!(
                "aspect ratio bounds {}..{} are not a valid range",
                f.min_aspect_ratio, f.max_aspect_ratio
            )));
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    pub fn rate_limit_delay(&self) -> Duration {
        Duration::from_millis(self.rate_limit_delay_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries, Duration::from_millis(self.retry_base_delay_ms))
    }

    /// Input and output name the same file.
    pub fn is_in_place(&self) -> bool {
        match (&self.input_path, &self.output_path) {
            (Some(input), Some(output)) => same_file(input, output),
            _ => false,
        }
    }
}

fn same_file(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

fn parse_value<T>(key: &str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
        reason: e.to_string(),
    })
}

fn parse_flag(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
            reason: "expected a boolean".into(),
        }),
    }
}

// ═══════════════════════════════════════════
// Secrets
// ═══════════════════════════════════════════

/// API keys and endpoints. Never logged: `Debug` prints only which are set.
#[derive(Clone, Default)]
pub struct Credentials {
    serpapi_api_key: Option<String>,
    gemini_api_key: Option<String>,
    ocr_endpoint: Option<String>,
}

impl Credentials {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        Self {
            serpapi_api_key: read(SERPAPI_KEY_VAR),
            gemini_api_key: read(GEMINI_KEY_VAR),
            ocr_endpoint: read(OCR_ENDPOINT_VAR),
        }
    }

    pub fn serpapi_api_key(&self) -> Result<&str, ConfigError> {
        self.serpapi_api_key
            .as_deref()
            .ok_or(ConfigError::MissingSecret(SERPAPI_KEY_VAR))
    }

    pub fn gemini_api_key(&self) -> Result<&str, ConfigError> {
        self.gemini_api_key
            .as_deref()
            .ok_or(ConfigError::MissingSecret(GEMINI_KEY_VAR))
    }

    pub fn ocr_endpoint(&self) -> Result<&str, ConfigError> {
        self.ocr_endpoint
            .as_deref()
            .ok_or(ConfigError::MissingSecret(OCR_ENDPOINT_VAR))
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mark = |v: &Option<String>| if v.is_some() { "<redacted>" } else { "<unset>" };
        f.debug_struct("Credentials")
            .field("serpapi_api_key", &mark(&self.serpapi_api_key))
            .field("gemini_api_key", &mark(&self.gemini_api_key))
            .field("ocr_endpoint", &mark(&self.ocr_endpoint))
            .finish()
    }
}

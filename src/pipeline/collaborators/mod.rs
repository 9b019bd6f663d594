//! External collaborators called once per record.
//!
//! Each collaborator is a trait with a blocking HTTP implementation and a
//! mock. HTTP failures are classified into `OperationError` here, in one
//! place, so every stage retries the same things:
//! - timeout, connection failure, 408, 429, 5xx → `Transport` (retried)
//! - other non-2xx, malformed URL → `PermanentInput` (fails fast)

pub mod search;
pub mod fetch;
pub mod caption;
pub mod ocr;

use std::time::Duration;

use crate::config::{ConfigError, APP_NAME, APP_VERSION};
use crate::pipeline::batch::OperationError;

pub use search::{ImageDescriptor, ImageSearch, MockImageSearch, SerpApiImageSearch};
pub use fetch::{FetchedImage, HttpImageFetcher, ImageFetcher, MockImageFetcher};
pub use caption::{GeminiCaptioner, MockCaptioner, VisionCaptioner};
pub use ocr::{HttpOcrClient, MockOcrClient, OcrClient};

/// Longest slice of a response body carried into an error message.
const MAX_ERROR_BODY: usize = 300;

/// Blocking client shared by all HTTP collaborators. `timeout` bounds each attempt.
pub fn http_client(timeout: Duration) -> Result<reqwest::blocking::Client, ConfigError> {
    reqwest::blocking::Client::builder()
        .timeout(timeout)
        .user_agent(format!("{APP_NAME}/{APP_VERSION}"))
        .build()
        .map_err(|e| ConfigError::Invalid(format!("cannot build HTTP client: {e}")))
}

/// Map a send-side reqwest error.
pub fn classify_request_error(e: &reqwest::Error) -> OperationError {
    if e.is_timeout() {
        OperationError::Transport(format!("request timed out: {e}"))
    } else if e.is_connect() {
        OperationError::Transport(format!("connection failed: {e}"))
    } else if e.is_builder() {
        OperationError::PermanentInput(format!("invalid request: {e}"))
    } else {
        OperationError::Transport(e.to_string())
    }
}

/// Map a non-success status. `body` is truncated before it lands in an error.
pub fn classify_status(status: u16, body: &str) -> OperationError {
    let detail = truncate(body.trim(), MAX_ERROR_BODY);
    let message = if detail.is_empty() {
        format!("HTTP {status}")
    } else {
        format!("HTTP {status}: {detail}")
    };
    if status == 408 || status == 429 || (500..600).contains(&status) {
        OperationError::Transport(message)
    } else {
        OperationError::PermanentInput(message)
    }
}

/// Parse `raw` as an absolute http(s) URL.
pub fn parse_http_url(raw: &str) -> Result<reqwest::Url, OperationError> {
    let url = reqwest::Url::parse(raw.trim())
        .map_err(|e| OperationError::PermanentInput(format!("malformed URL {raw:?}: {e}")))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(OperationError::PermanentInput(format!(
            "unsupported URL scheme {other:?}"
        ))),
    }
}

fn truncate(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}…", &s[..cut]),
        None => s.to_string(),
    }
}

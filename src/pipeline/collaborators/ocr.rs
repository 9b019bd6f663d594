use std::sync::atomic::{AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};

use super::{classify_request_error, classify_status, parse_http_url};
use crate::pipeline::batch::OperationError;

/// Returned by the endpoint contract when the body has no `response_message`.
pub const NO_CAPTION_FALLBACK: &str = "No caption generated";

/// Remote OCR/caption endpoint addressed by image URL.
pub trait OcrClient: Send + Sync {
    fn recognize(&self, image_url: &str) -> Result<String, OperationError>;
}

/// POSTs `{"image_url": ...}` and reads `response_message`.
pub struct HttpOcrClient {
    client: reqwest::blocking::Client,
    endpoint: String,
}

impl HttpOcrClient {
    pub fn new(client: reqwest::blocking::Client, endpoint: &str) -> Self {
        Self {
            client,
            endpoint: endpoint.to_string(),
        }
    }
}

#[derive(Serialize)]
struct OcrRequest<'a> {
    image_url: &'a str,
}

#[derive(Deserialize)]
struct OcrResponse {
    #[serde(default)]
    response_message: Option<String>,
}

fn parse_response(body: &str) -> Result<String, OperationError> {
    let parsed: OcrResponse = serde_json::from_str(body)
        .map_err(|e| OperationError::Transport(format!("malformed OCR response: {e}")))?;
    Ok(parsed
        .response_message
        .filter(|m| !m.trim().is_empty())
        .unwrap_or_else(|| NO_CAPTION_FALLBACK.to_string()))
}

impl OcrClient for HttpOcrClient {
    fn recognize(&self, image_url: &str) -> Result<String, OperationError> {
        parse_http_url(image_url)?;

        let response = self
            .client
            .post(&self.endpoint)
            .json(&OcrRequest { image_url })
            .send()
            .map_err(|e| classify_request_error(&e))?;

        let status = response.status();
        let body = response
            .text()
            .map_err(|e| OperationError::Transport(format!("cannot read OCR response: {e}")))?;
        if !status.is_success() {
            return Err(classify_status(status.as_u16(), &body));
        }
        parse_response(&body)
    }
}

/// Mock OCR client: answers `"ocr:<url>"`.
#[derive(Default)]
pub struct MockOcrClient {
    calls: AtomicUsize,
    fail_with: Option<OperationError>,
}

impl MockOcrClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(error: OperationError) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            fail_with: Some(error),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl OcrClient for MockOcrClient {
    fn recognize(&self, image_url: &str) -> Result<String, OperationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.fail_with {
            Some(error) => Err(error.clone()),
            None => Ok(format!("ocr:{image_url}")),
        }
    }
}

//! Vision-language captioning.
//!
//! `GeminiCaptioner` sends the prompt and the image as an inline base64 part
//! to `generateContent`. The API key goes in the `x-goog-api-key` header so
//! it never appears in a URL or an error message.

use std::sync::atomic::{AtomicUsize, Ordering};

use base64::Engine as _;
use serde::{Deserialize, Serialize};

use super::{classify_request_error, classify_status};
use crate::pipeline::batch::OperationError;

const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Produces a caption for one image.
pub trait VisionCaptioner: Send + Sync {
    fn caption(&self, image: &[u8], mime: &str, prompt: &str) -> Result<String, OperationError>;
}

pub struct GeminiCaptioner {
    client: reqwest::blocking::Client,
    base_url: String,
    model: String,
    api_key: String,
}

impl GeminiCaptioner {
    pub fn new(client: reqwest::blocking::Client, api_key: &str, model: &str) -> Self {
        Self {
            client,
            base_url: GEMINI_BASE_URL.to_string(),
            model: model.to_string(),
            api_key: api_key.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    contents: Vec<Content<'a>>,
}

#[derive(Serialize)]
struct Content<'a> {
    parts: Vec<Part<'a>>,
}

#[derive(Serialize)]
#[serde(untagged)]
enum Part<'a> {
    Text { text: &'a str },
    Inline { inline_data: InlineData<'a> },
}

#[derive(Serialize)]
struct InlineData<'a> {
    mime_type: &'a str,
    data: String,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    prompt_feedback: Option<PromptFeedback>,
}

#[derive(Deserialize)]
struct Candidate {
    #[serde(default)]
    content: Option<CandidateContent>,
}

#[derive(Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Deserialize)]
struct ResponsePart {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    #[serde(default)]
    block_reason: Option<String>,
}

fn build_request<'a>(image: &[u8], mime: &'a str, prompt: &'a str) -> GenerateRequest<'a> {
    GenerateRequest {
        contents: vec![Content {
            parts: vec![
                Part::Text { text: prompt },
                Part::Inline {
                    inline_data: InlineData {
                        mime_type: mime,
                        data: base64::engine::general_purpose::STANDARD.encode(image),
                    },
                },
            ],
        }],
    }
}

/// Extract the caption text from a `generateContent` body.
fn parse_response(body: &str) -> Result<String, OperationError> {
    let parsed: GenerateResponse = serde_json::from_str(body)
        .map_err(|e| OperationError::Transport(format!("malformed caption response: {e}")))?;

    if let Some(reason) = parsed.prompt_feedback.and_then(|f| f.block_reason) {
        return Err(OperationError::PermanentInput(format!("caption blocked: {reason}")));
    }

    let text: String = parsed
        .candidates
        .into_iter()
        .next()
        .and_then(|c| c.content)
        .map(|c| c.parts.into_iter().filter_map(|p| p.text).collect())
        .unwrap_or_default();

    let text = text.trim();
    if text.is_empty() {
        return Err(OperationError::Transport("caption response carried no text".into()));
    }
    Ok(text.to_string())
}

impl VisionCaptioner for GeminiCaptioner {
    fn caption(&self, image: &[u8], mime: &str, prompt: &str) -> Result<String, OperationError> {
        let url = format!("{}/models/{}:generateContent", self.base_url, self.model);
        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(&build_request(image, mime, prompt))
            .send()
            .map_err(|e| classify_request_error(&e))?;

        let status = response.status();
        let body = response
            .text()
            .map_err(|e| OperationError::Transport(format!("cannot read caption response: {e}")))?;
        if !status.is_success() {
            return Err(classify_status(status.as_u16(), &body));
        }

        parse_response(&body)
    }
}

/// Mock captioner. Returns a fixed caption, optionally after transient failures.
pub struct MockCaptioner {
    response: String,
    transient_failures: AtomicUsize,
    calls: AtomicUsize,
}

impl MockCaptioner {
    pub fn new(response: &str) -> Self {
        Self {
            response: response.to_string(),
            transient_failures: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_transient_failures(self, n: usize) -> Self {
        self.transient_failures.store(n, Ordering::SeqCst);
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl VisionCaptioner for MockCaptioner {
    fn caption(&self, image: &[u8], _mime: &str, _prompt: &str) -> Result<String, OperationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self
            .transient_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(OperationError::Transport("HTTP 503".into()));
        }
        if image.is_empty() {
            return Err(OperationError::PermanentInput("empty image".into()));
        }
        Ok(self.response.clone())
    }
}

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};

use super::{classify_request_error, classify_status};
use crate::pipeline::batch::OperationError;

const SERPAPI_ENDPOINT: &str = "https://serpapi.com/search.json";

/// Marker in SerpApi's `error` field when a page is simply past the last result.
const NO_RESULTS_MARKER: &str = "hasn't returned any results";

/// One image result of a search query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageDescriptor {
    pub title: String,
    pub original_url: String,
    pub thumbnail_url: String,
    pub source_website: String,
    pub width: u32,
    pub height: u32,
}

impl ImageDescriptor {
    /// `"<width>x<height>"`, as stored in the catalog.
    pub fn resolution(&self) -> String {
        format!("{}x{}", self.width, self.height)
    }
}

/// Image-search API.
pub trait ImageSearch: Send + Sync {
    /// One page of results for `query`. Pages are 0-based.
    fn search(&self, query: &str, page: u32) -> Result<Vec<ImageDescriptor>, OperationError>;
}

/// SerpApi `google_images` engine.
pub struct SerpApiImageSearch {
    client: reqwest::blocking::Client,
    endpoint: String,
    api_key: String,
}

impl SerpApiImageSearch {
    pub fn new(client: reqwest::blocking::Client, api_key: &str) -> Self {
        Self {
            client,
            endpoint: SERPAPI_ENDPOINT.to_string(),
            api_key: api_key.to_string(),
        }
    }

    pub fn with_endpoint(mut self, endpoint: &str) -> Self {
        self.endpoint = endpoint.to_string();
        self
    }
}

#[derive(Deserialize)]
struct SerpApiResponse {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    images_results: Vec<SerpApiImage>,
}

#[derive(Deserialize)]
struct SerpApiImage {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    original: Option<String>,
    #[serde(default)]
    thumbnail: Option<String>,
    #[serde(default)]
    source: Option<String>,
    #[serde(default)]
    original_width: Option<u32>,
    #[serde(default)]
    original_height: Option<u32>,
}

impl From<SerpApiImage> for ImageDescriptor {
    fn from(image: SerpApiImage) -> Self {
        Self {
            title: image.title.unwrap_or_default(),
            original_url: image.original.unwrap_or_default(),
            thumbnail_url: image.thumbnail.unwrap_or_default(),
            source_website: image.source.unwrap_or_default(),
            width: image.original_width.unwrap_or(0),
            height: image.original_height.unwrap_or(0),
        }
    }
}

/// Parse a SerpApi response body.
fn parse_response(body: &str) -> Result<Vec<ImageDescriptor>, OperationError> {
    let parsed: SerpApiResponse = serde_json::from_str(body)
        .map_err(|e| OperationError::Transport(format!("malformed search response: {e}")))?;

    if let Some(error) = parsed.error {
        if error.contains(NO_RESULTS_MARKER) {
            return Ok(Vec::new());
        }
        return Err(OperationError::PermanentInput(format!("search API error: {error}")));
    }

    Ok(parsed.images_results.into_iter().map(ImageDescriptor::from).collect())
}

impl ImageSearch for SerpApiImageSearch {
    fn search(&self, query: &str, page: u32) -> Result<Vec<ImageDescriptor>, OperationError> {
        let page = page.to_string();
        let response = self
            .client
            .get(&self.endpoint)
            .query(&[
                ("engine", "google_images"),
                ("q", query),
                ("ijn", page.as_str()),
                ("location", "Vietnam"),
                ("safe", "off"),
                ("num", "200"),
                ("api_key", self.api_key.as_str()),
            ])
            .send()
            // The request URL carries the API key
            .map_err(|e| classify_request_error(&e.without_url()))?;

        let status = response.status();
        let body = response
            .text()
            .map_err(|e| OperationError::Transport(format!("cannot read search response: {}", e.without_url())))?;
        if !status.is_success() {
            return Err(classify_status(status.as_u16(), &body));
        }

        parse_response(&body)
    }
}

/// Mock search returning canned pages. Unknown (query, page) pairs yield no results.
#[derive(Default)]
pub struct MockImageSearch {
    pages: HashMap<(String, u32), Result<Vec<ImageDescriptor>, OperationError>>,
    calls: AtomicUsize,
}

impl MockImageSearch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_page(mut self, query: &str, page: u32, results: Vec<ImageDescriptor>) -> Self {
        self.pages.insert((query.to_string(), page), Ok(results));
        self
    }

    pub fn with_error(mut self, query: &str, page: u32, error: OperationError) -> Self {
        self.pages.insert((query.to_string(), page), Err(error));
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ImageSearch for MockImageSearch {
    fn search(&self, query: &str, page: u32) -> Result<Vec<ImageDescriptor>, OperationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.pages
            .get(&(query.to_string(), page))
            .cloned()
            .unwrap_or_else(|| Ok(Vec::new()))
    }
}

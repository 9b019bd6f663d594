use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::{DateTime, Utc};

use super::{classify_request_error, classify_status, parse_http_url};
use crate::pipeline::batch::OperationError;

/// Downloaded image bytes plus the response headers the filters need.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedImage {
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
    /// Parsed `Last-Modified`. `None` when absent or unparseable.
    pub last_modified: Option<DateTime<Utc>>,
}

impl FetchedImage {
    pub fn new(bytes: Vec<u8>, content_type: &str) -> Self {
        Self {
            bytes,
            content_type: Some(content_type.to_string()),
            last_modified: None,
        }
    }

    pub fn with_last_modified(mut self, at: DateTime<Utc>) -> Self {
        self.last_modified = Some(at);
        self
    }
}

/// Parse an HTTP-date (`Wed, 21 Oct 2015 07:28:00 GMT`).
pub fn parse_http_date(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(raw.trim())
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Fetches image bytes by URL.
pub trait ImageFetcher: Send + Sync {
    fn fetch(&self, url: &str) -> Result<FetchedImage, OperationError>;
}

pub struct HttpImageFetcher {
    client: reqwest::blocking::Client,
}

impl HttpImageFetcher {
    pub fn new(client: reqwest::blocking::Client) -> Self {
        Self { client }
    }
}

impl ImageFetcher for HttpImageFetcher {
    fn fetch(&self, url: &str) -> Result<FetchedImage, OperationError> {
        let url = parse_http_url(url)?;
        let response = self
            .client
            .get(url)
            .send()
            .map_err(|e| classify_request_error(&e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(classify_status(status.as_u16(), &body));
        }

        let header = |name: reqwest::header::HeaderName| {
            response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        let content_type = header(reqwest::header::CONTENT_TYPE);
        let last_modified = header(reqwest::header::LAST_MODIFIED)
            .as_deref()
            .and_then(parse_http_date);

        let bytes = response
            .bytes()
            .map_err(|e| OperationError::Transport(format!("cannot read image body: {e}")))?
            .to_vec();

        Ok(FetchedImage {
            bytes,
            content_type,
            last_modified,
        })
    }
}

/// Mock fetcher with canned responses. Unknown URLs return HTTP 404.
#[derive(Default)]
pub struct MockImageFetcher {
    responses: HashMap<String, Result<FetchedImage, OperationError>>,
    fallback: Option<FetchedImage>,
    transient_failures: AtomicUsize,
    calls: AtomicUsize,
}

impl MockImageFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_image(mut self, url: &str, image: FetchedImage) -> Self {
        self.responses.insert(url.to_string(), Ok(image));
        self
    }

    pub fn with_error(mut self, url: &str, error: OperationError) -> Self {
        self.responses.insert(url.to_string(), Err(error));
        self
    }

    /// Serve `image` for every URL without a canned response.
    pub fn with_fallback(mut self, image: FetchedImage) -> Self {
        self.fallback = Some(image);
        self
    }

    /// Fail the first `n` calls with a transport error.
    pub fn with_transient_failures(self, n: usize) -> Self {
        self.transient_failures.store(n, Ordering::SeqCst);
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ImageFetcher for MockImageFetcher {
    fn fetch(&self, url: &str) -> Result<FetchedImage, OperationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let transient = self
            .transient_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if transient {
            return Err(OperationError::Transport("HTTP 503".into()));
        }

        match self.responses.get(url) {
            Some(response) => response.clone(),
            None => self
                .fallback
                .clone()
                .ok_or_else(|| OperationError::PermanentInput("HTTP 404".into())),
        }
    }
}

/// Encode a flat-colour PNG of the given size. For tests.
#[cfg(test)]
pub(crate) fn sample_png(width: u32, height: u32) -> Vec<u8> {
    let img = image::RgbImage::from_fn(width, height, |x, y| {
        image::Rgb([(x % 256) as u8, (y % 256) as u8, 128])
    });
    let mut buf = std::io::Cursor::new(Vec::new());
    image::DynamicImage::ImageRgb8(img)
        .write_to(&mut buf, image::ImageFormat::Png)
        .unwrap();
    buf.into_inner()
}

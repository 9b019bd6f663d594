//! Acceptance filters for crawled images.
//!
//! Two checkpoints: `check_descriptor` runs on search metadata before any
//! download, `check_response` on the fetched response headers. A failed
//! check is a `ContentRejected` error, which the processor records as a skip.

use chrono::{DateTime, Duration, Utc};

use crate::config::FilterConfig;
use crate::pipeline::batch::OperationError;

pub const MIN_WIDTH: u32 = 800;
pub const MIN_HEIGHT: u32 = 600;
pub const MIN_ASPECT_RATIO: f64 = 0.5;
pub const MAX_ASPECT_RATIO: f64 = 2.0;
/// Images last modified longer ago than this are dropped.
pub const MAX_IMAGE_AGE_DAYS: i64 = 5 * 365;

#[derive(Debug, Clone, PartialEq)]
pub struct ImageFilter {
    config: FilterConfig,
}

impl Default for ImageFilter {
    fn default() -> Self {
        Self::new(FilterConfig::default())
    }
}

impl ImageFilter {
    pub fn new(config: FilterConfig) -> Self {
        Self { config }
    }

    /// Resolution and aspect-ratio check on the advertised size.
    pub fn check_descriptor(&self, width: u32, height: u32) -> Result<(), OperationError> {
        let c = &self.config;
        if width < c.min_width || height < c.min_height {
            return Err(OperationError::ContentRejected(format!(
                "resolution {width}x{height} below {}x{}",
                c.min_width, c.min_height
            )));
        }
        let ratio = f64::from(width) / f64::from(height);
        if ratio < c.min_aspect_ratio || ratio > c.max_aspect_ratio {
            return Err(OperationError::ContentRejected(format!(
                "aspect ratio {ratio:.2} outside {}..{}",
                c.min_aspect_ratio, c.max_aspect_ratio
            )));
        }
        Ok(())
    }

    /// Content-type and age check on a fetched response.
    ///
    /// A missing `Last-Modified` is accepted; the content type must mention `image`.
    pub fn check_response(
        &self,
        content_type: Option<&str>,
        last_modified: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<(), OperationError> {
        let content_type = content_type.unwrap_or("");
        if !content_type.to_ascii_lowercase().contains("image") {
            return Err(OperationError::ContentRejected(format!(
                "content type {content_type:?} is not an image"
            )));
        }

        if let Some(modified) = last_modified {
            let age = now.signed_duration_since(modified);
            if age > Duration::days(self.config.max_age_days) {
                return Err(OperationError::ContentRejected(format!(
                    "last modified {} is older than {} days",
                    modified.format("%Y-%m-%d"),
                    self.config.max_age_days
                )));
            }
        }
        Ok(())
    }
}

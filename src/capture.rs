use std::thread;
use std::time::Duration;

use log::{info, warn};
use parking_lot::Mutex;

use crate::error::CaptureError;

/// A source of single still frames from the printer camera.
///
/// Used by the timelapse manager on its capture timer and by ad hoc
/// snapshot callers.
pub trait FrameSource: Send + Sync {
    fn fetch_frame(&self) -> Result<Vec<u8>, CaptureError>;
}

/// Camera snapshot fetcher with round-robin URLs and optional flipping.
///
/// Each call to [`FrameSource::fetch_frame`] makes exactly one request, so a
/// failing camera costs the timelapse one skipped frame and nothing more.
/// Manual snapshots can use [`SnapshotFetcher::fetch_with_retry`].
pub struct SnapshotFetcher {
    image_urls: Vec<String>,
    current_url_index: Mutex<usize>,
    flip_vertical: bool,
    client: reqwest::blocking::Client,
}

impl SnapshotFetcher {
    /// Create a new SnapshotFetcher.
    ///
    /// # Arguments
    ///
    /// * `image_urls` - URLs to fetch snapshots from (round-robin)
    /// * `flip_vertical` - Flip every frame vertically, for upside-down cameras
    /// * `timeout` - Upper bound for a single request
    pub fn new(image_urls: Vec<String>, flip_vertical: bool, timeout: Duration) -> Self {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::blocking::Client::new());

        Self {
            image_urls,
            current_url_index: Mutex::new(0),
            flip_vertical,
            client,
        }
    }

    /// Fetch a snapshot, retrying up to `max_retries` times.
    ///
    /// # Errors
    ///
    /// Returns [`CaptureError::RetriesExhausted`] once every attempt failed.
    pub fn fetch_with_retry(
        &self,
        max_retries: u32,
        retry_delay: Duration,
    ) -> Result<Vec<u8>, CaptureError> {
        let attempts = max_retries.max(1);
        for attempt in 1..=attempts {
            match self.fetch_frame() {
                Ok(data) => return Ok(data),
                Err(e) => {
                    warn!("Failed to fetch snapshot (attempt {}): {}", attempt, e);
                    if attempt < attempts {
                        info!("Retrying in {:?}...", retry_delay);
                        thread::sleep(retry_delay);
                    }
                }
            }
        }

        Err(CaptureError::RetriesExhausted { attempts })
    }

    /// Get the configured image URLs.
    pub fn image_urls(&self) -> &[String] {
        &self.image_urls
    }

    /// Pick the next URL and advance the round-robin cursor.
    fn next_url(&self) -> Option<&str> {
        if self.image_urls.is_empty() {
            return None;
        }
        let mut index = self.current_url_index.lock();
        let url = &self.image_urls[*index % self.image_urls.len()];
        *index = (*index + 1) % self.image_urls.len();
        Some(url)
    }

    fn attempt_fetch(&self, url: &str) -> Result<Vec<u8>, CaptureError> {
        let response = self
            .client
            .get(url)
            .send()
            .map_err(|e| CaptureError::Request {
                url: url.to_string(),
                reason: e.to_string(),
            })?;

        if !response.status().is_success() {
            return Err(CaptureError::Http {
                url: url.to_string(),
                status: response.status().as_u16(),
            });
        }

        let data = response.bytes().map_err(|e| CaptureError::Request {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

        // Cameras behind proxies sometimes answer 200 with an HTML error page.
        if image::guess_format(&data).is_err() {
            return Err(CaptureError::InvalidImage {
                url: url.to_string(),
            });
        }

        Ok(data.to_vec())
    }
}

impl FrameSource for SnapshotFetcher {
    fn fetch_frame(&self) -> Result<Vec<u8>, CaptureError> {
        let url = self.next_url().ok_or(CaptureError::NoSources)?;
        let data = self.attempt_fetch(url)?;
        apply_image_transformations(&data, self.flip_vertical)
    }
}

/// Apply image transformations (e.g., flipping) to a fetched frame.
///
/// # Arguments
///
/// * `image_data` - Raw image bytes
/// * `flip_vertical` - Whether to flip the image vertically
///
/// # Returns
///
/// Transformed image as bytes in the same format as the input
pub fn apply_image_transformations(
    image_data: &[u8],
    flip_vertical: bool,
) -> Result<Vec<u8>, CaptureError> {
    if !flip_vertical {
        return Ok(image_data.to_vec());
    }

    let dynamic_image = image::load_from_memory(image_data)
        .map_err(|e| CaptureError::Transform(e.to_string()))?;
    let flipped_image = dynamic_image.flipv();

    let mut buffer = Vec::new();
    let mut cursor = std::io::Cursor::new(&mut buffer);

    // Try to preserve the original format
    let format = image::guess_format(image_data).unwrap_or(image::ImageFormat::Jpeg);
    flipped_image
        .write_to(&mut cursor, format)
        .map_err(|e| CaptureError::Transform(e.to_string()))?;

    Ok(buffer)
}

//! Image fetching across local files, HTTP(s) and the cloud drive.
//!
//! Whatever the origin, bytes are decoded, bounded to a maximum pixel box and
//! handed on as PNG, the one format the transport sends.

use anyhow::{Context, Result};
use image::{imageops::FilterType, ImageFormat};
use std::io::{Cursor, Read};
use std::path::PathBuf;
use std::time::Duration;

use crate::cache::key::drive_file_id;
use crate::cache::ProviderMeta;

/// Longest edge of a prepared image, in pixels.
pub const MAX_DIMENSION: u32 = 1600;

const MAX_DOWNLOAD_BYTES: u64 = 32 * 1024 * 1024;
const DRIVE_DOWNLOAD_ENDPOINT: &str = "https://drive.google.com/uc";

/// A fetched, normalised image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedImage {
    /// PNG bytes.
    pub bytes: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub provider: Option<ProviderMeta>,
}

pub trait ImageSource: Send + Sync {
    fn fetch(&self, reference: &str) -> Result<FetchedImage>;
}

/// Where a reference points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Origin<'a> {
    Drive(&'a str),
    Http(&'a str),
    File(PathBuf),
}

pub fn classify(reference: &str) -> Origin<'_> {
    if let Some(id) = drive_file_id(reference) {
        return Origin::Drive(id);
    }
    if reference.starts_with("http://") || reference.starts_with("https://") {
        return Origin::Http(reference);
    }
    match local_path(reference) {
        Some(path) => Origin::File(path),
        None => Origin::File(PathBuf::from(reference)),
    }
}

/// Filesystem path named by `file://` or a bare (optionally `~`-prefixed)
/// path; `None` for remote references.
pub fn local_path(reference: &str) -> Option<PathBuf> {
    if reference.contains("://") && !reference.starts_with("file://") {
        return None;
    }
    if drive_file_id(reference).is_some() {
        return None;
    }
    let path = reference.strip_prefix("file://").unwrap_or(reference);
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return Some(home.join(rest));
        }
    }
    Some(PathBuf::from(path))
}

pub struct DefaultImageSource {
    agent: ureq::Agent,
    max_dimension: u32,
    drive_endpoint: String,
}

impl Default for DefaultImageSource {
    fn default() -> Self {
        Self::new()
    }
}

impl DefaultImageSource {
    pub fn new() -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(10))
            .timeout(Duration::from_secs(60))
            .build();
        Self {
            agent,
            max_dimension: MAX_DIMENSION,
            drive_endpoint: DRIVE_DOWNLOAD_ENDPOINT.to_string(),
        }
    }

    pub fn with_max_dimension(mut self, max: u32) -> Self {
        self.max_dimension = max.max(1);
        self
    }

    /// Download endpoint used for drive assets (`<endpoint>?export=download&id=<id>`).
    pub fn with_drive_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.drive_endpoint = endpoint.into();
        self
    }

    fn download(&self, url: &str) -> Result<(Vec<u8>, Option<String>)> {
        let response = self
            .agent
            .get(url)
            .call()
            .with_context(|| format!("Failed to fetch {}", url))?;
        let mime = response.header("Content-Type").map(str::to_string);

        let mut bytes = Vec::new();
        response
            .into_reader()
            .take(MAX_DOWNLOAD_BYTES)
            .read_to_end(&mut bytes)
            .with_context(|| format!("Failed to read response body from {}", url))?;
        Ok((bytes, mime))
    }

    /// Decode, bound to the maximum box, and re-encode as PNG. PNG input that
    /// already fits is passed through untouched.
    fn normalize(&self, bytes: Vec<u8>) -> Result<(Vec<u8>, u32, u32)> {
        let format = image::guess_format(&bytes).context("Unrecognised image format")?;
        let img = image::load_from_memory_with_format(&bytes, format)
            .context("Failed to decode image")?;

        let max = self.max_dimension;
        if format == ImageFormat::Png && img.width() <= max && img.height() <= max {
            return Ok((bytes, img.width(), img.height()));
        }

        let img = if img.width() > max || img.height() > max {
            img.resize(max, max, FilterType::Triangle)
        } else {
            img
        };

        let mut out = Vec::new();
        img.write_to(&mut Cursor::new(&mut out), ImageFormat::Png)
            .context("Failed to encode PNG")?;
        Ok((out, img.width(), img.height()))
    }
}

impl ImageSource for DefaultImageSource {
    fn fetch(&self, reference: &str) -> Result<FetchedImage> {
        let (raw, provider) = match classify(reference) {
            Origin::Drive(id) => {
                let url = format!("{}?export=download&id={}", self.drive_endpoint, id);
                let (bytes, mime) = self.download(&url)?;
                let meta = ProviderMeta {
                    provider: Some("gdrive".to_string()),
                    remote_id: Some(id.to_string()),
                    mime_type: mime,
                };
                (bytes, Some(meta))
            }
            Origin::Http(url) => {
                let (bytes, mime) = self.download(url)?;
                let meta = ProviderMeta {
                    provider: Some("http".to_string()),
                    remote_id: None,
                    mime_type: mime,
                };
                (bytes, Some(meta))
            }
            Origin::File(path) => {
                let bytes = std::fs::read(&path)
                    .with_context(|| format!("Failed to read image file: {}", path.display()))?;
                (bytes, None)
            }
        };

        let (bytes, width, height) = self
            .normalize(raw)
            .with_context(|| format!("Unusable image at {}", reference))?;
        tracing::debug!(reference, width, height, size = bytes.len(), "Fetched image");
        Ok(FetchedImage {
            bytes,
            width,
            height,
            provider,
        })
    }
}

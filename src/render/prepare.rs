//! Per-reference image preparation: cache lookup, fetch on miss, store.

use std::fmt;
use std::time::UNIX_EPOCH;

use super::cancel::{CancelToken, Cancelled};
use crate::cache::{content_fingerprint, ImageCache};
use crate::graphics::placeholder::MAX_GRID_CELLS;
use crate::session::Geometry;
use crate::source::{local_path, ImageSource};

/// Height of a terminal cell relative to its width, inverted: rows needed
/// per column of a square image.
pub const CELL_ASPECT: f64 = 0.42;

/// An image ready to transmit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedImage {
    pub reference: String,
    pub bytes: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub fingerprint: String,
    /// Protocol id recorded in the cache for this reference.
    pub cached_id: Option<u32>,
    pub from_cache: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrepareError {
    Cancelled,
    /// Fetch or decode failed; the message is shown inline.
    Failed(String),
}

impl fmt::Display for PrepareError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PrepareError::Cancelled => write!(f, "cancelled"),
            PrepareError::Failed(reason) => write!(f, "{}", reason),
        }
    }
}

impl std::error::Error for PrepareError {}

impl From<Cancelled> for PrepareError {
    fn from(_: Cancelled) -> Self {
        PrepareError::Cancelled
    }
}

/// Resolve `reference` to image bytes, fetching and storing on a miss.
///
/// Cancellation is honoured before the fetch and again before anything is
/// written to the cache. Cache write failures are logged; the fetched image is
/// still returned.
pub fn prepare(
    reference: &str,
    cache: &ImageCache,
    source: &dyn ImageSource,
    cancel: &CancelToken,
) -> Result<PreparedImage, PrepareError> {
    cancel.checkpoint()?;

    if let Some(hit) = from_cache(reference, cache) {
        return Ok(hit);
    }

    cancel.checkpoint()?;
    let fetched = source
        .fetch(reference)
        .map_err(|e| PrepareError::Failed(format!("{:#}", e)))?;
    cancel.checkpoint()?;

    if let Err(e) = cache.put_with_provider(
        reference,
        &fetched.bytes,
        fetched.width,
        fetched.height,
        fetched.provider.clone(),
    ) {
        tracing::warn!(reference, error = %e, "Failed to store image in cache");
    }
    // A re-stored reference keeps the id it had.
    let cached_id = cache.get_meta(reference).and_then(|m| m.image_id);

    Ok(PreparedImage {
        reference: reference.to_string(),
        fingerprint: content_fingerprint(&fetched.bytes),
        bytes: fetched.bytes,
        width: fetched.width,
        height: fetched.height,
        cached_id,
        from_cache: false,
    })
}

fn from_cache(reference: &str, cache: &ImageCache) -> Option<PreparedImage> {
    let meta = cache.get_meta(reference)?;

    if !is_fresh(reference, meta.created) {
        tracing::debug!(reference, "Local image changed since it was cached");
        return None;
    }

    let hit = cache.get(reference)?;
    let fingerprint = if meta.fingerprint.is_empty() {
        content_fingerprint(&hit.bytes)
    } else {
        meta.fingerprint
    };
    Some(PreparedImage {
        reference: reference.to_string(),
        bytes: hit.bytes,
        width: hit.width,
        height: hit.height,
        fingerprint,
        cached_id: meta.image_id,
        from_cache: true,
    })
}

/// False when `reference` is a local file modified after `created`
/// (milliseconds since the epoch). Remote references are always fresh.
pub fn is_fresh(reference: &str, created: u64) -> bool {
    match local_path(reference) {
        Some(path) => !matches!(modified_millis(&path), Some(m) if m > created),
        None => true,
    }
}

fn modified_millis(path: &std::path::Path) -> Option<u64> {
    let modified = std::fs::metadata(path).ok()?.modified().ok()?;
    let since = modified.duration_since(UNIX_EPOCH).ok()?;
    Some(since.as_millis() as u64)
}

/// Cell size for an image of `width` x `height` pixels in a view
/// `max_cols` wide, capped at `image_columns`.
pub fn image_geometry(width: u32, height: u32, max_cols: usize, image_columns: u32) -> Geometry {
    let available = max_cols.saturating_sub(2) as u32;
    let cols = if available > 0 {
        available.min(image_columns)
    } else {
        image_columns
    }
    .clamp(1, MAX_GRID_CELLS);

    let rows = if width == 0 {
        1
    } else {
        (height as f64 / width as f64 * cols as f64 * CELL_ASPECT) as u32
    }
    .clamp(1, MAX_GRID_CELLS);

    Geometry { cols, rows }
}

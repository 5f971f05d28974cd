//! On-disk cache index.
//!
//! One JSON document per cache directory listing every payload file and its
//! metadata. Rewritten whole on every mutation via temp file + rename.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use super::error::CacheError;

pub const INDEX_VERSION: u32 = 1;

/// Lowest image id handed out. Ids below this are left to other programs
/// drawing into the same terminal.
pub const FIRST_IMAGE_ID: u32 = 50;

/// Display metadata reported by the image provider (content type, remote id).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub reference: String,
    pub filename: String,
    /// Milliseconds since the epoch.
    pub created: u64,
    pub last_accessed: u64,
    pub size_bytes: u64,
    /// Pixel dimensions of the stored bitmap.
    pub width: u32,
    pub height: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_id: Option<u32>,
    #[serde(default)]
    pub last_cols: u32,
    #[serde(default)]
    pub last_rows: u32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub fingerprint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<ProviderMeta>,
    /// Insertion sequence; breaks ties between entries created in the same
    /// millisecond so eviction order is total.
    #[serde(default)]
    pub seq: u64,
}

impl CacheEntry {
    /// Ordering key for FIFO eviction.
    pub fn age_key(&self) -> (u64, u64) {
        (self.created, self.seq)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheIndex {
    pub version: u32,
    #[serde(default)]
    pub entries: HashMap<String, CacheEntry>,
    #[serde(default)]
    pub next_image_id: u32,
    /// Terminal session that last rewrote the index.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_session: Option<String>,
    #[serde(default)]
    pub next_seq: u64,
}

impl Default for CacheIndex {
    fn default() -> Self {
        Self {
            version: INDEX_VERSION,
            entries: HashMap::new(),
            next_image_id: FIRST_IMAGE_ID,
            last_session: None,
            next_seq: 0,
        }
    }
}

impl CacheIndex {
    /// Load the index at `path`, dropping entries whose payload file is gone
    /// from `cache_dir`. A missing index file yields an empty index.
    pub fn load(path: &Path, cache_dir: &Path) -> Result<Self, CacheError> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let data = std::fs::read(path).map_err(|e| CacheError::io(path, e))?;
        let mut index: CacheIndex = serde_json::from_slice(&data)?;

        index.entries.retain(|_, entry| {
            let present = cache_dir.join(&entry.filename).is_file();
            if !present {
                tracing::info!(
                    filename = %entry.filename,
                    "Removing stale cache entry for missing file"
                );
            }
            present
        });

        index.repair_counters();
        Ok(index)
    }

    /// Make sure the id and sequence counters sit above everything indexed,
    /// whatever an older or hand-edited index says.
    fn repair_counters(&mut self) {
        let max_id = self
            .entries
            .values()
            .filter_map(|e| e.image_id)
            .max()
            .unwrap_or(0);
        let floor = max_id.saturating_add(1).max(FIRST_IMAGE_ID);
        if self.next_image_id < floor {
            self.next_image_id = floor;
        }

        let max_seq = self.entries.values().map(|e| e.seq).max();
        if let Some(max_seq) = max_seq {
            self.next_seq = self.next_seq.max(max_seq + 1);
        }
    }

    /// Atomically replace the index file at `path`.
    pub fn save(&self, path: &Path) -> Result<(), CacheError> {
        let data = serde_json::to_vec_pretty(self)?;
        write_atomic(path, &data)
    }

    /// Key of the entry that was inserted first.
    pub fn oldest_key(&self) -> Option<String> {
        self.entries
            .iter()
            .min_by_key(|(_, e)| e.age_key())
            .map(|(k, _)| k.clone())
    }

    pub fn allocate_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }
}

/// Write `data` to a sibling temp file and rename it over `path`.
pub fn write_atomic(path: &Path, data: &[u8]) -> Result<(), CacheError> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = std::path::PathBuf::from(tmp);

    std::fs::write(&tmp, data).map_err(|e| CacheError::io(&tmp, e))?;
    if let Err(e) = std::fs::rename(&tmp, path) {
        let _ = std::fs::remove_file(&tmp);
        return Err(CacheError::io(path, e));
    }
    Ok(())
}

pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

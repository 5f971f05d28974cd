//! Disk-backed image cache.
//!
//! Maps canonicalised image references to previously fetched bitmap bytes
//! plus the graphics metadata needed to reuse a terminal-resident copy.
//! Eviction is strict FIFO by creation time: the working set of a running
//! preview is protected by the session ledger, not by cache recency.

pub mod error;
pub mod index;
pub mod key;
mod lock;

pub use error::CacheError;
pub use index::{CacheEntry, CacheIndex, ProviderMeta};
pub use key::{cache_key, canonical_reference};

use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use index::now_millis;
use lock::IndexWriteLock;

/// Default number of cached images.
pub const DEFAULT_MAX_ENTRIES: usize = 50;

const INDEX_FILE: &str = "cache_index.json";
const PAYLOAD_EXT: &str = "img";
const STAGED_EXT: &str = "staged";

/// Bytes and pixel dimensions returned by a cache hit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedImage {
    pub bytes: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

/// Entry count and total payload size.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub total_bytes: u64,
}

pub struct ImageCache {
    dir: PathBuf,
    index_path: PathBuf,
    max_entries: usize,
    index: RwLock<CacheIndex>,
    /// Terminal session recorded in the index as it was loaded, before this
    /// process rewrote it.
    previous_session: Option<String>,
    /// Terminal session this process runs in; stamped on every rewrite.
    session: RwLock<Option<String>>,
}

impl ImageCache {
    /// Open (creating if needed) the cache in `dir`.
    ///
    /// An unreadable or corrupt index is logged and replaced by an empty one
    /// rather than failing the caller.
    pub fn open(dir: impl Into<PathBuf>, max_entries: usize) -> Result<Self, CacheError> {
        let dir = dir.into();
        ensure_writable_dir(&dir)?;

        let index_path = dir.join(INDEX_FILE);
        let index = match CacheIndex::load(&index_path, &dir) {
            Ok(index) => index,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to load cache index, starting with empty cache");
                CacheIndex::default()
            }
        };

        tracing::debug!(
            dir = %dir.display(),
            entries = index.entries.len(),
            next_image_id = index.next_image_id,
            "Opened image cache"
        );

        Ok(Self {
            previous_session: index.last_session.clone(),
            dir,
            index_path,
            max_entries: max_entries.max(1),
            index: RwLock::new(index),
            session: RwLock::new(None),
        })
    }

    /// Record the terminal session identifier stamped on index rewrites.
    pub fn with_session(self, session: Option<String>) -> Self {
        self.set_session(session);
        self
    }

    /// Stamp later rewrites with `session`, e.g. after the terminal changed.
    pub fn set_session(&self, session: Option<String>) {
        *self.session.write().unwrap_or_else(PoisonError::into_inner) = session;
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    /// Session identifier found in the index when it was opened.
    pub fn previous_session(&self) -> Option<&str> {
        self.previous_session.as_deref()
    }

    fn read_index(&self) -> RwLockReadGuard<'_, CacheIndex> {
        self.index.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_index(&self) -> RwLockWriteGuard<'_, CacheIndex> {
        self.index.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Persist the index. Caller holds the write guard.
    fn save(&self, index: &mut CacheIndex) -> Result<(), CacheError> {
        let session = self
            .session
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if session.is_some() {
            index.last_session = session;
        }
        let _lock = IndexWriteLock::acquire(&self.dir).map_err(|e| CacheError::io(&self.dir, e))?;
        index.save(&self.index_path)
    }

    fn save_best_effort(&self, index: &mut CacheIndex) {
        if let Err(e) = self.save(index) {
            tracing::warn!(error = %e, "Failed to persist cache index");
        }
    }

    fn payload_path(&self, filename: &str) -> PathBuf {
        self.dir.join(filename)
    }

    /// Fetch cached bytes and pixel dimensions for `reference`.
    ///
    /// An entry whose payload has disappeared is dropped and reported as a
    /// miss.
    pub fn get(&self, reference: &str) -> Option<CachedImage> {
        let key = cache_key(reference);
        let entry = self.read_index().entries.get(&key).cloned()?;

        let path = self.payload_path(&entry.filename);
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::info!(reference, error = %e, "Cached payload unreadable, dropping entry");
                let mut index = self.write_index();
                index.entries.remove(&key);
                self.save_best_effort(&mut index);
                return None;
            }
        };

        {
            let mut index = self.write_index();
            if let Some(e) = index.entries.get_mut(&key) {
                e.last_accessed = now_millis();
            }
            self.save_best_effort(&mut index);
        }

        tracing::debug!(reference, key = %key, size = bytes.len(), "Image cache hit");
        Some(CachedImage {
            bytes,
            width: entry.width,
            height: entry.height,
        })
    }

    /// Store `bytes` for `reference`.
    pub fn put(&self, reference: &str, bytes: &[u8], width: u32, height: u32) -> Result<(), CacheError> {
        self.put_with_provider(reference, bytes, width, height, None)
    }

    /// Store `bytes` for `reference` together with provider display metadata.
    ///
    /// Re-storing an existing reference keeps its image id and last geometry,
    /// so a retransmission replaces the terminal's copy under the same id.
    /// Inserting a new reference into a full cache first evicts the single
    /// oldest entry.
    pub fn put_with_provider(
        &self,
        reference: &str,
        bytes: &[u8],
        width: u32,
        height: u32,
        provider: Option<ProviderMeta>,
    ) -> Result<(), CacheError> {
        let key = cache_key(reference);
        let filename = format!("{key}.{PAYLOAD_EXT}");
        let path = self.payload_path(&filename);

        // Staged outside the index lock; it replaces the live payload only
        // once the index describing it has been saved.
        let staged = self.payload_path(&format!("{filename}.{STAGED_EXT}"));
        std::fs::write(&staged, bytes).map_err(|e| CacheError::io(&staged, e))?;

        let mut index = self.write_index();
        let previous = index.entries.get(&key).cloned();

        if previous.is_none() && index.entries.len() >= self.max_entries {
            self.evict_oldest(&mut index);
        }

        let now = now_millis();
        let seq = index.allocate_seq();
        let mut entry = CacheEntry {
            reference: reference.to_string(),
            filename,
            created: now,
            last_accessed: now,
            size_bytes: bytes.len() as u64,
            width,
            height,
            image_id: None,
            last_cols: 0,
            last_rows: 0,
            fingerprint: content_fingerprint(bytes),
            provider,
            seq,
        };
        if let Some(prev) = previous.as_ref() {
            entry.image_id = prev.image_id;
            entry.last_cols = prev.last_cols;
            entry.last_rows = prev.last_rows;
            if entry.provider.is_none() {
                entry.provider = prev.provider.clone();
            }
        }
        index.entries.insert(key.clone(), entry);

        if let Err(e) = self.save(&mut index) {
            // The live payload is untouched, so the previous entry still
            // describes it.
            let _ = std::fs::remove_file(&staged);
            match previous {
                Some(prev) => index.entries.insert(key, prev),
                None => index.entries.remove(&key),
            };
            return Err(e);
        }

        if let Err(e) = std::fs::rename(&staged, &path) {
            // The saved index now describes bytes that never landed: drop
            // the entry so the reference reads as a miss.
            let _ = std::fs::remove_file(&staged);
            index.entries.remove(&key);
            self.save_best_effort(&mut index);
            return Err(CacheError::io(&path, e));
        }

        tracing::debug!(reference, key = %key, size = bytes.len(), width, height, "Stored image in cache");
        Ok(())
    }

    /// Remove the oldest entry (payload and record). Caller holds the lock.
    fn evict_oldest(&self, index: &mut CacheIndex) {
        let Some(oldest) = index.oldest_key() else {
            return;
        };
        if let Some(entry) = index.entries.remove(&oldest) {
            let path = self.payload_path(&entry.filename);
            if let Err(e) = std::fs::remove_file(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(path = %path.display(), error = %e, "Failed to remove evicted cache file");
                }
            }
            tracing::debug!(reference = %entry.reference, "Evicted oldest cache entry");
        }
    }

    /// Drop `reference` from the cache. Missing entries are not an error.
    pub fn invalidate(&self, reference: &str) -> Result<(), CacheError> {
        let key = cache_key(reference);
        let mut index = self.write_index();
        let Some(entry) = index.entries.remove(&key) else {
            return Ok(());
        };

        let path = self.payload_path(&entry.filename);
        if let Err(e) = std::fs::remove_file(&path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %path.display(), error = %e, "Failed to remove invalidated cache file");
            }
        }
        tracing::debug!(reference, "Invalidated cache entry");
        self.save(&mut index)
    }

    /// Reserve the next protocol image id. Ids increase monotonically and
    /// persist across runs; a failed index write is logged, the id stays
    /// reserved in memory.
    pub fn next_image_id(&self) -> u32 {
        let mut index = self.write_index();
        if index.next_image_id < index::FIRST_IMAGE_ID {
            index.next_image_id = index::FIRST_IMAGE_ID;
        }
        let id = index.next_image_id;
        index.next_image_id = id.wrapping_add(1).max(index::FIRST_IMAGE_ID);
        self.save_best_effort(&mut index);
        id
    }

    /// Full entry for `reference`, if cached.
    pub fn get_meta(&self, reference: &str) -> Option<CacheEntry> {
        self.read_index().entries.get(&cache_key(reference)).cloned()
    }

    /// Record the protocol id and geometry last used for `reference`.
    ///
    /// An empty `fingerprint` leaves the stored one untouched.
    pub fn update_meta(
        &self,
        reference: &str,
        image_id: u32,
        cols: u32,
        rows: u32,
        fingerprint: &str,
    ) -> Result<(), CacheError> {
        let key = cache_key(reference);
        let mut index = self.write_index();

        let entry = index
            .entries
            .get_mut(&key)
            .ok_or_else(|| CacheError::EntryMissing {
                reference: reference.to_string(),
            })?;
        entry.image_id = Some(image_id);
        entry.last_cols = cols;
        entry.last_rows = rows;
        if !fingerprint.is_empty() {
            entry.fingerprint = fingerprint.to_string();
        }
        entry.last_accessed = now_millis();

        if image_id >= index.next_image_id {
            index.next_image_id = image_id.saturating_add(1);
        }

        self.save(&mut index)
    }

    /// (image id, fingerprint) of every entry carrying a protocol id.
    pub fn resident_candidates(&self) -> Vec<(u32, String)> {
        self.read_index()
            .entries
            .values()
            .filter_map(|e| e.image_id.map(|id| (id, e.fingerprint.clone())))
            .collect()
    }

    pub fn stats(&self) -> CacheStats {
        let index = self.read_index();
        CacheStats {
            entries: index.entries.len(),
            total_bytes: index.entries.values().map(|e| e.size_bytes).sum(),
        }
    }
}

/// Content signature of a payload.
pub fn content_fingerprint(bytes: &[u8]) -> String {
    format!("{:016x}", xxhash_rust::xxh3::xxh3_64(bytes))
}

fn ensure_writable_dir(dir: &Path) -> Result<(), CacheError> {
    std::fs::create_dir_all(dir).map_err(|e| CacheError::io(dir, e))?;
    let probe = dir.join(".write_test");
    std::fs::write(&probe, b"test").map_err(|e| CacheError::io(&probe, e))?;
    let _ = std::fs::remove_file(&probe);
    Ok(())
}

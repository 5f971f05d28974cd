//! Per-process record of which image ids the attached terminal holds.
//!
//! The graphics protocol never reports evictions, so ids inherited from the
//! disk cache are only *assumed* resident (unconfirmed) until this process
//! transmits them itself.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError, RwLock};

use crate::cache::ImageCache;

/// Cell size of a placement.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Geometry {
    pub cols: u32,
    pub rows: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEntry {
    pub image_id: u32,
    /// This process transmitted the data (as opposed to inheriting the id).
    pub confirmed: bool,
    pub geometry: Option<Geometry>,
    /// Content fingerprint of the data behind the id; empty if unknown.
    pub fingerprint: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Residency {
    Absent,
    Unconfirmed,
    Confirmed,
}

impl Residency {
    pub fn is_resident(self) -> bool {
        self != Residency::Absent
    }
}

#[derive(Debug)]
struct LedgerState {
    seeded: bool,
    /// Terminal session last reported by the capability probe.
    session_id: Option<String>,
    /// Ids recorded in the disk cache may still be held by this terminal.
    /// Cleared for good once the terminal is known to have changed.
    inherit_from_cache: bool,
}

pub struct SessionLedger {
    entries: RwLock<HashMap<u32, SessionEntry>>,
    state: Mutex<LedgerState>,
    /// Treat unconfirmed ids as usable without retransmission.
    trust_unconfirmed: bool,
}

impl SessionLedger {
    pub fn new(trust_unconfirmed: bool) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            state: Mutex::new(LedgerState {
                seeded: false,
                session_id: None,
                inherit_from_cache: true,
            }),
            trust_unconfirmed,
        }
    }

    pub fn residency(&self, image_id: u32) -> Residency {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        match entries.get(&image_id) {
            Some(e) if e.confirmed => Residency::Confirmed,
            Some(_) => Residency::Unconfirmed,
            None => Residency::Absent,
        }
    }

    pub fn entry(&self, image_id: u32) -> Option<SessionEntry> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries.get(&image_id).cloned()
    }

    /// Whether `image_id` may be displayed without resending its data.
    ///
    /// Requires the id to be known with matching content, and either
    /// confirmed by this process or trusted by policy.
    pub fn is_reusable(&self, image_id: u32, fingerprint: &str) -> bool {
        let Some(entry) = self.entry(image_id) else {
            return false;
        };
        let same_content = entry.fingerprint.is_empty() || entry.fingerprint == fingerprint;
        same_content && (entry.confirmed || self.trust_unconfirmed)
    }

    /// Record that this process has just transmitted `image_id`.
    pub fn mark_resident(&self, image_id: u32, geometry: Geometry, fingerprint: &str) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.insert(
            image_id,
            SessionEntry {
                image_id,
                confirmed: true,
                geometry: Some(geometry),
                fingerprint: fingerprint.to_string(),
            },
        );
    }

    /// Record new geometry for an id that stays resident.
    pub fn update_geometry(&self, image_id: u32, geometry: Geometry) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(e) = entries.get_mut(&image_id) {
            e.geometry = Some(geometry);
        }
    }

    /// Inherit ids from the disk cache as unconfirmed entries.
    ///
    /// Runs once per terminal session and only when the cache index was last
    /// written from the session observed through [`observe_session`]; ids
    /// from another window mean nothing here. Nothing is inherited after the
    /// terminal changed or the cache was disowned. Confirmed entries are
    /// never downgraded. Returns the number of ids added.
    ///
    /// [`observe_session`]: SessionLedger::observe_session
    pub fn seed_from_cache(&self, cache: &ImageCache) -> usize {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if state.seeded {
                return 0;
            }
            state.seeded = true;

            if !state.inherit_from_cache {
                tracing::debug!("Cache ids disowned, not seeding session ledger");
                return 0;
            }
            match (cache.previous_session(), state.session_id.as_deref()) {
                (Some(prev), Some(cur)) if prev == cur => {}
                (prev, cur) => {
                    tracing::debug!(?prev, ?cur, "Not seeding session ledger from another terminal session");
                    return 0;
                }
            }
        }

        let mut added = 0;
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        for (image_id, fingerprint) in cache.resident_candidates() {
            if fingerprint.is_empty() || entries.contains_key(&image_id) {
                continue;
            }
            entries.insert(
                image_id,
                SessionEntry {
                    image_id,
                    confirmed: false,
                    geometry: None,
                    fingerprint,
                },
            );
            added += 1;
        }
        tracing::debug!(added, "Seeded session ledger from cache");
        added
    }

    /// Note the terminal session reported by the capability probe. A change
    /// from a previously observed session clears all residency state.
    /// Returns true when a reset happened.
    pub fn observe_session(&self, session_id: Option<&str>) -> bool {
        let changed = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            let changed = match (&state.session_id, session_id) {
                (Some(prev), Some(cur)) => prev != cur,
                (Some(_), None) => true,
                (None, _) => false,
            };
            state.session_id = session_id.map(str::to_string);
            changed
        };
        if changed {
            tracing::info!(?session_id, "Terminal session changed, resetting image residency");
            self.disown_cache();
        }
        changed
    }

    /// Forget everything and never inherit ids from the disk cache again:
    /// the terminal holding them is gone or was purged.
    pub fn disown_cache(&self) {
        self.reset();
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .inherit_from_cache = false;
    }

    /// Forget everything: all ids become absent and seeding may run again.
    pub fn reset(&self) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .seeded = false;
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const GEO: Geometry = Geometry { cols: 10, rows: 4 };

    fn cache_with_ids(dir: &std::path::Path, session: &str) {
        let cache = ImageCache::open(dir, 10)
            .unwrap()
            .with_session(Some(session.to_string()));
        cache.put("a", b"aaa", 1, 1).unwrap();
        cache.put("b", b"bbb", 1, 1).unwrap();
        cache.put("c", b"ccc", 1, 1).unwrap();
        cache.update_meta("a", 60, 1, 1, "").unwrap();
        cache.update_meta("b", 61, 1, 1, "").unwrap();
    }

    #[test]
    fn test_mark_resident_is_confirmed() {
        let ledger = SessionLedger::new(false);
        assert_eq!(ledger.residency(51), Residency::Absent);
        ledger.mark_resident(51, GEO, "fp");
        assert_eq!(ledger.residency(51), Residency::Confirmed);
        assert_eq!(ledger.entry(51).unwrap().geometry, Some(GEO));
        assert!(ledger.is_reusable(51, "fp"));
        assert!(!ledger.is_reusable(51, "other"));
    }

    #[test]
    fn test_seed_same_session_is_unconfirmed() {
        let dir = tempdir().unwrap();
        cache_with_ids(dir.path(), "win-1");
        let cache = ImageCache::open(dir.path(), 10).unwrap();

        let ledger = SessionLedger::new(false);
        ledger.observe_session(Some("win-1"));
        assert_eq!(ledger.seed_from_cache(&cache), 2);
        assert_eq!(ledger.residency(60), Residency::Unconfirmed);
        assert!(ledger.residency(61).is_resident());

        let fp = cache.get_meta("a").unwrap().fingerprint;
        assert!(!ledger.is_reusable(60, &fp));
    }

    #[test]
    fn test_trust_mode_reuses_unconfirmed() {
        let dir = tempdir().unwrap();
        cache_with_ids(dir.path(), "win-1");
        let cache = ImageCache::open(dir.path(), 10).unwrap();

        let ledger = SessionLedger::new(true);
        ledger.observe_session(Some("win-1"));
        ledger.seed_from_cache(&cache);
        let fp = cache.get_meta("a").unwrap().fingerprint;
        assert!(ledger.is_reusable(60, &fp));
    }

    #[test]
    fn test_seed_other_session_is_skipped() {
        let dir = tempdir().unwrap();
        cache_with_ids(dir.path(), "win-1");
        let cache = ImageCache::open(dir.path(), 10).unwrap();

        let ledger = SessionLedger::new(true);
        ledger.observe_session(Some("win-2"));
        assert_eq!(ledger.seed_from_cache(&cache), 0);
        assert!(ledger.is_empty());

        let unobserved = SessionLedger::new(true);
        assert_eq!(unobserved.seed_from_cache(&cache), 0);
    }

    #[test]
    fn test_seed_runs_once_and_keeps_confirmed() {
        let dir = tempdir().unwrap();
        cache_with_ids(dir.path(), "w");
        let cache = ImageCache::open(dir.path(), 10).unwrap();

        let ledger = SessionLedger::new(false);
        ledger.observe_session(Some("w"));
        ledger.mark_resident(60, GEO, "mine");
        assert_eq!(ledger.seed_from_cache(&cache), 1);
        assert_eq!(ledger.residency(60), Residency::Confirmed);
        assert_eq!(ledger.entry(60).unwrap().fingerprint, "mine");
        assert_eq!(ledger.seed_from_cache(&cache), 0);
    }

    #[test]
    fn test_session_change_resets() {
        let ledger = SessionLedger::new(false);
        assert!(!ledger.observe_session(Some("1")));
        ledger.mark_resident(51, GEO, "");
        assert!(!ledger.observe_session(Some("1")));
        assert_eq!(ledger.len(), 1);
        assert!(ledger.observe_session(Some("2")));
        assert!(ledger.is_empty());
    }

    #[test]
    fn test_reset_allows_reseeding() {
        let dir = tempdir().unwrap();
        cache_with_ids(dir.path(), "w");
        let cache = ImageCache::open(dir.path(), 10).unwrap();

        let ledger = SessionLedger::new(false);
        ledger.observe_session(Some("w"));
        ledger.seed_from_cache(&cache);
        ledger.reset();
        assert!(ledger.is_empty());
        assert_eq!(ledger.seed_from_cache(&cache), 2);
    }

    #[test]
    fn test_session_change_stops_inheriting() {
        let dir = tempdir().unwrap();
        cache_with_ids(dir.path(), "w");
        let cache = ImageCache::open(dir.path(), 10).unwrap();

        let ledger = SessionLedger::new(true);
        ledger.observe_session(Some("w"));
        assert_eq!(ledger.seed_from_cache(&cache), 2);

        assert!(ledger.observe_session(Some("w9")));
        assert!(ledger.is_empty());
        assert_eq!(ledger.seed_from_cache(&cache), 0);

        // Returning to the cache's session does not revive the old ids.
        assert!(ledger.observe_session(Some("w")));
        assert_eq!(ledger.seed_from_cache(&cache), 0);
        assert!(ledger.is_empty());
    }

    #[test]
    fn test_disowned_cache_is_never_seeded() {
        let dir = tempdir().unwrap();
        cache_with_ids(dir.path(), "w");
        let cache = ImageCache::open(dir.path(), 10).unwrap();

        let ledger = SessionLedger::new(true);
        ledger.observe_session(Some("w"));
        ledger.disown_cache();
        assert_eq!(ledger.seed_from_cache(&cache), 0);
    }

    #[test]
    fn test_update_geometry_only_for_known_ids() {
        let ledger = SessionLedger::new(false);
        ledger.update_geometry(70, GEO);
        assert!(ledger.entry(70).is_none());
        ledger.mark_resident(70, Geometry::default(), "");
        ledger.update_geometry(70, GEO);
        assert_eq!(ledger.entry(70).unwrap().geometry, Some(GEO));
    }
}

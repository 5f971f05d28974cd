//! Cache key derivation.
//!
//! Image references are canonicalised before hashing so that differently
//! formatted URLs pointing at the same remote asset share one cache entry.

use regex::Regex;
use sha2::{Digest, Sha256};
use std::borrow::Cow;
use std::sync::LazyLock;

/// Scheme prefix of the canonical form for cloud-drive assets.
pub const DRIVE_SCHEME: &str = "gdrive:";

/// Hex characters kept from the digest. 64 bits is plenty for a cache
/// bounded to a few dozen entries and keeps payload filenames short.
pub const KEY_LEN: usize = 16;

static DRIVE_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]+$").expect("drive id regex must compile"));

/// `/d/<id>` as used by `/file/d/<id>/view` and `/document/d/<id>/edit`.
static DRIVE_PATH_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"/d/([A-Za-z0-9_-]+)").expect("drive path regex must compile"));

/// `?id=<id>` as used by `open?id=` and `uc?export=download&id=`.
static DRIVE_QUERY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[?&]id=([A-Za-z0-9_-]+)").expect("drive query regex must compile")
});

/// Extract the cloud-drive file id from a reference, if it names one.
///
/// Accepts the canonical `gdrive:<id>` form as well as the URL shapes the
/// drive web UI hands out.
pub fn drive_file_id(reference: &str) -> Option<&str> {
    if let Some(id) = reference.strip_prefix(DRIVE_SCHEME) {
        return DRIVE_ID_RE.is_match(id).then_some(id);
    }

    if !is_drive_url(reference) {
        return None;
    }

    DRIVE_PATH_RE
        .captures(reference)
        .or_else(|| DRIVE_QUERY_RE.captures(reference))
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
}

fn is_drive_url(reference: &str) -> bool {
    let rest = reference
        .strip_prefix("https://")
        .or_else(|| reference.strip_prefix("http://"));
    match rest {
        Some(rest) => {
            let host = rest.split(['/', '?']).next().unwrap_or("");
            host == "drive.google.com" || host == "docs.google.com"
        }
        None => false,
    }
}

/// Normalise a reference to the form that is hashed.
///
/// Drive assets collapse to `gdrive:<id>`; everything else is used verbatim.
pub fn canonical_reference(reference: &str) -> Cow<'_, str> {
    match drive_file_id(reference) {
        Some(id) if !reference.starts_with(DRIVE_SCHEME) => {
            Cow::Owned(format!("{DRIVE_SCHEME}{id}"))
        }
        _ => Cow::Borrowed(reference),
    }
}

/// Fixed-length hex digest of the canonical reference.
pub fn cache_key(reference: &str) -> String {
    let digest = Sha256::digest(canonical_reference(reference).as_bytes());
    let mut key = hex::encode(digest);
    key.truncate(KEY_LEN);
    key
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_drive_id_from_canonical_form() {
        assert_eq!(drive_file_id("gdrive:FILE123"), Some("FILE123"));
        assert_eq!(drive_file_id("gdrive:bad/id"), None);
        assert_eq!(drive_file_id("gdrive:"), None);
    }

    #[test]
    fn test_drive_id_from_urls() {
        assert_eq!(
            drive_file_id("https://drive.google.com/file/d/FILE123/view"),
            Some("FILE123")
        );
        assert_eq!(
            drive_file_id("https://drive.google.com/file/d/FILE123/view?usp=sharing"),
            Some("FILE123")
        );
        assert_eq!(
            drive_file_id("https://drive.google.com/open?id=FILE123"),
            Some("FILE123")
        );
        assert_eq!(
            drive_file_id("https://drive.google.com/uc?export=download&id=FILE123"),
            Some("FILE123")
        );
    }

    #[test]
    fn test_non_drive_urls_are_not_rewritten() {
        assert_eq!(drive_file_id("https://example.com/d/FILE123/x.png"), None);
        assert_eq!(drive_file_id("/home/user/d/pic.png"), None);
        assert_eq!(
            canonical_reference("https://example.com/a.png"),
            "https://example.com/a.png"
        );
    }

    #[test]
    fn test_equivalent_drive_references_share_key() {
        let k = cache_key("gdrive:FILE123");
        assert_eq!(k, cache_key("https://drive.google.com/file/d/FILE123/view"));
        assert_eq!(k, cache_key("https://drive.google.com/open?id=FILE123"));
        assert_ne!(k, cache_key("gdrive:FILE124"));
    }

    #[test]
    fn test_key_length_is_fixed() {
        assert_eq!(cache_key("").len(), KEY_LEN);
        assert_eq!(cache_key("/tmp/x.png").len(), KEY_LEN);
        assert!(cache_key("a").chars().all(|c| c.is_ascii_hexdigit()));
    }

    proptest! {
        #[test]
        fn prop_drive_url_shapes_collide(id in "[A-Za-z0-9_-]{1,40}") {
            let canonical = cache_key(&format!("gdrive:{id}"));
            prop_assert_eq!(&canonical, &cache_key(&format!("https://drive.google.com/file/d/{id}/view")));
            prop_assert_eq!(&canonical, &cache_key(&format!("https://drive.google.com/open?id={id}")));
            prop_assert_eq!(&canonical, &cache_key(&format!("https://docs.google.com/uc?export=download&id={id}")));
        }

        #[test]
        fn prop_plain_references_hash_verbatim(path in "/[a-z]{1,12}/[a-z]{1,12}\\.png") {
            let canonical = canonical_reference(&path);
            prop_assert_eq!(canonical.as_ref(), path.as_str());
            prop_assert_eq!(cache_key(&path), cache_key(&path.clone()));
        }
    }
}

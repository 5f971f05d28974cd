//! Cache store error types.

use std::fmt;
use std::path::PathBuf;

/// Error returned by fallible cache store operations.
#[derive(Debug)]
pub enum CacheError {
    /// Metadata mutation against a reference that has no entry.
    EntryMissing { reference: String },

    /// Filesystem failure on the index or a payload file.
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Index (de)serialization failure.
    Serialize(serde_json::Error),
}

impl CacheError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        CacheError::Io {
            path: path.into(),
            source,
        }
    }

    /// True for the "no such entry" condition, which callers usually treat
    /// as a normal miss rather than a failure.
    pub fn is_missing(&self) -> bool {
        matches!(self, CacheError::EntryMissing { .. })
    }
}

impl fmt::Display for CacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheError::EntryMissing { reference } => {
                write!(f, "cache entry not found for reference: {}", reference)
            }
            CacheError::Io { path, source } => {
                write!(f, "cache I/O error on {}: {}", path.display(), source)
            }
            CacheError::Serialize(e) => write!(f, "cache index serialization failed: {}", e),
        }
    }
}

impl std::error::Error for CacheError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CacheError::Io { source, .. } => Some(source),
            CacheError::Serialize(e) => Some(e),
            CacheError::EntryMissing { .. } => None,
        }
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(e: serde_json::Error) -> Self {
        CacheError::Serialize(e)
    }
}

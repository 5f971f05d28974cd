//! Config types for lazynote.

use serde::Deserialize;
use std::path::PathBuf;

use crate::cache::DEFAULT_MAX_ENTRIES;
use crate::render::{PipelineSettings, DEFAULT_WORKERS};

/// Top-level keys accepted in the config file.
pub const KNOWN_FIELDS: &[&str] = &[
    "images",
    "image_columns",
    "right_padding",
    "workers",
    "trust_terminal_cache",
    "seed_from_cache",
    "verbose_protocol",
    "cache",
];

/// Keys accepted under `cache:`.
pub const KNOWN_CACHE_FIELDS: &[&str] = &["dir", "max_entries"];

/// Raw config file structure, mirroring the YAML. Unknown fields are
/// rejected.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawConfig {
    pub images: Option<bool>,
    pub image_columns: Option<u32>,
    pub right_padding: Option<usize>,
    pub workers: Option<usize>,
    pub trust_terminal_cache: Option<bool>,
    pub seed_from_cache: Option<bool>,
    pub verbose_protocol: Option<bool>,
    pub cache: Option<RawCacheConfig>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawCacheConfig {
    /// Cache directory (may contain tilde).
    pub dir: Option<PathBuf>,
    pub max_entries: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    /// Expanded cache directory.
    pub dir: PathBuf,
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: default_cache_dir(),
            max_entries: DEFAULT_MAX_ENTRIES,
        }
    }
}

/// Resolved configuration: file values over defaults, environment over both.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub images: bool,
    pub image_columns: u32,
    pub right_padding: usize,
    pub workers: usize,
    pub trust_terminal_cache: bool,
    pub seed_from_cache: bool,
    pub verbose_protocol: bool,
    pub cache: CacheConfig,
    /// File the values came from, if any.
    pub source_path: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        let pipeline = PipelineSettings::default();
        Self {
            images: pipeline.images,
            image_columns: pipeline.image_columns,
            right_padding: pipeline.right_padding,
            workers: DEFAULT_WORKERS,
            trust_terminal_cache: pipeline.trust_terminal_cache,
            seed_from_cache: pipeline.seed_from_cache,
            verbose_protocol: !pipeline.quiet,
            cache: CacheConfig::default(),
            source_path: None,
        }
    }
}

impl Config {
    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            images: self.images,
            image_columns: self.image_columns,
            right_padding: self.right_padding,
            workers: self.workers,
            trust_terminal_cache: self.trust_terminal_cache,
            seed_from_cache: self.seed_from_cache,
            quiet: !self.verbose_protocol,
        }
    }
}

/// `<cache dir>/lazynote/images`.
pub fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("lazynote")
        .join("images")
}

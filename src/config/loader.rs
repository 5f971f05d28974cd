//! Config loading for lazynote.
//!
//! Reads the YAML file, layers environment overrides on top, validates.

use regex::Regex;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use crate::config::error::ConfigError;
use crate::config::types::{Config, RawConfig, KNOWN_CACHE_FIELDS, KNOWN_FIELDS};

/// Any non-empty value trusts ids inherited from the cache without
/// retransmitting.
pub const TRUST_ENV: &str = "LAZYNOTE_TRUST_TERMINAL_CACHE";
/// Any non-empty value disables seeding the session ledger from the cache.
pub const DISABLE_SEEDING_ENV: &str = "LAZYNOTE_DISABLE_CACHE_SEEDING";
/// Any non-empty value asks the terminal to report graphics errors.
pub const VERBOSE_ENV: &str = "LAZYNOTE_GRAPHICS_VERBOSE";

static UNKNOWN_FIELD_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"unknown field `([^`]+)`").expect("unknown field regex must compile")
});

/// `<config dir>/lazynote/config.yaml`.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("lazynote").join("config.yaml"))
}

/// Expand tilde in path to home directory.
pub fn expand_path(path: &Path) -> PathBuf {
    let path_str = path.to_string_lossy();

    if let Some(rest) = path_str.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    } else if path_str == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    }

    path.to_path_buf()
}

/// Load the config from `explicit`, or from the default location.
///
/// An explicit path must exist; a missing default file yields defaults.
/// Environment overrides are applied in both cases.
pub fn load(explicit: Option<&Path>) -> Result<Config, ConfigError> {
    let mut config = match explicit {
        Some(path) => load_file(path)?,
        None => match default_config_path() {
            Some(path) if path.exists() => load_file(&path)?,
            _ => Config::default(),
        },
    };
    apply_env(&mut config, |name| std::env::var(name).ok());
    Ok(config)
}

/// Parse and validate one config file.
pub fn load_file(path: &Path) -> Result<Config, ConfigError> {
    let content = fs::read_to_string(path).map_err(|e| ConfigError::Io {
        path: path.to_path_buf(),
        source: e,
    })?;
    let raw = parse(path, &content)?;
    resolve(path, raw)
}

fn parse(path: &Path, content: &str) -> Result<RawConfig, ConfigError> {
    let only_comments = content
        .lines()
        .map(str::trim)
        .all(|l| l.is_empty() || l.starts_with('#'));
    if only_comments {
        return Ok(RawConfig::default());
    }

    serde_saphyr::from_str(content).map_err(|e| {
        let message = e.to_string();
        let suggestion = UNKNOWN_FIELD_RE
            .captures(&message)
            .and_then(|c| c.get(1))
            .and_then(|m| suggest_field(m.as_str()));
        ConfigError::Parse {
            path: path.to_path_buf(),
            message,
            suggestion,
        }
    })
}

/// Closest known key to a misspelt one, if any is close enough.
pub fn suggest_field(unknown: &str) -> Option<String> {
    KNOWN_FIELDS
        .iter()
        .chain(KNOWN_CACHE_FIELDS)
        .map(|known| (known, strsim::jaro_winkler(unknown, known)))
        .filter(|(_, score)| *score > 0.8)
        .max_by(|a, b| a.1.total_cmp(&b.1))
        .map(|(known, _)| known.to_string())
}

fn resolve(path: &Path, raw: RawConfig) -> Result<Config, ConfigError> {
    let defaults = Config::default();
    let cache = raw.cache.unwrap_or_default();

    let config = Config {
        images: raw.images.unwrap_or(defaults.images),
        image_columns: raw.image_columns.unwrap_or(defaults.image_columns),
        right_padding: raw.right_padding.unwrap_or(defaults.right_padding),
        workers: raw.workers.unwrap_or(defaults.workers),
        trust_terminal_cache: raw
            .trust_terminal_cache
            .unwrap_or(defaults.trust_terminal_cache),
        seed_from_cache: raw.seed_from_cache.unwrap_or(defaults.seed_from_cache),
        verbose_protocol: raw.verbose_protocol.unwrap_or(defaults.verbose_protocol),
        cache: crate::config::types::CacheConfig {
            dir: cache
                .dir
                .as_deref()
                .map(expand_path)
                .unwrap_or(defaults.cache.dir),
            max_entries: cache.max_entries.unwrap_or(defaults.cache.max_entries),
        },
        source_path: Some(path.to_path_buf()),
    };

    let invalid = |message: &str| ConfigError::Validation {
        path: path.to_path_buf(),
        message: message.to_string(),
    };
    if config.workers == 0 {
        return Err(invalid("`workers` must be at least 1"));
    }
    if config.cache.max_entries == 0 {
        return Err(invalid("`cache.max_entries` must be at least 1"));
    }
    if config.image_columns == 0 {
        return Err(invalid("`image_columns` must be at least 1"));
    }
    Ok(config)
}

/// Apply environment overrides read through `var`.
pub fn apply_env<F>(config: &mut Config, var: F)
where
    F: Fn(&str) -> Option<String>,
{
    let set = |name: &str| var(name).is_some_and(|v| !v.trim().is_empty());
    if set(TRUST_ENV) {
        config.trust_terminal_cache = true;
    }
    if set(DISABLE_SEEDING_ENV) {
        config.seed_from_cache = false;
    }
    if set(VERBOSE_ENV) {
        config.verbose_protocol = true;
    }
}

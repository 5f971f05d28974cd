//! Tracing subscriber setup.
//!
//! Log output goes to a file: the terminal is the display surface for
//! rendered notes and graphics escapes.

use anyhow::{Context, Result};
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

/// `<data dir>/lazynote/lazynote.log`.
pub fn default_log_path() -> Option<PathBuf> {
    dirs::data_dir().map(|d| d.join("lazynote").join("lazynote.log"))
}

/// Install the global subscriber, appending to `path`.
pub fn init(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create log directory {}", parent.display()))?;
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open log file {}", path.display()))?;

    build_subscriber(file)
        .try_init()
        .context("Failed to install tracing subscriber")?;
    Ok(())
}

/// Subscriber writing to `log_file`, filtered by `RUST_LOG` (default `info`).
pub fn build_subscriber(log_file: File) -> impl tracing::Subscriber + Send + Sync {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = fmt::layer()
        .with_ansi(false)
        .with_writer(Arc::new(log_file));

    tracing_subscriber::registry().with(fmt_layer).with(env_filter)
}

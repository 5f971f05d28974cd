//! CLI subcommand infrastructure for lazynote.
//!
//! Subcommand definitions live here; each command's implementation has its
//! own module.

pub mod cache;
pub mod config;
pub mod preview;
pub mod probe;

use clap::{Args, Subcommand};
use std::path::PathBuf;

/// Available subcommands for lazynote.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Render a markdown note, images included
    Preview(PreviewArgs),

    /// Image cache commands
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },

    /// Show detected terminal graphics capabilities
    Probe,

    /// Config file commands
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Arguments for the preview subcommand.
#[derive(Args, Debug)]
pub struct PreviewArgs {
    /// Markdown file to render
    #[arg(value_name = "FILE")]
    pub file: PathBuf,

    /// Target width in columns (default: terminal width)
    #[arg(long)]
    pub width: Option<usize>,

    /// Note id the render is tagged with
    #[arg(long, default_value_t = 1)]
    pub note_id: i64,

    /// Seconds to wait for images before giving up
    #[arg(long, default_value_t = 30)]
    pub timeout: u64,
}

/// Cache subcommand actions.
#[derive(Subcommand, Debug)]
pub enum CacheAction {
    /// Show entry count and size
    Stats,
    /// Drop one reference from the cache
    Invalidate {
        /// Image reference as written in the note
        #[arg(value_name = "REFERENCE")]
        reference: String,
    },
}

/// Config subcommand actions.
#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Validate the config file
    Validate,
    /// Show effective configuration
    Show,
}

//! Config validate and show commands.

use colored::Colorize;
use std::path::{Path, PathBuf};

use crate::config::{self, Config};

fn effective_path(explicit: Option<&Path>) -> Option<PathBuf> {
    match explicit {
        Some(path) => Some(path.to_path_buf()),
        None => config::default_config_path().filter(|p| p.exists()),
    }
}

/// Validate the config file. Quiet on success; prints the error and exits 1
/// otherwise.
pub fn validate(explicit: Option<&Path>) -> Result<(), i32> {
    let Some(path) = effective_path(explicit) else {
        eprintln!("error: No config found to validate");
        return Err(1);
    };
    match config::loader::load_file(&path) {
        Ok(_) => Ok(()),
        Err(e) => {
            eprintln!("{}", e);
            Err(1)
        }
    }
}

/// Print the effective configuration, environment overrides included.
pub fn show(explicit: Option<&Path>) -> Result<(), i32> {
    let cfg = match config::load(explicit) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("{}", e);
            return Err(1);
        }
    };

    match &cfg.source_path {
        Some(path) => println!("Using: {}", path.display().to_string().dimmed()),
        None => println!("{}", "No config found. Using defaults.".dimmed()),
    }
    println!();
    show_config(&cfg);
    Ok(())
}

fn show_config(cfg: &Config) {
    let flag = |on: bool| {
        if on {
            "yes".green()
        } else {
            "no".red()
        }
    };
    println!("{}: {}", "images".cyan(), flag(cfg.images));
    println!("{}: {}", "image_columns".cyan(), cfg.image_columns);
    println!("{}: {}", "right_padding".cyan(), cfg.right_padding);
    println!("{}: {}", "workers".cyan(), cfg.workers);
    println!("{}: {}", "trust_terminal_cache".cyan(), flag(cfg.trust_terminal_cache));
    println!("{}: {}", "seed_from_cache".cyan(), flag(cfg.seed_from_cache));
    println!("{}: {}", "verbose_protocol".cyan(), flag(cfg.verbose_protocol));
    println!("{}:", "cache".cyan());
    println!(
        "  {}: {}",
        "dir".blue(),
        cfg.cache.dir.display().to_string().yellow()
    );
    println!("  {}: {}", "max_entries".blue(), cfg.cache.max_entries);
}

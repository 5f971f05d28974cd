//! Cache stats and invalidate commands.

use colored::Colorize;

use crate::cache::ImageCache;
use crate::config::Config;

fn open(cfg: &Config) -> Result<ImageCache, i32> {
    ImageCache::open(&cfg.cache.dir, cfg.cache.max_entries).map_err(|e| {
        eprintln!("error: {}", e);
        1
    })
}

/// Print entry count and total payload size.
pub fn stats(cfg: &Config) -> Result<(), i32> {
    let cache = open(cfg)?;
    let stats = cache.stats();

    println!(
        "{}: {}",
        "dir".cyan(),
        cache.dir().display().to_string().yellow()
    );
    println!(
        "{}: {} / {}",
        "entries".cyan(),
        stats.entries.to_string().green(),
        cache.max_entries()
    );
    println!("{}: {}", "size".cyan(), format_bytes(stats.total_bytes));
    match cache.previous_session() {
        Some(session) => println!("{}: {}", "last_session".cyan(), session),
        None => println!("{}: {}", "last_session".cyan(), "(none)".dimmed()),
    }
    Ok(())
}

/// Drop `reference` from the cache.
pub fn invalidate(cfg: &Config, reference: &str) -> Result<(), i32> {
    let cache = open(cfg)?;
    if cache.get_meta(reference).is_none() {
        println!("{}", format!("Not cached: {}", reference).dimmed());
        return Ok(());
    }
    match cache.invalidate(reference) {
        Ok(()) => {
            println!("{} {}", "Invalidated".green(), reference);
            Ok(())
        }
        Err(e) => {
            eprintln!("error: {}", e);
            Err(1)
        }
    }
}

fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(1023), "1023 B");
        assert_eq!(format_bytes(1536), "1.5 KiB");
        assert_eq!(format_bytes(3 * 1024 * 1024), "3.0 MiB");
    }

    #[test]
    fn test_invalidate_removes_entry() {
        let dir = tempdir().unwrap();
        let mut cfg = Config::default();
        cfg.cache.dir = dir.path().to_path_buf();

        let cache = ImageCache::open(dir.path(), 10).unwrap();
        cache.put("http://a/b.png", b"png", 1, 1).unwrap();
        drop(cache);

        invalidate(&cfg, "http://a/b.png").unwrap();
        invalidate(&cfg, "http://a/b.png").unwrap();

        let cache = ImageCache::open(dir.path(), 10).unwrap();
        assert!(cache.get("http://a/b.png").is_none());
        assert_eq!(cache.stats().entries, 0);
    }
}

//! Render one note to stdout.

use anyhow::{Context, Result};
use colored::Colorize;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use crate::cache::ImageCache;
use crate::cli::PreviewArgs;
use crate::config::Config;
use crate::graphics::{CapabilityProbe, Transport};
use crate::render::{Collaborators, MarkdownFormatter, RenderPipeline};
use crate::source::DefaultImageSource;

const FALLBACK_WIDTH: usize = 80;

pub fn run(cfg: &Config, probe: &dyn CapabilityProbe, args: &PreviewArgs) -> Result<(), i32> {
    render(cfg, probe, args).map_err(|e| {
        eprintln!("error: {:#}", e);
        1
    })
}

fn render(cfg: &Config, probe: &dyn CapabilityProbe, args: &PreviewArgs) -> Result<()> {
    let markdown = std::fs::read_to_string(&args.file)
        .with_context(|| format!("Failed to read {}", args.file.display()))?;
    let width = args.width.unwrap_or_else(terminal_width);

    let caps = probe.probe();
    let cache = ImageCache::open(&cfg.cache.dir, cfg.cache.max_entries)
        .context("Failed to open image cache")?
        .with_session(caps.session_id.clone());
    let pipeline = RenderPipeline::new(
        Collaborators {
            cache: Arc::new(cache),
            transport: Arc::new(Transport::stdout(caps)),
            source: Arc::new(DefaultImageSource::new()),
            formatter: Arc::new(MarkdownFormatter),
        },
        cfg.pipeline_settings(),
    )?;

    if let Some(status) = pipeline.take_status_message() {
        eprintln!("{}", status.yellow());
    }

    let output = pipeline.start_render(args.note_id, &markdown, width);
    print_lines(&output.lines)?;
    if !output.pending {
        return Ok(());
    }

    match pipeline.recv_result_timeout(args.note_id, Duration::from_secs(args.timeout)) {
        Some(result) => {
            println!();
            print_lines(&result.lines)?;
        }
        None => {
            pipeline.stop();
            eprintln!("{}", "Timed out waiting for images".yellow());
        }
    }
    Ok(())
}

fn print_lines(lines: &[String]) -> Result<()> {
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    for line in lines {
        writeln!(out, "{}", line)?;
    }
    out.flush()?;
    Ok(())
}

fn terminal_width() -> usize {
    crossterm::terminal::size()
        .map(|(cols, _)| cols as usize)
        .unwrap_or(FALLBACK_WIDTH)
}

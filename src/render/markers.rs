//! Image references in markdown and the in-band markers the formatter emits
//! where a placeholder grid belongs.

use regex::Regex;
use std::borrow::Cow;
use std::collections::HashSet;
use std::sync::LazyLock;

/// Private-use code point delimiting a marker. Note text never carries it:
/// [`strip_sentinels`] removes it before formatting.
pub const SENTINEL: char = '\u{10FFFD}';

static IMAGE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"!\[([^\]]*)\]\(([^)]+)\)").expect("image regex must compile")
});

static MARKER_RE: LazyLock<Regex> = LazyLock::new(|| {
    let pattern = format!(
        r"{SENTINEL}\[KITTY_IMAGE:id=(\d+),cols=(\d+),rows=(\d+)\]{SENTINEL}"
    );
    Regex::new(&pattern).expect("marker regex must compile")
});

/// Placement a marker stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Marker {
    pub image_id: u32,
    pub cols: u32,
    pub rows: u32,
}

impl Marker {
    pub fn encode(&self) -> String {
        format!(
            "{SENTINEL}[KITTY_IMAGE:id={},cols={},rows={}]{SENTINEL}",
            self.image_id, self.cols, self.rows
        )
    }
}

/// Every image reference in document order, duplicates included. A link
/// title (`![a](x.png "title")`) and angle brackets are not part of the
/// reference.
pub fn image_references(markdown: &str) -> Vec<String> {
    IMAGE_RE
        .captures_iter(markdown)
        .filter_map(|c| c.get(2))
        .filter_map(|m| m.as_str().split_whitespace().next())
        .map(|r| r.trim_start_matches('<').trim_end_matches('>').to_string())
        .filter(|r| !r.is_empty())
        .collect()
}

/// First occurrences only, order preserved.
pub fn unique_references(refs: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    refs.iter()
        .filter(|r| seen.insert(r.as_str()))
        .cloned()
        .collect()
}

/// `text` without marker sentinels, so it cannot spell a marker.
pub fn strip_sentinels(text: &str) -> Cow<'_, str> {
    if text.contains(SENTINEL) {
        Cow::Owned(text.replace(SENTINEL, ""))
    } else {
        Cow::Borrowed(text)
    }
}

/// Replace each marker with `grid(marker)`, stopping at the first error.
///
/// A marker that shares its line with other text is moved onto lines of its
/// own so the grid's rows start at column zero.
pub fn replace_markers<F, E>(text: &str, mut grid: F) -> Result<String, E>
where
    F: FnMut(Marker) -> Result<String, E>,
{
    if !MARKER_RE.is_match(text) {
        return Ok(text.to_string());
    }

    let mut out: Vec<String> = Vec::new();
    for line in text.split('\n') {
        let mut last = 0;
        let mut replaced = false;
        for caps in MARKER_RE.captures_iter(line) {
            let Some(m) = caps.get(0) else { continue };
            let parsed = (
                caps[1].parse::<u32>(),
                caps[2].parse::<u32>(),
                caps[3].parse::<u32>(),
            );
            let (Ok(image_id), Ok(cols), Ok(rows)) = parsed else {
                continue;
            };
            let before = &line[last..m.start()];
            if !crate::ansi::strip_ansi(before).trim().is_empty() {
                let piece = if last == 0 { before.trim_end() } else { before.trim() };
                out.push(piece.to_string());
            }
            tracing::debug!(image_id, cols, rows, "Substituting image marker");
            out.push(grid(Marker {
                image_id,
                cols,
                rows,
            })?);
            last = m.end();
            replaced = true;
        }
        if !replaced {
            out.push(line.to_string());
            continue;
        }
        let rest = &line[last..];
        if !crate::ansi::strip_ansi(rest).trim().is_empty() {
            out.push(rest.trim_start().to_string());
        }
    }
    Ok(out.join("\n"))
}

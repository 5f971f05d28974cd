//! Word wrapping for styled text.
//!
//! Widths are measured on visible text only; escape sequences travel with the
//! word they precede. Placeholder-grid lines are never touched, since each
//! cell is exactly one column and the grid width was chosen to fit.

use unicode_width::UnicodeWidthChar;

use crate::ansi::{split_escapes, strip_ansi, visible_width};
use crate::graphics::placeholder::PLACEHOLDER;

/// Wrap every line of `text` to `width` columns.
pub fn wrap(text: &str, width: usize) -> Vec<String> {
    let width = width.max(1);
    let mut out = Vec::new();
    for line in text.split('\n') {
        wrap_line(line, width, &mut out);
    }
    out
}

fn wrap_line(line: &str, width: usize, out: &mut Vec<String>) {
    if line.contains(PLACEHOLDER) || visible_width(line) <= width {
        out.push(line.to_string());
        return;
    }

    let plain = strip_ansi(line);
    let lead = plain.chars().take_while(|c| *c == ' ').count().min(width / 2);
    let hang = hanging_prefix(&plain).min(width / 2);

    let mut builder = LineBuilder {
        out,
        width,
        hang,
        cur: " ".repeat(lead),
        cur_w: lead,
        has_word: false,
    };
    for (word, w) in words(line) {
        builder.push_word(&word, w);
    }
    builder.finish();
}

/// Columns continuation lines are indented by: leading quote bars and spaces,
/// plus the width of a list bullet if one follows.
fn hanging_prefix(plain: &str) -> usize {
    let mut rest = plain;
    let mut width = 0;
    loop {
        if let Some(r) = rest.strip_prefix("│ ") {
            rest = r;
            width += 2;
        } else if let Some(r) = rest.strip_prefix(' ') {
            rest = r;
            width += 1;
        } else {
            break;
        }
    }
    if rest.starts_with("• ") {
        return width + 2;
    }
    let digits = rest.chars().take_while(char::is_ascii_digit).count();
    if digits > 0 && rest[digits..].starts_with(". ") {
        return width + digits + 2;
    }
    width
}

/// Space-separated words with their visible widths. Escape-only tokens have
/// width zero.
fn words(line: &str) -> Vec<(String, usize)> {
    let mut words = Vec::new();
    let mut cur = String::new();
    let mut w = 0;
    for (piece, is_escape) in split_escapes(line) {
        if is_escape {
            cur.push_str(piece);
            continue;
        }
        for ch in piece.chars() {
            if ch == ' ' {
                if !cur.is_empty() {
                    words.push((std::mem::take(&mut cur), w));
                    w = 0;
                }
                continue;
            }
            cur.push(ch);
            w += ch.width().unwrap_or(0);
        }
    }
    if !cur.is_empty() {
        words.push((cur, w));
    }
    words
}

struct LineBuilder<'o> {
    out: &'o mut Vec<String>,
    width: usize,
    hang: usize,
    cur: String,
    cur_w: usize,
    has_word: bool,
}

impl LineBuilder<'_> {
    fn break_line(&mut self) {
        let line = std::mem::replace(&mut self.cur, " ".repeat(self.hang));
        self.out.push(line);
        self.cur_w = self.hang;
        self.has_word = false;
    }

    fn push_word(&mut self, word: &str, w: usize) {
        if w == 0 {
            self.cur.push_str(word);
            return;
        }
        if self.has_word {
            if self.cur_w + 1 + w > self.width {
                self.break_line();
            } else {
                self.cur.push(' ');
                self.cur_w += 1;
            }
        }
        if self.cur_w + w <= self.width {
            self.cur.push_str(word);
            self.cur_w += w;
            self.has_word = true;
            return;
        }

        // Longer than a whole line: split at character boundaries.
        for (piece, is_escape) in split_escapes(word) {
            if is_escape {
                self.cur.push_str(piece);
                continue;
            }
            for ch in piece.chars() {
                let cw = ch.width().unwrap_or(0);
                if self.cur_w + cw > self.width && self.cur_w > self.hang {
                    self.break_line();
                }
                self.cur.push(ch);
                self.cur_w += cw;
            }
        }
        self.has_word = true;
    }

    fn finish(self) {
        if !strip_ansi(&self.cur).trim().is_empty() || self.cur.contains('\x1b') {
            self.out.push(self.cur);
        }
    }
}

use regex::Regex;
use std::sync::LazyLock;
use unicode_width::UnicodeWidthStr;

/// Regex matching ANSI escape sequences:
/// - CSI sequences: ESC [ ... (params) final_byte  (colors, cursor movement, etc.)
/// - OSC sequences: ESC ] ... ST  (hyperlinks, window titles, etc.)
/// - APC sequences: ESC _ ... ST  (graphics protocol commands)
/// - Character set designators: ESC ( B, ESC ) 0, etc.
/// - Simple two-byte escapes: ESC =, ESC >, ESC M, etc.
static ANSI_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(concat!(
        r"\x1b\[[0-9;:?]*[ -/]*[@-~]",         // CSI sequences
        r"|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)", // OSC sequences (ST = BEL or ESC \)
        r"|\x1b_[^\x1b]*\x1b\\",               // APC sequences
        r"|\x1b[()][A-Z0-9]",                  // Character set designators
        r"|\x1b[^\[\]()_0-9]",                 // Simple two-byte escapes
    ))
    .expect("ANSI regex must compile")
});

/// Strip all ANSI escape sequences from a string.
pub fn strip_ansi(s: &str) -> String {
    ANSI_RE.replace_all(s, "").into_owned()
}

/// Number of terminal columns the string occupies once escapes are removed.
pub fn visible_width(s: &str) -> usize {
    if !s.contains('\x1b') {
        return s.width();
    }
    strip_ansi(s).width()
}

/// Split a string into alternating escape / text pieces, preserving order.
///
/// Escape sequences are returned with `true`, plain text with `false`.
pub fn split_escapes(s: &str) -> Vec<(&str, bool)> {
    let mut pieces = Vec::new();
    let mut last = 0;
    for m in ANSI_RE.find_iter(s) {
        if m.start() > last {
            pieces.push((&s[last..m.start()], false));
        }
        pieces.push((m.as_str(), true));
        last = m.end();
    }
    if last < s.len() {
        pieces.push((&s[last..], false));
    }
    pieces
}

//! Markdown to styled terminal text.
//!
//! The pipeline treats formatting as a collaborator behind [`Formatter`]; the
//! bundled [`MarkdownFormatter`] is a compact pulldown-cmark renderer that
//! emits SGR-styled lines and, when given an image lookup, image markers.

use crossterm::style::{ContentStyle, Stylize};
use pulldown_cmark::{Event, HeadingLevel, Options, Parser, Tag, TagEnd};

use super::markers::Marker;

/// Why an image could not be substituted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LookupError {
    /// Never prepared (or prepared by a different pass); keep the link text.
    Missing,
    /// Fetch or transmit failed; keep the link text and show a notice.
    Failed(String),
}

pub type ImageLookup<'a> = dyn Fn(&str) -> Result<Marker, LookupError> + Send + Sync + 'a;

pub struct FormatOptions<'a> {
    /// Target width in columns.
    pub width: usize,
    /// Image substitution. `None` renders images as plain link text.
    pub images: Option<&'a ImageLookup<'a>>,
}

impl<'a> FormatOptions<'a> {
    pub fn text_only(width: usize) -> Self {
        Self {
            width,
            images: None,
        }
    }
}

pub trait Formatter: Send + Sync {
    fn render(&self, markdown: &str, opts: &FormatOptions<'_>) -> anyhow::Result<String>;
}

pub const UNAVAILABLE_NOTICE: &str = "⚠ image unavailable";

#[derive(Debug, Default, Clone, Copy)]
pub struct MarkdownFormatter;

impl Formatter for MarkdownFormatter {
    fn render(&self, markdown: &str, opts: &FormatOptions<'_>) -> anyhow::Result<String> {
        let mut options = Options::empty();
        options.insert(Options::ENABLE_STRIKETHROUGH);
        options.insert(Options::ENABLE_TASKLISTS);

        let mut w = Writer::new(opts);
        for event in Parser::new_ext(markdown, options) {
            w.event(event);
        }
        Ok(w.finish())
    }
}

struct PendingImage {
    url: String,
    alt: String,
}

struct Writer<'o, 'a> {
    opts: &'o FormatOptions<'a>,
    lines: Vec<String>,
    line: String,
    quote_depth: usize,
    lists: Vec<Option<u64>>,
    bold: usize,
    italic: usize,
    strike: usize,
    heading: bool,
    code_block: bool,
    links: Vec<String>,
    image: Option<PendingImage>,
}

impl<'o, 'a> Writer<'o, 'a> {
    fn new(opts: &'o FormatOptions<'a>) -> Self {
        Self {
            opts,
            lines: Vec::new(),
            line: String::new(),
            quote_depth: 0,
            lists: Vec::new(),
            bold: 0,
            italic: 0,
            strike: 0,
            heading: false,
            code_block: false,
            links: Vec::new(),
            image: None,
        }
    }

    fn style(&self) -> ContentStyle {
        let mut style = ContentStyle::new();
        if self.bold > 0 || self.heading {
            style = style.bold();
        }
        if self.italic > 0 {
            style = style.italic();
        }
        if self.strike > 0 {
            style = style.crossed_out();
        }
        if !self.links.is_empty() {
            style = style.underlined().blue();
        }
        style
    }

    fn push_styled(&mut self, text: &str) {
        let style = self.style();
        if style == ContentStyle::new() {
            self.line.push_str(text);
        } else {
            self.line.push_str(&style.apply(text).to_string());
        }
    }

    fn prefix(&self) -> String {
        "│ ".repeat(self.quote_depth)
    }

    fn flush(&mut self) {
        if self.line.is_empty() {
            return;
        }
        let line = std::mem::take(&mut self.line);
        self.lines.push(format!("{}{}", self.prefix(), line));
    }

    /// Start a block: separate it from the previous one by a blank line,
    /// unless it continues a line already started (e.g. after a bullet).
    fn open_block(&mut self) {
        if !self.line.is_empty() {
            return;
        }
        if self.lists.is_empty() && self.lines.last().is_some_and(|l| !l.is_empty()) {
            self.lines.push(String::new());
        }
    }

    fn event(&mut self, event: Event<'_>) {
        match event {
            Event::Start(tag) => self.start(tag),
            Event::End(tag) => self.end(tag),
            Event::Text(text) => self.text(&text),
            Event::Code(code) => {
                if let Some(img) = self.image.as_mut() {
                    img.alt.push_str(&code);
                } else {
                    self.line.push_str(&format!("{}", code.as_ref().on_dark_grey()));
                }
            }
            Event::Html(html) | Event::InlineHtml(html) => {
                for (i, part) in html.split('\n').enumerate() {
                    if i > 0 {
                        self.flush();
                    }
                    self.line.push_str(part);
                }
            }
            Event::SoftBreak => {
                if let Some(img) = self.image.as_mut() {
                    img.alt.push(' ');
                } else {
                    self.line.push(' ');
                }
            }
            Event::HardBreak => self.flush(),
            Event::Rule => {
                self.flush();
                self.open_block();
                let width = self.opts.width.clamp(3, 40);
                self.lines.push(format!("{}", "─".repeat(width).dark_grey()));
            }
            Event::TaskListMarker(done) => {
                self.line.push_str(if done { "[x] " } else { "[ ] " });
            }
            _ => {}
        }
    }

    fn start(&mut self, tag: Tag<'_>) {
        match tag {
            Tag::Paragraph => self.open_block(),
            Tag::Heading { level, .. } => {
                self.flush();
                self.open_block();
                self.heading = true;
                let hashes = "#".repeat(heading_depth(level));
                self.push_styled(&format!("{hashes} "));
            }
            Tag::BlockQuote(_) => {
                self.flush();
                self.open_block();
                self.quote_depth += 1;
            }
            Tag::CodeBlock(_) => {
                self.flush();
                self.open_block();
                self.code_block = true;
            }
            Tag::List(start) => {
                self.flush();
                if self.lists.is_empty() {
                    self.open_block();
                }
                self.lists.push(start);
            }
            Tag::Item => {
                self.flush();
                let depth = self.lists.len().saturating_sub(1);
                let bullet = match self.lists.last_mut() {
                    Some(Some(n)) => {
                        let b = format!("{n}. ");
                        *n += 1;
                        b
                    }
                    _ => "• ".to_string(),
                };
                self.line.push_str(&"  ".repeat(depth));
                self.line.push_str(&bullet);
            }
            Tag::Emphasis => self.italic += 1,
            Tag::Strong => self.bold += 1,
            Tag::Strikethrough => self.strike += 1,
            Tag::Link { dest_url, .. } => self.links.push(dest_url.to_string()),
            Tag::Image { dest_url, .. } => {
                self.image = Some(PendingImage {
                    url: dest_url.to_string(),
                    alt: String::new(),
                });
            }
            _ => {}
        }
    }

    fn end(&mut self, tag: TagEnd) {
        match tag {
            TagEnd::Paragraph => self.flush(),
            TagEnd::Heading(_) => {
                self.heading = false;
                self.flush();
            }
            TagEnd::BlockQuote { .. } => {
                self.flush();
                self.quote_depth = self.quote_depth.saturating_sub(1);
            }
            TagEnd::CodeBlock => {
                self.flush();
                self.code_block = false;
            }
            TagEnd::List(_) => {
                self.flush();
                self.lists.pop();
            }
            TagEnd::Item => self.flush(),
            TagEnd::Emphasis => self.italic = self.italic.saturating_sub(1),
            TagEnd::Strong => self.bold = self.bold.saturating_sub(1),
            TagEnd::Strikethrough => self.strike = self.strike.saturating_sub(1),
            TagEnd::Link => {
                if let Some(url) = self.links.pop() {
                    self.line.push_str(&format!(" ({})", url.as_str().dark_grey()));
                }
            }
            TagEnd::Image => {
                if let Some(img) = self.image.take() {
                    self.image(img);
                }
            }
            _ => {}
        }
    }

    fn text(&mut self, text: &str) {
        if let Some(img) = self.image.as_mut() {
            img.alt.push_str(text);
            return;
        }
        if self.code_block {
            for line in text.lines() {
                self.line.push_str("  ");
                self.line.push_str(&format!("{}", line.yellow()));
                self.flush();
            }
            return;
        }
        self.push_styled(text);
    }

    fn image(&mut self, img: PendingImage) {
        let link_text = format!("![{}]({})", img.alt, img.url);
        let Some(lookup) = self.opts.images else {
            self.line.push_str(&link_text);
            return;
        };
        match lookup(&img.url) {
            Ok(marker) => {
                self.flush();
                self.lines.push(marker.encode());
            }
            Err(LookupError::Missing) => self.line.push_str(&link_text),
            Err(LookupError::Failed(reason)) => {
                self.line.push_str(&link_text);
                let notice = format!("{UNAVAILABLE_NOTICE}: {reason}");
                self.line.push_str(&format!(" {}", notice.dim()));
            }
        }
    }

    fn finish(mut self) -> String {
        self.flush();
        while self.lines.last().is_some_and(|l| l.is_empty()) {
            self.lines.pop();
        }
        self.lines.join("\n")
    }
}

fn heading_depth(level: HeadingLevel) -> usize {
    match level {
        HeadingLevel::H1 => 1,
        HeadingLevel::H2 => 2,
        HeadingLevel::H3 => 3,
        HeadingLevel::H4 => 4,
        HeadingLevel::H5 => 5,
        HeadingLevel::H6 => 6,
    }
}

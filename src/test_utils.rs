use anyhow::{anyhow, Result};
use image::{DynamicImage, ImageFormat, Rgb, RgbImage, Rgba, RgbaImage};
use std::collections::HashMap;
use std::io::{Cursor, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::graphics::{CapabilityProbe, GraphicsCapabilities};
use crate::render::format::{FormatOptions, Formatter};
use crate::source::{FetchedImage, ImageSource};

/// PNG of `w` x `h` pixels filled with `seed`-derived colour.
pub fn png_bytes_seeded(w: u32, h: u32, seed: u32) -> Vec<u8> {
    let px = Rgba([(seed & 0xff) as u8, ((seed >> 8) & 0xff) as u8, 0x40, 0xff]);
    let img = RgbaImage::from_pixel(w, h, px);
    let mut out = Vec::new();
    DynamicImage::ImageRgba8(img)
        .write_to(&mut Cursor::new(&mut out), ImageFormat::Png)
        .unwrap();
    out
}

pub fn png_bytes(w: u32, h: u32) -> Vec<u8> {
    png_bytes_seeded(w, h, 0)
}

pub fn jpeg_bytes(w: u32, h: u32) -> Vec<u8> {
    let img = RgbImage::from_pixel(w, h, Rgb([200, 10, 10]));
    let mut out = Vec::new();
    DynamicImage::ImageRgb8(img)
        .write_to(&mut Cursor::new(&mut out), ImageFormat::Jpeg)
        .unwrap();
    out
}

/// Cloneable in-memory display surface recording everything written.
#[derive(Clone, Default)]
pub struct SharedSink {
    buf: Arc<Mutex<Vec<u8>>>,
}

impl SharedSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bytes(&self) -> Vec<u8> {
        self.buf.lock().unwrap().clone()
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.bytes()).into_owned()
    }

    pub fn clear(&self) {
        self.buf.lock().unwrap().clear();
    }

    /// Image ids of every `a=T` transmission, in write order.
    pub fn transmitted_ids(&self) -> Vec<u32> {
        let text = self.text();
        text.split("a=T,")
            .skip(1)
            .filter_map(|rest| {
                let header = rest.split(';').next()?;
                header
                    .split(',')
                    .find_map(|kv| kv.strip_prefix("i="))
                    .and_then(|v| v.parse().ok())
            })
            .collect()
    }
}

impl Write for SharedSink {
    fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
        self.buf.lock().unwrap().extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

enum Scripted {
    Image { w: u32, h: u32, seed: u32 },
    Failure(String),
}

/// Image source answering from a script and recording every fetch.
#[derive(Default)]
pub struct ScriptedSource {
    script: HashMap<String, Scripted>,
    delay: Option<Duration>,
    fetches: Mutex<Vec<String>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_image(mut self, reference: &str, w: u32, h: u32) -> Self {
        let seed = self.script.len() as u32 + 1;
        self.script
            .insert(reference.to_string(), Scripted::Image { w, h, seed });
        self
    }

    pub fn with_failure(mut self, reference: &str, message: &str) -> Self {
        self.script
            .insert(reference.to_string(), Scripted::Failure(message.to_string()));
        self
    }

    /// Every fetch sleeps this long first.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn fetches(&self) -> Vec<String> {
        self.fetches.lock().unwrap().clone()
    }

    pub fn fetch_count(&self, reference: &str) -> usize {
        self.fetches().iter().filter(|r| *r == reference).count()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

impl ImageSource for ScriptedSource {
    fn fetch(&self, reference: &str) -> Result<FetchedImage> {
        self.fetches.lock().unwrap().push(reference.to_string());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        match self.script.get(reference) {
            Some(Scripted::Image { w, h, seed }) => Ok(FetchedImage {
                bytes: png_bytes_seeded(*w, *h, *seed),
                width: *w,
                height: *h,
                provider: None,
            }),
            Some(Scripted::Failure(message)) => Err(anyhow!("{}", message)),
            None => Err(anyhow!("no such image: {}", reference)),
        }
    }
}

/// Formatter that always fails.
pub struct BrokenFormatter;

impl Formatter for BrokenFormatter {
    fn render(&self, _markdown: &str, _opts: &FormatOptions<'_>) -> Result<String> {
        Err(anyhow!("formatter exploded"))
    }
}

/// Probe returning fixed capabilities.
pub struct FixedProbe(pub GraphicsCapabilities);

impl FixedProbe {
    /// Modern kitty: every feature tier.
    pub fn kitty(session_id: &str) -> Self {
        Self(GraphicsCapabilities {
            graphics: true,
            virtual_placement: true,
            relative_placement: true,
            actual_kitty: true,
            version: Some("0.35.0".to_string()),
            multiplexer: None,
            session_id: Some(session_id.to_string()),
        })
    }

    pub fn plain() -> Self {
        Self(GraphicsCapabilities::none())
    }
}

impl CapabilityProbe for FixedProbe {
    fn probe(&self) -> GraphicsCapabilities {
        self.0.clone()
    }
}

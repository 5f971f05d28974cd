//! Two-phase note rendering.
//!
//! [`RenderPipeline::start_render`] answers synchronously with text (or, when
//! every image is already resident, the full image-aware rendering). Anything
//! that needs fetching or transmitting runs on a background thread whose
//! result arrives on a channel and is applied only while still current.

pub mod cancel;
pub mod format;
pub mod markers;
pub mod prepare;
pub mod request;
pub mod wrap;

pub use cancel::{CancelToken, Cancelled};
pub use format::{FormatOptions, Formatter, LookupError, MarkdownFormatter};
pub use markers::Marker;
pub use prepare::{image_geometry, PrepareError, PreparedImage};
pub use request::{NoteId, RenderRequest, RenderResult};

use anyhow::Context as _;
use std::collections::HashMap;
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use crate::cache::ImageCache;
use crate::graphics::{CapabilityProbe, TransmitOptions, Transport};
use crate::session::{Geometry, SessionLedger};
use crate::source::ImageSource;

/// Default number of concurrent image preparations.
pub const DEFAULT_WORKERS: usize = 6;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineSettings {
    /// Master switch for image-aware rendering.
    pub images: bool,
    /// Widest image, in cells.
    pub image_columns: u32,
    /// Columns kept free on the right of the view.
    pub right_padding: usize,
    pub workers: usize,
    pub trust_terminal_cache: bool,
    pub seed_from_cache: bool,
    /// Suppress terminal replies (`q=2`).
    pub quiet: bool,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            images: true,
            image_columns: 45,
            right_padding: 5,
            workers: DEFAULT_WORKERS,
            trust_terminal_cache: false,
            seed_from_cache: true,
            quiet: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    TextRendering,
    FullRendering,
    /// Text shown, background work about to start.
    TextDisplayed,
    BackgroundRendering,
}

/// What `start_render` shows immediately.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderOutput {
    pub request_id: String,
    pub lines: Vec<String>,
    /// A background result for this request will follow.
    pub pending: bool,
}

/// Collaborators a pipeline drives.
pub struct Collaborators {
    pub cache: Arc<ImageCache>,
    pub transport: Arc<Transport>,
    pub source: Arc<dyn ImageSource>,
    pub formatter: Arc<dyn Formatter>,
}

struct Current {
    id: String,
    cancel: CancelToken,
}

struct Tracker {
    current: Option<Current>,
    state: PipelineState,
}

/// Per-reference outcome of the ordered placement pass.
type Placements = HashMap<String, Result<Marker, String>>;

struct Context {
    cache: Arc<ImageCache>,
    transport: Arc<Transport>,
    source: Arc<dyn ImageSource>,
    formatter: Arc<dyn Formatter>,
    ledger: SessionLedger,
    settings: PipelineSettings,
    pool: rayon::ThreadPool,
    /// Images enabled and the terminal can show them.
    images_enabled: AtomicBool,
    tracker: Mutex<Tracker>,
    status: Mutex<Option<String>>,
}

pub struct RenderPipeline {
    ctx: Arc<Context>,
    results_tx: Sender<RenderResult>,
    results_rx: Mutex<Receiver<RenderResult>>,
}

impl RenderPipeline {
    /// Build a pipeline over `parts`.
    ///
    /// On a graphics terminal whose ids cannot be inherited from the cache,
    /// every image the terminal holds is deleted so stale ids never render.
    pub fn new(parts: Collaborators, settings: PipelineSettings) -> anyhow::Result<Self> {
        let workers = settings.workers.max(1);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("lazynote-image-{}", i))
            .build()
            .context("Failed to create image worker pool")?;

        let caps = parts.transport.capabilities().clone();
        let ledger = SessionLedger::new(settings.trust_terminal_cache);
        ledger.observe_session(caps.session_id.as_deref());

        let images_enabled = settings.images && caps.supports_images();
        let status = if settings.images && !caps.graphics {
            Some("Terminal graphics unavailable: images shown as links".to_string())
        } else if settings.images && !caps.virtual_placement {
            Some("Terminal lacks virtual placements: images shown as links".to_string())
        } else {
            None
        };

        let inherits_ids = settings.seed_from_cache
            && caps.session_id.is_some()
            && parts.cache.previous_session() == caps.session_id.as_deref();
        if caps.graphics && !inherits_ids {
            if let Err(e) = parts.transport.delete_all_images() {
                tracing::warn!(error = %e, "Failed to clear terminal images");
            }
            ledger.disown_cache();
        }

        tracing::info!(
            images_enabled,
            workers,
            inherits_ids,
            "Render pipeline ready"
        );

        let (results_tx, results_rx) = channel();
        Ok(Self {
            ctx: Arc::new(Context {
                cache: parts.cache,
                transport: parts.transport,
                source: parts.source,
                formatter: parts.formatter,
                ledger,
                settings,
                pool,
                images_enabled: AtomicBool::new(images_enabled),
                tracker: Mutex::new(Tracker {
                    current: None,
                    state: PipelineState::Idle,
                }),
                status: Mutex::new(status),
            }),
            results_tx,
            results_rx: Mutex::new(results_rx),
        })
    }

    /// Display `markdown` for `note_id`, superseding any request in flight.
    pub fn start_render(&self, note_id: NoteId, markdown: &str, max_cols: usize) -> RenderOutput {
        let request = RenderRequest::new(note_id, markdown, max_cols);
        self.ctx.supersede(&request);
        let width = self.ctx.text_width(max_cols);

        self.ctx.set_state(PipelineState::TextRendering);
        let refs = markers::image_references(markdown);
        if !self.ctx.images_enabled.load(Ordering::Acquire) || refs.is_empty() {
            let (lines, _) = self.ctx.render_text(markdown, width);
            self.ctx.set_state(PipelineState::Idle);
            return RenderOutput {
                request_id: request.id,
                lines,
                pending: false,
            };
        }

        if self.ctx.settings.seed_from_cache {
            self.ctx.ledger.seed_from_cache(&self.ctx.cache);
        }

        let unique = markers::unique_references(&refs);
        if let Some(placed) = self.ctx.place_resident(&unique, width) {
            self.ctx.set_state(PipelineState::FullRendering);
            let (lines, _) = self.ctx.render_full(markdown, width, &placed);
            self.ctx.set_state(PipelineState::Idle);
            tracing::debug!(note_id, images = unique.len(), "Rendered note from resident images");
            return RenderOutput {
                request_id: request.id,
                lines,
                pending: false,
            };
        }

        let (lines, _) = self.ctx.render_text(markdown, width);
        self.ctx.set_state(PipelineState::TextDisplayed);
        let request_id = request.id.clone();
        self.spawn_background(request, width);
        RenderOutput {
            request_id,
            lines,
            pending: true,
        }
    }

    fn spawn_background(&self, request: RenderRequest, width: usize) {
        let ctx = Arc::clone(&self.ctx);
        let tx = self.results_tx.clone();
        ctx.set_state(PipelineState::BackgroundRendering);

        thread::spawn(move || {
            let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                ctx.render_background(&request, width)
            }));
            ctx.finish(&request.id);
            match outcome {
                Ok(Ok(result)) => {
                    if request.cancel.is_cancelled() {
                        tracing::debug!(request = %request.id, "Dropping result of cancelled render");
                    } else {
                        let _ = tx.send(result);
                    }
                }
                Ok(Err(Cancelled)) => {
                    tracing::debug!(request = %request.id, "Background render cancelled");
                }
                Err(_) => {
                    tracing::warn!(request = %request.id, "Background render panicked");
                }
            }
        });
    }

    /// Next deliverable result for `active_note`, without blocking. Stale
    /// results are discarded along the way.
    pub fn poll_result(&self, active_note: NoteId) -> Option<RenderResult> {
        let rx = self.results_rx.lock().unwrap_or_else(PoisonError::into_inner);
        while let Ok(result) = rx.try_recv() {
            if self.ctx.is_relevant(&result, active_note) {
                return Some(result);
            }
        }
        None
    }

    /// Wait up to `timeout` for a deliverable result for `active_note`.
    pub fn recv_result_timeout(&self, active_note: NoteId, timeout: Duration) -> Option<RenderResult> {
        let deadline = Instant::now() + timeout;
        let rx = self.results_rx.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match rx.recv_timeout(remaining) {
                Ok(result) if self.ctx.is_relevant(&result, active_note) => return Some(result),
                Ok(_) => continue,
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                    return None
                }
            }
        }
    }

    pub fn state(&self) -> PipelineState {
        self.ctx.lock_tracker().state
    }

    /// Id of the current request, if any.
    pub fn current_request(&self) -> Option<String> {
        self.ctx.lock_tracker().current.as_ref().map(|c| c.id.clone())
    }

    /// The one-time degradation notice, if there is one left to show.
    pub fn take_status_message(&self) -> Option<String> {
        self.ctx
            .status
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Re-run the capability probe and adopt what it reports.
    ///
    /// A different terminal session clears all residency for good: the new
    /// terminal is purged and every image is retransmitted on the next
    /// render. Returns true when the session changed.
    pub fn observe_terminal(&self, probe: &dyn CapabilityProbe) -> bool {
        let caps = probe.probe();
        self.ctx.transport.set_capabilities(caps.clone());
        self.ctx
            .images_enabled
            .store(self.ctx.settings.images && caps.supports_images(), Ordering::Release);

        let changed = self.ctx.ledger.observe_session(caps.session_id.as_deref());
        if changed {
            self.ctx.cache.set_session(caps.session_id.clone());
        }
        if changed && caps.graphics {
            if let Err(e) = self.ctx.transport.delete_all_images() {
                tracing::warn!(error = %e, "Failed to clear terminal images");
            }
        }
        changed
    }

    pub fn ledger(&self) -> &SessionLedger {
        &self.ctx.ledger
    }

    /// Cancel the current request; its result, if any, is never delivered.
    pub fn stop(&self) {
        let mut tracker = self.ctx.lock_tracker();
        if let Some(current) = tracker.current.take() {
            current.cancel.cancel();
            tracing::debug!(request = %current.id, "Render pipeline stopped");
        }
        tracker.state = PipelineState::Idle;
    }
}

impl Drop for RenderPipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Context {
    fn lock_tracker(&self) -> std::sync::MutexGuard<'_, Tracker> {
        self.tracker.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: PipelineState) {
        self.lock_tracker().state = state;
    }

    fn text_width(&self, max_cols: usize) -> usize {
        max_cols.saturating_sub(self.settings.right_padding).max(1)
    }

    fn supersede(&self, request: &RenderRequest) {
        let mut tracker = self.lock_tracker();
        if let Some(previous) = tracker.current.take() {
            previous.cancel.cancel();
            tracing::debug!(previous = %previous.id, next = %request.id, "Cancelled superseded render");
        }
        tracker.current = Some(Current {
            id: request.id.clone(),
            cancel: request.cancel.clone(),
        });
    }

    fn finish(&self, request_id: &str) {
        let mut tracker = self.lock_tracker();
        let is_current = tracker.current.as_ref().is_some_and(|c| c.id == request_id);
        if is_current && tracker.state == PipelineState::BackgroundRendering {
            tracker.state = PipelineState::Idle;
        }
    }

    fn is_relevant(&self, result: &RenderResult, active_note: NoteId) -> bool {
        let tracker = self.lock_tracker();
        let current = tracker.current.as_ref().is_some_and(|c| c.id == result.request_id);
        if !current || result.note_id != active_note {
            tracing::debug!(
                request = %result.request_id,
                note_id = result.note_id,
                active_note,
                "Discarding stale render result"
            );
            return false;
        }
        true
    }

    fn render_text(&self, markdown: &str, width: usize) -> (Vec<String>, bool) {
        self.format(markdown, &FormatOptions::text_only(width), width)
    }

    fn render_full(&self, markdown: &str, width: usize, placed: &Placements) -> (Vec<String>, bool) {
        let lookup = |url: &str| match placed.get(url) {
            Some(Ok(marker)) => Ok(*marker),
            Some(Err(reason)) => Err(LookupError::Failed(reason.clone())),
            None => Err(LookupError::Missing),
        };
        let opts = FormatOptions {
            width,
            images: Some(&lookup),
        };
        self.format(markdown, &opts, width)
    }

    /// Format, then turn markers into placeholder grids. Only image-aware
    /// passes substitute; if any grid cannot be produced the note is shown
    /// as text instead.
    fn format(&self, markdown: &str, opts: &FormatOptions<'_>, width: usize) -> (Vec<String>, bool) {
        let markdown = markers::strip_sentinels(markdown);
        let text = match self.formatter.render(&markdown, opts) {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(error = %e, "Markdown formatting failed, showing source");
                return (markdown.lines().map(str::to_string).collect(), false);
            }
        };
        if opts.images.is_none() {
            return (wrap::wrap(&text, width), true);
        }

        let substituted = markers::replace_markers(&text, |m| {
            self.transport
                .placeholder_grid(m.image_id, m.image_id, m.cols, m.rows)
        });
        match substituted {
            Ok(text) => (wrap::wrap(&text, width), true),
            Err(e) => {
                tracing::warn!(error = %e, "Placeholder grid unavailable, showing text");
                self.render_text(&markdown, width)
            }
        }
    }

    /// Placements for `unique` when every image can be shown without
    /// transmitting; `None` as soon as one cannot.
    fn place_resident(&self, unique: &[String], width: usize) -> Option<Placements> {
        let mut candidates = Vec::with_capacity(unique.len());
        for reference in unique {
            let meta = self.cache.get_meta(reference)?;
            let image_id = meta.image_id?;
            if !prepare::is_fresh(reference, meta.created)
                || !self.ledger.is_reusable(image_id, &meta.fingerprint)
            {
                return None;
            }
            candidates.push((reference, image_id, meta));
        }

        let mut placed = Placements::new();
        for (reference, image_id, meta) in candidates {
            let geometry = image_geometry(meta.width, meta.height, width, self.settings.image_columns);
            let marker = self
                .reuse(reference, image_id, &meta.fingerprint, geometry)
                .ok()?;
            placed.insert(reference.clone(), Ok(marker));
        }
        Some(placed)
    }

    fn render_background(&self, request: &RenderRequest, width: usize) -> Result<RenderResult, Cancelled> {
        let cancel = &request.cancel;
        let refs = markers::image_references(&request.markdown);
        let unique = markers::unique_references(&refs);
        cancel.checkpoint()?;

        let prepared = self.prepare_all(&unique, cancel);
        cancel.checkpoint()?;

        let placed = self.place_in_order(&refs, &prepared, width, cancel)?;
        cancel.checkpoint()?;

        let (lines, success) = self.render_full(&request.markdown, width, &placed);
        cancel.checkpoint()?;

        tracing::debug!(
            request = %request.id,
            images = unique.len(),
            elapsed_ms = request.created_at.elapsed().as_millis() as u64,
            "Background render complete"
        );
        Ok(RenderResult {
            request_id: request.id.clone(),
            note_id: request.note_id,
            lines,
            success,
        })
    }

    /// Fetch or load every reference on the worker pool. Outcomes come back
    /// through a channel, one per reference.
    fn prepare_all(
        &self,
        unique: &[String],
        cancel: &CancelToken,
    ) -> HashMap<String, Result<PreparedImage, PrepareError>> {
        let (tx, rx) = channel();
        self.pool.scope(|scope| {
            for reference in unique {
                let tx = tx.clone();
                scope.spawn(move |_| {
                    let outcome =
                        prepare::prepare(reference, &self.cache, self.source.as_ref(), cancel);
                    if let Err(PrepareError::Failed(reason)) = &outcome {
                        tracing::info!(reference = %reference, reason = %reason, "Image unavailable");
                    }
                    let _ = tx.send((reference.clone(), outcome));
                });
            }
        });
        drop(tx);
        rx.into_iter().collect()
    }

    /// Transmit in document order so that fresh ids follow the markdown.
    fn place_in_order(
        &self,
        refs: &[String],
        prepared: &HashMap<String, Result<PreparedImage, PrepareError>>,
        width: usize,
        cancel: &CancelToken,
    ) -> Result<Placements, Cancelled> {
        let mut placed = Placements::new();
        for reference in refs {
            cancel.checkpoint()?;
            if placed.contains_key(reference) {
                continue;
            }
            let outcome = match prepared.get(reference) {
                Some(Ok(image)) => self.place(image, width),
                Some(Err(PrepareError::Failed(reason))) => Err(reason.clone()),
                Some(Err(PrepareError::Cancelled)) => return Err(Cancelled),
                None => continue,
            };
            placed.insert(reference.clone(), outcome);
        }
        Ok(placed)
    }

    /// Show one prepared image: reuse its resident id when possible,
    /// otherwise transmit under its cached id or a fresh one.
    fn place(&self, image: &PreparedImage, width: usize) -> Result<Marker, String> {
        let geometry = image_geometry(image.width, image.height, width, self.settings.image_columns);

        if let Some(id) = image.cached_id {
            if self.ledger.is_reusable(id, &image.fingerprint) {
                return self
                    .reuse(&image.reference, id, &image.fingerprint, geometry)
                    .map_err(|e| e.to_string());
            }
        }

        let image_id = match image.cached_id {
            Some(id) => id,
            None => self.cache.next_image_id(),
        };
        let opts = TransmitOptions {
            image_id,
            placement_id: image_id,
            columns: geometry.cols,
            rows: geometry.rows,
            quiet: self.settings.quiet,
            virtual_placement: true,
            z_index: 0,
        };
        self.transport
            .transmit(&image.bytes, &opts)
            .map_err(|e| e.to_string())?;
        self.ledger.mark_resident(image_id, geometry, &image.fingerprint);
        self.record_meta(&image.reference, image_id, geometry, &image.fingerprint);

        tracing::debug!(
            reference = %image.reference,
            image_id,
            cols = geometry.cols,
            rows = geometry.rows,
            from_cache = image.from_cache,
            "Transmitted image"
        );
        Ok(Marker {
            image_id,
            cols: geometry.cols,
            rows: geometry.rows,
        })
    }

    /// Display a resident id at `geometry` without resending data.
    fn reuse(
        &self,
        reference: &str,
        image_id: u32,
        fingerprint: &str,
        geometry: Geometry,
    ) -> Result<Marker, crate::graphics::GraphicsError> {
        let previous = self.ledger.entry(image_id).and_then(|e| e.geometry);
        if previous != Some(geometry) {
            self.transport.create_virtual_placement(
                image_id,
                image_id,
                geometry.cols,
                geometry.rows,
                self.settings.quiet,
            )?;
            self.ledger.update_geometry(image_id, geometry);
            self.record_meta(reference, image_id, geometry, fingerprint);
        }
        tracing::debug!(
            reference,
            image_id,
            cols = geometry.cols,
            rows = geometry.rows,
            "Reusing resident image"
        );
        Ok(Marker {
            image_id,
            cols: geometry.cols,
            rows: geometry.rows,
        })
    }

    fn record_meta(&self, reference: &str, image_id: u32, geometry: Geometry, fingerprint: &str) {
        match self
            .cache
            .update_meta(reference, image_id, geometry.cols, geometry.rows, fingerprint)
        {
            Ok(()) => {}
            Err(e) if e.is_missing() => {
                tracing::debug!(reference, "Image not cached, id not recorded");
            }
            Err(e) => tracing::warn!(reference, error = %e, "Failed to record image metadata"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ansi::strip_ansi;
    use crate::graphics::GraphicsCapabilities;
    use crate::test_utils::{BrokenFormatter, FixedProbe, ScriptedSource, SharedSink};
    use std::path::Path;
    use tempfile::tempdir;

    const WAIT: Duration = Duration::from_secs(10);

    struct Harness {
        pipeline: RenderPipeline,
        sink: SharedSink,
        source: Arc<ScriptedSource>,
        cache: Arc<ImageCache>,
    }

    fn harness_with(
        dir: &Path,
        caps: GraphicsCapabilities,
        source: ScriptedSource,
        formatter: Arc<dyn Formatter>,
        settings: PipelineSettings,
    ) -> Harness {
        let sink = SharedSink::new();
        let cache = Arc::new(
            ImageCache::open(dir, 50)
                .unwrap()
                .with_session(caps.session_id.clone()),
        );
        let source = Arc::new(source);
        let pipeline = RenderPipeline::new(
            Collaborators {
                cache: Arc::clone(&cache),
                transport: Arc::new(Transport::new(caps, Box::new(sink.clone()))),
                source: source.clone(),
                formatter,
            },
            settings,
        )
        .unwrap();
        Harness {
            pipeline,
            sink,
            source,
            cache,
        }
    }

    fn harness(dir: &Path, caps: GraphicsCapabilities, source: ScriptedSource) -> Harness {
        harness_with(
            dir,
            caps,
            source,
            Arc::new(MarkdownFormatter),
            PipelineSettings::default(),
        )
    }

    fn fg(id: u32) -> String {
        format!("\x1b[38;2;{};{};{}m", (id >> 16) & 0xff, (id >> 8) & 0xff, id & 0xff)
    }

    fn count(lines: &[String], needle: &str) -> usize {
        lines.iter().map(|l| l.matches(needle).count()).sum()
    }

    #[test]
    fn test_no_graphics_is_text_only() {
        let dir = tempdir().unwrap();
        let h = harness(
            dir.path(),
            FixedProbe::plain().probe(),
            ScriptedSource::new().with_image("http://a/b.png", 8, 8),
        );

        let out = h.pipeline.start_render(7, "# Title\n![x](http://a/b.png)", 80);
        assert!(!out.pending);
        let text = strip_ansi(&out.lines.join("\n"));
        assert!(text.contains("# Title"));
        assert!(text.contains("![x](http://a/b.png)"));

        assert!(h.sink.bytes().is_empty());
        assert!(h.source.fetches().is_empty());
        assert_eq!(h.pipeline.state(), PipelineState::Idle);

        assert!(h.pipeline.take_status_message().is_some());
        assert!(h.pipeline.take_status_message().is_none());
    }

    #[test]
    fn test_purges_terminal_on_start() {
        let dir = tempdir().unwrap();
        let h = harness(dir.path(), FixedProbe::kitty("w1").probe(), ScriptedSource::new());
        assert_eq!(h.sink.text(), "\x1b_Ga=d,d=A,q=2\x1b\\");
        assert!(h.pipeline.take_status_message().is_none());
    }

    #[test]
    fn test_duplicate_references_transmit_once() {
        let dir = tempdir().unwrap();
        let source = ScriptedSource::new()
            .with_image("A", 8, 4)
            .with_image("B", 8, 4)
            .with_image("C", 8, 4);
        let h = harness(dir.path(), FixedProbe::kitty("w1").probe(), source);

        let md = "![a](A)\n\n![b](B)\n\n![a again](A)\n\n![c](C)";
        let out = h.pipeline.start_render(1, md, 80);
        assert!(out.pending);
        assert!(strip_ansi(&out.lines.join("\n")).contains("![a](A)"));

        let result = h.pipeline.recv_result_timeout(1, WAIT).expect("result");
        assert!(result.success);
        assert_eq!(result.request_id, out.request_id);

        // Fresh ids follow document order of first occurrence.
        assert_eq!(h.sink.transmitted_ids(), vec![50, 51, 52]);
        for r in ["A", "B", "C"] {
            assert_eq!(h.source.fetch_count(r), 1);
        }
        assert_eq!(h.cache.get_meta("A").unwrap().image_id, Some(50));
        assert_eq!(h.cache.get_meta("C").unwrap().image_id, Some(52));

        let a = count(&result.lines, &fg(50));
        let b = count(&result.lines, &fg(51));
        assert!(b > 0);
        assert_eq!(a, 2 * b);
        assert_eq!(h.pipeline.state(), PipelineState::Idle);
    }

    #[test]
    fn test_resident_images_take_fast_path() {
        let dir = tempdir().unwrap();
        let source = ScriptedSource::new().with_image("A", 8, 4);
        let h = harness(dir.path(), FixedProbe::kitty("w1").probe(), source);

        let md = "intro\n\n![a](A)";
        assert!(h.pipeline.start_render(1, md, 80).pending);
        h.pipeline.recv_result_timeout(1, WAIT).expect("result");
        let sent = h.sink.transmitted_ids().len();

        let out = h.pipeline.start_render(1, md, 80);
        assert!(!out.pending);
        assert!(count(&out.lines, &fg(50)) > 0);
        assert_eq!(h.sink.transmitted_ids().len(), sent);
        assert_eq!(h.source.fetches().len(), 1);

        // New width: placement resized, data not resent.
        h.sink.clear();
        let out = h.pipeline.start_render(1, md, 30);
        assert!(!out.pending);
        assert!(h.sink.text().contains("a=p,U=1,q=2,i=50,p=50,c=23,"));
        assert!(h.sink.transmitted_ids().is_empty());
        assert_eq!(h.cache.get_meta("A").unwrap().last_cols, 23);
    }

    #[test]
    fn test_superseded_note_never_delivers() {
        let dir = tempdir().unwrap();
        let source = ScriptedSource::new()
            .with_image("slow.png", 8, 8)
            .with_delay(Duration::from_millis(300));
        let h = harness(dir.path(), FixedProbe::kitty("w1").probe(), source);
        h.sink.clear();

        let first = h.pipeline.start_render(1, "![s](slow.png)", 80);
        assert!(first.pending);
        let second = h.pipeline.start_render(2, "just text", 80);
        assert!(!second.pending);

        assert!(h
            .pipeline
            .recv_result_timeout(1, Duration::from_millis(800))
            .is_none());
        assert!(h
            .pipeline
            .recv_result_timeout(2, Duration::from_millis(100))
            .is_none());
        assert!(h.sink.transmitted_ids().is_empty());
        assert_eq!(h.cache.stats().entries, 0);
        assert_eq!(h.pipeline.current_request(), Some(second.request_id));
    }

    #[test]
    fn test_result_for_other_note_is_discarded() {
        let dir = tempdir().unwrap();
        let source = ScriptedSource::new().with_image("A", 4, 4);
        let h = harness(dir.path(), FixedProbe::kitty("w1").probe(), source);

        assert!(h.pipeline.start_render(3, "![a](A)", 80).pending);
        assert!(h
            .pipeline
            .recv_result_timeout(4, Duration::from_secs(3))
            .is_none());
        assert!(h.pipeline.poll_result(3).is_none());
    }

    #[test]
    fn test_failed_image_shows_notice() {
        let dir = tempdir().unwrap();
        let source = ScriptedSource::new()
            .with_image("ok.png", 8, 8)
            .with_failure("bad.png", "connection refused");
        let h = harness(dir.path(), FixedProbe::kitty("w1").probe(), source);

        h.pipeline.start_render(1, "![ok](ok.png)\n\n![bad](bad.png)", 80);
        let result = h.pipeline.recv_result_timeout(1, WAIT).expect("result");
        let text = strip_ansi(&result.lines.join("\n"));
        assert!(text.contains("![bad](bad.png) ⚠ image unavailable: connection refused"));
        assert!(count(&result.lines, &fg(50)) > 0);
        assert_eq!(h.sink.transmitted_ids(), vec![50]);
    }

    #[test]
    fn test_worker_pool_bounds_fetches() {
        let dir = tempdir().unwrap();
        let mut source = ScriptedSource::new().with_delay(Duration::from_millis(30));
        let mut md = String::new();
        for i in 0..8 {
            let r = format!("img{}.png", i);
            source = source.with_image(&r, 4, 4);
            md.push_str(&format!("![{}]({})\n\n", i, r));
        }
        let settings = PipelineSettings {
            workers: 2,
            ..PipelineSettings::default()
        };
        let h = harness_with(
            dir.path(),
            FixedProbe::kitty("w1").probe(),
            source,
            Arc::new(MarkdownFormatter),
            settings,
        );

        h.pipeline.start_render(1, &md, 80);
        h.pipeline.recv_result_timeout(1, WAIT).expect("result");
        assert!(h.source.max_in_flight() <= 2);
        assert_eq!(h.sink.transmitted_ids(), (50..58).collect::<Vec<_>>());
    }

    #[test]
    fn test_same_session_with_trust_reuses_ids() {
        let dir = tempdir().unwrap();
        let md = "![a](A)";
        {
            let h = harness(
                dir.path(),
                FixedProbe::kitty("w1").probe(),
                ScriptedSource::new().with_image("A", 8, 4),
            );
            h.pipeline.start_render(1, md, 80);
            h.pipeline.recv_result_timeout(1, WAIT).expect("result");
        }

        let settings = PipelineSettings {
            trust_terminal_cache: true,
            ..PipelineSettings::default()
        };
        let h = harness_with(
            dir.path(),
            FixedProbe::kitty("w1").probe(),
            ScriptedSource::new().with_image("A", 8, 4),
            Arc::new(MarkdownFormatter),
            settings,
        );
        // Same session: nothing purged.
        assert!(h.sink.bytes().is_empty());

        let out = h.pipeline.start_render(1, md, 80);
        assert!(!out.pending);
        assert!(count(&out.lines, &fg(50)) > 0);
        assert!(h.sink.transmitted_ids().is_empty());
        assert!(h.source.fetches().is_empty());
    }

    #[test]
    fn test_same_session_without_trust_retransmits_same_id() {
        let dir = tempdir().unwrap();
        let md = "![a](A)";
        {
            let h = harness(
                dir.path(),
                FixedProbe::kitty("w1").probe(),
                ScriptedSource::new().with_image("A", 8, 4),
            );
            h.pipeline.start_render(1, md, 80);
            h.pipeline.recv_result_timeout(1, WAIT).expect("result");
        }

        let h = harness(
            dir.path(),
            FixedProbe::kitty("w1").probe(),
            ScriptedSource::new().with_image("A", 8, 4),
        );
        assert!(h.pipeline.start_render(1, md, 80).pending);
        h.pipeline.recv_result_timeout(1, WAIT).expect("result");
        assert_eq!(h.sink.transmitted_ids(), vec![50]);
        // Served from the disk cache.
        assert!(h.source.fetches().is_empty());
    }

    #[test]
    fn test_other_session_purges_and_retransmits() {
        let dir = tempdir().unwrap();
        let md = "![a](A)";
        {
            let h = harness(
                dir.path(),
                FixedProbe::kitty("w1").probe(),
                ScriptedSource::new().with_image("A", 8, 4),
            );
            h.pipeline.start_render(1, md, 80);
            h.pipeline.recv_result_timeout(1, WAIT).expect("result");
        }

        let settings = PipelineSettings {
            trust_terminal_cache: true,
            ..PipelineSettings::default()
        };
        let h = harness_with(
            dir.path(),
            FixedProbe::kitty("w2").probe(),
            ScriptedSource::new(),
            Arc::new(MarkdownFormatter),
            settings,
        );
        assert!(h.sink.text().contains("a=d,d=A"));
        assert!(h.pipeline.start_render(1, md, 80).pending);
        h.pipeline.recv_result_timeout(1, WAIT).expect("result");
        assert_eq!(h.sink.transmitted_ids(), vec![50]);
    }

    #[test]
    fn test_terminal_change_resets_residency() {
        let dir = tempdir().unwrap();
        let h = harness(
            dir.path(),
            FixedProbe::kitty("w1").probe(),
            ScriptedSource::new().with_image("A", 8, 4),
        );
        h.pipeline.start_render(1, "![a](A)", 80);
        h.pipeline.recv_result_timeout(1, WAIT).expect("result");
        assert!(!h.pipeline.ledger().is_empty());

        assert!(!h.pipeline.observe_terminal(&FixedProbe::kitty("w1")));
        assert!(h.pipeline.observe_terminal(&FixedProbe::kitty("w9")));
        assert!(h.pipeline.ledger().is_empty());
        assert!(h.pipeline.start_render(1, "![a](A)", 80).pending);
    }

    #[test]
    fn test_new_terminal_in_trust_mode_retransmits() {
        let dir = tempdir().unwrap();
        let md = "![a](A)";
        {
            let h = harness(
                dir.path(),
                FixedProbe::kitty("w1").probe(),
                ScriptedSource::new().with_image("A", 8, 4),
            );
            h.pipeline.start_render(1, md, 80);
            h.pipeline.recv_result_timeout(1, WAIT).expect("result");
        }

        let settings = PipelineSettings {
            trust_terminal_cache: true,
            ..PipelineSettings::default()
        };
        let h = harness_with(
            dir.path(),
            FixedProbe::kitty("w1").probe(),
            ScriptedSource::new(),
            Arc::new(MarkdownFormatter),
            settings,
        );
        assert!(h.pipeline.observe_terminal(&FixedProbe::kitty("w9")));
        assert!(h.sink.text().contains("a=d,d=A"));
        h.sink.clear();

        let out = h.pipeline.start_render(1, md, 80);
        assert!(out.pending);
        h.pipeline.recv_result_timeout(1, WAIT).expect("result");
        assert_eq!(h.sink.transmitted_ids(), vec![50]);
        assert_eq!(
            h.pipeline.ledger().residency(50),
            crate::session::Residency::Confirmed
        );
        let reopened = ImageCache::open(dir.path(), 50).unwrap();
        assert_eq!(reopened.previous_session(), Some("w9"));
    }

    #[test]
    fn test_terminal_without_graphics_degrades_to_text() {
        let dir = tempdir().unwrap();
        let h = harness(
            dir.path(),
            FixedProbe::kitty("w1").probe(),
            ScriptedSource::new().with_image("A", 8, 4),
        );
        assert!(h.pipeline.observe_terminal(&FixedProbe::plain()));
        h.sink.clear();

        let out = h.pipeline.start_render(1, "![a](A)", 80);
        assert!(!out.pending);
        assert!(h.sink.bytes().is_empty());
    }

    #[test]
    fn test_marker_lookalike_text_survives() {
        let dir = tempdir().unwrap();
        let note = "Markers look like [KITTY_IMAGE:id=5,cols=3,rows=2] in the docs.";
        let forged = format!(
            "{}\n\n![a](A)",
            Marker {
                image_id: 5,
                cols: 3,
                rows: 2
            }
            .encode()
        );

        let plain = harness(
            dir.path(),
            FixedProbe::plain().probe(),
            ScriptedSource::new(),
        );
        let out = plain.pipeline.start_render(1, note, 80);
        assert!(strip_ansi(&out.lines.join(" ")).contains("[KITTY_IMAGE:id=5,cols=3,rows=2]"));
        drop(plain);

        let h = harness(
            dir.path(),
            FixedProbe::kitty("w1").probe(),
            ScriptedSource::new().with_image("A", 8, 4),
        );
        let out = h.pipeline.start_render(2, note, 80);
        assert!(strip_ansi(&out.lines.join(" ")).contains("[KITTY_IMAGE:id=5,cols=3,rows=2]"));

        h.pipeline.start_render(3, &forged, 80);
        let result = h.pipeline.recv_result_timeout(3, WAIT).expect("result");
        assert!(strip_ansi(&result.lines.join("\n")).contains("[KITTY_IMAGE:id=5,cols=3,rows=2]"));
        assert_eq!(count(&result.lines, &fg(5)), 0);
        assert!(count(&result.lines, &fg(50)) > 0);
    }

    #[test]
    fn test_formatter_failure_falls_back_to_source() {
        let dir = tempdir().unwrap();
        let h = harness_with(
            dir.path(),
            FixedProbe::kitty("w1").probe(),
            ScriptedSource::new().with_image("A", 4, 4),
            Arc::new(BrokenFormatter),
            PipelineSettings::default(),
        );

        let out = h.pipeline.start_render(1, "line one\n![a](A)", 80);
        assert_eq!(out.lines, vec!["line one", "![a](A)"]);
        let result = h.pipeline.recv_result_timeout(1, WAIT).expect("result");
        assert!(!result.success);
    }

    #[test]
    fn test_stop_discards_pending_work() {
        let dir = tempdir().unwrap();
        let source = ScriptedSource::new()
            .with_image("A", 4, 4)
            .with_delay(Duration::from_millis(200));
        let h = harness(dir.path(), FixedProbe::kitty("w1").probe(), source);

        assert!(h.pipeline.start_render(1, "![a](A)", 80).pending);
        h.pipeline.stop();
        assert_eq!(h.pipeline.state(), PipelineState::Idle);
        assert!(h.pipeline.current_request().is_none());
        assert!(h
            .pipeline
            .recv_result_timeout(1, Duration::from_millis(500))
            .is_none());
    }

    #[test]
    fn test_images_disabled_by_settings() {
        let dir = tempdir().unwrap();
        let settings = PipelineSettings {
            images: false,
            ..PipelineSettings::default()
        };
        let h = harness_with(
            dir.path(),
            FixedProbe::kitty("w1").probe(),
            ScriptedSource::new().with_image("A", 4, 4),
            Arc::new(MarkdownFormatter),
            settings,
        );
        h.sink.clear();
        let out = h.pipeline.start_render(1, "![a](A)", 80);
        assert!(!out.pending);
        assert!(h.sink.bytes().is_empty());
        assert!(h.pipeline.take_status_message().is_none());
    }
}

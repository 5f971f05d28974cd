use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use super::cancel::CancelToken;

pub type NoteId = i64;

static REQUEST_SEQ: AtomicU64 = AtomicU64::new(0);

/// One display request for a note. Superseded requests are cancelled, never
/// mutated.
#[derive(Debug, Clone)]
pub struct RenderRequest {
    /// `note_<note id>_<issue time>_<seq>`; unique within the process.
    pub id: String,
    pub note_id: NoteId,
    pub markdown: String,
    /// Target width in terminal columns.
    pub max_cols: usize,
    pub cancel: CancelToken,
    pub created_at: Instant,
}

impl RenderRequest {
    pub fn new(note_id: NoteId, markdown: impl Into<String>, max_cols: usize) -> Self {
        let issued = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        let seq = REQUEST_SEQ.fetch_add(1, Ordering::Relaxed);
        Self {
            id: format!("note_{note_id}_{issued}_{seq}"),
            note_id,
            markdown: markdown.into(),
            max_cols,
            cancel: CancelToken::new(),
            created_at: Instant::now(),
        }
    }
}

/// Output of one request; produced once, applied at most once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderResult {
    pub request_id: String,
    pub note_id: NoteId,
    pub lines: Vec<String>,
    /// False when formatting failed and `lines` hold the raw markdown.
    pub success: bool,
}

//! Chunked image transmission frames.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};

use super::capabilities::Multiplexer;

/// Maximum base64 payload bytes per frame.
pub const CHUNK_SIZE: usize = 4096;

const APC_OPEN: &str = "\x1b_G";
const APC_CLOSE: &str = "\x1b\\";

/// Opening and closing sequences of one graphics command, wrapped for any
/// multiplexer the output passes through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Framing {
    pub open: String,
    pub close: String,
}

impl Framing {
    pub fn plain() -> Self {
        Self {
            open: APC_OPEN.to_string(),
            close: APC_CLOSE.to_string(),
        }
    }

    /// tmux passthrough: inner escapes doubled, whole command enclosed in a
    /// `ESC P tmux; ... ESC \` DCS string.
    pub fn tmux() -> Self {
        Self {
            open: format!("\x1bPtmux;{}", APC_OPEN.replace('\x1b', "\x1b\x1b")),
            close: format!("{}\x1b\\", APC_CLOSE.replace('\x1b', "\x1b\x1b")),
        }
    }

    pub fn for_multiplexer(mux: Option<Multiplexer>) -> Self {
        match mux {
            Some(Multiplexer::Tmux) => Self::tmux(),
            None => Self::plain(),
        }
    }

    /// One complete command: `open` + `body` + `close`.
    pub fn command(&self, body: &str) -> String {
        format!("{}{}{}", self.open, body, self.close)
    }
}

/// Parameters of a transmit-and-display (`a=T`) command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransmitOptions {
    pub image_id: u32,
    pub placement_id: u32,
    pub columns: u32,
    pub rows: u32,
    /// Suppress all terminal replies (`q=2`); otherwise only errors (`q=1`).
    pub quiet: bool,
    /// Create a unicode-placeholder virtual placement (`U=1`).
    pub virtual_placement: bool,
    pub z_index: i32,
}

impl TransmitOptions {
    /// Key/value header for a payload of `size` raw bytes. PNG data (`f=100`).
    pub fn header(&self, size: usize) -> String {
        let mut parts = vec!["a=T".to_string(), "f=100".to_string()];
        parts.push(if self.quiet { "q=2" } else { "q=1" }.to_string());
        if self.image_id != 0 {
            parts.push(format!("i={}", self.image_id));
        }
        if self.placement_id != 0 {
            parts.push(format!("p={}", self.placement_id));
        }
        if self.virtual_placement {
            parts.push("U=1".to_string());
        }
        if self.columns > 0 {
            parts.push(format!("c={}", self.columns));
        }
        if self.rows > 0 {
            parts.push(format!("r={}", self.rows));
        }
        if self.z_index != 0 {
            parts.push(format!("z={}", self.z_index));
        }
        parts.push(format!("S={size}"));
        parts.join(",")
    }
}

/// Encode `data` as a sequence of frames.
///
/// The payload is base64 encoded and split into [`CHUNK_SIZE`] pieces, each
/// sent as `m=1`. Only the first frame carries the parameter header. A final
/// empty `m=0` frame marks completion.
pub fn encode_transmission(data: &[u8], opts: &TransmitOptions, framing: &Framing) -> Vec<u8> {
    let encoded = BASE64.encode(data);
    let frames = encoded.len().div_ceil(CHUNK_SIZE) + 1;
    let mut out = Vec::with_capacity(
        encoded.len() + frames * (framing.open.len() + framing.close.len() + 8) + 96,
    );

    let mut header = Some(opts.header(data.len()));
    for chunk in encoded.as_bytes().chunks(CHUNK_SIZE) {
        out.extend_from_slice(framing.open.as_bytes());
        if let Some(h) = header.take() {
            out.extend_from_slice(h.as_bytes());
            out.push(b',');
        }
        out.extend_from_slice(b"m=1;");
        out.extend_from_slice(chunk);
        out.extend_from_slice(framing.close.as_bytes());
    }

    out.extend_from_slice(framing.open.as_bytes());
    if let Some(h) = header.take() {
        out.extend_from_slice(h.as_bytes());
        out.push(b',');
    }
    out.extend_from_slice(b"m=0;");
    out.extend_from_slice(framing.close.as_bytes());
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frames(bytes: &[u8], framing: &Framing) -> Vec<String> {
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        text.split(framing.close.as_str())
            .filter(|s| !s.is_empty())
            .map(|s| s.strip_prefix(framing.open.as_str()).unwrap().to_string())
            .collect()
    }

    fn opts() -> TransmitOptions {
        TransmitOptions {
            image_id: 51,
            placement_id: 51,
            columns: 30,
            rows: 10,
            quiet: true,
            virtual_placement: true,
            z_index: 0,
        }
    }

    #[test]
    fn test_header_layout() {
        assert_eq!(
            opts().header(1234),
            "a=T,f=100,q=2,i=51,p=51,U=1,c=30,r=10,S=1234"
        );
        let minimal = TransmitOptions::default();
        assert_eq!(minimal.header(0), "a=T,f=100,q=1,S=0");
    }

    #[test]
    fn test_z_index_in_header() {
        let o = TransmitOptions {
            z_index: -1,
            ..TransmitOptions::default()
        };
        assert!(o.header(5).contains(",z=-1,"));
    }

    #[test]
    fn test_small_payload_is_one_data_frame_plus_terminator() {
        let framing = Framing::plain();
        let out = encode_transmission(b"hello", &opts(), &framing);
        let f = frames(&out, &framing);
        assert_eq!(f.len(), 2);
        assert_eq!(f[0], format!("{},m=1;{}", opts().header(5), BASE64.encode(b"hello")));
        assert_eq!(f[1], "m=0;");
    }

    #[test]
    fn test_chunking_bounds_and_header_once() {
        let data = vec![7u8; 10_000];
        let framing = Framing::plain();
        let out = encode_transmission(&data, &opts(), &framing);
        let f = frames(&out, &framing);

        let encoded = BASE64.encode(&data);
        let expected_chunks = encoded.len().div_ceil(CHUNK_SIZE);
        assert_eq!(f.len(), expected_chunks + 1);

        let mut rebuilt = String::new();
        for (i, frame) in f[..expected_chunks].iter().enumerate() {
            let (params, payload) = frame.split_once(';').unwrap();
            assert!(payload.len() <= CHUNK_SIZE);
            if i == 0 {
                assert!(params.starts_with("a=T,"));
                assert!(params.ends_with(",m=1"));
            } else {
                assert_eq!(params, "m=1");
            }
            rebuilt.push_str(payload);
        }
        assert_eq!(rebuilt, encoded);
        assert_eq!(f.last().unwrap(), "m=0;");
    }

    #[test]
    fn test_empty_payload_still_carries_header() {
        let framing = Framing::plain();
        let out = encode_transmission(b"", &opts(), &framing);
        let f = frames(&out, &framing);
        assert_eq!(f, vec![format!("{},m=0;", opts().header(0))]);
    }

    #[test]
    fn test_tmux_framing_wraps_every_frame() {
        let framing = Framing::tmux();
        assert_eq!(framing.open, "\x1bPtmux;\x1b\x1b_G");
        assert_eq!(framing.close, "\x1b\x1b\\\x1b\\");

        let data = vec![1u8; 5000];
        let out = String::from_utf8(encode_transmission(&data, &opts(), &framing)).unwrap();
        let opens = out.matches("\x1bPtmux;").count();
        let closes = out.matches(framing.close.as_str()).count();
        assert_eq!(opens, 3);
        assert_eq!(closes, 3);
    }
}

//! Terminal graphics capability detection.
//!
//! Best effort and environment based: the terminal is never queried over the
//! tty, since replies would race with the key reader. Falls back to "no
//! graphics" whenever the terminal cannot be identified.

use regex::Regex;
use std::collections::HashMap;
use std::process::Command;
use std::sync::LazyLock;

/// First kitty release with unicode-placeholder virtual placements.
pub const VIRTUAL_PLACEMENT_VERSION: &str = "0.28.0";
/// First kitty release with placements relative to a parent placement.
pub const RELATIVE_PLACEMENT_VERSION: &str = "0.31.0";

/// Environment variable forcing the assumed kitty version.
pub const ASSUME_VERSION_ENV: &str = "LAZYNOTE_ASSUME_KITTY_VERSION";

static SEMVER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d+\.\d+\.\d+").expect("semver regex must compile"));

/// Terminal multiplexer the output passes through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Multiplexer {
    Tmux,
}

/// What the attached terminal can do with graphics commands.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GraphicsCapabilities {
    /// Terminal accepts graphics protocol transmissions at all.
    pub graphics: bool,
    /// Unicode-placeholder (virtual) placements.
    pub virtual_placement: bool,
    /// Placements anchored to another placement.
    pub relative_placement: bool,
    /// Running in kitty itself rather than another implementation of the
    /// protocol.
    pub actual_kitty: bool,
    pub version: Option<String>,
    pub multiplexer: Option<Multiplexer>,
    /// Identifies the terminal window; changes when the terminal restarts.
    pub session_id: Option<String>,
}

impl GraphicsCapabilities {
    /// Capabilities of a plain terminal.
    pub fn none() -> Self {
        Self::default()
    }

    /// True when image-aware rendering can run (transmit + virtual placement).
    pub fn supports_images(&self) -> bool {
        self.graphics && self.virtual_placement
    }
}

/// Source of terminal capabilities, consulted before any image-aware path.
pub trait CapabilityProbe: Send + Sync {
    fn probe(&self) -> GraphicsCapabilities;
}

/// Probe driven by environment variables, optionally asking the `kitty`
/// binary for its version.
pub struct EnvProbe {
    vars: HashMap<String, String>,
    query_binary: bool,
}

impl EnvProbe {
    /// Snapshot the process environment.
    pub fn from_env() -> Self {
        Self {
            vars: std::env::vars().collect(),
            query_binary: true,
        }
    }

    /// Probe over an explicit variable set; never spawns `kitty`.
    pub fn from_vars<I, K, V>(vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            vars: vars.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
            query_binary: false,
        }
    }

    fn var(&self, name: &str) -> Option<&str> {
        self.vars
            .get(name)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    fn term(&self) -> String {
        self.var("TERM").unwrap_or("").to_lowercase()
    }

    fn is_actual_kitty(&self) -> bool {
        self.term() == "xterm-kitty"
    }

    fn is_graphics_terminal(&self) -> bool {
        if self.is_actual_kitty() || self.term() == "xterm-ghostty" {
            return true;
        }
        if self.var("KITTY_WINDOW_ID").is_some() {
            return true;
        }
        matches!(
            self.var("TERM_PROGRAM").map(str::to_lowercase).as_deref(),
            Some("ghostty") | Some("wezterm")
        )
    }

    fn multiplexer(&self) -> Option<Multiplexer> {
        let term = self.term();
        if self.var("TMUX").is_some() || term.starts_with("screen") || term.starts_with("tmux") {
            Some(Multiplexer::Tmux)
        } else {
            None
        }
    }

    fn session_id(&self) -> Option<String> {
        let window = self.var("KITTY_WINDOW_ID")?;
        Some(match self.var("KITTY_PID") {
            Some(pid) => format!("{pid}:{window}"),
            None => window.to_string(),
        })
    }

    fn version(&self, actual_kitty: bool) -> Option<String> {
        if let Some(v) = self.var(ASSUME_VERSION_ENV) {
            return Some(v.to_string());
        }
        if self.query_binary && actual_kitty {
            return kitty_binary_version();
        }
        None
    }
}

impl CapabilityProbe for EnvProbe {
    fn probe(&self) -> GraphicsCapabilities {
        if !self.is_graphics_terminal() {
            tracing::debug!("Terminal does not advertise graphics support");
            return GraphicsCapabilities {
                multiplexer: self.multiplexer(),
                ..GraphicsCapabilities::none()
            };
        }

        let actual_kitty = self.is_actual_kitty();
        let version = self.version(actual_kitty);
        let (virtual_placement, relative_placement) = match version.as_deref() {
            // Unknown version: the placeholder protocol is widely implemented,
            // relative placements are not.
            None => (true, false),
            Some(v) => (
                semver_at_least(v, VIRTUAL_PLACEMENT_VERSION),
                semver_at_least(v, RELATIVE_PLACEMENT_VERSION),
            ),
        };

        let caps = GraphicsCapabilities {
            graphics: true,
            virtual_placement,
            relative_placement,
            actual_kitty,
            version,
            multiplexer: self.multiplexer(),
            session_id: self.session_id(),
        };
        tracing::info!(?caps, "Detected terminal graphics capabilities");
        caps
    }
}

fn kitty_binary_version() -> Option<String> {
    let output = Command::new("kitty").arg("--version").output().ok()?;
    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8_lossy(&output.stdout);
    SEMVER_RE.find(&text).map(|m| m.as_str().to_string())
}

/// Numeric comparison of dotted triples. False if either side is malformed.
pub fn semver_at_least(have: &str, want: &str) -> bool {
    match (parse_triple(have), parse_triple(want)) {
        (Some(h), Some(w)) => h >= w,
        _ => false,
    }
}

fn parse_triple(v: &str) -> Option<(u32, u32, u32)> {
    let m = SEMVER_RE.find(v)?;
    let mut parts = m.as_str().split('.').map(|p| p.parse::<u32>());
    Some((parts.next()?.ok()?, parts.next()?.ok()?, parts.next()?.ok()?))
}

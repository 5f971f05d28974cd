//! Terminal graphics protocol transport.
//!
//! Pure encoders live in the submodules; [`Transport`] gates them on the
//! detected capabilities and writes the resulting sequences to the display
//! surface. Nothing is ever written to a terminal that did not advertise
//! graphics support.

pub mod capabilities;
pub mod placeholder;
pub mod placement;
pub mod transmit;

pub use capabilities::{CapabilityProbe, EnvProbe, GraphicsCapabilities, Multiplexer};
pub use placeholder::placeholder_grid;
pub use placement::RelativePlacement;
pub use transmit::{Framing, TransmitOptions};

use std::fmt;
use std::io::Write;
use std::sync::{Mutex, PoisonError, RwLock, RwLockReadGuard};

/// Error returned by transport calls.
#[derive(Debug)]
pub enum GraphicsError {
    /// No attached terminal advertises graphics support.
    Unavailable,
    /// The terminal supports graphics but not this feature tier.
    FeatureUnavailable(&'static str),
    /// Writing to the display surface failed.
    Io(std::io::Error),
}

impl fmt::Display for GraphicsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GraphicsError::Unavailable => write!(f, "terminal graphics protocol not available"),
            GraphicsError::FeatureUnavailable(feature) => {
                write!(f, "terminal does not support {}", feature)
            }
            GraphicsError::Io(e) => write!(f, "graphics output failed: {}", e),
        }
    }
}

impl std::error::Error for GraphicsError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            GraphicsError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for GraphicsError {
    fn from(e: std::io::Error) -> Self {
        GraphicsError::Io(e)
    }
}

/// Raw byte sink the transport writes escape sequences to.
pub type DisplaySurface = Box<dyn Write + Send>;

struct Negotiated {
    caps: GraphicsCapabilities,
    framing: Framing,
}

impl Negotiated {
    fn new(caps: GraphicsCapabilities) -> Self {
        Self {
            framing: Framing::for_multiplexer(caps.multiplexer),
            caps,
        }
    }
}

pub struct Transport {
    negotiated: RwLock<Negotiated>,
    out: Mutex<DisplaySurface>,
}

impl Transport {
    pub fn new(caps: GraphicsCapabilities, out: DisplaySurface) -> Self {
        Self {
            negotiated: RwLock::new(Negotiated::new(caps)),
            out: Mutex::new(out),
        }
    }

    /// Transport writing to the process's stdout.
    pub fn stdout(caps: GraphicsCapabilities) -> Self {
        Self::new(caps, Box::new(std::io::stdout()))
    }

    pub fn capabilities(&self) -> GraphicsCapabilities {
        self.read_negotiated().caps.clone()
    }

    /// Adopt freshly probed capabilities, e.g. after the terminal changed.
    pub fn set_capabilities(&self, caps: GraphicsCapabilities) {
        *self
            .negotiated
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Negotiated::new(caps);
    }

    fn read_negotiated(&self) -> RwLockReadGuard<'_, Negotiated> {
        self.negotiated.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn framing(&self) -> Framing {
        self.read_negotiated().framing.clone()
    }

    fn ensure_available(&self) -> Result<(), GraphicsError> {
        if self.read_negotiated().caps.graphics {
            Ok(())
        } else {
            Err(GraphicsError::Unavailable)
        }
    }

    fn ensure_virtual(&self) -> Result<(), GraphicsError> {
        self.ensure_available()?;
        if self.read_negotiated().caps.virtual_placement {
            Ok(())
        } else {
            Err(GraphicsError::FeatureUnavailable("virtual placements"))
        }
    }

    /// Write one batch of bytes; writes from concurrent callers never
    /// interleave.
    fn write_all(&self, bytes: &[u8]) -> Result<(), GraphicsError> {
        let mut out = self.out.lock().unwrap_or_else(PoisonError::into_inner);
        out.write_all(bytes)?;
        out.flush()?;
        Ok(())
    }

    /// Send `data` (PNG) and display it according to `opts`.
    pub fn transmit(&self, data: &[u8], opts: &TransmitOptions) -> Result<(), GraphicsError> {
        self.ensure_available()?;
        if opts.virtual_placement {
            self.ensure_virtual()?;
        }
        let frames = transmit::encode_transmission(data, opts, &self.framing());
        tracing::debug!(
            image_id = opts.image_id,
            cols = opts.columns,
            rows = opts.rows,
            bytes = data.len(),
            "Transmitting image"
        );
        self.write_all(&frames)
    }

    /// Create (or resize) a virtual placement for already-resident data.
    pub fn create_virtual_placement(
        &self,
        image_id: u32,
        placement_id: u32,
        columns: u32,
        rows: u32,
        quiet: bool,
    ) -> Result<(), GraphicsError> {
        self.ensure_virtual()?;
        let body =
            placement::virtual_placement_body(image_id, placement_id, columns, rows, quiet);
        self.write_all(self.framing().command(&body).as_bytes())
    }

    /// Create a placement positioned relative to a parent placement.
    pub fn create_relative_placement(&self, p: &RelativePlacement) -> Result<(), GraphicsError> {
        self.ensure_available()?;
        if !self.read_negotiated().caps.relative_placement {
            return Err(GraphicsError::FeatureUnavailable("relative placements"));
        }
        let body = placement::relative_placement_body(p);
        self.write_all(self.framing().command(&body).as_bytes())
    }

    /// Text cells addressing a virtual placement.
    pub fn placeholder_grid(
        &self,
        image_id: u32,
        placement_id: u32,
        columns: u32,
        rows: u32,
    ) -> Result<String, GraphicsError> {
        self.ensure_virtual()?;
        Ok(placeholder::placeholder_grid(image_id, placement_id, columns, rows))
    }

    /// Drop every image (and its data) the terminal holds for this window.
    pub fn delete_all_images(&self) -> Result<(), GraphicsError> {
        self.ensure_available()?;
        let body = placement::delete_all_body(true);
        self.write_all(self.framing().command(&body).as_bytes())
    }
}

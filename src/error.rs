//! Error types for the sink core
//!
//! Every fallible library operation returns [`SinkError`]. The variants map
//! onto how a failure is surfaced to the host: connection and protocol
//! errors are fatal for the display, allocation errors only cost one frame,
//! format errors are reported at negotiation time.

use thiserror::Error;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, SinkError>;

#[derive(Debug, Error)]
pub enum SinkError {
    /// Server unreachable or a mandatory global is missing
    #[error("connection error: {0}")]
    Connection(String),

    /// Mid-session I/O failure on the display connection
    #[error("protocol I/O error: {0}")]
    ProtocolIo(String),

    /// Buffer construction, import or copy failed for a frame
    #[error("allocation error: {0}")]
    Allocation(String),

    /// The compositor cannot display this format in the requested memory domain
    #[error("format {format} is not supported via {domain}")]
    FormatUnsupported { format: String, domain: String },

    /// The compositor closed the output window
    #[error("output window was closed")]
    WindowClosed,

    /// A frame arrived before caps were negotiated
    #[error("no video format negotiated")]
    NotNegotiated,

    /// The host supplied a window handle that cannot be used
    #[error("invalid window handle: {0}")]
    InvalidWindowHandle(String),

    /// The display has been shut down
    #[error("display is shut down")]
    Shutdown,
}

impl SinkError {
    /// Whether the error leaves the display or window unusable
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SinkError::Connection(_)
                | SinkError::ProtocolIo(_)
                | SinkError::WindowClosed
                | SinkError::Shutdown
        )
    }

    pub(crate) fn allocation(msg: impl Into<String>) -> Self {
        SinkError::Allocation(msg.into())
    }
}

impl From<std::io::Error> for SinkError {
    fn from(err: std::io::Error) -> Self {
        SinkError::ProtocolIo(err.to_string())
    }
}

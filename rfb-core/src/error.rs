//! Domain-specific error types for the RFB pipeline.
//!
//! All fallible operations return `Result<T, RfbError>`. Protocol
//! errors are fatal to the session that produced them and nothing
//! else; "not enough data yet" is never an error (see
//! [`InStream`](crate::stream::InStream)).

use thiserror::Error;

use crate::geometry::Rect;

/// The canonical error type for the RFB pipeline.
#[derive(Debug, Error)]
pub enum RfbError {
    // ── Protocol Errors ──────────────────────────────────────────
    /// The peer sent bytes that break the wire format.
    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),

    /// Protocol violation with a formatted description.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A rectangle used an encoding we do not implement.
    #[error("unknown encoding {0}")]
    UnknownEncoding(i32),

    /// A server or client message type we do not understand.
    #[error("unknown message type {0}")]
    UnknownMessage(u8),

    /// A pixel format failed validation.
    #[error("invalid pixel format: {0}")]
    InvalidPixelFormat(&'static str),

    // ── Buffer Errors ────────────────────────────────────────────
    /// A rectangle reached outside the pixel buffer it addressed.
    #[error("rect {rect:?} outside buffer bounds {bounds:?}")]
    OutOfBounds { rect: Rect, bounds: Rect },

    /// Fewer bytes were available than a complete read required.
    #[error("stream truncated: needed {needed} bytes, {available} available")]
    Truncated { needed: usize, available: usize },

    // ── System Errors ────────────────────────────────────────────
    /// A zlib stream could not be driven.
    #[error("compression error: {0}")]
    Compression(String),

    /// The underlying socket reported an error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A decode worker failed outside of a decoder error.
    #[error("decode worker failed: {0}")]
    Worker(String),

    /// Catch-all for errors that do not fit another variant.
    #[error("{0}")]
    Other(String),
}

impl RfbError {
    /// Whether the error means the peer's byte stream can no longer be
    /// trusted and the session must be dropped.
    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            RfbError::ProtocolViolation(_)
                | RfbError::Protocol(_)
                | RfbError::UnknownEncoding(_)
                | RfbError::UnknownMessage(_)
                | RfbError::InvalidPixelFormat(_)
                | RfbError::OutOfBounds { .. }
                | RfbError::Truncated { .. }
        )
    }
}

// ── Convenient From implementations ──────────────────────────────

impl From<String> for RfbError {
    fn from(s: String) -> Self {
        RfbError::Other(s)
    }
}

impl From<&str> for RfbError {
    fn from(s: &str) -> Self {
        RfbError::Other(s.to_string())
    }
}

impl From<flate2::CompressError> for RfbError {
    fn from(e: flate2::CompressError) -> Self {
        RfbError::Compression(e.to_string())
    }
}

impl From<flate2::DecompressError> for RfbError {
    fn from(e: flate2::DecompressError) -> Self {
        RfbError::Compression(e.to_string())
    }
}

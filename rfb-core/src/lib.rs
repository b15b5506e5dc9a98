//! # rfb-core
//!
//! Update tracking and encoding pipeline for the RFB (VNC) protocol.
//!
//! This crate contains:
//! - **Geometry**: `Point`, `Rect` and the banded `Region` set algebra
//! - **Pixels**: `PixelFormat` conversion, `PixelBuffer` traits, owned buffers
//! - **Streams**: `OutStream`, `InStream` with restore points, zlib streams
//! - **Tracking**: `UpdateTracker` implementations merging changes and copies
//! - **Encoders**: Raw, RRE, Hextile, Tight, ZRLE and the `EncodeManager`
//! - **Decoders**: the inverse of each encoder plus CopyRect, and the
//!   threaded `DecodeManager`
//! - **Congestion**: delay-based window estimator pacing the update stream
//! - **Messages**: FramebufferUpdate framing, Fence, incremental readers
//! - **Error**: `RfbError`, a typed `thiserror`-based error hierarchy

pub mod congestion;
pub mod decoder;
pub mod encoder;
pub mod error;
pub mod geometry;
pub mod message;
pub mod palette;
pub mod params;
pub mod pixel;
pub mod region;
pub mod rle;
pub mod stream;
pub mod tracker;

// ── Re-exports for ergonomic usage ───────────────────────────────

pub use congestion::Congestion;
pub use decoder::{DecodeManager, Decoder, DecoderFlags, DecoderStats, SharedFramebuffer};
pub use encoder::{EncodeManager, Encoder, EncoderClass, EncoderStats};
pub use error::RfbError;
pub use geometry::{Point, Rect};
pub use message::{ClientMessage, FenceFlags, MsgHandler, MsgReader, encoding};
pub use palette::Palette;
pub use params::ClientParams;
pub use pixel::{ManagedPixelBuffer, ModifiablePixelBuffer, Pixel, PixelBuffer, PixelFormat};
pub use region::Region;
pub use stream::{InStream, OutStream};
pub use tracker::{
    ClippingUpdateTracker, ComparingUpdateTracker, SimpleUpdateTracker, UpdateInfo, UpdateTracker,
};

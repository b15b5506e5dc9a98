//! Byte streams used by the wire layer.
//!
//! | Module   | Purpose                                                  |
//! |----------|----------------------------------------------------------|
//! | `input`  | [`InStream`] with restore points, [`ByteCursor`], [`ByteSource`] |
//! | `output` | [`OutStream`], big-endian writer over `BytesMut`           |
//! | `zlib`   | Persistent deflate / inflate streams                     |
//!
//! All multi-byte integers on the wire are big-endian.

pub mod input;
pub mod output;
pub mod zlib;

pub use input::{ByteCursor, ByteSource, InStream};
pub use output::OutStream;
pub use zlib::{ZlibDeflater, ZlibInflater};

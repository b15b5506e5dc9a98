//! Pixel formats, pixel buffers and the pixel-width abstraction.
//!
//! | Module   | Purpose                                              |
//! |----------|------------------------------------------------------|
//! | `format` | [`PixelFormat`] layout, validation, conversion tables |
//! | `buffer` | [`PixelBuffer`] traits, views and owned buffers        |
//!
//! Encoders and decoders are written once, generic over [`Pixel`], and
//! instantiated for `u8`, `u16` and `u32` through [`dispatch_bpp!`].

pub mod buffer;
pub mod format;

use std::fmt::Debug;

pub use buffer::{ManagedPixelBuffer, ModifiablePixelBuffer, PixelBuffer, PixelView};
pub use format::PixelFormat;

// ── Pixel ────────────────────────────────────────────────────────

/// An unsigned integer wide enough for one pixel.
///
/// Pixels are loaded from and stored to buffers in host byte order, so
/// a load/store pair reproduces the buffer bytes exactly whatever the
/// pixel format's endianness. Only equality and hashing are done on
/// the loaded value.
pub trait Pixel: Copy + Eq + Default + Debug + Send + Sync + 'static {
    /// Bytes per pixel.
    const BYTES: usize;

    fn load(buf: &[u8]) -> Self;
    fn store(self, buf: &mut [u8]);
    fn to_u32(self) -> u32;
    fn from_u32(v: u32) -> Self;
}

macro_rules! impl_pixel {
    ($t:ty) => {
        impl Pixel for $t {
            const BYTES: usize = std::mem::size_of::<$t>();

            #[inline]
            fn load(buf: &[u8]) -> Self {
                let mut raw = [0u8; std::mem::size_of::<$t>()];
                raw.copy_from_slice(&buf[..Self::BYTES]);
                <$t>::from_ne_bytes(raw)
            }

            #[inline]
            fn store(self, buf: &mut [u8]) {
                buf[..Self::BYTES].copy_from_slice(&self.to_ne_bytes());
            }

            #[inline]
            fn to_u32(self) -> u32 {
                self as u32
            }

            #[inline]
            fn from_u32(v: u32) -> Self {
                v as $t
            }
        }
    };
}

impl_pixel!(u8);
impl_pixel!(u16);
impl_pixel!(u32);

/// Run `$body` with `$t` bound to the pixel type for `$bpp` bits.
///
/// Pixel formats are validated to 8, 16 or 32 bpp, so the fallback arm
/// is the 32-bit one.
#[macro_export]
macro_rules! dispatch_bpp {
    ($bpp:expr, $t:ident => $body:expr) => {
        match $bpp {
            8 => {
                type $t = u8;
                $body
            }
            16 => {
                type $t = u16;
                $body
            }
            _ => {
                type $t = u32;
                $body
            }
        }
    };
}

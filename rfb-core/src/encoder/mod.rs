//! Pixel encoders.
//!
//! Each encoder turns a rectangle of pixels, already in the client's
//! pixel format, into the body of one RFB rect. The rect header is
//! written by the caller ([`EncodeManager`]).
//!
//! | Module    | Encoding | Notes                                      |
//! |-----------|----------|--------------------------------------------|
//! | `raw`     | 0        | Rows of pixels, the universal fallback     |
//! | `rre`     | 2        | Background plus coloured subrects          |
//! | `hextile` | 5        | 16×16 tiles, bg/fg carried between tiles   |
//! | `tight`   | 7        | Fill, mono, indexed or full colour + zlib  |
//! | `zrle`    | 16       | 64×64 tiles, palette RLE, one zlib stream  |
//! | `manager` |          | Chooses encoders and drives a whole update |
//!
//! The [`Palette`] handed to [`Encoder::write_rect`] has already been
//! built from the rect by the manager: it is empty when the rect has
//! more colours than the encoder asked for, which means "full colour".

pub mod hextile;
pub mod manager;
pub mod raw;
pub mod rre;
pub mod tight;
pub mod zrle;

use bitflags::bitflags;

use crate::error::RfbError;
use crate::palette::Palette;
use crate::params::ClientParams;
use crate::pixel::{Pixel, PixelFormat, PixelView};
use crate::stream::OutStream;

pub use hextile::HextileEncoder;
pub use manager::{EncodeManager, EncoderClass, EncoderStats};
pub use raw::RawEncoder;
pub use rre::RreEncoder;
pub use tight::TightEncoder;
pub use zrle::ZrleEncoder;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct EncoderFlags: u32 {
        /// Wants the server's native pixel format rather than the
        /// client's, and converts itself.
        const USE_NATIVE_PF = 1 << 0;
    }
}

// ── Encoder ──────────────────────────────────────────────────────

pub trait Encoder: Send {
    /// Protocol encoding number written in the rect header.
    fn encoding(&self) -> i32;

    fn flags(&self) -> EncoderFlags {
        EncoderFlags::empty()
    }

    /// Largest palette this encoder can use, `None` when it never
    /// looks at one.
    fn max_palette_size(&self) -> Option<usize> {
        None
    }

    /// Whether the client can receive this encoding.
    fn is_supported(&self, cp: &ClientParams) -> bool {
        cp.supports_encoding(self.encoding())
    }

    /// `-1` selects the encoder's default.
    fn set_compress_level(&mut self, _level: i32) {}

    /// Encode the pixels of `pb`. `palette` is either empty or holds
    /// every colour of `pb`.
    fn write_rect(
        &mut self,
        pb: &PixelView<'_>,
        palette: &Palette,
        os: &mut OutStream,
    ) -> Result<(), RfbError>;

    /// Encode a `width`×`height` rect of one colour, given as the
    /// bytes of one pixel in `pf`.
    fn write_solid_rect(
        &mut self,
        width: usize,
        height: usize,
        pf: &PixelFormat,
        colour: &[u8],
        os: &mut OutStream,
    ) -> Result<(), RfbError>;
}

// ── Helpers ──────────────────────────────────────────────────────

/// Write one pixel value the way [`Pixel::load`] read it.
#[inline]
pub(crate) fn write_pixel<P: Pixel>(os: &mut OutStream, p: P) {
    let mut buf = [0u8; 4];
    p.store(&mut buf);
    os.write_bytes(&buf[..P::BYTES]);
}

/// Bits per palette index in a packed-palette tile.
pub(crate) fn packed_index_bits(palette_size: usize) -> usize {
    match palette_size {
        0..=1 => 0,
        2 => 1,
        3..=4 => 2,
        _ => 4,
    }
}

/// Whether every pixel of `pb` has the same value.
pub(crate) fn is_solid<P: Pixel>(pb: &PixelView<'_>) -> bool {
    if pb.area() == 0 {
        return true;
    }
    let first: P = pb.pixel(0, 0);
    (0..pb.height()).all(|y| (0..pb.width()).all(|x| pb.pixel::<P>(x, y) == first))
}

/// Create the encoder for a protocol encoding number.
pub fn create(encoding: i32) -> Result<Box<dyn Encoder>, RfbError> {
    use crate::message::encoding as enc;
    Ok(match encoding {
        enc::RAW => Box::new(RawEncoder::new()),
        enc::RRE => Box::new(RreEncoder::new()),
        enc::HEXTILE => Box::new(HextileEncoder::new()),
        enc::TIGHT => Box::new(TightEncoder::new()),
        enc::ZRLE => Box::new(ZrleEncoder::new()),
        other => return Err(RfbError::UnknownEncoding(other)),
    })
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::encoding;

    #[test]
    fn packed_bits_table() {
        let expect = [0, 1, 2, 2, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4];
        for (i, &b) in expect.iter().enumerate() {
            assert_eq!(packed_index_bits(i + 1), b, "size {}", i + 1);
        }
    }

    #[test]
    fn factory_covers_encodable_set() {
        for &e in &crate::params::ENCODABLE {
            assert_eq!(create(e).unwrap().encoding(), e);
        }
        assert!(matches!(create(encoding::COPY_RECT), Err(RfbError::UnknownEncoding(1))));
    }

    #[test]
    fn solid_detection() {
        let data = [1u8, 1, 1, 1, 2, 1];
        let pb = PixelView::new(PixelFormat::BGR233, &data, 2, 2, 3);
        assert!(is_solid::<u8>(&pb));
        let pb = PixelView::new(PixelFormat::BGR233, &data, 3, 2, 3);
        assert!(!is_solid::<u8>(&pb));
    }
}

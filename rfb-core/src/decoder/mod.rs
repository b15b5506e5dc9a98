//! Pixel decoders.
//!
//! Decoding happens in two phases so that the expensive part can run
//! on worker threads:
//!
//! 1. [`Decoder::read_rect`] runs on the network thread. It walks the
//!    wire format just far enough to find where the rect ends and
//!    copies exactly those bytes out of the [`InStream`].
//! 2. [`Decoder::decode_rect`] runs later, anywhere, on the copied
//!    bytes and writes pixels into a framebuffer.
//!
//! | Module     | Encoding | Flags               |
//! |------------|----------|---------------------|
//! | `raw`      | 0        |                     |
//! | `copyrect` | 1        | `READS_FRAMEBUFFER` |
//! | `rre`      | 2        |                     |
//! | `hextile`  | 5        |                     |
//! | `tight`    | 7        | `PARTIALLY_ORDERED` |
//! | `zrle`     | 16       | `ORDERED`           |
//! | `manager`  |          | worker pool         |

pub mod copyrect;
pub mod hextile;
pub mod manager;
pub mod raw;
pub mod rre;
pub mod tight;
pub mod zrle;

use bitflags::bitflags;

use crate::error::RfbError;
use crate::geometry::Rect;
use crate::message::encoding;
use crate::pixel::{ModifiablePixelBuffer, PixelFormat};
use crate::region::Region;
use crate::stream::{ByteSource, InStream, OutStream};

pub use copyrect::CopyRectDecoder;
pub use hextile::HextileDecoder;
pub use manager::{DecodeManager, DecoderStats, SharedFramebuffer};
pub use raw::RawDecoder;
pub use rre::RreDecoder;
pub use tight::TightDecoder;
pub use zrle::ZrleDecoder;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct DecoderFlags: u32 {
        /// Rects must be decoded in the order they arrived, e.g.
        /// because they share a compression stream.
        const ORDERED = 1 << 0;
        /// Some pairs of rects must keep their order; ask
        /// [`Decoder::rects_conflict`].
        const PARTIALLY_ORDERED = 1 << 1;
        /// Decoding reads the framebuffer, so it has to happen with
        /// the framebuffer locked.
        const READS_FRAMEBUFFER = 1 << 2;
    }
}

/// Encodings a decode manager accepts.
pub const DECODABLE: [i32; 6] = [
    encoding::RAW,
    encoding::COPY_RECT,
    encoding::RRE,
    encoding::HEXTILE,
    encoding::TIGHT,
    encoding::ZRLE,
];

// ── Decoder ──────────────────────────────────────────────────────

pub trait Decoder: Send + Sync {
    fn flags(&self) -> DecoderFlags {
        DecoderFlags::empty()
    }

    /// Copy the body of rect `r` from `is` to `os`.
    ///
    /// Returns `Ok(false)` with `is` rewound when the body has not
    /// fully arrived; `os` then holds garbage and must be cleared.
    fn read_rect(
        &self,
        r: &Rect,
        is: &mut InStream,
        pf: &PixelFormat,
        os: &mut OutStream,
    ) -> Result<bool, RfbError>;

    /// Pixels decoding `data` will touch.
    fn affected_region(&self, r: &Rect, _data: &[u8], _pf: &PixelFormat) -> Region {
        Region::from(*r)
    }

    /// Whether two rects of this encoding must be decoded in arrival
    /// order. Only asked for `PARTIALLY_ORDERED` decoders.
    fn rects_conflict(
        &self,
        _r1: &Rect,
        _data1: &[u8],
        _r2: &Rect,
        _data2: &[u8],
        _pf: &PixelFormat,
    ) -> bool {
        false
    }

    /// Decode bytes produced by [`read_rect`](Self::read_rect) into
    /// `pb`. `pf` is the format the pixels were sent in.
    fn decode_rect(
        &self,
        r: &Rect,
        data: &[u8],
        pf: &PixelFormat,
        pb: &mut dyn ModifiablePixelBuffer,
    ) -> Result<(), RfbError>;
}

/// Whether `enc` can be decoded.
pub fn supported(enc: i32) -> bool {
    DECODABLE.contains(&enc)
}

/// Create the decoder for a protocol encoding number.
pub fn create(enc: i32) -> Result<Box<dyn Decoder>, RfbError> {
    Ok(match enc {
        encoding::RAW => Box::new(RawDecoder),
        encoding::COPY_RECT => Box::new(CopyRectDecoder),
        encoding::RRE => Box::new(RreDecoder),
        encoding::HEXTILE => Box::new(HextileDecoder),
        encoding::TIGHT => Box::new(TightDecoder::new()),
        encoding::ZRLE => Box::new(ZrleDecoder::new()),
        other => return Err(RfbError::UnknownEncoding(other)),
    })
}

// ── Helpers ──────────────────────────────────────────────────────

/// Move `n` bytes from `is` to `os`, or rewind `is` if there are fewer.
pub(crate) fn copy_bytes(
    is: &mut InStream,
    n: usize,
    os: &mut OutStream,
) -> Result<bool, RfbError> {
    if !is.has_data_or_restore(n) {
        return Ok(false);
    }
    os.write_bytes(is.take(n)?);
    Ok(true)
}

/// Fill `r` with a pixel given as bytes in `pf`.
pub(crate) fn fill_pf(
    pb: &mut dyn ModifiablePixelBuffer,
    pf: &PixelFormat,
    r: &Rect,
    pixel: &[u8],
) -> Result<(), RfbError> {
    pb.fill_rect_pf(pf, r, pf.pixel_from_buffer(pixel))
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn factory_covers_decodable_set() {
        for &e in &DECODABLE {
            assert!(supported(e));
            assert!(create(e).is_ok());
        }
        assert!(!supported(encoding::LAST_RECT));
        assert!(matches!(create(3), Err(RfbError::UnknownEncoding(3))));
    }

    #[test]
    fn ordering_flags() {
        assert!(create(encoding::ZRLE).unwrap().flags().contains(DecoderFlags::ORDERED));
        assert!(
            create(encoding::TIGHT)
                .unwrap()
                .flags()
                .contains(DecoderFlags::PARTIALLY_ORDERED)
        );
        assert!(
            create(encoding::COPY_RECT)
                .unwrap()
                .flags()
                .contains(DecoderFlags::READS_FRAMEBUFFER)
        );
        assert!(create(encoding::RAW).unwrap().flags().is_empty());
    }

    #[test]
    fn copy_bytes_rewinds_when_short() {
        let mut is = InStream::from_slice(&[1, 2, 3]);
        let mut os = OutStream::new();
        is.set_restore_point();
        assert!(copy_bytes(&mut is, 2, &mut os).unwrap());
        assert!(!copy_bytes(&mut is, 2, &mut os).unwrap());
        assert_eq!(is.avail(), 3);
    }
}

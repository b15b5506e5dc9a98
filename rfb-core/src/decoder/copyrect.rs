//! CopyRect: `u16 srcX | u16 srcY`, the rect is copied from there.

use crate::error::RfbError;
use crate::geometry::{Point, Rect};
use crate::pixel::{ModifiablePixelBuffer, PixelFormat};
use crate::region::Region;
use crate::stream::{ByteCursor, ByteSource, InStream, OutStream};

use super::{Decoder, DecoderFlags, copy_bytes};

#[derive(Debug, Default)]
pub struct CopyRectDecoder;

fn source(data: &[u8]) -> Result<Point, RfbError> {
    let mut c = ByteCursor::new(data);
    let x = c.read_u16()? as i32;
    let y = c.read_u16()? as i32;
    Ok(Point::new(x, y))
}

impl Decoder for CopyRectDecoder {
    fn flags(&self) -> DecoderFlags {
        DecoderFlags::READS_FRAMEBUFFER
    }

    fn read_rect(
        &self,
        _r: &Rect,
        is: &mut InStream,
        _pf: &PixelFormat,
        os: &mut OutStream,
    ) -> Result<bool, RfbError> {
        is.set_restore_point();
        if !copy_bytes(is, 4, os)? {
            return Ok(false);
        }
        is.clear_restore_point();
        Ok(true)
    }

    fn affected_region(&self, r: &Rect, data: &[u8], _pf: &PixelFormat) -> Region {
        let mut region = Region::from(*r);
        if let Ok(src) = source(data) {
            region.assign_union(&Region::from(r.translate(src.subtract(r.tl))));
        }
        region
    }

    fn decode_rect(
        &self,
        r: &Rect,
        data: &[u8],
        _pf: &PixelFormat,
        pb: &mut dyn ModifiablePixelBuffer,
    ) -> Result<(), RfbError> {
        let src = source(data)?;
        pb.copy_rect(r, r.tl.subtract(src))
    }
}

// ── Tests ────────────────────────────────────────────────────────

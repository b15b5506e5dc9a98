use crate::error::RfbError;
use crate::geometry::Rect;
use crate::pixel::{ModifiablePixelBuffer, PixelFormat};
use crate::stream::{ByteCursor, ByteSource, InStream, OutStream};

use super::{Decoder, copy_bytes, fill_pf};

#[derive(Debug, Default)]
pub struct RreDecoder;

impl Decoder for RreDecoder {
    fn read_rect(
        &self,
        _r: &Rect,
        is: &mut InStream,
        pf: &PixelFormat,
        os: &mut OutStream,
    ) -> Result<bool, RfbError> {
        let bpp = pf.bytes_per_pixel();
        is.set_restore_point();
        if !is.has_data_or_restore(4) {
            return Ok(false);
        }
        let n = is.read_u32()? as usize;
        os.write_u32(n as u32);
        if !copy_bytes(is, bpp + n * (bpp + 8), os)? {
            return Ok(false);
        }
        is.clear_restore_point();
        Ok(true)
    }

    fn decode_rect(
        &self,
        r: &Rect,
        data: &[u8],
        pf: &PixelFormat,
        pb: &mut dyn ModifiablePixelBuffer,
    ) -> Result<(), RfbError> {
        let bpp = pf.bytes_per_pixel();
        let mut c = ByteCursor::new(data);
        let n = c.read_u32()?;
        fill_pf(pb, pf, r, c.take(bpp)?)?;

        let mut px = [0u8; 4];
        for _ in 0..n {
            px[..bpp].copy_from_slice(c.take(bpp)?);
            let x = c.read_u16()? as i32;
            let y = c.read_u16()? as i32;
            let w = c.read_u16()? as i32;
            let h = c.read_u16()? as i32;
            if x + w > r.width() || y + h > r.height() {
                return Err(RfbError::ProtocolViolation("RRE subrect outside rect"));
            }
            let sub = Rect::from_xywh(r.tl.x + x, r.tl.y + y, w, h);
            fill_pf(pb, pf, &sub, &px[..bpp])?;
        }
        Ok(())
    }
}

// ── Tests ────────────────────────────────────────────────────────

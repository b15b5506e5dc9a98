use crate::error::RfbError;
use crate::geometry::Rect;
use crate::pixel::{ModifiablePixelBuffer, PixelFormat};
use crate::stream::{InStream, OutStream};

use super::{Decoder, copy_bytes};

#[derive(Debug, Default)]
pub struct RawDecoder;

impl Decoder for RawDecoder {
    fn read_rect(
        &self,
        r: &Rect,
        is: &mut InStream,
        pf: &PixelFormat,
        os: &mut OutStream,
    ) -> Result<bool, RfbError> {
        let len = r.area() as usize * pf.bytes_per_pixel();
        is.set_restore_point();
        if !copy_bytes(is, len, os)? {
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
        let len = r.area() as usize * pf.bytes_per_pixel();
        if data.len() < len {
            return Err(RfbError::Truncated {
                needed: len,
                available: data.len(),
            });
        }
        pb.image_rect_pf(pf, r, data, 0)
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pixel::{ManagedPixelBuffer, PixelBuffer};

    #[test]
    fn reads_exactly_the_rect() {
        let r = Rect::new(0, 0, 2, 2);
        let mut is = InStream::from_slice(&[1, 2, 3]);
        let mut os = OutStream::new();
        assert!(!RawDecoder.read_rect(&r, &mut is, &PixelFormat::BGR233, &mut os).unwrap());
        is.feed(&[4, 99]);
        os.clear();
        assert!(RawDecoder.read_rect(&r, &mut is, &PixelFormat::BGR233, &mut os).unwrap());
        assert_eq!(os.as_slice(), &[1, 2, 3, 4]);
        assert_eq!(is.avail(), 1);
    }

    #[test]
    fn decodes_into_place() {
        let mut fb = ManagedPixelBuffer::new(PixelFormat::BGR233, 4, 4);
        RawDecoder
            .decode_rect(&Rect::new(1, 1, 3, 2), &[7, 8], &PixelFormat::BGR233, &mut fb)
            .unwrap();
        let mut out = [0u8; 4];
        fb.get_image(&mut out, &Rect::new(0, 1, 4, 2), 0).unwrap();
        assert_eq!(out, [0, 7, 8, 0]);
    }
}

//! Raw encoding: the pixels, row by row.

use crate::error::RfbError;
use crate::message::encoding;
use crate::palette::Palette;
use crate::params::ClientParams;
use crate::pixel::{PixelFormat, PixelView};
use crate::stream::OutStream;

use super::Encoder;

#[derive(Debug, Default)]
pub struct RawEncoder;

impl RawEncoder {
    pub fn new() -> Self {
        Self
    }
}

impl Encoder for RawEncoder {
    fn encoding(&self) -> i32 {
        encoding::RAW
    }

    fn is_supported(&self, _cp: &ClientParams) -> bool {
        // every client has to accept raw
        true
    }

    fn write_rect(
        &mut self,
        pb: &PixelView<'_>,
        _palette: &Palette,
        os: &mut OutStream,
    ) -> Result<(), RfbError> {
        for y in 0..pb.height() {
            os.write_bytes(pb.row(y));
        }
        Ok(())
    }

    fn write_solid_rect(
        &mut self,
        width: usize,
        height: usize,
        pf: &PixelFormat,
        colour: &[u8],
        os: &mut OutStream,
    ) -> Result<(), RfbError> {
        let pixel = &colour[..pf.bytes_per_pixel()];
        for _ in 0..width * height {
            os.write_bytes(pixel);
        }
        Ok(())
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rows_skip_stride_padding() {
        let data = [1u8, 2, 9, 3, 4, 9];
        let pb = PixelView::new(PixelFormat::BGR233, &data, 2, 2, 3);
        let mut os = OutStream::new();
        RawEncoder::new()
            .write_rect(&pb, &Palette::new(), &mut os)
            .unwrap();
        assert_eq!(os.as_slice(), &[1, 2, 3, 4]);
    }

    #[test]
    fn solid_repeats_pixel() {
        let mut os = OutStream::new();
        RawEncoder::new()
            .write_solid_rect(3, 1, &PixelFormat::RGB565, &[0xAB, 0xCD], &mut os)
            .unwrap();
        assert_eq!(os.as_slice(), &[0xAB, 0xCD, 0xAB, 0xCD, 0xAB, 0xCD]);
    }
}

//! RRE encoding.
//!
//! ```text
//! u32 nSubrects | bg pixel | nSubrects × (pixel | u16 x | u16 y | u16 w | u16 h)
//! ```
//!
//! Subrects are found greedily on a scratch copy: from each pixel that
//! still differs from the background, both the horizontal-first and
//! the vertical-first rectangle of that colour are measured and the
//! larger one is taken and painted over with the background.

use crate::dispatch_bpp;
use crate::error::RfbError;
use crate::message::encoding;
use crate::palette::Palette;
use crate::pixel::{Pixel, PixelFormat, PixelView};
use crate::stream::OutStream;

use super::{Encoder, write_pixel};

#[derive(Debug, Default)]
pub struct RreEncoder {
    subrects: OutStream,
}

impl RreEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    fn encode<P: Pixel>(&mut self, pb: &PixelView<'_>, palette: &Palette, os: &mut OutStream) {
        let w = pb.width();
        let h = pb.height();
        let mut data: Vec<P> = Vec::with_capacity(w * h);
        for y in 0..h {
            for x in 0..w {
                data.push(pb.pixel(x, y));
            }
        }

        let bg = if palette.is_empty() {
            data.first().copied().unwrap_or_default()
        } else {
            P::from_u32(palette.colour(0))
        };

        self.subrects.clear();
        let n = find_subrects(&mut data, w, h, bg, &mut self.subrects);

        os.write_u32(n);
        write_pixel(os, bg);
        os.write_bytes(self.subrects.as_slice());
    }
}

/// Emit subrects for every non-`bg` pixel of `data`, clearing them.
fn find_subrects<P: Pixel>(data: &mut [P], w: usize, h: usize, bg: P, out: &mut OutStream) -> u32 {
    let mut n = 0;
    for y in 0..h {
        for x in 0..w {
            let c = data[y * w + x];
            if c == bg {
                continue;
            }

            let row_run = |data: &[P], y: usize, from: usize, limit: usize| {
                (from..limit).take_while(|&i| data[y * w + i] == c).count()
            };

            // horizontal first
            let hw = row_run(data, y, x, w);
            let hh = (y..h).take_while(|&j| row_run(data, j, x, x + hw) == hw).count();

            // vertical first
            let vh = (y..h).take_while(|&j| data[j * w + x] == c).count();
            let vw = (x..w)
                .take_while(|&i| (y..y + vh).all(|j| data[j * w + i] == c))
                .count();

            let (sw, sh) = if vw * vh > hw * hh { (vw, vh) } else { (hw, hh) };

            write_pixel(out, c);
            out.write_u16(x as u16);
            out.write_u16(y as u16);
            out.write_u16(sw as u16);
            out.write_u16(sh as u16);
            n += 1;

            for j in y..y + sh {
                data[j * w + x..j * w + x + sw].fill(bg);
            }
        }
    }
    n
}

impl Encoder for RreEncoder {
    fn encoding(&self) -> i32 {
        encoding::RRE
    }

    fn write_rect(
        &mut self,
        pb: &PixelView<'_>,
        palette: &Palette,
        os: &mut OutStream,
    ) -> Result<(), RfbError> {
        dispatch_bpp!(pb.pf().bpp(), P => self.encode::<P>(pb, palette, os));
        Ok(())
    }

    fn write_solid_rect(
        &mut self,
        _width: usize,
        _height: usize,
        pf: &PixelFormat,
        colour: &[u8],
        os: &mut OutStream,
    ) -> Result<(), RfbError> {
        os.write_u32(0);
        os.write_bytes(&colour[..pf.bytes_per_pixel()]);
        Ok(())
    }
}

// ── Tests ────────────────────────────────────────────────────────

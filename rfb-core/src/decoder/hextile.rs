//! Hextile: 16×16 tiles, each raw or a background with coloured subrects.

use crate::dispatch_bpp;
use crate::encoder::hextile::{TILE_SIZE, TileFlags};
use crate::error::RfbError;
use crate::geometry::Rect;
use crate::pixel::{ModifiablePixelBuffer, Pixel, PixelFormat};
use crate::stream::{ByteCursor, ByteSource, InStream, OutStream};

use super::{Decoder, copy_bytes};

#[derive(Debug, Default)]
pub struct HextileDecoder;

/// Tiles of `r`, left to right, top to bottom.
fn tiles(r: &Rect) -> impl Iterator<Item = Rect> + '_ {
    let ts = TILE_SIZE as i32;
    (r.tl.y..r.br.y).step_by(TILE_SIZE).flat_map(move |y| {
        (r.tl.x..r.br.x)
            .step_by(TILE_SIZE)
            .map(move |x| Rect::new(x, y, (x + ts).min(r.br.x), (y + ts).min(r.br.y)))
    })
}

fn decode<P: Pixel>(
    r: &Rect,
    data: &[u8],
    pf: &PixelFormat,
    pb: &mut dyn ModifiablePixelBuffer,
) -> Result<(), RfbError> {
    let mut c = ByteCursor::new(data);
    let mut buf = vec![0u8; TILE_SIZE * TILE_SIZE * P::BYTES];
    let mut bg = P::default();
    let mut fg = P::default();

    for t in tiles(r) {
        let tw = t.width() as usize;
        let th = t.height() as usize;
        let tile = &mut buf[..tw * th * P::BYTES];

        let flags = TileFlags::from_bits_truncate(c.read_u8()?);
        if flags.contains(TileFlags::RAW) {
            tile.copy_from_slice(c.take(tile.len())?);
            pb.image_rect_pf(pf, &t, tile, 0)?;
            continue;
        }

        if flags.contains(TileFlags::BG_SPECIFIED) {
            bg = P::load(c.take(P::BYTES)?);
        }
        for px in tile.chunks_exact_mut(P::BYTES) {
            bg.store(px);
        }
        if flags.contains(TileFlags::FG_SPECIFIED) {
            fg = P::load(c.take(P::BYTES)?);
        }

        if flags.contains(TileFlags::ANY_SUBRECTS) {
            let n = c.read_u8()?;
            for _ in 0..n {
                let colour = if flags.contains(TileFlags::SUBRECTS_COLOURED) {
                    P::load(c.take(P::BYTES)?)
                } else {
                    fg
                };
                let xy = c.read_u8()? as usize;
                let wh = c.read_u8()? as usize;
                let x = xy >> 4;
                let y = xy & 15;
                let w = (wh >> 4) + 1;
                let h = (wh & 15) + 1;
                if x + w > tw || y + h > th {
                    return Err(RfbError::ProtocolViolation("hextile subrect outside tile"));
                }
                for row in y..y + h {
                    for px in tile[(row * tw + x) * P::BYTES..(row * tw + x + w) * P::BYTES]
                        .chunks_exact_mut(P::BYTES)
                    {
                        colour.store(px);
                    }
                }
            }
        }

        pb.image_rect_pf(pf, &t, tile, 0)?;
    }
    Ok(())
}

impl Decoder for HextileDecoder {
    fn read_rect(
        &self,
        r: &Rect,
        is: &mut InStream,
        pf: &PixelFormat,
        os: &mut OutStream,
    ) -> Result<bool, RfbError> {
        let bpp = pf.bytes_per_pixel();
        is.set_restore_point();
        for t in tiles(r) {
            if !is.has_data_or_restore(1) {
                return Ok(false);
            }
            let flags = is.read_u8()?;
            os.write_u8(flags);
            let flags = TileFlags::from_bits_truncate(flags);

            if flags.contains(TileFlags::RAW) {
                if !copy_bytes(is, t.area() as usize * bpp, os)? {
                    return Ok(false);
                }
                continue;
            }

            let mut len = 0;
            if flags.contains(TileFlags::BG_SPECIFIED) {
                len += bpp;
            }
            if flags.contains(TileFlags::FG_SPECIFIED) {
                len += bpp;
            }
            if !copy_bytes(is, len, os)? {
                return Ok(false);
            }

            if flags.contains(TileFlags::ANY_SUBRECTS) {
                if !is.has_data_or_restore(1) {
                    return Ok(false);
                }
                let n = is.read_u8()? as usize;
                os.write_u8(n as u8);
                let each = if flags.contains(TileFlags::SUBRECTS_COLOURED) {
                    bpp + 2
                } else {
                    2
                };
                if !copy_bytes(is, n * each, os)? {
                    return Ok(false);
                }
            }
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
        dispatch_bpp!(pf.bpp(), P => decode::<P>(r, data, pf, pb))
    }
}

// ── Tests ────────────────────────────────────────────────────────

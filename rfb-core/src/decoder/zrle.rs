use std::ops::Range;
use std::sync::{Mutex, PoisonError};

use crate::dispatch_bpp;
use crate::encoder::zrle::{TILE_SIZE, cpixel_range};
use crate::error::RfbError;
use crate::geometry::Rect;
use crate::pixel::{ModifiablePixelBuffer, Pixel, PixelFormat};
use crate::rle::read_run;
use crate::stream::{ByteCursor, ByteSource, InStream, OutStream, ZlibInflater};

use super::{Decoder, DecoderFlags, copy_bytes};

/// All rects share one inflate stream, hence `ORDERED`.
#[derive(Debug, Default)]
pub struct ZrleDecoder {
    zis: Mutex<ZlibInflater>,
}

impl ZrleDecoder {
    pub fn new() -> Self {
        Self::default()
    }
}

fn read_cpixel<P: Pixel>(c: &mut ByteCursor<'_>, range: &Range<usize>) -> Result<P, RfbError> {
    let mut buf = [0u8; 4];
    buf[range.clone()].copy_from_slice(c.take(range.len())?);
    Ok(P::load(&buf))
}

fn decode_tiles<P: Pixel>(
    r: &Rect,
    data: &[u8],
    pf: &PixelFormat,
    pb: &mut dyn ModifiablePixelBuffer,
) -> Result<(), RfbError> {
    let range = cpixel_range(pf);
    let mut c = ByteCursor::new(data);
    let mut tile = vec![P::default(); TILE_SIZE * TILE_SIZE];
    let mut bytes = vec![0u8; TILE_SIZE * TILE_SIZE * P::BYTES];
    let mut palette = [P::default(); 128];

    let ts = TILE_SIZE as i32;
    for ty in (r.tl.y..r.br.y).step_by(TILE_SIZE) {
        for tx in (r.tl.x..r.br.x).step_by(TILE_SIZE) {
            let t = Rect::new(tx, ty, (tx + ts).min(r.br.x), (ty + ts).min(r.br.y));
            let tw = t.width() as usize;
            let th = t.height() as usize;
            let area = tw * th;

            let mode = c.read_u8()?;
            let rle = mode & 0x80 != 0;
            let pal_size = (mode & 0x7F) as usize;
            for p in palette.iter_mut().take(pal_size) {
                *p = read_cpixel(&mut c, &range)?;
            }

            if pal_size == 1 {
                let mut px = [0u8; 4];
                palette[0].store(&mut px);
                pb.fill_rect_pf(pf, &t, pf.pixel_from_buffer(&px))?;
                continue;
            }

            let tile = &mut tile[..area];
            match (rle, pal_size) {
                (false, 0) => {
                    for p in tile.iter_mut() {
                        *p = read_cpixel(&mut c, &range)?;
                    }
                }
                (false, _) => {
                    let bits = match pal_size {
                        17.. => 8,
                        5..=16 => 4,
                        3..=4 => 2,
                        _ => 1,
                    };
                    let mask = ((1u16 << bits) - 1) as u8;
                    for row in tile.chunks_exact_mut(tw) {
                        let mut byte = 0u8;
                        let mut nbits = 0;
                        for p in row.iter_mut() {
                            if nbits == 0 {
                                byte = c.read_u8()?;
                                nbits = 8;
                            }
                            nbits -= bits;
                            let idx = ((byte >> nbits) & mask) as usize;
                            if idx >= pal_size {
                                return Err(RfbError::ProtocolViolation(
                                    "ZRLE palette index out of range",
                                ));
                            }
                            *p = palette[idx];
                        }
                    }
                }
                (true, 0) => {
                    let mut i = 0;
                    while i < area {
                        let pix: P = read_cpixel(&mut c, &range)?;
                        let len = 1 + read_run(&mut c)?;
                        if len > area - i {
                            return Err(RfbError::ProtocolViolation("ZRLE run past end of tile"));
                        }
                        tile[i..i + len].fill(pix);
                        i += len;
                    }
                }
                (true, _) => {
                    let mut i = 0;
                    while i < area {
                        let b = c.read_u8()?;
                        let idx = (b & 0x7F) as usize;
                        let len = if b & 0x80 != 0 { 1 + read_run(&mut c)? } else { 1 };
                        if idx >= pal_size {
                            return Err(RfbError::ProtocolViolation(
                                "ZRLE palette index out of range",
                            ));
                        }
                        if len > area - i {
                            return Err(RfbError::ProtocolViolation("ZRLE run past end of tile"));
                        }
                        tile[i..i + len].fill(palette[idx]);
                        i += len;
                    }
                }
            }

            let out = &mut bytes[..area * P::BYTES];
            for (p, dst) in tile.iter().zip(out.chunks_exact_mut(P::BYTES)) {
                p.store(dst);
            }
            pb.image_rect_pf(pf, &t, out, 0)?;
        }
    }
    Ok(())
}

impl Decoder for ZrleDecoder {
    fn flags(&self) -> DecoderFlags {
        DecoderFlags::ORDERED
    }

    fn read_rect(
        &self,
        _r: &Rect,
        is: &mut InStream,
        _pf: &PixelFormat,
        os: &mut OutStream,
    ) -> Result<bool, RfbError> {
        is.set_restore_point();
        if !is.has_data_or_restore(4) {
            return Ok(false);
        }
        let len = is.read_u32()? as usize;
        os.write_u32(len as u32);
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
        let mut c = ByteCursor::new(data);
        let len = c.read_u32()? as usize;
        let compressed = c.take(len)?;

        let mut raw = Vec::new();
        self.zis
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .decompress(compressed, &mut raw)?;

        dispatch_bpp!(pf.bpp(), P => decode_tiles::<P>(r, &raw, pf, pb))
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pixel::{ManagedPixelBuffer, PixelBuffer};
    use crate::stream::ZlibDeflater;

    fn body(tiles: &[u8], deflater: &mut ZlibDeflater) -> Vec<u8> {
        let mut z = Vec::new();
        deflater.compress(tiles, &mut z).unwrap();
        let mut out = (z.len() as u32).to_be_bytes().to_vec();
        out.extend(z);
        out
    }

    fn decode8(dec: &ZrleDecoder, r: Rect, data: &[u8]) -> Result<Vec<u8>, RfbError> {
        let mut fb = ManagedPixelBuffer::new(PixelFormat::BGR233, r.br.x, r.br.y);
        dec.decode_rect(&r, data, &PixelFormat::BGR233, &mut fb)?;
        let mut out = vec![0u8; r.area() as usize];
        fb.get_image(&mut out, &r, 0)?;
        Ok(out)
    }

    #[test]
    fn stream_persists_across_rects() {
        let dec = ZrleDecoder::new();
        let mut z = ZlibDeflater::new(-1);
        let r = Rect::new(0, 0, 2, 1);
        assert_eq!(decode8(&dec, r, &body(&[1, 5], &mut z)).unwrap(), vec![5, 5]);
        assert_eq!(decode8(&dec, r, &body(&[0, 3, 4], &mut z)).unwrap(), vec![3, 4]);
    }

    #[test]
    fn packed_and_plain_rle_tiles() {
        let dec = ZrleDecoder::new();
        let mut z = ZlibDeflater::new(-1);
        let r = Rect::new(0, 0, 3, 1);
        // packed, 3 colours → 2 bits: indices 2 0 1
        let out = decode8(&dec, r, &body(&[3, 7, 8, 9, 0b1000_0100], &mut z)).unwrap();
        assert_eq!(out, vec![9, 7, 8]);
        // plain RLE: 5×2 then 6×1
        let out = decode8(&dec, r, &body(&[128, 5, 1, 6, 0], &mut z)).unwrap();
        assert_eq!(out, vec![5, 5, 6]);
    }

    #[test]
    fn run_past_tile_is_rejected() {
        let dec = ZrleDecoder::new();
        let mut z = ZlibDeflater::new(-1);
        let err = decode8(&dec, Rect::new(0, 0, 2, 1), &body(&[130, 1, 2, 0x80, 5], &mut z))
            .unwrap_err();
        assert!(matches!(err, RfbError::ProtocolViolation(_)));
    }

    #[test]
    fn bad_palette_index_is_rejected() {
        let dec = ZrleDecoder::new();
        let mut z = ZlibDeflater::new(-1);
        let err = decode8(&dec, Rect::new(0, 0, 2, 1), &body(&[130, 1, 2, 0x05, 0x00], &mut z))
            .unwrap_err();
        assert!(matches!(err, RfbError::ProtocolViolation(_)));
    }
}

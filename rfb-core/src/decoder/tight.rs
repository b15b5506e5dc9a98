//! Tight decoding.
//!
//! Besides what the encoder produces this accepts the copy and
//! gradient filters. JPEG rects are refused.

use std::borrow::Cow;
use std::sync::{Mutex, PoisonError};

use crate::encoder::tight::{
    EXPLICIT_FILTER, FILL, FILTER_COPY, FILTER_GRADIENT, FILTER_PALETTE, JPEG, MAX_SUBENCODING,
    MIN_TO_COMPRESS, tpixel_len,
};
use crate::error::RfbError;
use crate::geometry::Rect;
use crate::pixel::{ModifiablePixelBuffer, PixelFormat};
use crate::stream::{ByteCursor, ByteSource, InStream, OutStream, ZlibInflater};

use super::{Decoder, DecoderFlags, copy_bytes, fill_pf};

/// Four inflate streams; rects on different streams may be decoded
/// in any order.
#[derive(Debug)]
pub struct TightDecoder {
    zis: [Mutex<ZlibInflater>; 4],
}

impl Default for TightDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl TightDecoder {
    pub fn new() -> Self {
        Self {
            zis: std::array::from_fn(|_| Mutex::new(ZlibInflater::new())),
        }
    }
}

/// What follows the control byte of a basic rect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Filter {
    Copy,
    Palette(usize),
    Gradient,
}

/// Reject control bytes we cannot decode.
fn check_subencoding(comp: u8) -> Result<(), RfbError> {
    if comp == JPEG {
        return Err(RfbError::ProtocolViolation("tight JPEG rects are not supported"));
    }
    if comp > MAX_SUBENCODING {
        return Err(RfbError::ProtocolViolation("unknown tight subencoding"));
    }
    Ok(())
}

/// Filters other than the palette, which carries its own data.
fn plain_filter(id: u8) -> Result<Filter, RfbError> {
    match id {
        FILTER_COPY => Ok(Filter::Copy),
        FILTER_GRADIENT => Ok(Filter::Gradient),
        _ => Err(RfbError::ProtocolViolation("unknown tight filter")),
    }
}

/// Bytes of pixel data for a `w`×`h` rect.
fn data_size(r: &Rect, filter: Filter, pf: &PixelFormat) -> usize {
    let bits = match filter {
        Filter::Palette(n) if n <= 2 => 1,
        Filter::Palette(_) => 8,
        _ if pf.is_888() => 24,
        _ => pf.bpp() as usize,
    };
    r.height().max(0) as usize * (r.width().max(0) as usize * bits).div_ceil(8)
}

/// A TPIXEL as pixel bytes in `pf`.
fn tpixel_to_pixel(pf: &PixelFormat, tpixel: &[u8]) -> [u8; 4] {
    let mut px = [0u8; 4];
    if pf.is_888() {
        pf.buffer_from_rgb(&mut px, tpixel, 1);
    } else {
        px[..tpixel.len()].copy_from_slice(tpixel);
    }
    px
}

/// Incremental compact length, `None` with `is` rewound if short.
fn read_compact_length(is: &mut InStream) -> Result<Option<usize>, RfbError> {
    let mut len = 0usize;
    for i in 0..3 {
        if !is.has_data_or_restore(1) {
            return Ok(None);
        }
        let b = is.read_u8()? as usize;
        if i == 2 {
            return Ok(Some(len | (b << 14)));
        }
        len |= (b & 0x7F) << (7 * i);
        if b & 0x80 == 0 {
            break;
        }
    }
    Ok(Some(len))
}

/// Undo the gradient filter. `data` holds RGB triplets for 888
/// formats and pixels in `pf` otherwise; prediction runs on 8-bit
/// RGB either way.
fn ungradient(pf: &PixelFormat, data: &[u8], w: usize, h: usize, out: &mut [u8]) {
    let bpp = pf.bytes_per_pixel();
    let mut prev = vec![[0u8; 3]; w];
    let mut this = vec![[0u8; 3]; w];

    for y in 0..h {
        for x in 0..w {
            let i = y * w + x;
            let mut d = [0u8; 3];
            if pf.is_888() {
                d.copy_from_slice(&data[i * 3..i * 3 + 3]);
            } else {
                pf.rgb_from_buffer(&mut d, &data[i * bpp..(i + 1) * bpp], 1);
            }

            let (left, up_left) = if x > 0 {
                (this[x - 1], prev[x - 1])
            } else {
                ([0; 3], [0; 3])
            };
            for c in 0..3 {
                let est = (prev[x][c] as i32 + left[c] as i32 - up_left[c] as i32).clamp(0, 255);
                this[x][c] = d[c].wrapping_add(est as u8);
            }
            pf.buffer_from_rgb(&mut out[i * bpp..(i + 1) * bpp], &this[x], 1);
        }
        std::mem::swap(&mut prev, &mut this);
    }
}

impl Decoder for TightDecoder {
    fn flags(&self) -> DecoderFlags {
        DecoderFlags::PARTIALLY_ORDERED
    }

    fn read_rect(
        &self,
        r: &Rect,
        is: &mut InStream,
        pf: &PixelFormat,
        os: &mut OutStream,
    ) -> Result<bool, RfbError> {
        let tpixel = tpixel_len(pf);

        is.set_restore_point();
        if !is.has_data_or_restore(1) {
            return Ok(false);
        }
        let ctl = is.read_u8()?;
        os.write_u8(ctl);
        let comp = ctl >> 4;

        if comp == FILL {
            if !copy_bytes(is, tpixel, os)? {
                return Ok(false);
            }
            is.clear_restore_point();
            return Ok(true);
        }
        check_subencoding(comp)?;

        let mut filter = Filter::Copy;
        if comp & EXPLICIT_FILTER != 0 {
            if !is.has_data_or_restore(1) {
                return Ok(false);
            }
            let id = is.read_u8()?;
            os.write_u8(id);
            if id == FILTER_PALETTE {
                if !is.has_data_or_restore(1) {
                    return Ok(false);
                }
                let n = is.read_u8()?;
                os.write_u8(n);
                let n = n as usize + 1;
                if !copy_bytes(is, n * tpixel, os)? {
                    return Ok(false);
                }
                filter = Filter::Palette(n);
            } else {
                filter = plain_filter(id)?;
            }
        }

        let size = data_size(r, filter, pf);
        if size < MIN_TO_COMPRESS {
            if !copy_bytes(is, size, os)? {
                return Ok(false);
            }
        } else {
            let Some(len) = read_compact_length(is)? else {
                return Ok(false);
            };
            os.write_compact_length(len);
            if !copy_bytes(is, len, os)? {
                return Ok(false);
            }
        }

        is.clear_restore_point();
        Ok(true)
    }

    fn rects_conflict(
        &self,
        _r1: &Rect,
        data1: &[u8],
        _r2: &Rect,
        data2: &[u8],
        _pf: &PixelFormat,
    ) -> bool {
        let (Some(&ctl1), Some(&ctl2)) = (data1.first(), data2.first()) else {
            return true;
        };
        // a stream reset has to wait for everything before it
        if ctl1 & 0x0F != 0 || ctl2 & 0x0F != 0 {
            return true;
        }
        let (comp1, comp2) = (ctl1 >> 4, ctl2 >> 4);
        if comp1 == FILL || comp2 == FILL || comp1 == JPEG || comp2 == JPEG {
            return false;
        }
        comp1 & 0x03 == comp2 & 0x03
    }

    fn decode_rect(
        &self,
        r: &Rect,
        data: &[u8],
        pf: &PixelFormat,
        pb: &mut dyn ModifiablePixelBuffer,
    ) -> Result<(), RfbError> {
        let tpixel = tpixel_len(pf);
        let bpp = pf.bytes_per_pixel();
        let mut c = ByteCursor::new(data);

        let ctl = c.read_u8()?;
        for (i, zis) in self.zis.iter().enumerate() {
            if ctl & (1 << i) != 0 {
                zis.lock().unwrap_or_else(PoisonError::into_inner).reset();
            }
        }

        let comp = ctl >> 4;
        if comp == FILL {
            let px = tpixel_to_pixel(pf, c.take(tpixel)?);
            return fill_pf(pb, pf, r, &px);
        }
        check_subencoding(comp)?;

        let mut filter = Filter::Copy;
        let mut palette: Vec<[u8; 4]> = Vec::new();
        if comp & EXPLICIT_FILTER != 0 {
            let id = c.read_u8()?;
            if id == FILTER_PALETTE {
                let n = c.read_u8()? as usize + 1;
                for _ in 0..n {
                    palette.push(tpixel_to_pixel(pf, c.take(tpixel)?));
                }
                filter = Filter::Palette(n);
            } else {
                filter = plain_filter(id)?;
            }
        }

        let size = data_size(r, filter, pf);
        let input: Cow<'_, [u8]> = if size < MIN_TO_COMPRESS {
            Cow::Borrowed(c.take(size)?)
        } else {
            let len = c.read_compact_length()?;
            let compressed = c.take(len)?;
            let mut out = Vec::with_capacity(size);
            self.zis[(comp & 0x03) as usize]
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .decompress(compressed, &mut out)?;
            if out.len() < size {
                return Err(RfbError::ProtocolViolation("tight data shorter than rect"));
            }
            Cow::Owned(out)
        };

        let w = r.width() as usize;
        let h = r.height() as usize;
        let mut pixels = vec![0u8; w * h * bpp];

        match filter {
            Filter::Copy if pf.is_888() => pf.buffer_from_rgb(&mut pixels, &input, w * h),
            Filter::Copy => pixels.copy_from_slice(&input[..w * h * bpp]),
            Filter::Gradient => ungradient(pf, &input, w, h, &mut pixels),
            Filter::Palette(n) if n <= 2 => {
                let row_bytes = w.div_ceil(8);
                for y in 0..h {
                    for x in 0..w {
                        let bit = (input[y * row_bytes + x / 8] >> (7 - x % 8)) & 1;
                        let entry = palette.get(bit as usize).ok_or(
                            RfbError::ProtocolViolation("tight palette index out of range"),
                        )?;
                        let i = (y * w + x) * bpp;
                        pixels[i..i + bpp].copy_from_slice(&entry[..bpp]);
                    }
                }
            }
            Filter::Palette(_) => {
                for (i, &idx) in input[..w * h].iter().enumerate() {
                    let entry = palette.get(idx as usize).ok_or(
                        RfbError::ProtocolViolation("tight palette index out of range"),
                    )?;
                    pixels[i * bpp..(i + 1) * bpp].copy_from_slice(&entry[..bpp]);
                }
            }
        }

        pb.image_rect_pf(pf, r, &pixels, 0)
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pixel::{ManagedPixelBuffer, PixelBuffer};

    fn decode(pf: PixelFormat, r: Rect, data: &[u8]) -> Result<ManagedPixelBuffer, RfbError> {
        let mut fb = ManagedPixelBuffer::new(pf, r.br.x, r.br.y);
        TightDecoder::new().decode_rect(&r, data, &pf, &mut fb)?;
        Ok(fb)
    }

    fn image(fb: &ManagedPixelBuffer, r: Rect) -> Vec<u8> {
        let mut out = vec![0u8; r.area() as usize * fb.pf().bytes_per_pixel()];
        fb.get_image(&mut out, &r, 0).unwrap();
        out
    }

    #[test]
    fn fill_with_rgb_tpixel() {
        let pf = PixelFormat::RGB888;
        let r = Rect::new(0, 0, 2, 2);
        let fb = decode(pf, r, &[0x80, 10, 20, 30]).unwrap();
        let mut px = [0u8; 4];
        pf.buffer_from_pixel(&mut px, pf.pixel_from_rgb(10, 20, 30));
        assert_eq!(image(&fb, r), px.repeat(4));
    }

    #[test]
    fn uncompressed_mono_palette() {
        let r = Rect::new(0, 0, 3, 2);
        // explicit filter on stream 1, palette [4, 6], rows 101 / 010
        let body = [0x50, 1, 1, 4, 6, 0b1010_0000, 0b0100_0000];
        let fb = decode(PixelFormat::BGR233, r, &body).unwrap();
        assert_eq!(image(&fb, r), vec![6, 4, 6, 4, 6, 4]);
    }

    #[test]
    fn gradient_filter_predicts_from_neighbours() {
        let pf = PixelFormat::RGB888;
        let r = Rect::new(0, 0, 2, 2);
        // residuals: every pixel is (10, 0, 0) more than its prediction
        #[rustfmt::skip]
        let residuals = [
            10, 0, 0,  0, 0, 0,
            0, 0, 0,   0, 0, 0,
        ];
        let mut z = crate::stream::ZlibDeflater::new(-1);
        let mut compressed = Vec::new();
        z.compress(&residuals, &mut compressed).unwrap();
        let mut body = vec![0x40, FILTER_GRADIENT];
        let mut os = OutStream::new();
        os.write_compact_length(compressed.len());
        body.extend_from_slice(os.as_slice());
        body.extend(compressed);

        let fb = decode(pf, r, &body).unwrap();
        let red = |v| {
            let mut px = [0u8; 4];
            pf.buffer_from_pixel(&mut px, pf.pixel_from_rgb(v, 0, 0));
            px
        };
        // (0,0)=10, (1,0)=left=10, (0,1)=up=10, (1,1)=10+10-10
        assert_eq!(image(&fb, r), [red(10), red(10), red(10), red(10)].concat());
    }

    #[test]
    fn jpeg_and_unknown_subencodings_are_rejected() {
        let r = Rect::new(0, 0, 1, 1);
        let mut is = InStream::from_slice(&[0x90, 0, 0, 0]);
        let mut os = OutStream::new();
        let err = TightDecoder::new()
            .read_rect(&r, &mut is, &PixelFormat::BGR233, &mut os)
            .unwrap_err();
        assert!(err.is_protocol());

        let err = decode(PixelFormat::BGR233, r, &[0xA0]).unwrap_err();
        assert!(err.is_protocol());

        let err = decode(PixelFormat::BGR233, r, &[0x40, 7, 0]).unwrap_err();
        assert!(err.is_protocol());
    }

    #[test]
    fn read_waits_for_compressed_body() {
        let r = Rect::new(0, 0, 4, 4);
        // 16 bytes of 8bpp data: compact length 20 then 20 bytes
        let mut body = vec![0x00, 20];
        body.extend(std::iter::repeat_n(0xAB, 20));
        let mut is = InStream::from_slice(&body[..10]);
        let mut os = OutStream::new();
        let dec = TightDecoder::new();
        assert!(!dec.read_rect(&r, &mut is, &PixelFormat::BGR233, &mut os).unwrap());
        assert_eq!(is.avail(), 10);

        is.feed(&body[10..]);
        os.clear();
        assert!(dec.read_rect(&r, &mut is, &PixelFormat::BGR233, &mut os).unwrap());
        assert_eq!(os.as_slice(), &body[..]);
    }

    #[test]
    fn conflicts_follow_streams() {
        let dec = TightDecoder::new();
        let r = Rect::new(0, 0, 1, 1);
        let pf = PixelFormat::BGR233;
        assert!(dec.rects_conflict(&r, &[0x10], &r, &[0x50], &pf));
        assert!(!dec.rects_conflict(&r, &[0x10], &r, &[0x20], &pf));
        assert!(!dec.rects_conflict(&r, &[0x80], &r, &[0x00], &pf));
        assert!(dec.rects_conflict(&r, &[0x21], &r, &[0x80], &pf));
    }
}

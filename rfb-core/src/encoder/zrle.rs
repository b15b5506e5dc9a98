//! ZRLE encoding.
//!
//! ```text
//! u32 length | zlib data
//! zlib data = tiles of 64×64, each: u8 mode | ...
//!   mode 0          raw CPIXELs
//!   mode 1          one CPIXEL, solid tile
//!   mode 2..=16     palette of CPIXELs, packed indices, rows byte-padded
//!   mode 128+n      palette of n CPIXELs, index runs
//! ```
//!
//! One deflate stream lives for the whole connection; each rect ends
//! with a sync flush.
//!
//! A CPIXEL is the pixel minus its unused byte when the format is 32bpp
//! with depth ≤ 24 and the padding byte is the first or the last one.

use std::ops::Range;

use tracing::trace;

use crate::dispatch_bpp;
use crate::error::RfbError;
use crate::message::encoding;
use crate::palette::Palette;
use crate::pixel::{Pixel, PixelFormat, PixelView};
use crate::rle::write_run;
use crate::stream::{OutStream, ZlibDeflater};

use super::{Encoder, packed_index_bits};

pub const TILE_SIZE: usize = 64;
/// Largest palette an RLE tile can name: the mode byte is `0x80 | size`.
pub const MAX_PALETTE: usize = 127;

/// Bytes of a pixel buffer that make up its CPIXEL.
pub(crate) fn cpixel_range(pf: &PixelFormat) -> Range<usize> {
    let bpp = pf.bytes_per_pixel();
    if pf.bpp() != 32 || pf.depth() > 24 {
        return 0..bpp;
    }
    let max = pf.pixel_from_rgb(255, 255, 255);
    let mut buf = [0u8; 4];
    pf.buffer_from_pixel(&mut buf, max);
    if buf[0] == 0 {
        1..4
    } else if buf[3] == 0 {
        0..3
    } else {
        0..4
    }
}

#[derive(Debug)]
pub struct ZrleEncoder {
    zos: ZlibDeflater,
    /// Uncompressed tile data of the current rect.
    mos: OutStream,
    compressed: Vec<u8>,
}

impl Default for ZrleEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl ZrleEncoder {
    pub fn new() -> Self {
        Self::with_level(-1)
    }

    /// An encoder whose deflate stream uses `level`. ZRLE has no way
    /// to tell the client about a new stream, so this is fixed for
    /// the connection.
    pub fn with_level(level: i32) -> Self {
        Self {
            zos: ZlibDeflater::new(level),
            mos: OutStream::new(),
            compressed: Vec::new(),
        }
    }

    fn write_cpixel(&mut self, range: &Range<usize>, pixel: &[u8]) {
        self.mos.write_bytes(&pixel[range.clone()]);
    }

    fn write_palette<P: Pixel>(&mut self, range: &Range<usize>, palette: &Palette) {
        let mut buf = [0u8; 4];
        for c in palette.colours() {
            P::from_u32(c).store(&mut buf);
            self.write_cpixel(range, &buf);
        }
    }

    fn write_raw_tile<P: Pixel>(&mut self, range: &Range<usize>, tile: &PixelView<'_>) {
        self.mos.write_u8(0);
        let bpp = P::BYTES;
        for y in 0..tile.height() {
            for px in tile.row(y).chunks_exact(bpp) {
                self.write_cpixel(range, px);
            }
        }
    }

    fn write_packed_tile<P: Pixel>(
        &mut self,
        range: &Range<usize>,
        tile: &PixelView<'_>,
        palette: &Palette,
    ) {
        self.mos.write_u8(palette.size() as u8);
        self.write_palette::<P>(range, palette);

        let bits = packed_index_bits(palette.size());
        for y in 0..tile.height() {
            let mut byte: u32 = 0;
            let mut nbits = 0;
            for x in 0..tile.width() {
                let idx = palette.lookup(tile.pixel::<P>(x, y).to_u32()) as u32;
                byte = (byte << bits) | idx;
                nbits += bits;
                if nbits >= 8 {
                    self.mos.write_u8(byte as u8);
                    byte = 0;
                    nbits = 0;
                }
            }
            if nbits > 0 {
                byte <<= 8 - nbits;
                self.mos.write_u8(byte as u8);
            }
        }
    }

    fn write_rle_tile<P: Pixel>(
        &mut self,
        range: &Range<usize>,
        tile: &PixelView<'_>,
        palette: &Palette,
    ) {
        self.mos.write_u8(palette.size() as u8 | 0x80);
        self.write_palette::<P>(range, palette);

        let mut prev: P = tile.pixel(0, 0);
        let mut run = 0usize;
        for y in 0..tile.height() {
            for x in 0..tile.width() {
                let p: P = tile.pixel(x, y);
                if p != prev {
                    self.write_run_of(palette, prev, run);
                    prev = p;
                    run = 0;
                }
                run += 1;
            }
        }
        self.write_run_of(palette, prev, run);
    }

    fn write_run_of<P: Pixel>(&mut self, palette: &Palette, colour: P, run: usize) {
        let idx = palette.lookup(colour.to_u32());
        if run == 1 {
            self.mos.write_u8(idx);
        } else {
            self.mos.write_u8(idx | 0x80);
            write_run(&mut self.mos, run - 1);
        }
    }

    fn encode<P: Pixel>(&mut self, pb: &PixelView<'_>, palette: &Palette) {
        let range = cpixel_range(pb.pf());
        for ty in (0..pb.height()).step_by(TILE_SIZE) {
            let th = TILE_SIZE.min(pb.height() - ty);
            for tx in (0..pb.width()).step_by(TILE_SIZE) {
                let tw = TILE_SIZE.min(pb.width() - tx);
                let tile = pb.sub(tx, ty, tw, th);
                match palette.size() {
                    0 => self.write_raw_tile::<P>(&range, &tile),
                    1..=16 => self.write_packed_tile::<P>(&range, &tile, palette),
                    _ => self.write_rle_tile::<P>(&range, &tile, palette),
                }
            }
        }
    }

    /// Compress the pending tile data and write it with its length.
    fn flush(&mut self, os: &mut OutStream) -> Result<(), RfbError> {
        self.compressed.clear();
        self.zos.compress(self.mos.as_slice(), &mut self.compressed)?;
        trace!(
            raw = self.mos.len(),
            compressed = self.compressed.len(),
            "zrle rect"
        );
        self.mos.clear();
        os.write_u32(self.compressed.len() as u32);
        os.write_bytes(&self.compressed);
        Ok(())
    }
}

impl Encoder for ZrleEncoder {
    fn encoding(&self) -> i32 {
        encoding::ZRLE
    }

    fn max_palette_size(&self) -> Option<usize> {
        Some(MAX_PALETTE)
    }

    fn write_rect(
        &mut self,
        pb: &PixelView<'_>,
        palette: &Palette,
        os: &mut OutStream,
    ) -> Result<(), RfbError> {
        if palette.size() == 1 {
            let bpp = pb.pf().bytes_per_pixel();
            let mut colour = [0u8; 4];
            colour[..bpp].copy_from_slice(&pb.row(0)[..bpp]);
            return self.write_solid_rect(pb.width(), pb.height(), pb.pf(), &colour, os);
        }
        dispatch_bpp!(pb.pf().bpp(), P => self.encode::<P>(pb, palette));
        self.flush(os)
    }

    fn write_solid_rect(
        &mut self,
        width: usize,
        height: usize,
        pf: &PixelFormat,
        colour: &[u8],
        os: &mut OutStream,
    ) -> Result<(), RfbError> {
        let range = cpixel_range(pf);
        let tiles = width.div_ceil(TILE_SIZE) * height.div_ceil(TILE_SIZE);
        for _ in 0..tiles {
            self.mos.write_u8(1);
            self.write_cpixel(&range, colour);
        }
        self.flush(os)
    }
}

// ── Tests ────────────────────────────────────────────────────────

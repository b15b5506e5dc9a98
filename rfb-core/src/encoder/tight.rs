//! Tight encoding (without JPEG).
//!
//! ```text
//! fill   u8 0x80 | TPIXEL
//! basic  u8 (stream | explicit_filter) << 4 | reset bits
//!        [u8 filter=1 | u8 size-1 | size × TPIXEL]
//!        data, raw when < 12 bytes, else compact length + zlib
//! ```
//!
//! | Stream | Used for                                    |
//! |--------|---------------------------------------------|
//! | 0      | full colour pixels                          |
//! | 1      | two-colour bitmaps, 1 bit/px MSB first      |
//! | 2      | indexed pixels, 1 byte/px (never at 8bpp)   |
//!
//! A TPIXEL is the pixel as three bytes of RGB when the format is
//! 32bpp true colour with byte-aligned 8-bit channels.
//!
//! Each stream's deflate level follows the compress level. The level
//! of a running stream cannot be changed in place, so a change starts
//! a new stream and sets the stream's reset bit in the control byte.

use tracing::trace;

use crate::dispatch_bpp;
use crate::error::RfbError;
use crate::message::encoding;
use crate::palette::Palette;
use crate::pixel::{Pixel, PixelFormat, PixelView};
use crate::stream::{OutStream, ZlibDeflater};

use super::Encoder;

pub const FILL: u8 = 0x08;
pub const JPEG: u8 = 0x09;
pub const MAX_SUBENCODING: u8 = 0x09;
pub const EXPLICIT_FILTER: u8 = 0x04;

pub const FILTER_COPY: u8 = 0;
pub const FILTER_PALETTE: u8 = 1;
pub const FILTER_GRADIENT: u8 = 2;

/// Data shorter than this is sent uncompressed.
pub const MIN_TO_COMPRESS: usize = 12;

pub const STREAM_FULL_COLOUR: usize = 0;
pub const STREAM_MONO: usize = 1;
pub const STREAM_INDEXED: usize = 2;

const DEFAULT_COMPRESS_LEVEL: usize = 2;

/// Deflate level per compress level: (indexed, mono, full colour).
const LEVELS: [(i32, i32, i32); 10] = [
    (0, 0, 0),
    (1, 1, 1),
    (3, 3, 2),
    (5, 5, 2),
    (6, 7, 3),
    (7, 8, 4),
    (7, 8, 5),
    (8, 9, 6),
    (9, 9, 7),
    (9, 9, 9),
];

#[derive(Debug)]
pub struct TightEncoder {
    streams: [Option<ZlibDeflater>; 4],
    compress_level: usize,
    data: OutStream,
    compressed: Vec<u8>,
}

impl Default for TightEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl TightEncoder {
    pub fn new() -> Self {
        Self {
            streams: [None, None, None, None],
            compress_level: DEFAULT_COMPRESS_LEVEL,
            data: OutStream::new(),
            compressed: Vec::new(),
        }
    }

    fn levels(&self) -> (i32, i32, i32) {
        LEVELS[self.compress_level]
    }

    fn write_tpixel(os: &mut OutStream, pf: &PixelFormat, pixel: &[u8]) {
        if pf.is_888() {
            let mut rgb = [0u8; 3];
            pf.rgb_from_buffer(&mut rgb, pixel, 1);
            os.write_bytes(&rgb);
        } else {
            os.write_bytes(&pixel[..pf.bytes_per_pixel()]);
        }
    }

    /// Reset bits for `stream` at `level`, starting the stream anew
    /// when the level moved. Only called for data that will be
    /// compressed.
    fn prepare_stream(&mut self, stream: usize, level: i32) -> u8 {
        let Some(z) = self.streams[stream].as_mut() else {
            self.streams[stream] = Some(ZlibDeflater::new(level));
            return 0;
        };
        if z.level() == level {
            return 0;
        }
        trace!(stream, level, "tight stream reset");
        z.reset(level);
        1 << stream
    }

    /// Write the control byte and header bytes, then the data in
    /// `self.data`, compressing on `stream` if it is long enough.
    fn write_basic(
        &mut self,
        stream: usize,
        level: i32,
        header: &[u8],
        filter: bool,
        os: &mut OutStream,
    ) -> Result<(), RfbError> {
        let len = self.data.len();
        let reset = if len >= MIN_TO_COMPRESS {
            self.prepare_stream(stream, level)
        } else {
            0
        };
        let filter_bit = if filter { EXPLICIT_FILTER } else { 0 };
        os.write_u8(((stream as u8 | filter_bit) << 4) | reset);
        os.write_bytes(header);

        if len < MIN_TO_COMPRESS {
            os.write_bytes(self.data.as_slice());
        } else {
            self.compressed.clear();
            let z = self.streams[stream]
                .as_mut()
                .ok_or(RfbError::Compression("tight stream not started".into()))?;
            z.compress(self.data.as_slice(), &mut self.compressed)?;
            os.write_compact_length(self.compressed.len());
            os.write_bytes(&self.compressed);
        }
        self.data.clear();
        Ok(())
    }

    fn palette_header<P: Pixel>(pf: &PixelFormat, palette: &Palette) -> OutStream {
        let mut header = OutStream::new();
        header.write_u8(FILTER_PALETTE);
        header.write_u8((palette.size() - 1) as u8);
        let mut buf = [0u8; 4];
        for c in palette.colours() {
            P::from_u32(c).store(&mut buf);
            Self::write_tpixel(&mut header, pf, &buf);
        }
        header
    }

    fn write_full_colour(
        &mut self,
        pb: &PixelView<'_>,
        os: &mut OutStream,
    ) -> Result<(), RfbError> {
        let pf = *pb.pf();
        if pf.is_888() {
            let mut rgb = vec![0u8; pb.width() * 3];
            for y in 0..pb.height() {
                pf.rgb_from_buffer(&mut rgb, pb.row(y), pb.width());
                self.data.write_bytes(&rgb);
            }
        } else {
            for y in 0..pb.height() {
                self.data.write_bytes(pb.row(y));
            }
        }
        let (_, _, level) = self.levels();
        self.write_basic(STREAM_FULL_COLOUR, level, &[], false, os)
    }

    fn write_mono<P: Pixel>(
        &mut self,
        pb: &PixelView<'_>,
        palette: &Palette,
        os: &mut OutStream,
    ) -> Result<(), RfbError> {
        let bg = P::from_u32(palette.colour(0));
        for y in 0..pb.height() {
            let mut byte = 0u8;
            let mut mask = 0x80u8;
            for x in 0..pb.width() {
                if pb.pixel::<P>(x, y) != bg {
                    byte |= mask;
                }
                mask >>= 1;
                if mask == 0 {
                    self.data.write_u8(byte);
                    byte = 0;
                    mask = 0x80;
                }
            }
            if mask != 0x80 {
                self.data.write_u8(byte);
            }
        }
        let header = Self::palette_header::<P>(pb.pf(), palette);
        let (_, level, _) = self.levels();
        self.write_basic(STREAM_MONO, level, header.as_slice(), true, os)
    }

    fn write_indexed<P: Pixel>(
        &mut self,
        pb: &PixelView<'_>,
        palette: &Palette,
        os: &mut OutStream,
    ) -> Result<(), RfbError> {
        let mut prev: P = pb.pixel(0, 0);
        let mut idx = palette.lookup(prev.to_u32());
        for y in 0..pb.height() {
            for x in 0..pb.width() {
                let p: P = pb.pixel(x, y);
                if p != prev {
                    prev = p;
                    idx = palette.lookup(p.to_u32());
                }
                self.data.write_u8(idx);
            }
        }
        let header = Self::palette_header::<P>(pb.pf(), palette);
        let (level, _, _) = self.levels();
        self.write_basic(STREAM_INDEXED, level, header.as_slice(), true, os)
    }

    fn encode<P: Pixel>(
        &mut self,
        pb: &PixelView<'_>,
        palette: &Palette,
        os: &mut OutStream,
    ) -> Result<(), RfbError> {
        match palette.size() {
            0 => self.write_full_colour(pb, os),
            1 => {
                let mut buf = [0u8; 4];
                pb.pixel::<P>(0, 0).store(&mut buf);
                self.write_solid_rect(pb.width(), pb.height(), pb.pf(), &buf, os)
            }
            2 => self.write_mono::<P>(pb, palette, os),
            // bytes per index equal bytes per pixel, so skip the palette
            _ if P::BYTES == 1 => self.write_full_colour(pb, os),
            _ => self.write_indexed::<P>(pb, palette, os),
        }
    }
}

impl Encoder for TightEncoder {
    fn encoding(&self) -> i32 {
        encoding::TIGHT
    }

    fn max_palette_size(&self) -> Option<usize> {
        Some(256)
    }

    fn set_compress_level(&mut self, level: i32) {
        self.compress_level = if (0..=9).contains(&level) {
            level as usize
        } else {
            DEFAULT_COMPRESS_LEVEL
        };
    }

    fn write_rect(
        &mut self,
        pb: &PixelView<'_>,
        palette: &Palette,
        os: &mut OutStream,
    ) -> Result<(), RfbError> {
        dispatch_bpp!(pb.pf().bpp(), P => self.encode::<P>(pb, palette, os))
    }

    fn write_solid_rect(
        &mut self,
        _width: usize,
        _height: usize,
        pf: &PixelFormat,
        colour: &[u8],
        os: &mut OutStream,
    ) -> Result<(), RfbError> {
        os.write_u8(FILL << 4);
        Self::write_tpixel(os, pf, colour);
        Ok(())
    }
}

/// Bytes of one TPIXEL in `pf`.
pub(crate) fn tpixel_len(pf: &PixelFormat) -> usize {
    if pf.is_888() { 3 } else { pf.bytes_per_pixel() }
}

// ── Tests ────────────────────────────────────────────────────────

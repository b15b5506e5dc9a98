//! Pixel layout description and colour conversion.
//!
//! A [`PixelFormat`] says how an RGB colour is packed into 1, 2 or 4
//! bytes. Formats are validated once at construction and never change
//! afterwards; everything else in the pipeline trusts them.
//!
//! Wire form (16 bytes):
//!
//! ```text
//! u8  bpp          u8  depth
//! u8  big_endian   u8  true_colour
//! u16 red_max      u16 green_max     u16 blue_max
//! u8  red_shift    u8  green_shift   u8  blue_shift
//! 3 bytes padding
//! ```
//!
//! Channel conversion goes through two lookup tables per channel width:
//! `up` scales an n-bit value to 8 bits (`v * 255 / max`), `down` scales
//! back with rounding (`(v * max + 128) / 255`).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::RfbError;
use crate::stream::{ByteSource, OutStream};

// ── Conversion tables ────────────────────────────────────────────

const fn build_up() -> [[u8; 256]; 8] {
    let mut t = [[0u8; 256]; 8];
    let mut bits = 1;
    while bits <= 8 {
        let max = (1usize << bits) - 1;
        let mut i = 0;
        while i < 256 {
            // repeating every max+1 entries makes the upper bits irrelevant
            let v = i & max;
            t[bits - 1][i] = (v * 255 / max) as u8;
            i += 1;
        }
        bits += 1;
    }
    t
}

const fn build_down() -> [[u8; 256]; 8] {
    let mut t = [[0u8; 256]; 8];
    let mut bits = 1;
    while bits <= 8 {
        let max = (1usize << bits) - 1;
        let mut i = 0;
        while i < 256 {
            t[bits - 1][i] = ((i * max + 128) / 255) as u8;
            i += 1;
        }
        bits += 1;
    }
    t
}

static UPCONV: [[u8; 256]; 8] = build_up();
static DOWNCONV: [[u8; 256]; 8] = build_down();

/// Bits needed for a channel maximum of the form `2^n - 1`.
const fn bits(max: u16) -> u32 {
    16 - max.leading_zeros()
}

// ── PixelFormat ──────────────────────────────────────────────────

/// A validated RFB pixel format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "PixelFormatFields", into = "PixelFormatFields")]
pub struct PixelFormat {
    bpp: u8,
    depth: u8,
    big_endian: bool,
    true_colour: bool,
    red_max: u16,
    green_max: u16,
    blue_max: u16,
    red_shift: u8,
    green_shift: u8,
    blue_shift: u8,
}

/// Unvalidated field bag used for (de)serialization.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PixelFormatFields {
    pub bpp: u8,
    pub depth: u8,
    pub big_endian: bool,
    pub true_colour: bool,
    pub red_max: u16,
    pub green_max: u16,
    pub blue_max: u16,
    pub red_shift: u8,
    pub green_shift: u8,
    pub blue_shift: u8,
}

impl TryFrom<PixelFormatFields> for PixelFormat {
    type Error = RfbError;

    fn try_from(f: PixelFormatFields) -> Result<Self, RfbError> {
        PixelFormat::new(
            f.bpp,
            f.depth,
            f.big_endian,
            f.true_colour,
            f.red_max,
            f.green_max,
            f.blue_max,
            f.red_shift,
            f.green_shift,
            f.blue_shift,
        )
    }
}

impl From<PixelFormat> for PixelFormatFields {
    fn from(pf: PixelFormat) -> Self {
        Self {
            bpp: pf.bpp,
            depth: pf.depth,
            big_endian: pf.big_endian,
            true_colour: pf.true_colour,
            red_max: pf.red_max,
            green_max: pf.green_max,
            blue_max: pf.blue_max,
            red_shift: pf.red_shift,
            green_shift: pf.green_shift,
            blue_shift: pf.blue_shift,
        }
    }
}

impl PixelFormat {
    /// 32bpp depth 24, red in the high byte, little-endian.
    pub const RGB888: PixelFormat = PixelFormat {
        bpp: 32,
        depth: 24,
        big_endian: false,
        true_colour: true,
        red_max: 255,
        green_max: 255,
        blue_max: 255,
        red_shift: 16,
        green_shift: 8,
        blue_shift: 0,
    };

    pub const RGB565: PixelFormat = PixelFormat {
        bpp: 16,
        depth: 16,
        big_endian: false,
        true_colour: true,
        red_max: 31,
        green_max: 63,
        blue_max: 31,
        red_shift: 11,
        green_shift: 5,
        blue_shift: 0,
    };

    /// The 8-bit layout also used in place of colour maps.
    pub const BGR233: PixelFormat = PixelFormat {
        bpp: 8,
        depth: 8,
        big_endian: false,
        true_colour: true,
        red_max: 7,
        green_max: 7,
        blue_max: 3,
        red_shift: 0,
        green_shift: 3,
        blue_shift: 6,
    };

    #[allow(clippy::too_many_arguments)]
    pub fn new(
        bpp: u8,
        depth: u8,
        big_endian: bool,
        true_colour: bool,
        red_max: u16,
        green_max: u16,
        blue_max: u16,
        red_shift: u8,
        green_shift: u8,
        blue_shift: u8,
    ) -> Result<Self, RfbError> {
        let pf = Self {
            bpp,
            depth,
            big_endian,
            true_colour,
            red_max,
            green_max,
            blue_max,
            red_shift,
            green_shift,
            blue_shift,
        };
        pf.validate()?;
        Ok(pf)
    }

    fn validate(&self) -> Result<(), RfbError> {
        if !matches!(self.bpp, 8 | 16 | 32) {
            return Err(RfbError::InvalidPixelFormat("bpp must be 8, 16 or 32"));
        }
        if self.depth > self.bpp {
            return Err(RfbError::InvalidPixelFormat("depth exceeds bpp"));
        }
        if !self.true_colour && self.depth != 8 {
            return Err(RfbError::InvalidPixelFormat("colour map requires depth 8"));
        }

        let maxes = [self.red_max, self.green_max, self.blue_max];
        for max in maxes {
            if max == 0 || max & max.wrapping_add(1) != 0 {
                return Err(RfbError::InvalidPixelFormat("channel max is not 2^n-1"));
            }
            // channels wider than 8 bits are not supported
            if max >= 256 {
                return Err(RfbError::InvalidPixelFormat("channel wider than 8 bits"));
            }
        }

        let total: u32 = maxes.iter().map(|&m| bits(m)).sum();
        if total > self.depth as u32 {
            return Err(RfbError::InvalidPixelFormat("channels exceed depth"));
        }

        let shifts = [self.red_shift, self.green_shift, self.blue_shift];
        for (max, shift) in maxes.iter().zip(shifts) {
            if bits(*max) + shift as u32 > self.bpp as u32 {
                return Err(RfbError::InvalidPixelFormat("channel outside pixel"));
            }
        }

        let masks: Vec<u32> = maxes
            .iter()
            .zip(shifts)
            .map(|(&m, s)| (m as u32) << s)
            .collect();
        if masks[0] & masks[1] != 0 || masks[0] & masks[2] != 0 || masks[1] & masks[2] != 0 {
            return Err(RfbError::InvalidPixelFormat("channels overlap"));
        }
        Ok(())
    }

    // ── Accessors ────────────────────────────────────────────────

    pub fn bpp(&self) -> u8 {
        self.bpp
    }

    pub fn bytes_per_pixel(&self) -> usize {
        self.bpp as usize / 8
    }

    pub fn depth(&self) -> u8 {
        self.depth
    }

    pub fn is_big_endian(&self) -> bool {
        self.big_endian
    }

    pub fn is_true_colour(&self) -> bool {
        self.true_colour
    }

    pub fn red_max(&self) -> u16 {
        self.red_max
    }

    pub fn green_max(&self) -> u16 {
        self.green_max
    }

    pub fn blue_max(&self) -> u16 {
        self.blue_max
    }

    pub fn red_shift(&self) -> u8 {
        self.red_shift
    }

    pub fn green_shift(&self) -> u8 {
        self.green_shift
    }

    pub fn blue_shift(&self) -> u8 {
        self.blue_shift
    }

    /// 32bpp true colour with three byte-aligned 8-bit channels.
    pub fn is_888(&self) -> bool {
        self.true_colour
            && self.bpp == 32
            && self.depth == 24
            && self.red_max == 255
            && self.green_max == 255
            && self.blue_max == 255
            && self.red_shift & 0x7 == 0
            && self.green_shift & 0x7 == 0
            && self.blue_shift & 0x7 == 0
    }

    /// Whether buffers in `self` and `other` have identical bytes for
    /// the same colours.
    ///
    /// Stricter than "same colours" and looser than `==`: a 32bpp
    /// format with swapped endianness and mirrored byte shifts is
    /// equivalent, and the endianness of 8bpp formats never matters.
    pub fn is_equivalent(&self, other: &PixelFormat) -> bool {
        if self.bpp != other.bpp || self.depth != other.depth {
            return false;
        }
        if self.red_max != other.red_max
            || self.green_max != other.green_max
            || self.blue_max != other.blue_max
        {
            return false;
        }

        if self.big_endian == other.big_endian || self.bpp == 8 {
            return self.red_shift == other.red_shift
                && self.green_shift == other.green_shift
                && self.blue_shift == other.blue_shift;
        }

        // each channel has to sit in the mirrored byte at the same bit
        // offset, without straddling a byte boundary
        let last_byte = self.bpp / 8 - 1;
        let chans = [
            (self.red_shift, other.red_shift, self.red_max),
            (self.green_shift, other.green_shift, self.green_max),
            (self.blue_shift, other.blue_shift, self.blue_max),
        ];
        chans.iter().all(|&(s, o, max)| {
            let w = bits(max) as u8;
            s / 8 <= last_byte
                && o / 8 <= last_byte
                && s / 8 == last_byte - o / 8
                && s % 8 == o % 8
                && s / 8 == (s + w - 1) / 8
        })
    }

    // ── Wire form ────────────────────────────────────────────────

    /// Read the 16-byte wire form.
    ///
    /// Colour-map formats are accepted by forcing the [`BGR233`]
    /// channel layout; the map itself is never used.
    ///
    /// [`BGR233`]: PixelFormat::BGR233
    pub fn read<S: ByteSource + ?Sized>(src: &mut S) -> Result<Self, RfbError> {
        let bpp = src.read_u8()?;
        let depth = src.read_u8()?;
        let big_endian = src.read_u8()? != 0;
        let true_colour = src.read_u8()? != 0;
        let mut red_max = src.read_u16()?;
        let mut green_max = src.read_u16()?;
        let mut blue_max = src.read_u16()?;
        let mut red_shift = src.read_u8()?;
        let mut green_shift = src.read_u8()?;
        let mut blue_shift = src.read_u8()?;
        src.skip(3)?;

        if !true_colour {
            red_max = 7;
            green_max = 7;
            blue_max = 3;
            red_shift = 0;
            green_shift = 3;
            blue_shift = 6;
        }

        Self::new(
            bpp,
            depth,
            big_endian,
            true_colour,
            red_max,
            green_max,
            blue_max,
            red_shift,
            green_shift,
            blue_shift,
        )
    }

    pub fn write(&self, os: &mut OutStream) {
        os.write_u8(self.bpp);
        os.write_u8(self.depth);
        os.write_u8(self.big_endian as u8);
        os.write_u8(self.true_colour as u8);
        os.write_u16(self.red_max);
        os.write_u16(self.green_max);
        os.write_u16(self.blue_max);
        os.write_u8(self.red_shift);
        os.write_u8(self.green_shift);
        os.write_u8(self.blue_shift);
        os.pad(3);
    }

    // ── Single pixels ────────────────────────────────────────────

    /// Pixel value of the first `bpp/8` bytes of `buf`.
    #[inline]
    pub fn pixel_from_buffer(&self, buf: &[u8]) -> u32 {
        let n = self.bytes_per_pixel();
        let bytes = &buf[..n];
        if self.big_endian {
            bytes.iter().fold(0u32, |p, &b| (p << 8) | b as u32)
        } else {
            bytes.iter().rev().fold(0u32, |p, &b| (p << 8) | b as u32)
        }
    }

    #[inline]
    pub fn buffer_from_pixel(&self, buf: &mut [u8], p: u32) {
        let n = self.bytes_per_pixel();
        for (i, b) in buf[..n].iter_mut().enumerate() {
            let shift = if self.big_endian { (n - 1 - i) * 8 } else { i * 8 };
            *b = (p >> shift) as u8;
        }
    }

    #[inline]
    pub fn pixel_from_rgb(&self, r: u8, g: u8, b: u8) -> u32 {
        let r = DOWNCONV[bits(self.red_max) as usize - 1][r as usize] as u32;
        let g = DOWNCONV[bits(self.green_max) as usize - 1][g as usize] as u32;
        let b = DOWNCONV[bits(self.blue_max) as usize - 1][b as usize] as u32;
        (r << self.red_shift) | (g << self.green_shift) | (b << self.blue_shift)
    }

    #[inline]
    pub fn rgb_from_pixel(&self, p: u32) -> (u8, u8, u8) {
        let r = UPCONV[bits(self.red_max) as usize - 1][((p >> self.red_shift) & 0xff) as usize];
        let g =
            UPCONV[bits(self.green_max) as usize - 1][((p >> self.green_shift) & 0xff) as usize];
        let b = UPCONV[bits(self.blue_max) as usize - 1][((p >> self.blue_shift) & 0xff) as usize];
        (r, g, b)
    }

    /// Translate pixel value `p` in `src` into this format.
    pub fn pixel_from_pixel(&self, src: &PixelFormat, p: u32) -> u32 {
        let (r, g, b) = src.rgb_from_pixel(p);
        self.pixel_from_rgb(r, g, b)
    }

    // ── Buffers ──────────────────────────────────────────────────

    /// Pack `pixels` RGB triplets from `src` into `dst`.
    pub fn buffer_from_rgb(&self, dst: &mut [u8], src: &[u8], pixels: usize) {
        let bpp = self.bytes_per_pixel();
        for (d, s) in dst.chunks_exact_mut(bpp).zip(src.chunks_exact(3)).take(pixels) {
            let p = self.pixel_from_rgb(s[0], s[1], s[2]);
            self.buffer_from_pixel(d, p);
        }
    }

    /// Unpack `pixels` pixels from `src` into RGB triplets in `dst`.
    pub fn rgb_from_buffer(&self, dst: &mut [u8], src: &[u8], pixels: usize) {
        let bpp = self.bytes_per_pixel();
        for (d, s) in dst.chunks_exact_mut(3).zip(src.chunks_exact(bpp)).take(pixels) {
            let (r, g, b) = self.rgb_from_pixel(self.pixel_from_buffer(s));
            d.copy_from_slice(&[r, g, b]);
        }
    }

    /// Convert a `w`×`h` block from `src_pf`. Strides are in pixels.
    #[allow(clippy::too_many_arguments)]
    pub fn buffer_from_buffer(
        &self,
        dst: &mut [u8],
        src_pf: &PixelFormat,
        src: &[u8],
        w: usize,
        h: usize,
        dst_stride: usize,
        src_stride: usize,
    ) {
        let dbpp = self.bytes_per_pixel();
        let sbpp = src_pf.bytes_per_pixel();
        if w == 0 || h == 0 {
            return;
        }

        if self.is_equivalent(src_pf) {
            for y in 0..h {
                let d = y * dst_stride * dbpp;
                let s = y * src_stride * sbpp;
                dst[d..d + w * dbpp].copy_from_slice(&src[s..s + w * sbpp]);
            }
            return;
        }

        for y in 0..h {
            let drow = &mut dst[y * dst_stride * dbpp..][..w * dbpp];
            let srow = &src[y * src_stride * sbpp..][..w * sbpp];
            for (d, s) in drow.chunks_exact_mut(dbpp).zip(srow.chunks_exact(sbpp)) {
                let p = self.pixel_from_pixel(src_pf, src_pf.pixel_from_buffer(s));
                self.buffer_from_pixel(d, p);
            }
        }
    }
}

impl Default for PixelFormat {
    fn default() -> Self {
        Self::BGR233
    }
}

// ── Text form ────────────────────────────────────────────────────

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "depth {} ({}bpp)", self.depth, self.bpp)?;
        if self.bpp != 8 {
            f.write_str(if self.big_endian {
                " big-endian"
            } else {
                " little-endian"
            })?;
        }
        if !self.true_colour {
            return f.write_str(" color-map");
        }

        let (rs, gs, bs) = (
            self.red_shift as u32,
            self.green_shift as u32,
            self.blue_shift as u32,
        );
        let depth = self.depth as u32;
        let m = |n: u32| ((1u32 << n) - 1) as u16;

        if bs == 0
            && gs > bs
            && rs > gs
            && rs <= depth
            && self.blue_max == m(gs)
            && self.green_max == m(rs - gs)
            && self.red_max == m(depth - rs)
        {
            return write!(f, " rgb{}{}{}", depth - rs, rs - gs, gs);
        }
        if rs == 0
            && gs > rs
            && bs > gs
            && bs <= depth
            && self.red_max == m(gs)
            && self.green_max == m(bs - gs)
            && self.blue_max == m(depth - bs)
        {
            return write!(f, " bgr{}{}{}", depth - bs, bs - gs, gs);
        }

        write!(
            f,
            " rgb max {},{},{} shift {},{},{}",
            self.red_max, self.green_max, self.blue_max, rs, gs, bs
        )
    }
}

/// Parses the short form `rgbXYZ` / `bgrXYZ` (one digit per channel,
/// host byte order), e.g. `rgb565` or `bgr233`.
impl FromStr for PixelFormat {
    type Err = RfbError;

    fn from_str(s: &str) -> Result<Self, RfbError> {
        let bad = RfbError::InvalidPixelFormat("expected rgbNNN or bgrNNN");
        if s.len() != 6 || !s.is_ascii() {
            return Err(bad);
        }
        let (order, digits) = s.split_at(3);
        let d: Vec<u8> = digits
            .bytes()
            .map(|c| c.wrapping_sub(b'0'))
            .collect();
        if d.iter().any(|&v| v > 8) {
            return Err(bad);
        }
        let (bits1, bits2, bits3) = (d[0], d[1], d[2]);
        let depth = bits1 + bits2 + bits3;
        let bpp = match depth {
            0..=8 => 8,
            9..=16 => 16,
            _ => 32,
        };
        let big_endian = cfg!(target_endian = "big");
        let max = |n: u8| ((1u32 << n) - 1) as u16;

        let green_shift = bits3;
        let green_max = max(bits2);
        let (red_max, red_shift, blue_max, blue_shift) = if order.eq_ignore_ascii_case("bgr") {
            (max(bits3), 0, max(bits1), bits3 + bits2)
        } else if order.eq_ignore_ascii_case("rgb") {
            (max(bits1), bits3 + bits2, max(bits3), 0)
        } else {
            return Err(bad);
        };

        Self::new(
            bpp,
            depth,
            big_endian,
            true,
            red_max,
            green_max,
            blue_max,
            red_shift,
            green_shift,
            blue_shift,
        )
    }
}

// ── Tests ────────────────────────────────────────────────────────

//! Hextile encoding.
//!
//! The rect is cut into 16×16 tiles, left to right, top to bottom.
//! Each tile starts with a flags byte:
//!
//! ```text
//! Raw              1   w*h pixels follow, nothing else
//! BgSpecified      2   bg pixel follows
//! FgSpecified      4   fg pixel follows
//! AnySubrects      8   u8 count, then subrects
//! SubrectsColoured 16  every subrect carries its own pixel
//! subrect             [pixel] | u8 (x<<4)|y | u8 ((w-1)<<4)|(h-1)
//! ```
//!
//! Background and foreground persist from tile to tile and are only
//! sent when they change; a raw tile forgets both.

use bitflags::bitflags;

use crate::dispatch_bpp;
use crate::error::RfbError;
use crate::message::encoding;
use crate::palette::Palette;
use crate::pixel::{Pixel, PixelFormat, PixelView};
use crate::stream::OutStream;

use super::{Encoder, write_pixel};

pub const TILE_SIZE: usize = 16;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct TileFlags: u8 {
        const RAW = 1 << 0;
        const BG_SPECIFIED = 1 << 1;
        const FG_SPECIFIED = 1 << 2;
        const ANY_SUBRECTS = 1 << 3;
        const SUBRECTS_COLOURED = 1 << 4;
    }
}

// ── Tile analysis ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
struct Subrect<P> {
    colour: P,
    xy: u8,
    wh: u8,
}

/// Result of analysing one tile.
struct Tile<P> {
    flags: TileFlags,
    /// Encoded subrect bytes including the count, when ANY_SUBRECTS.
    size: usize,
    background: P,
    foreground: P,
    subrects: Vec<Subrect<P>>,
}

impl<P: Pixel> Tile<P> {
    fn analyse(tile: &[P], w: usize, h: usize, palette: &mut Palette) -> Self {
        let first = tile[0];
        let same = tile.iter().take_while(|&&p| p == first).count();
        if same == w * h {
            return Self {
                flags: TileFlags::empty(),
                size: 0,
                background: first,
                foreground: first,
                subrects: Vec::new(),
            };
        }

        let mut subrects = Vec::with_capacity(TILE_SIZE * TILE_SIZE);
        palette.clear();

        // complete rows of the first colour at the top
        let mut y = same / w;
        if y > 0 {
            subrects.push(Subrect {
                colour: first,
                xy: 0,
                wh: (((w - 1) << 4) | ((y - 1) & 0x0F)) as u8,
            });
            palette.insert(first.to_u32(), 1);
        }

        let max_colours = 48 + 2 * 8 * P::BYTES;
        let mut processed = [[false; TILE_SIZE]; TILE_SIZE];

        while y < h {
            let mut x = 0;
            while x < w {
                if processed[y][x] {
                    x += 1;
                    continue;
                }
                let colour = tile[y * w + x];
                let max_x = x + (x..w).take_while(|&sx| tile[y * w + sx] == colour).count();
                let sw = max_x - x;
                let sh = 1 + (y + 1..h)
                    .take_while(|&sy| (x..max_x).all(|sx| tile[sy * w + sx] == colour))
                    .count();

                subrects.push(Subrect {
                    colour,
                    xy: ((x << 4) | (y & 0x0F)) as u8,
                    wh: (((sw - 1) << 4) | ((sh - 1) & 0x0F)) as u8,
                });

                if !palette.insert(colour.to_u32(), 1) || palette.size() > max_colours {
                    return Self {
                        flags: TileFlags::RAW,
                        size: 0,
                        background: first,
                        foreground: first,
                        subrects: Vec::new(),
                    };
                }

                for row in processed.iter_mut().take(y + sh).skip(y + 1) {
                    row[x..x + sw].fill(true);
                }
                x += sw;
            }
            y += 1;
        }

        let background = P::from_u32(palette.colour(0));
        let n = subrects.len() - palette.count(0) as usize;
        let (flags, size, foreground) = if palette.size() == 2 {
            (TileFlags::ANY_SUBRECTS, 1 + 2 * n, P::from_u32(palette.colour(1)))
        } else {
            (
                TileFlags::ANY_SUBRECTS | TileFlags::SUBRECTS_COLOURED,
                1 + (2 + P::BYTES) * n,
                background,
            )
        };

        Self {
            flags,
            size,
            background,
            foreground,
            subrects,
        }
    }

    fn write_subrects(&self, os: &mut OutStream) {
        let n = self
            .subrects
            .iter()
            .filter(|s| s.colour != self.background)
            .count();
        os.write_u8(n as u8);
        for s in self.subrects.iter().filter(|s| s.colour != self.background) {
            if self.flags.contains(TileFlags::SUBRECTS_COLOURED) {
                write_pixel(os, s.colour);
            }
            os.write_u8(s.xy);
            os.write_u8(s.wh);
        }
    }
}

// ── Encoder ──────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct HextileEncoder {
    palette: Palette,
}

impl HextileEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    fn encode<P: Pixel>(&mut self, pb: &PixelView<'_>, os: &mut OutStream) {
        let mut buf = [P::default(); TILE_SIZE * TILE_SIZE];
        let mut old_bg: Option<P> = None;
        let mut old_fg: Option<P> = None;

        for ty in (0..pb.height()).step_by(TILE_SIZE) {
            let th = TILE_SIZE.min(pb.height() - ty);
            for tx in (0..pb.width()).step_by(TILE_SIZE) {
                let tw = TILE_SIZE.min(pb.width() - tx);
                for y in 0..th {
                    for x in 0..tw {
                        buf[y * tw + x] = pb.pixel(tx + x, ty + y);
                    }
                }
                let tile_px = &buf[..tw * th];

                let tile = Tile::analyse(tile_px, tw, th, &mut self.palette);
                if tile.flags.contains(TileFlags::RAW) || tile.size >= tw * th * P::BYTES {
                    os.write_u8(TileFlags::RAW.bits());
                    for &p in tile_px {
                        write_pixel(os, p);
                    }
                    old_bg = None;
                    old_fg = None;
                    continue;
                }

                let mut flags = tile.flags;
                if old_bg != Some(tile.background) {
                    flags |= TileFlags::BG_SPECIFIED;
                    old_bg = Some(tile.background);
                }
                if flags.contains(TileFlags::ANY_SUBRECTS) {
                    if flags.contains(TileFlags::SUBRECTS_COLOURED) {
                        old_fg = None;
                    } else if old_fg != Some(tile.foreground) {
                        flags |= TileFlags::FG_SPECIFIED;
                        old_fg = Some(tile.foreground);
                    }
                }

                os.write_u8(flags.bits());
                if flags.contains(TileFlags::BG_SPECIFIED) {
                    write_pixel(os, tile.background);
                }
                if flags.contains(TileFlags::FG_SPECIFIED) {
                    write_pixel(os, tile.foreground);
                }
                if flags.contains(TileFlags::ANY_SUBRECTS) {
                    tile.write_subrects(os);
                }
            }
        }
    }
}

impl Encoder for HextileEncoder {
    fn encoding(&self) -> i32 {
        encoding::HEXTILE
    }

    fn write_rect(
        &mut self,
        pb: &PixelView<'_>,
        _palette: &Palette,
        os: &mut OutStream,
    ) -> Result<(), RfbError> {
        dispatch_bpp!(pb.pf().bpp(), P => self.encode::<P>(pb, os));
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
        let tiles = width.div_ceil(TILE_SIZE) * height.div_ceil(TILE_SIZE);
        if tiles == 0 {
            return Ok(());
        }
        os.write_u8(TileFlags::BG_SPECIFIED.bits());
        os.write_bytes(&colour[..pf.bytes_per_pixel()]);
        os.pad(tiles - 1);
        Ok(())
    }
}

// ── Tests ────────────────────────────────────────────────────────

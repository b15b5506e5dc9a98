//! Encode manager: turns one [`UpdateInfo`] into a FramebufferUpdate.
//!
//! Every rect of the update is classified by what its pixels look like
//! and the class decides which encoder writes it:
//!
//! | Class        | Rect content                             |
//! |--------------|------------------------------------------|
//! | `Solid`      | one colour                               |
//! | `Bitmap`     | two colours, noisy                       |
//! | `BitmapRle`  | two colours, long runs                   |
//! | `Indexed`    | a few colours, noisy                     |
//! | `IndexedRle` | a few colours, long runs                 |
//! | `FullColour` | too many colours for a palette           |
//!
//! The class → encoder table is rebuilt for every update from the
//! client's preferred encoding, falling back to whatever else the
//! client supports and finally to Raw.
//!
//! When the client understands LastRect the manager does not have to
//! know the rect count up front, which lets it look for large solid
//! areas first and send those as cheap solid rects.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;
use tracing::{Span, debug, info};

use crate::dispatch_bpp;
use crate::error::RfbError;
use crate::geometry::Rect;
use crate::message::{self, encoding};
use crate::palette::Palette;
use crate::params::{ClientParams, ENCODABLE};
use crate::pixel::{Pixel, PixelBuffer, PixelView};
use crate::region::Region;
use crate::stream::OutStream;
use crate::tracker::UpdateInfo;

use super::{
    Encoder, EncoderFlags, HextileEncoder, RawEncoder, RreEncoder, TightEncoder, ZrleEncoder,
};

/// Side of the blocks the solid search starts from.
const SOLID_SEARCH_BLOCK: i32 = 16;
/// Solid areas smaller than this are left to the normal encoders.
const SOLID_BLOCK_MIN_AREA: i64 = 2048;

/// Rects are split so that no piece exceeds this many pixels ...
const SUB_RECT_MAX_AREA: i64 = 65536;
/// ... or this width.
const SUB_RECT_MAX_WIDTH: i32 = 2048;

// ── EncoderClass ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum EncoderClass {
    Solid,
    Bitmap,
    BitmapRle,
    Indexed,
    IndexedRle,
    FullColour,
}

impl EncoderClass {
    pub const ALL: [EncoderClass; 6] = [
        EncoderClass::Solid,
        EncoderClass::Bitmap,
        EncoderClass::BitmapRle,
        EncoderClass::Indexed,
        EncoderClass::IndexedRle,
        EncoderClass::FullColour,
    ];

    fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for EncoderClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EncoderClass::Solid => "Solid",
            EncoderClass::Bitmap => "Bitmap",
            EncoderClass::BitmapRle => "Bitmap RLE",
            EncoderClass::Indexed => "Indexed",
            EncoderClass::IndexedRle => "Indexed RLE",
            EncoderClass::FullColour => "Full Colour",
        };
        f.write_str(s)
    }
}

// ── EncoderStats ─────────────────────────────────────────────────

/// Counters for one (encoding, class) pair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EncoderStats {
    pub rects: u64,
    pub pixels: u64,
    /// Bytes written, rect headers included.
    pub bytes: u64,
    /// What the same rects would have cost as Raw.
    pub equivalent: u64,
}

impl EncoderStats {
    fn add(&mut self, other: &EncoderStats) {
        self.rects += other.rects;
        self.pixels += other.pixels;
        self.bytes += other.bytes;
        self.equivalent += other.equivalent;
    }

    /// Raw size divided by encoded size.
    pub fn ratio(&self) -> f64 {
        if self.bytes == 0 {
            0.0
        } else {
            self.equivalent as f64 / self.bytes as f64
        }
    }
}

// ── EncodeManager ────────────────────────────────────────────────

/// Drives the encoders for one client connection.
///
/// Encoders keep per-connection state (zlib streams, Hextile's carried
/// colours), so a manager must not be shared between clients.
pub struct EncodeManager {
    span: Span,
    /// One encoder per entry of [`ENCODABLE`], in the same order.
    encoders: Vec<Box<dyn Encoder>>,
    /// Index into `encoders` for each [`EncoderClass`].
    active: [usize; 6],
    palette: Palette,
    /// Scratch for rects converted to the client's pixel format.
    conv: Vec<u8>,
    updates: u64,
    copy_stats: EncoderStats,
    stats: BTreeMap<(i32, EncoderClass), EncoderStats>,
}

impl EncodeManager {
    /// Create a manager logging into `span`.
    pub fn new(span: Span) -> Self {
        let encoders: Vec<Box<dyn Encoder>> = ENCODABLE
            .iter()
            .map(|&enc| -> Box<dyn Encoder> {
                match enc {
                    encoding::RRE => Box::new(RreEncoder::new()),
                    encoding::HEXTILE => Box::new(HextileEncoder::new()),
                    encoding::TIGHT => Box::new(TightEncoder::new()),
                    encoding::ZRLE => Box::new(ZrleEncoder::new()),
                    _ => Box::new(RawEncoder::new()),
                }
            })
            .collect();
        let raw = slot(encoding::RAW).unwrap_or(0);
        Self {
            span,
            encoders,
            active: [raw; 6],
            palette: Palette::new(),
            conv: Vec::new(),
            updates: 0,
            copy_stats: EncoderStats::default(),
            stats: BTreeMap::new(),
        }
    }

    /// Whether this manager can produce `enc`.
    pub fn supported(enc: i32) -> bool {
        ENCODABLE.contains(&enc)
    }

    /// Encoding currently assigned to `class`.
    pub fn active_encoding(&self, class: EncoderClass) -> i32 {
        self.encoders[self.active[class.index()]].encoding()
    }

    /// Number of updates written so far.
    pub fn updates(&self) -> u64 {
        self.updates
    }

    pub fn copy_stats(&self) -> &EncoderStats {
        &self.copy_stats
    }

    /// Counters per (encoding, class), in a stable order.
    pub fn stats(&self) -> impl Iterator<Item = (i32, EncoderClass, &EncoderStats)> + '_ {
        self.stats.iter().map(|(&(enc, class), s)| (enc, class, s))
    }

    /// Sum over every encoding and class, copies included.
    pub fn total_stats(&self) -> EncoderStats {
        let mut total = self.copy_stats;
        for s in self.stats.values() {
            total.add(s);
        }
        total
    }

    /// Write one FramebufferUpdate for `ui` with pixels from `pb`.
    pub fn write_update(
        &mut self,
        ui: &UpdateInfo,
        pb: &dyn PixelBuffer,
        cp: &ClientParams,
        os: &mut OutStream,
    ) -> Result<(), RfbError> {
        let _enter = self.span.clone().entered();

        self.updates += 1;
        self.prepare_encoders(cp);

        let mut changed = ui.changed.clone();
        let mut copied = ui.copied.clone();
        if !cp.supports_encoding(encoding::COPY_RECT) && !copied.is_empty() {
            changed.assign_union(&copied);
            copied.clear();
        }

        let last_rect = cp.supports_last_rect();
        let n_rects = if last_rect {
            0xFFFF
        } else {
            let n = copied.num_rects() + compute_num_rects(&changed);
            u16::try_from(n).map_err(|_| RfbError::Other(format!("update has {n} rects")))?
        };
        debug!(
            changed = changed.num_rects(),
            copied = copied.num_rects(),
            n_rects,
            "writing update"
        );

        message::write_framebuffer_update_start(os, n_rects);

        self.write_copy_rects(&copied, ui, pb, os);

        if last_rect {
            self.write_solid_rects(&mut changed, pb, cp, os)?;
        }

        self.write_rects(&changed, pb, cp, os)?;

        if last_rect {
            message::write_last_rect(os);
        }
        Ok(())
    }

    /// Log what has been sent so far.
    pub fn log_stats(&self) {
        let _enter = self.span.enter();

        info!(updates = self.updates, "framebuffer updates");

        if self.copy_stats.rects != 0 {
            info!(
                rects = self.copy_stats.rects,
                pixels = self.copy_stats.pixels,
                bytes = self.copy_stats.bytes,
                ratio = self.copy_stats.ratio(),
                "  CopyRect"
            );
        }

        for (&(enc, class), s) in &self.stats {
            info!(
                encoder = encoding::name(enc),
                class = %class,
                rects = s.rects,
                pixels = s.pixels,
                bytes = s.bytes,
                ratio = s.ratio(),
                "  encoded"
            );
        }

        let total = self.total_stats();
        info!(
            rects = total.rects,
            pixels = total.pixels,
            bytes = total.bytes,
            ratio = total.ratio(),
            "  total"
        );
    }

    // ── Encoder selection ────────────────────────────────────────

    fn prepare_encoders(&mut self, cp: &ClientParams) {
        use EncoderClass::*;

        let raw = slot(encoding::RAW).unwrap_or(0);
        let mut active = [raw; 6];
        let set = |active: &mut [usize; 6], classes: &[EncoderClass], enc: i32| {
            if let Some(i) = slot(enc) {
                for c in classes {
                    active[c.index()] = i;
                }
            }
        };

        match cp.preferred_encoding() {
            encoding::RRE => set(&mut active, &[BitmapRle, IndexedRle], encoding::RRE),
            encoding::HEXTILE => set(
                &mut active,
                &[BitmapRle, IndexedRle, FullColour],
                encoding::HEXTILE,
            ),
            encoding::TIGHT => set(
                &mut active,
                &[FullColour, Indexed, IndexedRle, Bitmap, BitmapRle],
                encoding::TIGHT,
            ),
            encoding::ZRLE => set(
                &mut active,
                &[FullColour, BitmapRle, IndexedRle, Bitmap, Indexed],
                encoding::ZRLE,
            ),
            _ => {}
        }

        let first_supported = |candidates: &[i32]| -> Option<usize> {
            candidates
                .iter()
                .filter_map(|&enc| slot(enc))
                .find(|&i| self.encoders[i].is_supported(cp))
        };

        let unassigned = |active: &[usize; 6], c: EncoderClass| active[c.index()] == raw;

        if unassigned(&active, FullColour) {
            if let Some(i) =
                first_supported(&[encoding::ZRLE, encoding::TIGHT, encoding::HEXTILE])
            {
                active[FullColour.index()] = i;
            }
        }
        if unassigned(&active, Indexed) {
            if let Some(i) =
                first_supported(&[encoding::ZRLE, encoding::TIGHT, encoding::HEXTILE])
            {
                active[Indexed.index()] = i;
            }
        }
        if unassigned(&active, IndexedRle) {
            active[IndexedRle.index()] = active[Indexed.index()];
        }
        if unassigned(&active, Bitmap) {
            active[Bitmap.index()] = active[Indexed.index()];
        }
        if unassigned(&active, BitmapRle) {
            active[BitmapRle.index()] = active[Bitmap.index()];
        }
        if unassigned(&active, Solid) {
            if let Some(i) = first_supported(&[
                encoding::TIGHT,
                encoding::RRE,
                encoding::ZRLE,
                encoding::HEXTILE,
            ]) {
                active[Solid.index()] = i;
            }
        }

        self.active = active;
        for i in active {
            self.encoders[i].set_compress_level(cp.compress_level);
        }
    }

    // ── CopyRect ─────────────────────────────────────────────────

    fn write_copy_rects(
        &mut self,
        copied: &Region,
        ui: &UpdateInfo,
        pb: &dyn PixelBuffer,
        os: &mut OutStream,
    ) {
        let delta = ui.copy_delta;
        let bpp = pb.pf().bytes_per_pixel() as u64;
        for r in copied.get_rects(delta.x <= 0, delta.y <= 0) {
            let before = os.len();
            message::write_copy_rect(os, &r, r.tl.x - delta.x, r.tl.y - delta.y);

            let area = r.area() as u64;
            self.copy_stats.rects += 1;
            self.copy_stats.pixels += area;
            self.copy_stats.bytes += (os.len() - before) as u64;
            self.copy_stats.equivalent += 12 + area * bpp;
        }
    }

    // ── Solid-area search ────────────────────────────────────────

    fn write_solid_rects(
        &mut self,
        changed: &mut Region,
        pb: &dyn PixelBuffer,
        cp: &ClientParams,
        os: &mut OutStream,
    ) -> Result<(), RfbError> {
        let rects = changed.rects().to_vec();
        dispatch_bpp!(pb.pf().bpp(), P => {
            for r in &rects {
                self.find_solid_rect::<P>(r, changed, pb, cp, os)?;
            }
        });
        Ok(())
    }

    /// Look for a solid area inside `rect`, send it, and search the
    /// remaining parts of `rect` the same way.
    fn find_solid_rect<P: Pixel>(
        &mut self,
        rect: &Rect,
        changed: &mut Region,
        pb: &dyn PixelBuffer,
        cp: &ClientParams,
        os: &mut OutStream,
    ) -> Result<(), RfbError> {
        let mut dy = rect.tl.y;
        while dy < rect.br.y {
            let dh = SOLID_SEARCH_BLOCK.min(rect.br.y - dy);

            let mut dx = rect.tl.x;
            while dx < rect.br.x {
                let dw = SOLID_SEARCH_BLOCK.min(rect.br.x - dx);
                let colour: P = pb.view(&Rect::from_xywh(dx, dy, 1, 1))?.pixel(0, 0);

                if !check_solid_tile(pb, &Rect::from_xywh(dx, dy, dw, dh), colour)? {
                    dx += SOLID_SEARCH_BLOCK;
                    continue;
                }

                let sr = Rect::from_xywh(dx, dy, rect.br.x - dx, rect.br.y - dy);
                let erb = extend_solid_area_by_block(pb, &sr, colour)?;

                let erp = if erb == *rect {
                    erb
                } else if erb.area() < SOLID_BLOCK_MIN_AREA {
                    dx += SOLID_SEARCH_BLOCK;
                    continue;
                } else {
                    extend_solid_area_by_pixel(pb, rect, &erb, colour)?
                };

                self.write_solid(&erp, pb, cp, colour, os)?;
                changed.assign_subtract(&Region::from(erp));

                // left of the area, below the strip already searched
                if erp.tl.x != rect.tl.x && erp.height() > SOLID_SEARCH_BLOCK {
                    let left = Rect::from_xywh(
                        rect.tl.x,
                        erp.tl.y + SOLID_SEARCH_BLOCK,
                        erp.tl.x - rect.tl.x,
                        erp.height() - SOLID_SEARCH_BLOCK,
                    );
                    self.find_solid_rect::<P>(&left, changed, pb, cp, os)?;
                }

                if erp.br.x != rect.br.x {
                    let right = Rect::from_xywh(
                        erp.br.x,
                        erp.tl.y,
                        rect.br.x - erp.br.x,
                        erp.height(),
                    );
                    self.find_solid_rect::<P>(&right, changed, pb, cp, os)?;
                }

                if erp.br.y != rect.br.y {
                    let below = Rect::from_xywh(
                        rect.tl.x,
                        erp.br.y,
                        rect.width(),
                        rect.br.y - erp.br.y,
                    );
                    self.find_solid_rect::<P>(&below, changed, pb, cp, os)?;
                }

                return Ok(());
            }
            dy += SOLID_SEARCH_BLOCK;
        }
        Ok(())
    }

    fn write_solid<P: Pixel>(
        &mut self,
        r: &Rect,
        pb: &dyn PixelBuffer,
        cp: &ClientParams,
        colour: P,
        os: &mut OutStream,
    ) -> Result<(), RfbError> {
        let idx = self.active[EncoderClass::Solid.index()];
        let encoder = &mut self.encoders[idx];
        let enc = encoder.encoding();

        let mut native = [0u8; 4];
        colour.store(&mut native);
        let mut converted = [0u8; 4];
        let (pf, bytes) = if encoder.flags().contains(EncoderFlags::USE_NATIVE_PF) {
            (pb.pf(), &native)
        } else {
            cp.pf.buffer_from_buffer(&mut converted, pb.pf(), &native, 1, 1, 1, 1);
            (&cp.pf, &converted)
        };

        let before = os.len();
        message::write_rect_header(os, r, enc);
        encoder.write_solid_rect(r.width() as usize, r.height() as usize, pf, bytes, os)?;

        record(
            &mut self.stats,
            (enc, EncoderClass::Solid),
            r,
            cp.pf.bytes_per_pixel(),
            os.len() - before,
        );
        Ok(())
    }

    // ── Normal rects ─────────────────────────────────────────────

    fn write_rects(
        &mut self,
        changed: &Region,
        pb: &dyn PixelBuffer,
        cp: &ClientParams,
        os: &mut OutStream,
    ) -> Result<(), RfbError> {
        for r in changed.rects() {
            for sr in split_rect(r) {
                self.write_sub_rect(&sr, pb, cp, os)?;
            }
        }
        Ok(())
    }

    fn write_sub_rect(
        &mut self,
        rect: &Rect,
        pb: &dyn PixelBuffer,
        cp: &ClientParams,
        os: &mut OutStream,
    ) -> Result<(), RfbError> {
        let area = rect.area() as usize;

        // higher compress levels spend less effort on palettes
        let divisor = match cp.compress_level {
            -1 => 2 * 8,
            level => level * 8,
        }
        .max(4) as usize;

        let mut max_colours = (area / divisor).max(2);
        for class in [EncoderClass::IndexedRle, EncoderClass::Indexed] {
            if let Some(limit) = self.encoders[self.active[class.index()]].max_palette_size() {
                max_colours = max_colours.min(limit);
            }
        }

        let native = pb.view(rect)?;
        let w = native.width();
        let h = native.height();
        let client = if cp.pf.is_equivalent(pb.pf()) {
            native
        } else {
            self.conv.resize(area * cp.pf.bytes_per_pixel(), 0);
            pb.get_image_pf(&cp.pf, &mut self.conv, rect, 0)?;
            PixelView::new(cp.pf, &self.conv, w, h, w)
        };

        self.palette = Palette::with_max(max_colours);
        let rle_runs =
            dispatch_bpp!(cp.pf.bpp(), P => analyse_rect::<P>(&client, &mut self.palette));
        let rle_runs = match rle_runs {
            Some(n) => n,
            None => {
                self.palette.clear();
                0
            }
        };

        // runs never exceed the area, so palette rects go to the RLE classes
        let use_rle = rle_runs <= area * 2;

        let class = match self.palette.size() {
            0 => EncoderClass::FullColour,
            1 => EncoderClass::Solid,
            2 if use_rle => EncoderClass::BitmapRle,
            2 => EncoderClass::Bitmap,
            _ if use_rle => EncoderClass::IndexedRle,
            _ => EncoderClass::Indexed,
        };

        let encoder = &mut self.encoders[self.active[class.index()]];
        let enc = encoder.encoding();
        let view = if encoder.flags().contains(EncoderFlags::USE_NATIVE_PF) {
            &native
        } else {
            &client
        };

        let before = os.len();
        message::write_rect_header(os, rect, enc);
        encoder.write_rect(view, &self.palette, os)?;

        record(
            &mut self.stats,
            (enc, class),
            rect,
            cp.pf.bytes_per_pixel(),
            os.len() - before,
        );
        Ok(())
    }
}

impl fmt::Debug for EncodeManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncodeManager")
            .field("updates", &self.updates)
            .field(
                "active",
                &EncoderClass::ALL
                    .iter()
                    .map(|&c| (c, encoding::name(self.active_encoding(c))))
                    .collect::<Vec<_>>(),
            )
            .finish()
    }
}

// ── Helpers ──────────────────────────────────────────────────────

fn slot(enc: i32) -> Option<usize> {
    ENCODABLE.iter().position(|&e| e == enc)
}

fn record(
    stats: &mut BTreeMap<(i32, EncoderClass), EncoderStats>,
    key: (i32, EncoderClass),
    r: &Rect,
    client_bpp: usize,
    bytes: usize,
) {
    let area = r.area() as u64;
    let s = stats.entry(key).or_default();
    s.rects += 1;
    s.pixels += area;
    s.bytes += bytes as u64;
    s.equivalent += 12 + area * client_bpp as u64;
}

/// Pieces `r` is cut into before encoding.
fn split_rect(r: &Rect) -> Vec<Rect> {
    let w = r.width();
    let h = r.height();
    if (w as i64) * (h as i64) < SUB_RECT_MAX_AREA && w < SUB_RECT_MAX_WIDTH {
        return vec![*r];
    }

    let sw = w.min(SUB_RECT_MAX_WIDTH);
    let sh = (SUB_RECT_MAX_AREA / sw as i64) as i32;

    let mut out = Vec::new();
    let mut y = r.tl.y;
    while y < r.br.y {
        let y2 = (y + sh).min(r.br.y);
        let mut x = r.tl.x;
        while x < r.br.x {
            let x2 = (x + sw).min(r.br.x);
            out.push(Rect::new(x, y, x2, y2));
            x += sw;
        }
        y += sh;
    }
    out
}

/// Number of rects [`split_rect`] produces over the whole region.
fn compute_num_rects(changed: &Region) -> usize {
    changed
        .rects()
        .iter()
        .map(|r| {
            let w = r.width();
            let h = r.height();
            if (w as i64) * (h as i64) < SUB_RECT_MAX_AREA && w < SUB_RECT_MAX_WIDTH {
                return 1;
            }
            let sw = w.min(SUB_RECT_MAX_WIDTH);
            let sh = (SUB_RECT_MAX_AREA / sw as i64) as i32;
            (((w + sw - 1) / sw) * ((h + sh - 1) / sh)) as usize
        })
        .sum()
}

/// Build the palette of `pb` and count its colour changes.
///
/// Returns `None` when `pb` has more colours than `palette` takes.
fn analyse_rect<P: Pixel>(pb: &PixelView<'_>, palette: &mut Palette) -> Option<usize> {
    palette.clear();
    if pb.area() == 0 {
        return Some(0);
    }

    let mut runs = 0;
    let mut colour: P = pb.pixel(0, 0);
    let mut count = 0u32;
    for y in 0..pb.height() {
        for x in 0..pb.width() {
            let p: P = pb.pixel(x, y);
            if p != colour {
                if !palette.insert(colour.to_u32(), count) {
                    return None;
                }
                runs += 1;
                colour = p;
                count = 0;
            }
            count += 1;
        }
    }
    if !palette.insert(colour.to_u32(), count) {
        return None;
    }
    Some(runs)
}

fn check_solid_tile<P: Pixel>(
    pb: &dyn PixelBuffer,
    r: &Rect,
    colour: P,
) -> Result<bool, RfbError> {
    let view = pb.view(r)?;
    Ok((0..view.height()).all(|y| (0..view.width()).all(|x| view.pixel::<P>(x, y) == colour)))
}

/// Grow a solid area from the top-left block of `r` one block at a
/// time, width first, keeping the largest area seen.
fn extend_solid_area_by_block<P: Pixel>(
    pb: &dyn PixelBuffer,
    r: &Rect,
    colour: P,
) -> Result<Rect, RfbError> {
    let mut w_prev = r.width();
    let mut w_best = 0;
    let mut h_best = 0;

    let mut dy = r.tl.y;
    while dy < r.br.y {
        let dh = SOLID_SEARCH_BLOCK.min(r.br.y - dy);

        let dw = SOLID_SEARCH_BLOCK.min(w_prev);
        if !check_solid_tile(pb, &Rect::from_xywh(r.tl.x, dy, dw, dh), colour)? {
            break;
        }

        let mut dx = r.tl.x + dw;
        while dx < r.tl.x + w_prev {
            let dw = SOLID_SEARCH_BLOCK.min(r.tl.x + w_prev - dx);
            if !check_solid_tile(pb, &Rect::from_xywh(dx, dy, dw, dh), colour)? {
                break;
            }
            dx += dw;
        }

        w_prev = dx - r.tl.x;
        let h = dy + dh - r.tl.y;
        if (w_prev as i64) * (h as i64) > (w_best as i64) * (h_best as i64) {
            w_best = w_prev;
            h_best = h;
        }
        dy += SOLID_SEARCH_BLOCK;
    }

    Ok(Rect::from_xywh(r.tl.x, r.tl.y, w_best, h_best))
}

/// Grow `sr` inside `r` one row or column at a time: up, down, left,
/// then right.
fn extend_solid_area_by_pixel<P: Pixel>(
    pb: &dyn PixelBuffer,
    r: &Rect,
    sr: &Rect,
    colour: P,
) -> Result<Rect, RfbError> {
    let mut er = *sr;

    let mut cy = sr.tl.y - 1;
    while cy >= r.tl.y
        && check_solid_tile(pb, &Rect::from_xywh(sr.tl.x, cy, sr.width(), 1), colour)?
    {
        cy -= 1;
    }
    er.tl.y = cy + 1;

    let mut cy = sr.br.y;
    while cy < r.br.y
        && check_solid_tile(pb, &Rect::from_xywh(sr.tl.x, cy, sr.width(), 1), colour)?
    {
        cy += 1;
    }
    er.br.y = cy;

    let mut cx = sr.tl.x - 1;
    while cx >= r.tl.x
        && check_solid_tile(pb, &Rect::from_xywh(cx, er.tl.y, 1, er.height()), colour)?
    {
        cx -= 1;
    }
    er.tl.x = cx + 1;

    let mut cx = sr.br.x;
    while cx < r.br.x
        && check_solid_tile(pb, &Rect::from_xywh(cx, er.tl.y, 1, er.height()), colour)?
    {
        cx += 1;
    }
    er.br.x = cx;

    Ok(er)
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Point;
    use crate::pixel::{ManagedPixelBuffer, ModifiablePixelBuffer, PixelFormat};

    fn manager() -> EncodeManager {
        EncodeManager::new(Span::none())
    }

    fn fb8(w: i32, h: i32, colour: u8) -> ManagedPixelBuffer {
        let mut fb = ManagedPixelBuffer::new(PixelFormat::BGR233, w, h);
        fb.fill_rect(&Rect::new(0, 0, w, h), &[colour]).unwrap();
        fb
    }

    fn changed(r: Rect) -> UpdateInfo {
        UpdateInfo {
            changed: Region::from(r),
            ..UpdateInfo::default()
        }
    }

    fn header_at(out: &[u8], at: usize) -> (Rect, i32) {
        let u = |i: usize| u16::from_be_bytes([out[at + i], out[at + i + 1]]) as i32;
        let enc = i32::from_be_bytes([out[at + 8], out[at + 9], out[at + 10], out[at + 11]]);
        (Rect::from_xywh(u(0), u(2), u(4), u(6)), enc)
    }

    #[test]
    fn split_limits_area_and_width() {
        assert_eq!(split_rect(&Rect::new(0, 0, 100, 100)).len(), 1);

        // 2048 wide is already too wide: 2048×32 strips
        let pieces = split_rect(&Rect::new(0, 0, 2048, 64));
        assert_eq!(pieces, vec![Rect::new(0, 0, 2048, 32), Rect::new(0, 32, 2048, 64)]);

        let r = Rect::new(10, 20, 5010, 120);
        let pieces = split_rect(&r);
        assert_eq!(pieces.len(), compute_num_rects(&Region::from(r)));
        assert!(pieces.iter().all(|p| p.area() <= SUB_RECT_MAX_AREA));
        assert!(pieces.iter().all(|p| p.width() <= SUB_RECT_MAX_WIDTH));
        assert_eq!(Region::from_rects(pieces), Region::from(r));
    }

    #[test]
    fn encoder_selection_follows_preference() {
        let mut em = manager();

        em.prepare_encoders(&ClientParams::default().with_encodings(&[encoding::HEXTILE]));
        assert_eq!(em.active_encoding(EncoderClass::FullColour), encoding::HEXTILE);
        assert_eq!(em.active_encoding(EncoderClass::Indexed), encoding::HEXTILE);
        assert_eq!(em.active_encoding(EncoderClass::Solid), encoding::HEXTILE);

        em.prepare_encoders(
            &ClientParams::default().with_encodings(&[encoding::RRE, encoding::ZRLE]),
        );
        assert_eq!(em.active_encoding(EncoderClass::BitmapRle), encoding::RRE);
        assert_eq!(em.active_encoding(EncoderClass::FullColour), encoding::ZRLE);
        assert_eq!(em.active_encoding(EncoderClass::Bitmap), encoding::ZRLE);
        assert_eq!(em.active_encoding(EncoderClass::Solid), encoding::RRE);

        em.prepare_encoders(
            &ClientParams::default().with_encodings(&[encoding::ZRLE, encoding::TIGHT]),
        );
        assert_eq!(em.active_encoding(EncoderClass::IndexedRle), encoding::ZRLE);
        assert_eq!(em.active_encoding(EncoderClass::Solid), encoding::TIGHT);

        em.prepare_encoders(&ClientParams::default());
        for c in EncoderClass::ALL {
            assert_eq!(em.active_encoding(c), encoding::RAW);
        }
    }

    #[test]
    fn raw_update_with_counted_rects() {
        let mut fb = fb8(8, 8, 0);
        fb.fill_rect(&Rect::new(2, 2, 4, 3), &[9]).unwrap();
        let cp = ClientParams::new(PixelFormat::BGR233, 8, 8);
        let mut os = OutStream::new();
        let mut em = manager();
        em.write_update(&changed(Rect::new(2, 2, 4, 4)), &fb, &cp, &mut os)
            .unwrap();

        let out = os.as_slice();
        assert_eq!(&out[..4], &[0, 0, 0, 1]);
        assert_eq!(header_at(out, 4), (Rect::new(2, 2, 4, 4), encoding::RAW));
        assert_eq!(&out[16..], &[9, 9, 0, 0]);
        assert_eq!(em.updates(), 1);
    }

    #[test]
    fn solid_area_sent_with_last_rect() {
        let fb = fb8(64, 64, 0x2A);
        let cp = ClientParams::new(PixelFormat::BGR233, 64, 64)
            .with_encodings(&[encoding::HEXTILE, encoding::LAST_RECT]);
        let mut os = OutStream::new();
        let mut em = manager();
        em.write_update(&changed(Rect::new(0, 0, 64, 64)), &fb, &cp, &mut os)
            .unwrap();

        let out = os.as_slice();
        assert_eq!(&out[..4], &[0, 0, 0xFF, 0xFF]);
        assert_eq!(header_at(out, 4), (Rect::new(0, 0, 64, 64), encoding::HEXTILE));
        // 16 tiles: bg on the first, empty flags on the rest
        assert_eq!(&out[16..18], &[2, 0x2A]);
        assert_eq!(out.len(), 16 + 2 + 15 + 12);
        assert_eq!(header_at(out, out.len() - 12).1, encoding::LAST_RECT);

        let solid: Vec<_> = em.stats().collect();
        assert_eq!(solid.len(), 1);
        assert_eq!(solid[0].0, encoding::HEXTILE);
        assert_eq!(solid[0].1, EncoderClass::Solid);
        assert_eq!(solid[0].2.pixels, 64 * 64);
    }

    #[test]
    fn solid_search_leaves_the_rest_to_normal_encoders() {
        // 64×64 of colour 1 with a noisy 64×8 strip at the bottom
        let mut fb = fb8(64, 72, 1);
        for x in 0..64 {
            fb.fill_rect(&Rect::new(x, 64, x + 1, 72), &[(x % 7) as u8 + 2])
                .unwrap();
        }
        let cp = ClientParams::new(PixelFormat::BGR233, 64, 72)
            .with_encodings(&[encoding::RAW, encoding::LAST_RECT]);
        let mut os = OutStream::new();
        let mut em = manager();
        em.write_update(&changed(Rect::new(0, 0, 64, 72)), &fb, &cp, &mut os)
            .unwrap();

        let out = os.as_slice();
        assert_eq!(header_at(out, 4), (Rect::new(0, 0, 64, 64), encoding::RAW));
        let next = 16 + 64 * 64;
        assert_eq!(header_at(out, next), (Rect::new(0, 64, 64, 72), encoding::RAW));
        assert_eq!(out.len(), next + 12 + 64 * 8 + 12);
    }

    #[test]
    fn copy_rects_reference_their_source() {
        let fb = fb8(32, 32, 0);
        let ui = UpdateInfo {
            changed: Region::new(),
            copied: Region::from_rects([Rect::new(10, 4, 20, 8), Rect::new(10, 10, 20, 14)]),
            copy_delta: Point::new(5, 2),
        };
        let cp = ClientParams::new(PixelFormat::BGR233, 32, 32)
            .with_encodings(&[encoding::COPY_RECT]);
        let mut os = OutStream::new();
        let mut em = manager();
        em.write_update(&ui, &fb, &cp, &mut os).unwrap();

        let out = os.as_slice();
        assert_eq!(&out[..4], &[0, 0, 0, 2]);
        // moving down: bottom band first
        assert_eq!(header_at(out, 4), (Rect::new(10, 10, 20, 14), encoding::COPY_RECT));
        assert_eq!(&out[16..20], &[0, 5, 0, 8]);
        assert_eq!(header_at(out, 20), (Rect::new(10, 4, 20, 8), encoding::COPY_RECT));
        assert_eq!(&out[32..36], &[0, 5, 0, 2]);
        assert_eq!(em.copy_stats().rects, 2);
    }

    #[test]
    fn copies_become_changes_without_copy_rect() {
        let fb = fb8(16, 16, 3);
        let ui = UpdateInfo {
            changed: Region::new(),
            copied: Region::from(Rect::new(0, 0, 4, 4)),
            copy_delta: Point::new(1, 1),
        };
        let cp = ClientParams::new(PixelFormat::BGR233, 16, 16);
        let mut os = OutStream::new();
        manager().write_update(&ui, &fb, &cp, &mut os).unwrap();

        let out = os.as_slice();
        assert_eq!(&out[..4], &[0, 0, 0, 1]);
        assert_eq!(header_at(out, 4).1, encoding::RAW);
        assert_eq!(out.len(), 16 + 16);
    }

    #[test]
    fn palette_analysis_picks_class() {
        let mut fb = fb8(64, 64, 0);
        fb.fill_rect(&Rect::new(0, 0, 64, 32), &[7]).unwrap();
        let cp = ClientParams::new(PixelFormat::BGR233, 64, 64)
            .with_encodings(&[encoding::ZRLE]);
        let mut os = OutStream::new();
        let mut em = manager();
        em.write_update(&changed(Rect::new(0, 0, 64, 64)), &fb, &cp, &mut os)
            .unwrap();

        let keys: Vec<_> = em.stats().map(|(e, c, _)| (e, c)).collect();
        assert_eq!(keys, vec![(encoding::ZRLE, EncoderClass::BitmapRle)]);
    }

    #[test]
    fn busy_two_colour_rect_still_uses_rle() {
        // a checkerboard changes colour on every pixel
        let checker: Vec<u8> = (0..64 * 64).map(|i| ((i % 64 + i / 64) % 2 * 7) as u8).collect();
        let mut fb = fb8(64, 64, 0);
        fb.image_rect(&Rect::new(0, 0, 64, 64), &checker, 0).unwrap();
        let cp = ClientParams::new(PixelFormat::BGR233, 64, 64)
            .with_encodings(&[encoding::RRE, encoding::HEXTILE]);
        let mut os = OutStream::new();
        let mut em = manager();
        em.write_update(&changed(Rect::new(0, 0, 64, 64)), &fb, &cp, &mut os)
            .unwrap();

        let keys: Vec<_> = em.stats().map(|(e, c, _)| (e, c)).collect();
        assert_eq!(keys, vec![(encoding::RRE, EncoderClass::BitmapRle)]);
    }

    #[test]
    fn analysis_counts_runs_and_overflows() {
        let data = [1u8, 1, 2, 2, 3, 3];
        let pb = PixelView::new(PixelFormat::BGR233, &data, 6, 1, 6);

        let mut pal = Palette::with_max(3);
        assert_eq!(analyse_rect::<u8>(&pb, &mut pal), Some(2));
        assert_eq!(pal.size(), 3);

        let mut pal = Palette::with_max(2);
        assert_eq!(analyse_rect::<u8>(&pb, &mut pal), None);
    }

    #[test]
    fn client_format_conversion() {
        let mut fb = ManagedPixelBuffer::new(PixelFormat::RGB888, 2, 1);
        let red = PixelFormat::RGB888.pixel_from_rgb(255, 0, 0);
        fb.fill_rect_pf(&PixelFormat::RGB888, &Rect::new(0, 0, 2, 1), red)
            .unwrap();
        let cp = ClientParams::new(PixelFormat::RGB565, 2, 1);
        let mut os = OutStream::new();
        manager()
            .write_update(&changed(Rect::new(0, 0, 2, 1)), &fb, &cp, &mut os)
            .unwrap();

        let mut px = [0u8; 2];
        let red565 = PixelFormat::RGB565.pixel_from_rgb(255, 0, 0);
        PixelFormat::RGB565.buffer_from_pixel(&mut px, red565);
        assert_eq!(&os.as_slice()[16..], &[px[0], px[1], px[0], px[1]]);
    }
}

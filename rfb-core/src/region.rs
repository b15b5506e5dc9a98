//! Banded rectangle regions.
//!
//! A [`Region`] is a point set stored as y-x banded rectangles, the
//! representation X11 and pixman use:
//!
//! ```text
//! band 0   [x1,x2) [x3,x4)        rows y0..y1
//! band 1   [x1,x2)                rows y1..y2
//! band 2   [x5,x6) [x7,x8) ...    rows y3..y4   (gap above allowed)
//! ```
//!
//! Every rect of a band shares the band's `tl.y`/`br.y`. Bands are
//! sorted top to bottom and never overlap; spans within a band are
//! sorted, disjoint and non-touching. Two vertically adjacent bands
//! never carry identical spans (they would have been coalesced), so
//! a point set has exactly one representation and `==` is structural.

use std::cmp::{max, min};

use crate::geometry::{Point, Rect};

// ── Region ───────────────────────────────────────────────────────

/// A set of pixels stored as canonical, non-overlapping rectangles.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Region {
    rects: Vec<Rect>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Union,
    Intersect,
    Subtract,
}

impl Region {
    /// The empty region.
    pub fn new() -> Self {
        Self::default()
    }

    /// Union of an arbitrary, possibly overlapping, set of rects.
    pub fn from_rects<I: IntoIterator<Item = Rect>>(rects: I) -> Self {
        let mut region = Region::new();
        for r in rects {
            region.assign_union(&Region::from(r));
        }
        region
    }

    pub fn clear(&mut self) {
        self.rects.clear();
    }

    /// Replace the contents with a single rect.
    pub fn reset(&mut self, r: Rect) {
        self.rects.clear();
        if !r.is_empty() {
            self.rects.push(r);
        }
    }

    pub fn translate(&mut self, delta: Point) {
        for r in &mut self.rects {
            *r = r.translate(delta);
        }
    }

    /// Translated copy.
    pub fn translated(&self, delta: Point) -> Region {
        let mut r = self.clone();
        r.translate(delta);
        r
    }

    pub fn assign_intersect(&mut self, other: &Region) {
        *self = self.intersect(other);
    }

    pub fn assign_union(&mut self, other: &Region) {
        *self = self.union(other);
    }

    pub fn assign_subtract(&mut self, other: &Region) {
        *self = self.subtract(other);
    }

    pub fn intersect(&self, other: &Region) -> Region {
        if self.is_empty() || other.is_empty() {
            return Region::new();
        }
        region_op(self, other, Op::Intersect)
    }

    pub fn union(&self, other: &Region) -> Region {
        if self.is_empty() {
            return other.clone();
        }
        if other.is_empty() {
            return self.clone();
        }
        region_op(self, other, Op::Union)
    }

    pub fn subtract(&self, other: &Region) -> Region {
        if self.is_empty() || other.is_empty() {
            return self.clone();
        }
        region_op(self, other, Op::Subtract)
    }

    pub fn is_empty(&self) -> bool {
        self.rects.is_empty()
    }

    pub fn num_rects(&self) -> usize {
        self.rects.len()
    }

    /// Canonical rects, top-down and left-to-right.
    pub fn rects(&self) -> &[Rect] {
        &self.rects
    }

    /// Total pixel count.
    pub fn area(&self) -> i64 {
        self.rects.iter().map(Rect::area).sum()
    }

    /// Rects in one of four traversal orders.
    ///
    /// Bands are walked top-down or bottom-up; rects within a band stay
    /// together and are ordered by x in the requested direction. This
    /// is the order CopyRect needs so that overlapping moves never
    /// read pixels that an earlier rect already overwrote.
    pub fn get_rects(&self, left_to_right: bool, top_down: bool) -> Vec<Rect> {
        let mut out = Vec::with_capacity(self.rects.len());
        let mut bands = band_ranges(&self.rects);
        if !top_down {
            bands.reverse();
        }
        for (start, end) in bands {
            let band = &self.rects[start..end];
            if left_to_right {
                out.extend_from_slice(band);
            } else {
                out.extend(band.iter().rev());
            }
        }
        out
    }

    /// Smallest rect enclosing the region, empty for an empty region.
    pub fn bounding_rect(&self) -> Rect {
        let (Some(first), Some(last)) = (self.rects.first(), self.rects.last()) else {
            return Rect::default();
        };
        let mut x1 = first.tl.x;
        let mut x2 = first.br.x;
        for (start, end) in band_ranges(&self.rects) {
            x1 = min(x1, self.rects[start].tl.x);
            x2 = max(x2, self.rects[end - 1].br.x);
        }
        Rect::new(x1, first.tl.y, x2, last.br.y)
    }
}

impl From<Rect> for Region {
    fn from(r: Rect) -> Self {
        let mut region = Region::new();
        region.reset(r);
        region
    }
}

// ── Band machinery ───────────────────────────────────────────────

/// `[start, end)` index ranges of the bands in a canonical rect list.
fn band_ranges(rects: &[Rect]) -> Vec<(usize, usize)> {
    let mut out = Vec::new();
    let mut start = 0;
    for i in 1..=rects.len() {
        if i == rects.len() || rects[i].tl.y != rects[start].tl.y {
            out.push((start, i));
            start = i;
        }
    }
    out
}

type Span = (i32, i32);

fn spans_of(band: &[Rect]) -> Vec<Span> {
    band.iter().map(|r| (r.tl.x, r.br.x)).collect()
}

fn combine_spans(a: &[Span], b: &[Span], op: Op) -> Vec<Span> {
    match op {
        Op::Union => {
            let mut all: Vec<Span> = a.iter().chain(b.iter()).copied().collect();
            all.sort_unstable();
            let mut out: Vec<Span> = Vec::with_capacity(all.len());
            for s in all {
                match out.last_mut() {
                    Some(last) if s.0 <= last.1 => last.1 = max(last.1, s.1),
                    _ => out.push(s),
                }
            }
            out
        }
        Op::Intersect => {
            let mut out = Vec::new();
            let (mut i, mut j) = (0, 0);
            while i < a.len() && j < b.len() {
                let x1 = max(a[i].0, b[j].0);
                let x2 = min(a[i].1, b[j].1);
                if x1 < x2 {
                    out.push((x1, x2));
                }
                if a[i].1 < b[j].1 {
                    i += 1;
                } else {
                    j += 1;
                }
            }
            out
        }
        Op::Subtract => {
            let mut out = Vec::new();
            let mut j = 0;
            for &(mut x1, x2) in a {
                while j < b.len() && b[j].1 <= x1 {
                    j += 1;
                }
                let mut k = j;
                while k < b.len() && b[k].0 < x2 {
                    if b[k].0 > x1 {
                        out.push((x1, b[k].0));
                    }
                    x1 = max(x1, b[k].1);
                    if x1 >= x2 {
                        break;
                    }
                    k += 1;
                }
                if x1 < x2 {
                    out.push((x1, x2));
                }
            }
            out
        }
    }
}

/// Accumulates output bands, coalescing identical neighbours.
struct Builder {
    rects: Vec<Rect>,
    last_band: usize,
}

impl Builder {
    fn new() -> Self {
        Self {
            rects: Vec::new(),
            last_band: 0,
        }
    }

    fn push_band(&mut self, y1: i32, y2: i32, spans: &[Span]) {
        if spans.is_empty() {
            return;
        }
        let prev = &mut self.rects[self.last_band..];
        let mergeable = !prev.is_empty()
            && prev[0].br.y == y1
            && prev.len() == spans.len()
            && prev
                .iter()
                .zip(spans)
                .all(|(r, s)| r.tl.x == s.0 && r.br.x == s.1);
        if mergeable {
            for r in prev {
                r.br.y = y2;
            }
            return;
        }
        self.last_band = self.rects.len();
        self.rects
            .extend(spans.iter().map(|&(x1, x2)| Rect::new(x1, y1, x2, y2)));
    }
}

fn region_op(a: &Region, b: &Region, op: Op) -> Region {
    let a_bands = band_ranges(&a.rects);
    let b_bands = band_ranges(&b.rects);

    let mut ys: Vec<i32> = a_bands
        .iter()
        .map(|&(s, _)| &a.rects[s])
        .chain(b_bands.iter().map(|&(s, _)| &b.rects[s]))
        .flat_map(|r| [r.tl.y, r.br.y])
        .collect();
    ys.sort_unstable();
    ys.dedup();

    let mut out = Builder::new();
    let (mut ia, mut ib) = (0, 0);
    let empty: Vec<Span> = Vec::new();

    for w in ys.windows(2) {
        let (y1, y2) = (w[0], w[1]);

        while ia < a_bands.len() && a.rects[a_bands[ia].0].br.y <= y1 {
            ia += 1;
        }
        while ib < b_bands.len() && b.rects[b_bands[ib].0].br.y <= y1 {
            ib += 1;
        }

        let a_spans = match a_bands.get(ia) {
            Some(&(s, e)) if a.rects[s].tl.y <= y1 => spans_of(&a.rects[s..e]),
            _ => empty.clone(),
        };
        let b_spans = match b_bands.get(ib) {
            Some(&(s, e)) if b.rects[s].tl.y <= y1 => spans_of(&b.rects[s..e]),
            _ => empty.clone(),
        };

        if a_spans.is_empty() && (op != Op::Union || b_spans.is_empty()) {
            continue;
        }

        let spans = combine_spans(&a_spans, &b_spans, op);
        out.push_band(y1, y2, &spans);
    }

    Region { rects: out.rects }
}

// ── Tests ────────────────────────────────────────────────────────

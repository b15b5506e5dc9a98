//! Point and rectangle value types.
//!
//! A [`Rect`] is half-open: `tl` is inside, `br` is one past the last
//! column and row. Every operation is total; empty rects propagate
//! instead of failing.

use std::cmp::{max, min};
use std::fmt;

// ── Point ────────────────────────────────────────────────────────

/// A position or displacement in framebuffer coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

impl Point {
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    pub const fn negate(self) -> Self {
        Self::new(-self.x, -self.y)
    }

    pub const fn translate(self, delta: Point) -> Self {
        Self::new(self.x + delta.x, self.y + delta.y)
    }

    pub const fn subtract(self, other: Point) -> Self {
        Self::new(self.x - other.x, self.y - other.y)
    }
}

impl fmt::Display for Point {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({},{})", self.x, self.y)
    }
}

// ── Rect ─────────────────────────────────────────────────────────

/// An axis-aligned rectangle `[tl, br)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Rect {
    pub tl: Point,
    pub br: Point,
}

impl Rect {
    /// Rectangle from its two corners.
    pub const fn new(x1: i32, y1: i32, x2: i32, y2: i32) -> Self {
        Self {
            tl: Point::new(x1, y1),
            br: Point::new(x2, y2),
        }
    }

    /// Rectangle from origin and size, the way the wire carries it.
    pub const fn from_xywh(x: i32, y: i32, w: i32, h: i32) -> Self {
        Self::new(x, y, x + w, y + h)
    }

    pub fn set_xywh(&mut self, x: i32, y: i32, w: i32, h: i32) {
        *self = Self::from_xywh(x, y, w, h);
    }

    /// Overlapping part of `self` and `r`. Never inverted: when the two
    /// do not meet the result is an empty rect anchored at the
    /// clamped top-left.
    pub fn intersect(&self, r: &Rect) -> Rect {
        let tl = Point::new(max(self.tl.x, r.tl.x), max(self.tl.y, r.tl.y));
        let br = Point::new(
            max(min(self.br.x, r.br.x), tl.x),
            max(min(self.br.y, r.br.y), tl.y),
        );
        Rect { tl, br }
    }

    /// Bounding box of both. An empty operand contributes nothing.
    pub fn union_boundary(&self, r: &Rect) -> Rect {
        if r.is_empty() {
            return *self;
        }
        if self.is_empty() {
            return *r;
        }
        Rect::new(
            min(self.tl.x, r.tl.x),
            min(self.tl.y, r.tl.y),
            max(self.br.x, r.br.x),
            max(self.br.y, r.br.y),
        )
    }

    pub fn translate(&self, delta: Point) -> Rect {
        Rect {
            tl: self.tl.translate(delta),
            br: self.br.translate(delta),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tl.x >= self.br.x || self.tl.y >= self.br.y
    }

    pub fn clear(&mut self) {
        *self = Rect::default();
    }

    /// Whether `self` lies entirely inside `r`.
    pub fn enclosed_by(&self, r: &Rect) -> bool {
        self.tl.x >= r.tl.x && self.tl.y >= r.tl.y && self.br.x <= r.br.x && self.br.y <= r.br.y
    }

    pub fn overlaps(&self, r: &Rect) -> bool {
        self.tl.x < r.br.x && self.tl.y < r.br.y && self.br.x > r.tl.x && self.br.y > r.tl.y
    }

    /// Pixel count, zero for empty rects.
    pub fn area(&self) -> i64 {
        if self.is_empty() {
            0
        } else {
            self.width() as i64 * self.height() as i64
        }
    }

    pub fn width(&self) -> i32 {
        self.br.x - self.tl.x
    }

    pub fn height(&self) -> i32 {
        self.br.y - self.tl.y
    }

    pub fn dimensions(&self) -> Point {
        Point::new(self.width(), self.height())
    }

    pub fn contains(&self, p: Point) -> bool {
        self.tl.x <= p.x && self.tl.y <= p.y && self.br.x > p.x && self.br.y > p.y
    }
}

impl fmt::Display for Rect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}x{} at {}",
            self.width(),
            self.height(),
            self.tl
        )
    }
}

// ── Tests ────────────────────────────────────────────────────────

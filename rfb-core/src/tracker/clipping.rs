//! Tracker adaptor that clips to the visible framebuffer.

use crate::geometry::{Point, Rect};
use crate::region::Region;
use crate::tracker::UpdateTracker;

/// Clips changes and copies to `clip` before passing them on.
///
/// A copy whose source lies partly outside the clip cannot be replayed
/// by the client for that part, so the part is forwarded as changed.
#[derive(Debug, Clone)]
pub struct ClippingUpdateTracker<T> {
    inner: T,
    clip: Rect,
}

impl<T: UpdateTracker> ClippingUpdateTracker<T> {
    pub fn new(inner: T, clip: Rect) -> Self {
        Self { inner, clip }
    }

    pub fn set_clip_rect(&mut self, clip: Rect) {
        self.clip = clip;
    }

    pub fn clip_rect(&self) -> Rect {
        self.clip
    }

    pub fn inner(&self) -> &T {
        &self.inner
    }

    pub fn inner_mut(&mut self) -> &mut T {
        &mut self.inner
    }

    pub fn into_inner(self) -> T {
        self.inner
    }
}

impl<T: UpdateTracker> UpdateTracker for ClippingUpdateTracker<T> {
    fn add_changed(&mut self, region: &Region) {
        let clip = Region::from(self.clip);
        self.inner.add_changed(&region.intersect(&clip));
    }

    fn add_copied(&mut self, dest: &Region, delta: Point) {
        let clip = Region::from(self.clip);
        let clip_dest = dest.intersect(&clip);
        if clip_dest.is_empty() {
            return;
        }

        // the part of the copy whose source is on screen
        let mut valid = clip_dest.translated(delta.negate());
        valid.assign_intersect(&clip);
        if !valid.is_empty() {
            valid.translate(delta);
            self.inner.add_copied(&valid, delta);
        }

        let rest = clip_dest.subtract(&valid);
        if !rest.is_empty() {
            self.inner.add_changed(&rest);
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::SimpleUpdateTracker;

    fn r(x1: i32, y1: i32, x2: i32, y2: i32) -> Region {
        Region::from(Rect::new(x1, y1, x2, y2))
    }

    #[test]
    fn changes_are_clipped() {
        let mut t =
            ClippingUpdateTracker::new(SimpleUpdateTracker::new(), Rect::new(0, 0, 100, 100));
        t.add_changed(&r(90, 90, 120, 120));
        assert_eq!(t.inner().changed(), &r(90, 90, 100, 100));
    }

    #[test]
    fn offscreen_source_becomes_change() {
        let mut t =
            ClippingUpdateTracker::new(SimpleUpdateTracker::new(), Rect::new(0, 0, 100, 100));
        // moved right by 20: the left 20 columns came from x < 0
        t.add_copied(&r(0, 0, 50, 10), Point::new(20, 0));
        assert_eq!(t.inner().copied(), &r(20, 0, 50, 10));
        assert_eq!(t.inner().changed(), &r(0, 0, 20, 10));
    }

    #[test]
    fn fully_offscreen_dest_is_dropped() {
        let mut t =
            ClippingUpdateTracker::new(SimpleUpdateTracker::new(), Rect::new(0, 0, 100, 100));
        t.add_copied(&r(200, 200, 210, 210), Point::new(1, 1));
        assert!(t.inner().is_empty());
        t.set_clip_rect(Rect::new(0, 0, 300, 300));
        t.add_copied(&r(200, 200, 210, 210), Point::new(1, 1));
        assert_eq!(t.into_inner().copied(), &r(200, 200, 210, 210));
    }
}

//! The basic change/copy merging tracker.

use crate::geometry::{Point, Rect};
use crate::region::Region;
use crate::tracker::{UpdateInfo, UpdateTracker};

/// Accumulates changes and a single copy for one client.
#[derive(Debug, Clone, Default)]
pub struct SimpleUpdateTracker {
    changed: Region,
    copied: Region,
    copy_delta: Point,
}

impl SimpleUpdateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget a region, e.g. because it was sent by other means.
    pub fn subtract(&mut self, region: &Region) {
        self.copied.assign_subtract(region);
        self.changed.assign_subtract(region);
    }

    /// The pending update clipped to `clip`.
    ///
    /// Anything both copied and changed is reported as changed only.
    pub fn get_update_info(&mut self, clip: &Region) -> UpdateInfo {
        self.copied.assign_subtract(&self.changed);
        UpdateInfo {
            changed: self.changed.intersect(clip),
            copied: self.copied.intersect(clip),
            copy_delta: self.copy_delta,
        }
    }

    /// Replay the pending state into another tracker.
    pub fn copy_to(&self, to: &mut dyn UpdateTracker) {
        if !self.copied.is_empty() {
            to.add_copied(&self.copied, self.copy_delta);
        }
        if !self.changed.is_empty() {
            to.add_changed(&self.changed);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.copied.is_empty()
    }

    /// Reset after an update has been sent.
    pub fn clear(&mut self) {
        self.changed.clear();
        self.copied.clear();
        self.copy_delta = Point::default();
    }

    pub fn changed(&self) -> &Region {
        &self.changed
    }

    pub fn copied(&self) -> &Region {
        &self.copied
    }

    pub fn copy_delta(&self) -> Point {
        self.copy_delta
    }

    pub(crate) fn set_changed(&mut self, changed: Region) {
        self.changed = changed;
    }
}

impl UpdateTracker for SimpleUpdateTracker {
    fn add_changed(&mut self, region: &Region) {
        self.changed.assign_union(region);
    }

    fn add_copied(&mut self, dest: &Region, delta: Point) {
        if dest.is_empty() {
            return;
        }

        // can any of this continue the pending copy?
        let src = dest.translated(delta.negate());
        let mut overlap = src.intersect(&self.copied);

        if overlap.is_empty() {
            let new_br: Rect = dest.bounding_rect();
            let old_br: Rect = self.copied.bounding_rect();
            if old_br.area() > new_br.area() {
                // keep the (probably) bigger existing copy
                self.changed.assign_union(dest);
            } else {
                // source pixels still waiting to be sent land changed
                let invalid_src = src.intersect(&self.changed).translated(delta);
                self.changed.assign_union(&invalid_src);
                self.changed.assign_union(&self.copied.clone());
                self.copied = dest.clone();
                self.copy_delta = delta;
            }
            return;
        }

        let invalid_src = overlap.intersect(&self.changed).translated(delta);
        self.changed.assign_union(&invalid_src);

        overlap.translate(delta);
        let not_chained = dest.union(&self.copied).subtract(&overlap);
        self.changed.assign_union(&not_chained);

        self.copied = overlap;
        self.copy_delta = self.copy_delta.translate(delta);
    }
}

// ── Tests ────────────────────────────────────────────────────────

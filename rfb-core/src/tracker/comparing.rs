//! Pixel-comparing tracker.
//!
//! Capture backends often report far more than actually changed (whole
//! windows, whole screens). [`ComparingUpdateTracker`] keeps a shadow
//! copy of the framebuffer and, before each update, shrinks the changed
//! region to what really differs.
//!
//! Each changed rect is walked in 64×64 blocks. Inside a block the
//! change is trimmed to the first and last differing rows, then to
//! 8-pixel column groups from the left and right edges. The shadow is
//! refreshed for the trimmed area only.

use tracing::info;

use crate::error::RfbError;
use crate::geometry::{Point, Rect};
use crate::pixel::{ManagedPixelBuffer, ModifiablePixelBuffer, PixelBuffer};
use crate::region::Region;
use crate::tracker::{SimpleUpdateTracker, UpdateInfo, UpdateTracker};

const BLOCK_SIZE: i32 = 64;
/// Column granularity when trimming the left and right edges.
const MIN_COMPARE_WIDTH: i32 = BLOCK_SIZE / 8;

pub struct ComparingUpdateTracker {
    inner: SimpleUpdateTracker,
    old_fb: ManagedPixelBuffer,
    first_compare: bool,
    enabled: bool,
    total_pixels: u64,
    missed_pixels: u64,
}

impl ComparingUpdateTracker {
    /// A tracker for `fb`, which starts out entirely changed.
    pub fn new(fb: &dyn PixelBuffer) -> Self {
        let mut inner = SimpleUpdateTracker::new();
        inner.add_changed(&Region::from(fb.rect()));
        Self {
            inner,
            old_fb: ManagedPixelBuffer::new(*fb.pf(), 0, 0),
            first_compare: true,
            enabled: true,
            total_pixels: 0,
            missed_pixels: 0,
        }
    }

    /// Filter the changed region against the shadow copy of `fb`.
    ///
    /// Returns whether the changed region was modified. The first call
    /// after construction or [`disable`](Self::disable) only takes the
    /// snapshot.
    pub fn compare(&mut self, fb: &dyn PixelBuffer) -> Result<bool, RfbError> {
        if !self.enabled {
            return Ok(false);
        }

        if self.first_compare {
            self.old_fb = ManagedPixelBuffer::new(*fb.pf(), fb.width(), fb.height());
            let mut y = 0;
            while y < fb.height() {
                let pos = Rect::new(0, y, fb.width(), fb.height().min(y + BLOCK_SIZE));
                let (src, stride) = fb.get_buffer(&pos)?;
                self.old_fb.image_rect(&pos, src, stride)?;
                y += BLOCK_SIZE;
            }
            self.first_compare = false;
            return Ok(false);
        }

        let delta = self.inner.copy_delta();
        for r in self.inner.copied().get_rects(delta.x <= 0, delta.y <= 0) {
            self.old_fb.copy_rect(&r, delta)?;
        }

        let mut new_changed = Region::new();
        for r in self.inner.changed().rects().to_vec() {
            self.compare_rect(fb, &r, &mut new_changed)?;
        }

        self.total_pixels += self.inner.changed().area() as u64;
        self.missed_pixels += new_changed.area() as u64;

        if *self.inner.changed() == new_changed {
            return Ok(false);
        }
        self.inner.set_changed(new_changed);
        Ok(true)
    }

    pub fn enable(&mut self) {
        self.enabled = true;
    }

    /// Stop filtering. The shadow is re-taken when re-enabled.
    pub fn disable(&mut self) {
        self.enabled = false;
        self.first_compare = true;
    }

    pub fn get_update_info(&mut self, clip: &Region) -> UpdateInfo {
        self.inner.get_update_info(clip)
    }

    pub fn clear(&mut self) {
        self.inner.clear();
    }

    pub fn subtract(&mut self, region: &Region) {
        self.inner.subtract(region);
    }

    pub fn tracker(&self) -> &SimpleUpdateTracker {
        &self.inner
    }

    /// Log and reset the in/out pixel counters.
    pub fn log_stats(&mut self) {
        let ratio = if self.missed_pixels == 0 {
            f64::INFINITY
        } else {
            self.total_pixels as f64 / self.missed_pixels as f64
        };
        info!(
            pixels_in = self.total_pixels,
            pixels_out = self.missed_pixels,
            "compare ratio 1:{ratio:.3}"
        );
        self.total_pixels = 0;
        self.missed_pixels = 0;
    }

    fn compare_rect(
        &mut self,
        fb: &dyn PixelBuffer,
        r: &Rect,
        new_changed: &mut Region,
    ) -> Result<(), RfbError> {
        if !r.enclosed_by(&fb.rect()) {
            let safe = r.intersect(&fb.rect());
            if !safe.is_empty() {
                self.compare_rect(fb, &safe, new_changed)?;
            }
            return Ok(());
        }

        let bpp = fb.pf().bytes_per_pixel();
        let mut block_top = r.tl.y;
        while block_top < r.br.y {
            let block_bottom = r.br.y.min(block_top + BLOCK_SIZE);
            let mut block_left = r.tl.x;
            while block_left < r.br.x {
                let block_right = r.br.x.min(block_left + BLOCK_SIZE);
                let block = Rect::new(block_left, block_top, block_right, block_bottom);
                if let Some(change) = self.compare_block(fb, &block, bpp)? {
                    new_changed.assign_union(&Region::from(change));
                }
                block_left += BLOCK_SIZE;
            }
            block_top += BLOCK_SIZE;
        }
        Ok(())
    }

    /// The trimmed changed area of one block, copied into the shadow.
    fn compare_block(
        &mut self,
        fb: &dyn PixelBuffer,
        block: &Rect,
        bpp: usize,
    ) -> Result<Option<Rect>, RfbError> {
        let (new, new_stride) = fb.get_buffer(block)?;
        let (old, old_stride) = self.old_fb.get_buffer_rw(block)?;
        let w = block.width() as usize * bpp;
        let h = block.height() as usize;
        let new_row = |y: usize, x: usize, n: usize| &new[y * new_stride * bpp + x..][..n];

        let Some(first) =
            (0..h).find(|&y| old[y * old_stride * bpp..][..w] != *new_row(y, 0, w))
        else {
            return Ok(None);
        };

        let mut change_height = h - first;
        while change_height > 1 {
            let y = first + change_height - 1;
            if old[y * old_stride * bpp..][..w] != *new_row(y, 0, w) {
                break;
            }
            change_height -= 1;
        }

        let col_same = |old: &[u8], px: i32| -> bool {
            let x = px as usize * bpp;
            let n = MIN_COMPARE_WIDTH as usize * bpp;
            (first..first + change_height)
                .all(|y| old[y * old_stride * bpp + x..][..n] == *new_row(y, x, n))
        };

        let mut change_left = 0;
        let mut change_right = block.width();
        while change_left + MIN_COMPARE_WIDTH < change_right && col_same(old, change_left) {
            change_left += MIN_COMPARE_WIDTH;
        }
        while change_left + MIN_COMPARE_WIDTH < change_right
            && col_same(old, change_right - MIN_COMPARE_WIDTH)
        {
            change_right -= MIN_COMPARE_WIDTH;
        }

        // refresh the shadow for the whole width of the changed rows
        for y in first..first + change_height {
            old[y * old_stride * bpp..][..w].copy_from_slice(new_row(y, 0, w));
        }

        let y = block.tl.y + first as i32;
        Ok(Some(Rect::new(
            block.tl.x + change_left,
            y,
            block.tl.x + change_right,
            y + change_height as i32,
        )))
    }
}

impl UpdateTracker for ComparingUpdateTracker {
    fn add_changed(&mut self, region: &Region) {
        self.inner.add_changed(region);
    }

    fn add_copied(&mut self, dest: &Region, delta: Point) {
        self.inner.add_copied(dest, delta);
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pixel::PixelFormat;

    fn fb(w: i32, h: i32) -> ManagedPixelBuffer {
        ManagedPixelBuffer::new(PixelFormat::BGR233, w, h)
    }

    fn all(fb: &ManagedPixelBuffer) -> Region {
        Region::from(fb.rect())
    }

    #[test]
    fn first_compare_keeps_full_change() {
        let fb = fb(100, 100);
        let mut t = ComparingUpdateTracker::new(&fb);
        assert!(!t.compare(&fb).unwrap());
        assert_eq!(t.tracker().changed(), &all(&fb));
    }

    #[test]
    fn unchanged_pixels_are_dropped() {
        let mut fb = fb(200, 100);
        let mut t = ComparingUpdateTracker::new(&fb);
        t.compare(&fb).unwrap();
        t.clear();

        fb.fill_rect(&Rect::new(70, 10, 72, 12), &[0xFF]).unwrap();
        t.add_changed(&all(&fb));
        assert!(t.compare(&fb).unwrap());
        // block 64..128 trimmed to rows 10..12 and the 8px group at 64..72
        let info = t.get_update_info(&all(&fb));
        assert_eq!(info.changed, Region::from(Rect::new(64, 10, 72, 12)));
    }

    #[test]
    fn nothing_changed_gives_empty_region() {
        let fb = fb(64, 64);
        let mut t = ComparingUpdateTracker::new(&fb);
        t.compare(&fb).unwrap();
        t.clear();
        t.add_changed(&all(&fb));
        assert!(t.compare(&fb).unwrap());
        assert!(t.tracker().changed().is_empty());
        t.log_stats();
    }

    #[test]
    fn shadow_is_updated_after_compare() {
        let mut fb = fb(64, 64);
        let mut t = ComparingUpdateTracker::new(&fb);
        t.compare(&fb).unwrap();
        t.clear();
        fb.fill_rect(&Rect::new(0, 0, 1, 1), &[1]).unwrap();
        t.add_changed(&all(&fb));
        t.compare(&fb).unwrap();
        t.clear();
        t.add_changed(&all(&fb));
        t.compare(&fb).unwrap();
        assert!(t.tracker().changed().is_empty());
    }

    #[test]
    fn disabled_tracker_passes_through() {
        let fb = fb(32, 32);
        let mut t = ComparingUpdateTracker::new(&fb);
        t.disable();
        assert!(!t.compare(&fb).unwrap());
        t.enable();
        // re-enabled: snapshot first
        assert!(!t.compare(&fb).unwrap());
        assert_eq!(t.tracker().changed(), &all(&fb));
    }

    #[test]
    fn copies_are_replayed_on_shadow() {
        let mut fb = fb(64, 16);
        fb.fill_rect(&Rect::new(0, 0, 8, 8), &[5]).unwrap();
        let mut t = ComparingUpdateTracker::new(&fb);
        t.compare(&fb).unwrap();
        t.clear();

        fb.copy_rect(&Rect::new(32, 0, 40, 8), Point::new(32, 0)).unwrap();
        t.add_copied(&Region::from(Rect::new(32, 0, 40, 8)), Point::new(32, 0));
        t.add_changed(&Region::from(Rect::new(32, 0, 40, 8)));
        t.compare(&fb).unwrap();
        // the copy already explains the pixels
        assert!(t.tracker().changed().is_empty());
    }
}

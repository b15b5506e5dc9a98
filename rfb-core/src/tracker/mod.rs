//! Update tracking.
//!
//! A tracker accumulates what changed on the framebuffer between two
//! updates sent to one client: a region of changed pixels plus at most
//! one pending copy (a region and the offset it was moved by). Changes
//! always win over copies; a pixel in both is sent as changed.
//!
//! | Tracker                     | Purpose                                        |
//! |-----------------------------|------------------------------------------------|
//! | [`SimpleUpdateTracker`]     | Merges changes and copies into one update      |
//! | [`ClippingUpdateTracker`]   | Clips everything to a rect before forwarding   |
//! | [`ComparingUpdateTracker`]  | Drops "changes" whose pixels did not change    |

pub mod clipping;
pub mod comparing;
pub mod simple;

use crate::geometry::Point;
use crate::region::Region;

pub use clipping::ClippingUpdateTracker;
pub use comparing::ComparingUpdateTracker;
pub use simple::SimpleUpdateTracker;

// ── UpdateTracker ────────────────────────────────────────────────

/// Sink for framebuffer change notifications.
pub trait UpdateTracker {
    /// Pixels in `region` have new content.
    fn add_changed(&mut self, region: &Region);

    /// Pixels in `dest` now hold what was at `dest - delta`.
    fn add_copied(&mut self, dest: &Region, delta: Point);
}

// ── UpdateInfo ───────────────────────────────────────────────────

/// One update's worth of tracked state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateInfo {
    pub changed: Region,
    pub copied: Region,
    pub copy_delta: Point,
}

impl UpdateInfo {
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.copied.is_empty()
    }
}

//! Frequency-sorted colour table for indexed encodings.
//!
//! Entry `0` is always the most common colour. Ranks are part of the
//! wire format (palette indices are transmitted), so the ordering rules
//! below are exact and must not depend on hashing:
//!
//! - re-inserting a known colour adds to its count and moves it up past
//!   every entry with a strictly smaller count;
//! - a new colour lands after every entry whose count is `>=` its own.
//!
//! Storage is inline fixed arrays; building a palette never allocates.

use std::fmt;

/// Hard upper bound on distinct colours.
pub const MAX_COLOURS: usize = 256;

#[derive(Debug, Clone, Copy, Default)]
struct Entry {
    list_node: u8,
    num_pixels: u32,
}

#[derive(Debug, Clone, Copy, Default)]
struct ListNode {
    colour: u32,
    idx: u8,
    next: Option<u8>,
}

// ── Palette ──────────────────────────────────────────────────────

/// A colour table of at most [`max_size`](Palette::max_size) entries.
#[derive(Clone)]
pub struct Palette {
    max: usize,
    num_colours: usize,
    hash: [Option<u8>; 256],
    entry: [Entry; MAX_COLOURS],
    list: [ListNode; MAX_COLOURS],
}

impl Palette {
    /// A palette accepting up to 256 colours.
    pub fn new() -> Self {
        Self::with_max(MAX_COLOURS)
    }

    /// A palette that reports full once `max` colours are present.
    pub fn with_max(max: usize) -> Self {
        Self {
            max: max.min(MAX_COLOURS),
            num_colours: 0,
            hash: [None; 256],
            entry: [Entry::default(); MAX_COLOURS],
            list: [ListNode::default(); MAX_COLOURS],
        }
    }

    pub fn clear(&mut self) {
        self.num_colours = 0;
        self.hash = [None; 256];
    }

    /// Count `num_pixels` more pixels of `colour`.
    ///
    /// Returns `false` when `colour` is new and the palette is already
    /// at its maximum; the palette is left unchanged in that case.
    pub fn insert(&mut self, colour: u32, num_pixels: u32) -> bool {
        let key = gen_hash(colour) as usize;

        let mut prev: Option<u8> = None;
        let mut node = self.hash[key];
        while let Some(n) = node {
            let n_usize = n as usize;
            if self.list[n_usize].colour == colour {
                let mut i = self.list[n_usize].idx as usize;
                self.entry[i].num_pixels += num_pixels;
                while i > 0 && self.entry[i].num_pixels > self.entry[i - 1].num_pixels {
                    self.entry.swap(i, i - 1);
                    self.list[self.entry[i].list_node as usize].idx = i as u8;
                    self.list[self.entry[i - 1].list_node as usize].idx = (i - 1) as u8;
                    i -= 1;
                }
                return true;
            }
            prev = node;
            node = self.list[n_usize].next;
        }

        if self.num_colours >= self.max {
            return false;
        }

        let n = self.num_colours as u8;
        self.list[n as usize] = ListNode {
            colour,
            idx: 0,
            next: None,
        };
        match prev {
            Some(p) => self.list[p as usize].next = Some(n),
            None => self.hash[key] = Some(n),
        }

        let mut i = self.num_colours;
        while i > 0 && self.entry[i - 1].num_pixels < num_pixels {
            self.entry[i] = self.entry[i - 1];
            self.list[self.entry[i].list_node as usize].idx = i as u8;
            i -= 1;
        }
        self.entry[i] = Entry {
            list_node: n,
            num_pixels,
        };
        self.list[n as usize].idx = i as u8;

        self.num_colours += 1;
        true
    }

    /// Rank of a colour previously inserted into this palette.
    ///
    /// Callers only look up colours from the same scan that built the
    /// palette; a missing colour is a debug assertion and rank 0 otherwise.
    pub fn lookup(&self, colour: u32) -> u8 {
        let mut node = self.hash[gen_hash(colour) as usize];
        while let Some(n) = node {
            let ln = &self.list[n as usize];
            if ln.colour == colour {
                return ln.idx;
            }
            node = ln.next;
        }
        debug_assert!(false, "colour {colour:#x} not in palette");
        0
    }

    /// Colour at rank `i`.
    pub fn colour(&self, i: usize) -> u32 {
        self.list[self.entry[i].list_node as usize].colour
    }

    /// Pixel count at rank `i`.
    pub fn count(&self, i: usize) -> u32 {
        self.entry[i].num_pixels
    }

    /// Number of distinct colours.
    pub fn size(&self) -> usize {
        self.num_colours
    }

    pub fn is_empty(&self) -> bool {
        self.num_colours == 0
    }

    pub fn max_size(&self) -> usize {
        self.max
    }

    /// Colours in rank order.
    pub fn colours(&self) -> impl Iterator<Item = u32> + '_ {
        (0..self.num_colours).map(|i| self.colour(i))
    }
}

impl Default for Palette {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Palette {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries((0..self.num_colours).map(|i| (self.colour(i), self.count(i))))
            .finish()
    }
}

/// djb2 folded to one byte, one round per colour byte.
fn gen_hash(colour: u32) -> u8 {
    let mut key: u8 = (5381u32 & 0xff) as u8;
    for shift in (0..32).step_by(8) {
        key = (key << 5).wrapping_add(key) ^ (colour >> shift) as u8;
    }
    key
}

// ── Tests ────────────────────────────────────────────────────────

//! Persistent zlib streams.
//!
//! ZRLE and Tight keep one deflate context per connection (Tight keeps
//! four) for the lifetime of the session. Every rect ends with a sync
//! flush so the peer can inflate it completely without waiting for
//! more data, while the dictionary carries over to the next rect.

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};

use crate::error::RfbError;

/// Clamp an RFB compress level to zlib's range; `-1` means default.
fn compression_for(level: i32) -> Compression {
    if level < 0 {
        Compression::default()
    } else {
        Compression::new(level.min(9) as u32)
    }
}

// ── ZlibDeflater ─────────────────────────────────────────────────

pub struct ZlibDeflater {
    inner: Compress,
    level: i32,
}

impl ZlibDeflater {
    pub fn new(level: i32) -> Self {
        Self {
            inner: Compress::new(compression_for(level), true),
            level,
        }
    }

    pub fn level(&self) -> i32 {
        self.level
    }

    /// Start a fresh stream at `level`. The peer must reset its
    /// inflater at the same point.
    pub fn reset(&mut self, level: i32) {
        self.inner = Compress::new(compression_for(level), true);
        self.level = level;
    }

    /// Compress `input` and sync-flush, appending to `out`.
    pub fn compress(&mut self, input: &[u8], out: &mut Vec<u8>) -> Result<(), RfbError> {
        let start_in = self.inner.total_in();
        loop {
            let consumed = (self.inner.total_in() - start_in) as usize;
            out.reserve((input.len() - consumed) / 2 + 64);
            self.inner
                .compress_vec(&input[consumed..], out, FlushCompress::Sync)?;
            let consumed = (self.inner.total_in() - start_in) as usize;
            // the flush is complete once deflate stops filling the buffer
            if consumed >= input.len() && out.len() < out.capacity() {
                return Ok(());
            }
        }
    }
}

impl std::fmt::Debug for ZlibDeflater {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZlibDeflater")
            .field("level", &self.level)
            .field("total_in", &self.inner.total_in())
            .field("total_out", &self.inner.total_out())
            .finish()
    }
}

// ── ZlibInflater ─────────────────────────────────────────────────

pub struct ZlibInflater {
    inner: Decompress,
}

impl ZlibInflater {
    pub fn new() -> Self {
        Self {
            inner: Decompress::new(true),
        }
    }

    pub fn reset(&mut self) {
        self.inner.reset(true);
    }

    /// Inflate all of `input`, appending to `out`.
    pub fn decompress(&mut self, input: &[u8], out: &mut Vec<u8>) -> Result<(), RfbError> {
        let start_in = self.inner.total_in();
        loop {
            let consumed = (self.inner.total_in() - start_in) as usize;
            let before_out = self.inner.total_out();
            out.reserve(((input.len() - consumed) * 4).max(4096));
            let status =
                self.inner
                    .decompress_vec(&input[consumed..], out, FlushDecompress::Sync)?;
            let now_consumed = (self.inner.total_in() - start_in) as usize;

            if status == Status::StreamEnd {
                return Ok(());
            }
            if now_consumed >= input.len() && out.len() < out.capacity() {
                return Ok(());
            }
            if now_consumed == consumed && self.inner.total_out() == before_out {
                if now_consumed >= input.len() {
                    return Ok(());
                }
                return Err(RfbError::Compression("inflate made no progress".into()));
            }
        }
    }
}

impl Default for ZlibInflater {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ZlibInflater {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZlibInflater")
            .field("total_in", &self.inner.total_in())
            .field("total_out", &self.inner.total_out())
            .finish()
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dictionary_persists_across_flushes() {
        let mut d = ZlibDeflater::new(6);
        let mut i = ZlibInflater::new();

        let first: Vec<u8> = (0..5000u32).map(|v| (v % 251) as u8).collect();
        let mut packed = Vec::new();
        d.compress(&first, &mut packed).unwrap();
        let mut unpacked = Vec::new();
        i.decompress(&packed, &mut unpacked).unwrap();
        assert_eq!(unpacked, first);

        // the same data again compresses to far less
        let mut packed2 = Vec::new();
        d.compress(&first, &mut packed2).unwrap();
        assert!(packed2.len() < packed.len());
        let mut unpacked2 = Vec::new();
        i.decompress(&packed2, &mut unpacked2).unwrap();
        assert_eq!(unpacked2, first);
    }

    #[test]
    fn large_incompressible_input() {
        let mut d = ZlibDeflater::new(1);
        let mut i = ZlibInflater::new();
        let mut x: u32 = 12345;
        let data: Vec<u8> = (0..200_000)
            .map(|_| {
                x = x.wrapping_mul(1_103_515_245).wrapping_add(12345);
                (x >> 16) as u8
            })
            .collect();
        let mut packed = Vec::new();
        d.compress(&data, &mut packed).unwrap();
        let mut out = Vec::new();
        i.decompress(&packed, &mut out).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn reset_pairs_with_peer_reset() {
        let mut d = ZlibDeflater::new(-1);
        let mut i = ZlibInflater::new();
        let mut packed = Vec::new();
        d.compress(b"hello hello", &mut packed).unwrap();
        let mut out = Vec::new();
        i.decompress(&packed, &mut out).unwrap();

        d.reset(9);
        assert_eq!(d.level(), 9);
        i.reset();
        packed.clear();
        out.clear();
        d.compress(b"again", &mut packed).unwrap();
        i.decompress(&packed, &mut out).unwrap();
        assert_eq!(out, b"again");
    }

    #[test]
    fn garbage_is_an_error() {
        let mut i = ZlibInflater::new();
        let mut out = Vec::new();
        assert!(i.decompress(&[0xFF, 0xFF, 0xFF, 0xFF], &mut out).is_err());
    }
}

//! Input streams.
//!
//! [`InStream`] buffers bytes arriving from the network. A reader that
//! parses a multi-field structure first sets a restore point, checks
//! [`has_data_or_restore`](InStream::has_data_or_restore) before every
//! field, and if the data is not there yet the stream rewinds to the
//! restore point so the whole structure is parsed again once more bytes
//! arrive. Running out of data is therefore a `false` return, never an
//! error; reading past the end without checking is
//! [`RfbError::Truncated`].

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::RfbError;

// ── ByteSource ───────────────────────────────────────────────────

/// Big-endian reads over some byte source.
pub trait ByteSource {
    /// Bytes that can be read without blocking.
    fn remaining(&self) -> usize;

    /// Consume exactly `n` bytes.
    fn take(&mut self, n: usize) -> Result<&[u8], RfbError>;

    fn read_u8(&mut self) -> Result<u8, RfbError> {
        Ok(self.take(1)?[0])
    }

    fn read_u16(&mut self) -> Result<u16, RfbError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn read_u32(&mut self) -> Result<u32, RfbError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_s32(&mut self) -> Result<i32, RfbError> {
        Ok(self.read_u32()? as i32)
    }

    fn skip(&mut self, n: usize) -> Result<(), RfbError> {
        self.take(n).map(|_| ())
    }

    /// Copy `dst.len()` bytes out.
    fn read_into(&mut self, dst: &mut [u8]) -> Result<(), RfbError> {
        let src = self.take(dst.len())?;
        dst.copy_from_slice(src);
        Ok(())
    }

    /// Tight's 1–3 byte length: 7 bits per byte, high bit means more
    /// follows, the third byte carries a full 8 bits.
    fn read_compact_length(&mut self) -> Result<usize, RfbError> {
        let mut b = self.read_u8()? as usize;
        let mut len = b & 0x7f;
        if b & 0x80 != 0 {
            b = self.read_u8()? as usize;
            len |= (b & 0x7f) << 7;
            if b & 0x80 != 0 {
                b = self.read_u8()? as usize;
                len |= b << 14;
            }
        }
        Ok(len)
    }
}

// ── ByteCursor ───────────────────────────────────────────────────

/// Reads from a complete in-memory buffer.
#[derive(Debug, Clone)]
pub struct ByteCursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteCursor<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }
}

impl ByteSource for ByteCursor<'_> {
    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&[u8], RfbError> {
        if self.remaining() < n {
            return Err(RfbError::Truncated {
                needed: n,
                available: self.remaining(),
            });
        }
        let out = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }
}

// ── InStream ─────────────────────────────────────────────────────

/// Growable receive buffer with a single restore point.
#[derive(Debug, Default)]
pub struct InStream {
    buf: BytesMut,
    pos: usize,
    restore: Option<usize>,
}

impl InStream {
    pub fn new() -> Self {
        Self::default()
    }

    /// A stream pre-loaded with `data`.
    pub fn from_slice(data: &[u8]) -> Self {
        let mut s = Self::new();
        s.feed(data);
        s
    }

    /// Append newly received bytes.
    pub fn feed(&mut self, data: &[u8]) {
        self.compact();
        self.buf.extend_from_slice(data);
    }

    /// Read whatever `reader` has ready into the buffer.
    ///
    /// Returns the number of bytes added; `0` means end of stream.
    pub async fn fill_from<R: AsyncRead + Unpin>(
        &mut self,
        reader: &mut R,
    ) -> Result<usize, RfbError> {
        self.compact();
        self.buf.reserve(16 * 1024);
        let n = reader.read_buf(&mut self.buf).await?;
        Ok(n)
    }

    /// Unread bytes.
    pub fn avail(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn has_data(&self, n: usize) -> bool {
        self.avail() >= n
    }

    /// `has_data`, rewinding to the restore point on failure.
    pub fn has_data_or_restore(&mut self, n: usize) -> bool {
        if self.has_data(n) {
            return true;
        }
        self.goto_restore_point();
        false
    }

    pub fn set_restore_point(&mut self) {
        self.restore = Some(self.pos);
    }

    pub fn clear_restore_point(&mut self) {
        self.restore = None;
    }

    pub fn goto_restore_point(&mut self) {
        if let Some(pos) = self.restore.take() {
            self.pos = pos;
        }
    }

    /// Drop bytes nothing can rewind to any more.
    fn compact(&mut self) {
        let keep_from = self.restore.unwrap_or(self.pos);
        if keep_from == 0 {
            return;
        }
        self.buf.advance(keep_from);
        self.pos -= keep_from;
        if let Some(r) = self.restore.as_mut() {
            *r -= keep_from;
        }
    }
}

impl ByteSource for InStream {
    fn remaining(&self) -> usize {
        self.avail()
    }

    fn take(&mut self, n: usize) -> Result<&[u8], RfbError> {
        if self.avail() < n {
            return Err(RfbError::Truncated {
                needed: n,
                available: self.avail(),
            });
        }
        let start = self.pos;
        self.pos += n;
        Ok(&self.buf[start..start + n])
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn big_endian_reads() {
        let mut c = ByteCursor::new(&[0x01, 0x02, 0x03, 0x04, 0xFF, 0xFF, 0xFF, 0xFE]);
        assert_eq!(c.read_u16().unwrap(), 0x0102);
        assert_eq!(c.read_u8().unwrap(), 0x03);
        assert_eq!(c.read_u8().unwrap(), 0x04);
        assert_eq!(c.read_s32().unwrap(), -2);
        assert!(c.is_empty());
    }

    #[test]
    fn truncated_read_is_an_error() {
        let mut c = ByteCursor::new(&[1, 2]);
        let err = c.read_u32().unwrap_err();
        assert!(matches!(
            err,
            RfbError::Truncated {
                needed: 4,
                available: 2
            }
        ));
    }

    #[test]
    fn compact_length_forms() {
        let mut c = ByteCursor::new(&[0x05]);
        assert_eq!(c.read_compact_length().unwrap(), 5);
        let mut c = ByteCursor::new(&[0x90, 0x01]);
        assert_eq!(c.read_compact_length().unwrap(), 0x10 | (1 << 7));
        let mut c = ByteCursor::new(&[0xFF, 0xFF, 0xFF]);
        assert_eq!(c.read_compact_length().unwrap(), 0x3F_FFFF);
    }

    #[test]
    fn restore_point_rewinds_partial_parse() {
        let mut s = InStream::from_slice(&[0x00, 0x2A, 0x00]);
        s.set_restore_point();
        assert!(s.has_data_or_restore(2));
        assert_eq!(s.read_u16().unwrap(), 42);
        // second field not complete yet
        assert!(!s.has_data_or_restore(4));
        assert_eq!(s.avail(), 3);

        s.feed(&[0x00, 0x00, 0x07]);
        s.set_restore_point();
        assert!(s.has_data_or_restore(2));
        assert_eq!(s.read_u16().unwrap(), 42);
        assert!(s.has_data_or_restore(4));
        assert_eq!(s.read_u32().unwrap(), 7);
        s.clear_restore_point();
        assert_eq!(s.avail(), 0);
    }

    #[test]
    fn feed_compacts_consumed_bytes() {
        let mut s = InStream::from_slice(&[1, 2, 3]);
        s.skip(3).unwrap();
        s.feed(&[4]);
        assert_eq!(s.avail(), 1);
        assert_eq!(s.read_u8().unwrap(), 4);
    }

    #[tokio::test]
    async fn fill_from_reader_in_pieces() {
        let mut mock = tokio_test::io::Builder::new()
            .read(&[0x00, 0x01])
            .read(&[0x02])
            .build();
        let mut s = InStream::new();
        assert_eq!(s.fill_from(&mut mock).await.unwrap(), 2);
        s.set_restore_point();
        assert!(!s.has_data_or_restore(3));
        assert_eq!(s.fill_from(&mut mock).await.unwrap(), 1);
        assert!(s.has_data(3));
        assert_eq!(s.fill_from(&mut mock).await.unwrap(), 0);
    }
}

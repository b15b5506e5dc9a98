//! Big-endian output stream.

use bytes::{BufMut, Bytes, BytesMut};

/// Append-only write buffer for wire messages.
#[derive(Debug, Default, Clone)]
pub struct OutStream {
    buf: BytesMut,
}

impl OutStream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(cap: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(cap),
        }
    }

    pub fn write_u8(&mut self, v: u8) {
        self.buf.put_u8(v);
    }

    pub fn write_u16(&mut self, v: u16) {
        self.buf.put_u16(v);
    }

    pub fn write_u32(&mut self, v: u32) {
        self.buf.put_u32(v);
    }

    pub fn write_s32(&mut self, v: i32) {
        self.buf.put_i32(v);
    }

    pub fn write_bytes(&mut self, data: &[u8]) {
        self.buf.put_slice(data);
    }

    /// `n` zero bytes.
    pub fn pad(&mut self, n: usize) {
        self.buf.put_bytes(0, n);
    }

    /// Tight compact length, 1 to 3 bytes.
    pub fn write_compact_length(&mut self, len: usize) {
        let mut b = (len & 0x7f) as u8;
        if len <= 0x7f {
            self.write_u8(b);
            return;
        }
        self.write_u8(b | 0x80);
        b = ((len >> 7) & 0x7f) as u8;
        if len <= 0x3fff {
            self.write_u8(b);
            return;
        }
        self.write_u8(b | 0x80);
        self.write_u8(((len >> 14) & 0xff) as u8);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Hand the written bytes off, leaving the stream empty.
    pub fn take(&mut self) -> Bytes {
        self.buf.split().freeze()
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{ByteCursor, ByteSource};

    #[test]
    fn writes_big_endian() {
        let mut os = OutStream::new();
        os.write_u16(0x0102);
        os.write_u32(0x0304_0506);
        os.write_s32(-1);
        os.pad(2);
        assert_eq!(
            os.as_slice(),
            &[1, 2, 3, 4, 5, 6, 0xFF, 0xFF, 0xFF, 0xFF, 0, 0]
        );
    }

    #[test]
    fn compact_length_sizes() {
        let cases = [(0usize, 1usize), (127, 1), (128, 2), (16383, 2), (16384, 3), (4_194_303, 3)];
        for (len, size) in cases {
            let mut os = OutStream::new();
            os.write_compact_length(len);
            assert_eq!(os.len(), size, "len {len}");
            let mut c = ByteCursor::new(os.as_slice());
            assert_eq!(c.read_compact_length().unwrap(), len);
        }
    }

    #[test]
    fn take_empties_stream() {
        let mut os = OutStream::new();
        os.write_bytes(b"abc");
        let b = os.take();
        assert_eq!(&b[..], b"abc");
        assert!(os.is_empty());
    }
}

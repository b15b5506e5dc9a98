//! Run-length continuation bytes shared by ZRLE and its decoder.
//!
//! A count `n` is written as `n / 255` bytes of `0xFF` followed by one
//! byte `n % 255`, so it always takes `1 + n / 255` bytes. The reader
//! sums bytes until it sees one below `0xFF`.

use crate::error::RfbError;
use crate::stream::{ByteSource, OutStream};

/// Bytes [`write_run`] produces for `n`.
pub const fn run_len(n: usize) -> usize {
    1 + n / 255
}

pub fn write_run(os: &mut OutStream, mut n: usize) {
    while n >= 255 {
        os.write_u8(255);
        n -= 255;
    }
    os.write_u8(n as u8);
}

pub fn read_run<S: ByteSource + ?Sized>(src: &mut S) -> Result<usize, RfbError> {
    let mut n = 0usize;
    loop {
        let b = src.read_u8()?;
        n += b as usize;
        if b != 255 {
            return Ok(n);
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::ByteCursor;

    #[test]
    fn lengths_and_values() {
        for n in [0, 1, 254, 255, 256, 509, 510, 4095, 65535] {
            let mut os = OutStream::new();
            write_run(&mut os, n);
            assert_eq!(os.len(), run_len(n), "n = {n}");
            let mut c = ByteCursor::new(os.as_slice());
            assert_eq!(read_run(&mut c).unwrap(), n);
            assert!(c.is_empty());
        }
    }

    #[test]
    fn exact_bytes_at_boundary() {
        let mut os = OutStream::new();
        write_run(&mut os, 255);
        assert_eq!(os.as_slice(), &[255, 0]);
    }

    #[test]
    fn unterminated_run_is_truncated() {
        let mut c = ByteCursor::new(&[255, 255]);
        assert!(matches!(read_run(&mut c), Err(RfbError::Truncated { .. })));
    }
}

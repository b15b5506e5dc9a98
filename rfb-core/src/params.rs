//! Parameters negotiated with one client.
//!
//! The encoder side reads everything it needs to choose and tune
//! encoders from [`ClientParams`]: the pixel format the client asked
//! for, the encodings it listed (in preference order) and the compress
//! level it selected through pseudo-encodings.

use serde::{Deserialize, Serialize};

use crate::message::encoding;
use crate::pixel::PixelFormat;

/// Encodings an encode manager can produce, in no particular order.
pub const ENCODABLE: [i32; 5] = [
    encoding::RAW,
    encoding::RRE,
    encoding::HEXTILE,
    encoding::TIGHT,
    encoding::ZRLE,
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientParams {
    /// Format the client wants pixels in.
    pub pf: PixelFormat,
    pub width: i32,
    pub height: i32,
    /// `-1` means the encoder's own default.
    pub compress_level: i32,
    /// Encodings and pseudo-encodings, most preferred first.
    encodings: Vec<i32>,
}

impl Default for ClientParams {
    fn default() -> Self {
        Self {
            pf: PixelFormat::RGB888,
            width: 0,
            height: 0,
            compress_level: 2,
            encodings: vec![encoding::RAW],
        }
    }
}

impl ClientParams {
    pub fn new(pf: PixelFormat, width: i32, height: i32) -> Self {
        Self {
            pf,
            width,
            height,
            ..Self::default()
        }
    }

    /// Replace the encoding list, as a `SetEncodings` message does.
    ///
    /// Compress-level pseudo-encodings are applied; when several are
    /// listed the earliest wins. Raw is always supported.
    pub fn set_encodings(&mut self, encodings: &[i32]) {
        self.compress_level = -1;
        for &e in encodings.iter().rev() {
            if (encoding::COMPRESS_LEVEL_0..=encoding::COMPRESS_LEVEL_9).contains(&e) {
                self.compress_level = e - encoding::COMPRESS_LEVEL_0;
            }
        }
        self.encodings = encodings.to_vec();
        if !self.encodings.contains(&encoding::RAW) {
            self.encodings.push(encoding::RAW);
        }
    }

    /// Builder form of [`set_encodings`](Self::set_encodings).
    pub fn with_encodings(mut self, encodings: &[i32]) -> Self {
        self.set_encodings(encodings);
        self
    }

    pub fn encodings(&self) -> &[i32] {
        &self.encodings
    }

    pub fn supports_encoding(&self, enc: i32) -> bool {
        self.encodings.contains(&enc)
    }

    /// First listed encoding that can actually be produced.
    pub fn preferred_encoding(&self) -> i32 {
        self.encodings
            .iter()
            .copied()
            .find(|e| ENCODABLE.contains(e))
            .unwrap_or(encoding::RAW)
    }

    pub fn supports_last_rect(&self) -> bool {
        self.supports_encoding(encoding::LAST_RECT)
    }

    pub fn supports_fence(&self) -> bool {
        self.supports_encoding(encoding::FENCE)
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compress_level_from_pseudo_encoding() {
        let mut cp = ClientParams::default();
        assert_eq!(cp.compress_level, 2);
        cp.set_encodings(&[encoding::ZRLE, encoding::COMPRESS_LEVEL_0 + 6]);
        assert_eq!(cp.compress_level, 6);
        cp.set_encodings(&[encoding::ZRLE]);
        assert_eq!(cp.compress_level, -1);
        cp.set_encodings(&[
            encoding::COMPRESS_LEVEL_0 + 1,
            encoding::COMPRESS_LEVEL_0 + 9,
        ]);
        assert_eq!(cp.compress_level, 1);
    }

    #[test]
    fn preferred_skips_pseudo_and_unknown() {
        let cp = ClientParams::default().with_encodings(&[
            encoding::LAST_RECT,
            99,
            encoding::HEXTILE,
            encoding::ZRLE,
        ]);
        assert_eq!(cp.preferred_encoding(), encoding::HEXTILE);
        assert!(cp.supports_last_rect());
        assert!(!cp.supports_fence());
        assert!(cp.supports_encoding(encoding::RAW));
    }

    #[test]
    fn serde_roundtrip() {
        let cp = ClientParams::new(PixelFormat::RGB565, 640, 480)
            .with_encodings(&[encoding::TIGHT, encoding::FENCE]);
        let json = serde_json::to_string(&cp).unwrap();
        let back: ClientParams = serde_json::from_str(&json).unwrap();
        assert_eq!(back, cp);
        let partial: ClientParams = serde_json::from_str("{\"width\": 10}").unwrap();
        assert_eq!(partial.width, 10);
        assert_eq!(partial.pf, PixelFormat::RGB888);
    }
}

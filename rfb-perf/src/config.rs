//! Configuration for the loopback performance session.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use rfb_core::{PixelFormat, encoding};

use crate::session::SessionConfig;

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PerfConfig {
    /// Framebuffer and pacing.
    pub session: SessionSection,
    /// What the simulated client asks the server for.
    pub encoding: EncodingSection,
    /// Client-side decoding.
    pub decoding: DecodingSection,
    /// Logging settings.
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSection {
    pub width: i32,
    pub height: i32,
    /// Frames the synthetic desktop animates before the session ends.
    pub frames: u32,
    /// Frames per second.
    pub fps: u32,
    /// "rgb888", "rgb565" or "bgr233".
    pub pixel_format: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EncodingSection {
    /// "raw", "rre", "hextile", "tight" or "zrle".
    pub preferred: String,
    /// 0–9, or -1 to leave it to the encoder.
    pub compress_level: i32,
    pub copy_rect: bool,
    pub last_rect: bool,
    /// Filter reported changes against a shadow framebuffer.
    pub compare: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DecodingSection {
    /// Decode worker threads; 0 picks one per CPU, at most four.
    pub threads: usize,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    pub level: String,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for PerfConfig {
    fn default() -> Self {
        Self {
            session: SessionSection::default(),
            encoding: EncodingSection::default(),
            decoding: DecodingSection::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            width: 1024,
            height: 768,
            frames: 120,
            fps: 30,
            pixel_format: "rgb888".into(),
        }
    }
}

impl Default for EncodingSection {
    fn default() -> Self {
        Self {
            preferred: "tight".into(),
            compress_level: 2,
            copy_rect: true,
            last_rect: true,
            compare: true,
        }
    }
}

impl Default for DecodingSection {
    fn default() -> Self {
        Self { threads: 0 }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

// ── Names ────────────────────────────────────────────────────────

/// Encoding number for a config name.
pub fn encoding_by_name(name: &str) -> Option<i32> {
    match name.to_ascii_lowercase().as_str() {
        "raw" => Some(encoding::RAW),
        "rre" => Some(encoding::RRE),
        "hextile" => Some(encoding::HEXTILE),
        "tight" => Some(encoding::TIGHT),
        "zrle" => Some(encoding::ZRLE),
        _ => None,
    }
}

pub fn pixel_format_by_name(name: &str) -> Option<PixelFormat> {
    match name.to_ascii_lowercase().as_str() {
        "rgb888" => Some(PixelFormat::RGB888),
        "rgb565" => Some(PixelFormat::RGB565),
        "bgr233" => Some(PixelFormat::BGR233),
        _ => None,
    }
}

// ── Loading ──────────────────────────────────────────────────────

impl PerfConfig {
    /// Load configuration from a TOML file, falling back to defaults.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!("invalid config {}: {e}; using defaults", path.display());
                Self::default()
            }),
            Err(_) => {
                tracing::info!("no config at {}; using defaults", path.display());
                Self::default()
            }
        }
    }

    /// Write the default configuration to a file (for bootstrapping).
    pub fn write_default(path: &Path) -> std::io::Result<()> {
        let text = toml::to_string_pretty(&Self::default()).map_err(std::io::Error::other)?;
        std::fs::write(path, text)
    }

    /// Resolve names and clamp everything into a usable session.
    pub fn to_session_config(&self) -> SessionConfig {
        let pf = pixel_format_by_name(&self.session.pixel_format).unwrap_or_else(|| {
            tracing::warn!(
                "unknown pixel format {:?}; using rgb888",
                self.session.pixel_format
            );
            PixelFormat::RGB888
        });

        let preferred = encoding_by_name(&self.encoding.preferred).unwrap_or_else(|| {
            tracing::warn!(
                "unknown encoding {:?}; using zrle",
                self.encoding.preferred
            );
            encoding::ZRLE
        });

        let mut encodings = vec![preferred];
        if self.encoding.copy_rect {
            encodings.push(encoding::COPY_RECT);
        }
        if self.encoding.last_rect {
            encodings.push(encoding::LAST_RECT);
        }
        if (0..=9).contains(&self.encoding.compress_level) {
            encodings.push(encoding::COMPRESS_LEVEL_0 + self.encoding.compress_level);
        }
        encodings.push(encoding::FENCE);

        let fps = self.session.fps.clamp(1, 120);
        SessionConfig {
            width: self.session.width.clamp(64, 4096),
            height: self.session.height.clamp(64, 4096),
            frames: self.session.frames.max(1),
            frame_interval: Duration::from_millis(1000 / fps as u64),
            pf,
            encodings,
            compare: self.encoding.compare,
            decode_threads: (self.decoding.threads > 0).then_some(self.decoding.threads.min(16)),
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let text = toml::to_string_pretty(&PerfConfig::default()).unwrap();
        assert!(text.contains("[session]"));
        assert!(text.contains("preferred"));
        assert!(text.contains("threads"));
    }

    #[test]
    fn written_default_loads_back() {
        let path = std::env::temp_dir().join(format!("rfb-perf-{}.toml", std::process::id()));
        PerfConfig::write_default(&path).unwrap();
        let cfg = PerfConfig::load(&path);
        std::fs::remove_file(&path).ok();
        assert_eq!(cfg.to_session_config(), PerfConfig::default().to_session_config());
        assert_eq!(cfg.logging.level, "info");
    }

    #[test]
    fn missing_file_gives_defaults() {
        let cfg = PerfConfig::load(Path::new("/nonexistent/rfb-perf.toml"));
        assert_eq!(cfg.session.fps, 30);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let cfg: PerfConfig = toml::from_str("[encoding]\npreferred = \"hextile\"\n").unwrap();
        assert_eq!(cfg.encoding.preferred, "hextile");
        assert_eq!(cfg.session.width, 1024);
        assert!(cfg.encoding.last_rect);
    }

    #[test]
    fn session_config_lists_encodings_in_order() {
        let cfg = PerfConfig::default();
        let s = cfg.to_session_config();
        assert_eq!(
            s.encodings,
            vec![
                encoding::TIGHT,
                encoding::COPY_RECT,
                encoding::LAST_RECT,
                encoding::COMPRESS_LEVEL_0 + 2,
                encoding::FENCE,
            ]
        );
        assert_eq!(s.pf, PixelFormat::RGB888);
        assert_eq!(s.decode_threads, None);
    }

    #[test]
    fn session_config_clamps() {
        let mut cfg = PerfConfig::default();
        cfg.session.width = 10;
        cfg.session.fps = 1000;
        cfg.session.frames = 0;
        cfg.encoding.preferred = "jpeg".into();
        cfg.encoding.compress_level = -1;
        let s = cfg.to_session_config();
        assert_eq!(s.width, 64);
        assert_eq!(s.frame_interval, Duration::from_millis(8));
        assert_eq!(s.frames, 1);
        assert_eq!(s.encodings[0], encoding::ZRLE);
        let levels = encoding::COMPRESS_LEVEL_0..=encoding::COMPRESS_LEVEL_9;
        assert!(!s.encodings.iter().any(|e| levels.contains(e)));
    }

    #[test]
    fn names_are_case_insensitive() {
        assert_eq!(encoding_by_name("ZRLE"), Some(encoding::ZRLE));
        assert_eq!(pixel_format_by_name("BGR233"), Some(PixelFormat::BGR233));
        assert_eq!(encoding_by_name("copyrect"), None);
    }
}

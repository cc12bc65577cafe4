//! Quality presets and supported frame rates

use serde::Serialize;

/// Frame rates a recording may request
pub const FRAMERATE_OPTIONS: &[u32] = &[30, 60, 120, 144, 240];

/// Speed hint used when the session falls back to software encoding
pub const SAFE_MODE_SPEED: &str = "ultrafast";

/// A named bundle of compression rate and encoder speed
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QualityPreset {
    /// Registry key (`balanced`, `lossless`, ...)
    pub key: &'static str,
    /// Human readable label
    pub label: &'static str,
    /// Constant rate factor on the software scale (0 = lossless)
    pub crf: u8,
    /// x264 speed preset
    pub speed: &'static str,
}

const PRESETS: &[QualityPreset] = &[
    QualityPreset {
        key: "ultrafast",
        label: "Fast",
        crf: 23,
        speed: "ultrafast",
    },
    QualityPreset {
        key: "balanced",
        label: "Balanced",
        crf: 20,
        speed: "fast",
    },
    QualityPreset {
        key: "quality",
        label: "Quality",
        crf: 18,
        speed: "medium",
    },
    QualityPreset {
        key: "lossless",
        label: "Lossless",
        crf: 0,
        speed: "ultrafast",
    },
];

impl QualityPreset {
    /// Look up a preset by key
    pub fn lookup(key: &str) -> Option<&'static QualityPreset> {
        PRESETS.iter().find(|p| p.key == key)
    }

    /// All registered presets, fastest first
    pub fn all() -> &'static [QualityPreset] {
        PRESETS
    }

    pub fn is_lossless(&self) -> bool {
        self.crf == 0
    }

    /// Same compression rate with the fastest encoder speed.
    ///
    /// Used once the session has been demoted to software encoding.
    pub fn safe_mode(&self) -> QualityPreset {
        QualityPreset {
            speed: SAFE_MODE_SPEED,
            ..self.clone()
        }
    }
}

/// Whether `fps` is one of the supported frame rates
pub fn is_supported_framerate(fps: u32) -> bool {
    FRAMERATE_OPTIONS.contains(&fps)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_has_three_lossy_tiers_and_lossless() {
        let lossy: Vec<_> = QualityPreset::all()
            .iter()
            .filter(|p| !p.is_lossless())
            .collect();
        assert_eq!(lossy.len(), 3);
        assert!(QualityPreset::lookup("lossless").unwrap().is_lossless());
    }

    #[test]
    fn test_lookup() {
        let balanced = QualityPreset::lookup("balanced").unwrap();
        assert_eq!(balanced.crf, 20);
        assert_eq!(balanced.speed, "fast");
        assert!(QualityPreset::lookup("cinematic").is_none());
    }

    #[test]
    fn test_safe_mode_keeps_crf() {
        let quality = QualityPreset::lookup("quality").unwrap();
        let safe = quality.safe_mode();
        assert_eq!(safe.crf, 18);
        assert_eq!(safe.speed, "ultrafast");
        assert_eq!(safe.key, "quality");
    }

    #[test]
    fn test_framerates() {
        for fps in [30, 60, 120, 144, 240] {
            assert!(is_supported_framerate(fps));
        }
        assert!(!is_supported_framerate(0));
        assert!(!is_supported_framerate(59));
        assert!(!is_supported_framerate(75));
    }
}

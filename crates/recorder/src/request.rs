//! Recording request and capture region

use crate::encode::preset::{is_supported_framerate, QualityPreset};
use serde::Serialize;
use std::path::PathBuf;
use thiserror::Error;

/// Reasons a request is rejected before any process is launched
#[derive(Debug, Error, PartialEq)]
pub enum RequestError {
    #[error("Unsupported frame rate {0}; expected 30, 60, 120, 144 or 240")]
    UnsupportedFramerate(u32),

    #[error("Unknown quality preset '{0}'")]
    UnknownPreset(String),

    #[error("Output path is empty")]
    EmptyOutputPath,
}

/// Screen rectangle given as two corners, in screen pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CaptureRegion {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
}

/// Offset and size handed to the capture device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureArea {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl CaptureRegion {
    pub fn new(x1: i32, y1: i32, x2: i32, y2: i32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    /// Normalized capture area with even dimensions
    ///
    /// Corners may be given in any order. Odd widths and heights are rounded
    /// down; an area smaller than 2x2 after rounding yields `None` and the
    /// caller captures the whole desktop instead.
    pub fn sanitized(&self) -> Option<CaptureArea> {
        let (left, right) = (self.x1.min(self.x2), self.x1.max(self.x2));
        let (top, bottom) = (self.y1.min(self.y2), self.y1.max(self.y2));

        let width = (right as i64 - left as i64) as u64 & !1;
        let height = (bottom as i64 - top as i64) as u64 & !1;

        if width < 2 || height < 2 {
            return None;
        }

        Some(CaptureArea {
            x: left,
            y: top,
            width: u32::try_from(width).ok()?,
            height: u32::try_from(height).ok()?,
        })
    }
}

impl std::str::FromStr for CaptureRegion {
    type Err = String;

    /// Parses `x1,y1,x2,y2`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<i32> = s
            .split(',')
            .map(|p| p.trim().parse::<i32>())
            .collect::<Result<_, _>>()
            .map_err(|e| format!("invalid region '{}': {}", s, e))?;

        match parts.as_slice() {
            [x1, y1, x2, y2] => Ok(CaptureRegion::new(*x1, *y1, *x2, *y2)),
            _ => Err(format!("region '{}' must have four comma separated values", s)),
        }
    }
}

/// Everything needed to start a session; fixed for the session's lifetime
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordingRequest {
    /// Final artifact location
    pub output_path: PathBuf,
    /// Area to capture; `None` records the full desktop
    pub region: Option<CaptureRegion>,
    /// DirectShow microphone device name
    pub microphone: Option<String>,
    /// Capture system audio through the configured loopback device
    pub system_audio: bool,
    pub framerate: u32,
    /// Quality preset key
    pub quality: String,
}

impl RecordingRequest {
    pub fn new(output_path: impl Into<PathBuf>) -> Self {
        Self {
            output_path: output_path.into(),
            region: None,
            microphone: None,
            system_audio: false,
            framerate: 60,
            quality: "balanced".to_string(),
        }
    }

    pub fn with_region(mut self, region: CaptureRegion) -> Self {
        self.region = Some(region);
        self
    }

    pub fn with_microphone(mut self, device: impl Into<String>) -> Self {
        self.microphone = Some(device.into());
        self
    }

    pub fn with_system_audio(mut self, enabled: bool) -> Self {
        self.system_audio = enabled;
        self
    }

    pub fn with_framerate(mut self, fps: u32) -> Self {
        self.framerate = fps;
        self
    }

    pub fn with_quality(mut self, key: impl Into<String>) -> Self {
        self.quality = key.into();
        self
    }

    /// Check the request and resolve its quality preset
    ///
    /// Unsupported frame rates are rejected, never clamped.
    pub fn validate(&self) -> Result<&'static QualityPreset, RequestError> {
        if self.output_path.as_os_str().is_empty() {
            return Err(RequestError::EmptyOutputPath);
        }
        if !is_supported_framerate(self.framerate) {
            return Err(RequestError::UnsupportedFramerate(self.framerate));
        }
        QualityPreset::lookup(&self.quality)
            .ok_or_else(|| RequestError::UnknownPreset(self.quality.clone()))
    }

    /// Extension used for segment files, taken from the output path
    pub fn container_extension(&self) -> String {
        self.output_path
            .extension()
            .and_then(|e| e.to_str())
            .filter(|e| !e.is_empty())
            .unwrap_or("mp4")
            .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_sanitized_rounds_down_to_even() {
        let area = CaptureRegion::new(10, 20, 111, 221).sanitized().unwrap();
        assert_eq!(area, CaptureArea { x: 10, y: 20, width: 100, height: 200 });
    }

    #[test]
    fn test_sanitized_normalizes_corner_order() {
        let area = CaptureRegion::new(300, 400, 100, 100).sanitized().unwrap();
        assert_eq!(area, CaptureArea { x: 100, y: 100, width: 200, height: 300 });
    }

    #[test]
    fn test_degenerate_region_is_none() {
        assert!(CaptureRegion::new(5, 5, 6, 100).sanitized().is_none());
        assert!(CaptureRegion::new(5, 5, 5, 5).sanitized().is_none());
    }

    #[test]
    fn test_negative_offsets_survive() {
        // Monitors left of the primary have negative coordinates
        let area = CaptureRegion::new(-1920, 0, 0, 1080).sanitized().unwrap();
        assert_eq!(area.x, -1920);
        assert_eq!(area.width, 1920);
    }

    proptest! {
        #[test]
        fn prop_sanitized_dimensions_are_even(
            x1 in -5000i32..5000,
            y1 in -5000i32..5000,
            x2 in -5000i32..5000,
            y2 in -5000i32..5000,
        ) {
            if let Some(area) = CaptureRegion::new(x1, y1, x2, y2).sanitized() {
                prop_assert_eq!(area.width % 2, 0);
                prop_assert_eq!(area.height % 2, 0);
                prop_assert!(area.width >= 2 && area.height >= 2);
                prop_assert!((area.width as i64) <= (x1 as i64 - x2 as i64).abs());
                prop_assert!((area.height as i64) <= (y1 as i64 - y2 as i64).abs());
            }
        }
    }

    #[test]
    fn test_region_from_str() {
        let region: CaptureRegion = "0, 0,1280,720".parse().unwrap();
        assert_eq!(region, CaptureRegion::new(0, 0, 1280, 720));
        assert!("1,2,3".parse::<CaptureRegion>().is_err());
        assert!("a,b,c,d".parse::<CaptureRegion>().is_err());
    }

    #[test]
    fn test_validate_rejects_unsupported_framerate() {
        let req = RecordingRequest::new("out.mp4").with_framerate(75);
        assert_eq!(req.validate(), Err(RequestError::UnsupportedFramerate(75)));
    }

    #[test]
    fn test_validate_rejects_unknown_preset() {
        let req = RecordingRequest::new("out.mp4").with_quality("cinematic");
        assert_eq!(
            req.validate(),
            Err(RequestError::UnknownPreset("cinematic".to_string()))
        );
    }

    #[test]
    fn test_validate_resolves_preset() {
        let req = RecordingRequest::new("out.mkv")
            .with_framerate(144)
            .with_quality("lossless");
        assert_eq!(req.validate().unwrap().key, "lossless");
        assert_eq!(req.container_extension(), "mkv");
        assert_eq!(RecordingRequest::new("noext").container_extension(), "mp4");
    }
}

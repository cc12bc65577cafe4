//! Hardware encoder detection
//!
//! Probes the ffmpeg binary once with `-encoders` and remembers which
//! hardware H.264 encoders it was built with. A missing binary, a hung
//! probe or a non-zero exit simply means "no hardware"; none of those are
//! errors.

use log::{debug, info, warn};
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::OnceCell;

/// Encoder implementation used for the video stream
///
/// Ordering follows preference: earlier variants win in [`best_encoder`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EncoderChoice {
    /// NVIDIA NVENC
    Nvenc,
    /// Intel Quick Sync
    Qsv,
    /// AMD AMF
    Amf,
    /// libx264
    Software,
}

/// Hardware encoders in priority order
const HARDWARE_PRIORITY: &[EncoderChoice] =
    &[EncoderChoice::Nvenc, EncoderChoice::Qsv, EncoderChoice::Amf];

impl EncoderChoice {
    /// Codec name passed to `-c:v`
    pub fn codec(&self) -> &'static str {
        match self {
            EncoderChoice::Nvenc => "h264_nvenc",
            EncoderChoice::Qsv => "h264_qsv",
            EncoderChoice::Amf => "h264_amf",
            EncoderChoice::Software => "libx264",
        }
    }

    pub fn is_hardware(&self) -> bool {
        !matches!(self, EncoderChoice::Software)
    }
}

impl std::fmt::Display for EncoderChoice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.codec())
    }
}

/// Extract the hardware encoders mentioned in `ffmpeg -encoders` output
pub fn parse_encoder_listing(output: &str) -> BTreeSet<EncoderChoice> {
    HARDWARE_PRIORITY
        .iter()
        .copied()
        .filter(|enc| {
            output
                .split_whitespace()
                .any(|token| token == enc.codec())
        })
        .collect()
}

/// Pick the preferred encoder from a detected set
///
/// Returns software unconditionally when hardware encoding is disabled.
pub fn best_encoder(available: &BTreeSet<EncoderChoice>, hardware_enabled: bool) -> EncoderChoice {
    if !hardware_enabled {
        return EncoderChoice::Software;
    }

    HARDWARE_PRIORITY
        .iter()
        .copied()
        .find(|enc| available.contains(enc))
        .unwrap_or(EncoderChoice::Software)
}

/// Run the capability probe against `binary`
///
/// Never fails: every problem is logged and reported as an empty set.
pub async fn detect_encoders(binary: &Path, timeout: Duration) -> BTreeSet<EncoderChoice> {
    let mut cmd = Command::new(binary);
    cmd.arg("-hide_banner")
        .arg("-encoders")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true);
    crate::supervisor::hide_console_window(&mut cmd);

    let output = match tokio::time::timeout(timeout, cmd.output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            warn!("Encoder probe could not run {}: {}", binary.display(), e);
            return BTreeSet::new();
        }
        Err(_) => {
            warn!("Encoder probe timed out after {:?}", timeout);
            return BTreeSet::new();
        }
    };

    if !output.status.success() {
        warn!("Encoder probe exited with {}", output.status);
        return BTreeSet::new();
    }

    let listing = String::from_utf8_lossy(&output.stdout);
    let detected = parse_encoder_listing(&listing);
    debug!("Encoder probe found {:?}", detected);
    detected
}

/// Lazily probed, cached encoder capabilities for one binary
#[derive(Debug)]
pub struct EncoderCapabilities {
    binary: PathBuf,
    timeout: Duration,
    detected: OnceCell<BTreeSet<EncoderChoice>>,
}

impl EncoderCapabilities {
    pub fn new(binary: PathBuf, timeout: Duration) -> Self {
        Self {
            binary,
            timeout,
            detected: OnceCell::new(),
        }
    }

    /// Detected hardware encoders; the probe runs at most once
    pub async fn available(&self) -> &BTreeSet<EncoderChoice> {
        self.detected
            .get_or_init(|| async {
                let detected = detect_encoders(&self.binary, self.timeout).await;
                info!(
                    "Hardware encoders available: {}",
                    if detected.is_empty() {
                        "none".to_string()
                    } else {
                        detected
                            .iter()
                            .map(|e| e.codec())
                            .collect::<Vec<_>>()
                            .join(", ")
                    }
                );
                detected
            })
            .await
    }

    /// Best encoder for a new session
    pub async fn best(&self, hardware_enabled: bool) -> EncoderChoice {
        if !hardware_enabled {
            return EncoderChoice::Software;
        }
        best_encoder(self.available().await, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const LISTING: &str = "\
Encoders:
 V..... = Video
 ------
 V....D libx264              libx264 H.264 / AVC / MPEG-4 AVC (codec h264)
 V....D h264_amf             AMD AMF H.264 Encoder (codec h264)
 V....D h264_nvenc           NVIDIA NVENC H.264 encoder (codec h264)
 V....D hevc_nvenc           NVIDIA NVENC hevc encoder (codec hevc)
";

    #[test]
    fn test_parse_listing_finds_hardware_tokens() {
        let found = parse_encoder_listing(LISTING);
        assert!(found.contains(&EncoderChoice::Nvenc));
        assert!(found.contains(&EncoderChoice::Amf));
        assert!(!found.contains(&EncoderChoice::Qsv));
        assert!(!found.contains(&EncoderChoice::Software));
    }

    #[test]
    fn test_parse_listing_ignores_partial_tokens() {
        let found = parse_encoder_listing(" V....D h264_nvenc_custom  something\n");
        assert!(found.is_empty());
    }

    #[test]
    fn test_best_encoder_priority() {
        let all: BTreeSet<_> = [EncoderChoice::Amf, EncoderChoice::Qsv, EncoderChoice::Nvenc]
            .into_iter()
            .collect();
        assert_eq!(best_encoder(&all, true), EncoderChoice::Nvenc);

        let qsv_amf: BTreeSet<_> = [EncoderChoice::Amf, EncoderChoice::Qsv].into_iter().collect();
        assert_eq!(best_encoder(&qsv_amf, true), EncoderChoice::Qsv);

        let amf: BTreeSet<_> = [EncoderChoice::Amf].into_iter().collect();
        assert_eq!(best_encoder(&amf, true), EncoderChoice::Amf);

        assert_eq!(best_encoder(&BTreeSet::new(), true), EncoderChoice::Software);
    }

    proptest! {
        #[test]
        fn prop_disabled_hardware_always_software(
            nvenc in proptest::bool::ANY,
            qsv in proptest::bool::ANY,
            amf in proptest::bool::ANY,
        ) {
            let mut set = BTreeSet::new();
            if nvenc { set.insert(EncoderChoice::Nvenc); }
            if qsv { set.insert(EncoderChoice::Qsv); }
            if amf { set.insert(EncoderChoice::Amf); }
            prop_assert_eq!(best_encoder(&set, false), EncoderChoice::Software);
        }
    }

    #[tokio::test]
    async fn test_missing_binary_yields_empty_set() {
        let detected = detect_encoders(
            Path::new("/nonexistent/neorec-ffmpeg"),
            Duration::from_secs(2),
        )
        .await;
        assert!(detected.is_empty());
    }

    #[tokio::test]
    async fn test_capabilities_disabled_skips_probe() {
        let caps = EncoderCapabilities::new(
            PathBuf::from("/nonexistent/neorec-ffmpeg"),
            Duration::from_secs(2),
        );
        assert_eq!(caps.best(false).await, EncoderChoice::Software);
        assert!(caps.detected.get().is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_capabilities_probe_is_cached() {
        use crate::test_support::FakeEncoder;

        let fake = FakeEncoder::new().with_hardware(&["h264_qsv"]).install();
        let caps = EncoderCapabilities::new(fake.binary.clone(), Duration::from_secs(5));

        assert_eq!(caps.best(true).await, EncoderChoice::Qsv);
        assert_eq!(caps.best(true).await, EncoderChoice::Qsv);
        assert_eq!(fake.probe_count(), 1);
    }
}

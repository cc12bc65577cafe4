//! Joining segments into the final artifact
//!
//! Uses ffmpeg's concat demuxer with stream copy, so no re-encoding happens.
//! A merge that fails never loses the recording outright: the last segment
//! is moved into place instead.

use crate::supervisor::hide_console_window;
use log::{info, warn};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;

/// How the final file came to be
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStatus {
    /// Several segments concatenated
    Merged,
    /// The only segment was moved into place
    Moved,
    /// Concatenation failed; the last segment was kept
    Fallback,
    /// Nothing was recorded
    Empty,
}

#[derive(Debug, Error)]
pub(crate) enum MergeError {
    #[error("failed to run {binary}: {source}")]
    Spawn {
        binary: String,
        source: std::io::Error,
    },

    #[error("concat timed out after {0:?}")]
    Timeout(Duration),

    #[error("concat exited with {0}")]
    Failed(ExitStatus),

    #[error("concat produced an empty file")]
    EmptyOutput,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result of finalizing a session's segments
#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutcome {
    pub output_path: Option<PathBuf>,
    pub status: MergeStatus,
    /// Why concatenation was abandoned, for [`MergeStatus::Fallback`]
    pub warning: Option<String>,
}

/// Concat demuxer manifest for `segments`
///
/// Single quotes in paths are closed, escaped and reopened (`'\''`).
pub fn concat_manifest(segments: &[PathBuf]) -> String {
    segments
        .iter()
        .map(|path| {
            let escaped = path.to_string_lossy().replace('\'', r"'\''");
            format!("file '{}'\n", escaped)
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct SegmentMerger {
    binary: PathBuf,
    timeout: Duration,
}

impl SegmentMerger {
    pub fn new(binary: PathBuf, timeout: Duration) -> Self {
        Self { binary, timeout }
    }

    /// Produce `final_path` from the segments that actually hold data
    ///
    /// `manifest` is where the concat list is written. Only an IO failure
    /// while moving a segment into place is returned as an error.
    pub async fn merge(
        &self,
        segments: &[PathBuf],
        manifest: &Path,
        final_path: &Path,
    ) -> std::io::Result<MergeOutcome> {
        let segments = existing_segments(segments).await;

        if segments.is_empty() {
            info!("No segment holds data; nothing to merge");
            return Ok(MergeOutcome {
                output_path: None,
                status: MergeStatus::Empty,
                warning: None,
            });
        }

        if let Some(parent) = final_path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        if let [only] = segments.as_slice() {
            move_file(only, final_path).await?;
            info!("Single segment moved to {}", final_path.display());
            return Ok(MergeOutcome {
                output_path: Some(final_path.to_path_buf()),
                status: MergeStatus::Moved,
                warning: None,
            });
        }

        match self.concat(&segments, manifest, final_path).await {
            Ok(()) => {
                info!(
                    "Merged {} segments into {}",
                    segments.len(),
                    final_path.display()
                );
                Ok(MergeOutcome {
                    output_path: Some(final_path.to_path_buf()),
                    status: MergeStatus::Merged,
                    warning: None,
                })
            }
            Err(e) => {
                let err = crate::recorder::RecorderError::MergeFailure(e.to_string());
                warn!("{}; keeping the last segment only", err);
                let _ = tokio::fs::remove_file(final_path).await;

                // non-empty, checked above
                let last = &segments[segments.len() - 1];
                move_file(last, final_path).await?;
                Ok(MergeOutcome {
                    output_path: Some(final_path.to_path_buf()),
                    status: MergeStatus::Fallback,
                    warning: Some(format!("{}; only the last segment was kept", err)),
                })
            }
        }
    }

    async fn concat(
        &self,
        segments: &[PathBuf],
        manifest: &Path,
        final_path: &Path,
    ) -> Result<(), MergeError> {
        tokio::fs::write(manifest, concat_manifest(segments)).await?;

        let mut cmd = Command::new(&self.binary);
        cmd.args(["-y", "-f", "concat", "-safe", "0", "-i"])
            .arg(manifest)
            .args(["-c", "copy"])
            .arg(final_path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        hide_console_window(&mut cmd);

        let mut child = cmd.spawn().map_err(|source| MergeError::Spawn {
            binary: self.binary.display().to_string(),
            source,
        })?;

        let status = match tokio::time::timeout(self.timeout, child.wait()).await {
            Ok(status) => status?,
            Err(_) => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                return Err(MergeError::Timeout(self.timeout));
            }
        };

        if !status.success() {
            return Err(MergeError::Failed(status));
        }

        let written = tokio::fs::metadata(final_path)
            .await
            .map(|m| m.len())
            .unwrap_or(0);
        if written == 0 {
            return Err(MergeError::EmptyOutput);
        }
        Ok(())
    }
}

/// Segments whose files exist and are not empty, in the given order
async fn existing_segments(segments: &[PathBuf]) -> Vec<PathBuf> {
    let mut found = Vec::with_capacity(segments.len());
    for path in segments {
        match tokio::fs::metadata(path).await {
            Ok(meta) if meta.len() > 0 => found.push(path.clone()),
            Ok(_) => warn!("Skipping empty segment {}", path.display()),
            Err(_) => warn!("Skipping missing segment {}", path.display()),
        }
    }
    found
}

/// Rename, or copy and delete when the rename crosses filesystems
pub(crate) async fn move_file(from: &Path, to: &Path) -> std::io::Result<()> {
    if tokio::fs::rename(from, to).await.is_ok() {
        return Ok(());
    }
    tokio::fs::copy(from, to).await?;
    tokio::fs::remove_file(from).await
}

/// Best-effort removal of a session directory
pub(crate) async fn remove_session_dir(dir: &Path) {
    if let Err(e) = tokio::fs::remove_dir_all(dir).await {
        warn!("Could not remove session directory {}: {}", dir.display(), e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manifest_lines() {
        let manifest = concat_manifest(&[
            PathBuf::from("/tmp/a/segment_000.mp4"),
            PathBuf::from("/tmp/a/segment_001.mp4"),
        ]);
        assert_eq!(
            manifest,
            "file '/tmp/a/segment_000.mp4'\nfile '/tmp/a/segment_001.mp4'\n"
        );
    }

    #[test]
    fn test_manifest_escapes_single_quotes() {
        let manifest = concat_manifest(&[PathBuf::from("/tmp/it's here/segment_000.mp4")]);
        assert_eq!(manifest, "file '/tmp/it'\\''s here/segment_000.mp4'\n");
    }

    async fn write(path: &Path, bytes: &[u8]) {
        tokio::fs::write(path, bytes).await.unwrap();
    }

    fn merger(binary: PathBuf) -> SegmentMerger {
        SegmentMerger::new(binary, Duration::from_secs(10))
    }

    #[tokio::test]
    async fn test_no_segments_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("segment_000.mp4");
        let empty = dir.path().join("segment_001.mp4");
        write(&empty, b"").await;

        let outcome = merger(PathBuf::from("ffmpeg"))
            .merge(&[missing, empty], &dir.path().join("concat.txt"), &dir.path().join("out.mp4"))
            .await
            .unwrap();
        assert_eq!(outcome.status, MergeStatus::Empty);
        assert_eq!(outcome.output_path, None);
    }

    #[tokio::test]
    async fn test_single_segment_is_moved_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let seg = dir.path().join("segment_000.mp4");
        write(&seg, b"one segment of video").await;
        let final_path = dir.path().join("nested/out/final.mp4");

        // binary is never invoked for a single segment
        let outcome = merger(PathBuf::from("/nonexistent/neorec-ffmpeg"))
            .merge(&[seg.clone()], &dir.path().join("concat.txt"), &final_path)
            .await
            .unwrap();

        assert_eq!(outcome.status, MergeStatus::Moved);
        assert_eq!(std::fs::read(&final_path).unwrap(), b"one segment of video");
        assert!(!seg.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_many_segments_are_concatenated() {
        use crate::test_support::FakeEncoder;

        let fake = FakeEncoder::new().install();
        let dir = tempfile::tempdir().unwrap();
        let segments: Vec<PathBuf> = (0..3)
            .map(|i| dir.path().join(format!("segment_{:03}.mp4", i)))
            .collect();
        write(&segments[0], b"aaaa").await;
        write(&segments[1], b"bb").await;
        write(&segments[2], b"cccccc").await;
        let final_path = dir.path().join("final.mp4");

        let outcome = merger(fake.binary.clone())
            .merge(&segments, &dir.path().join("concat.txt"), &final_path)
            .await
            .unwrap();

        assert_eq!(outcome.status, MergeStatus::Merged);
        let merged = std::fs::read(&final_path).unwrap();
        assert_eq!(merged.len(), 12);
        assert_eq!(merged, b"aaaabbcccccc");
        assert!(dir.path().join("concat.txt").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failed_concat_keeps_last_segment() {
        use crate::test_support::FakeEncoder;

        let fake = FakeEncoder::new().fail_when("concat").install();
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("segment_000.mp4");
        let last = dir.path().join("segment_001.mp4");
        write(&first, b"first").await;
        write(&last, b"last").await;
        let final_path = dir.path().join("final.mp4");

        let outcome = merger(fake.binary.clone())
            .merge(&[first.clone(), last], &dir.path().join("concat.txt"), &final_path)
            .await
            .unwrap();

        assert_eq!(outcome.status, MergeStatus::Fallback);
        assert!(outcome.warning.unwrap().contains("only the last segment"));
        assert_eq!(std::fs::read(&final_path).unwrap(), b"last");
        // earlier segments are left for the caller
        assert!(first.exists());
    }

    #[tokio::test]
    async fn test_missing_binary_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("segment_000.mp4");
        let last = dir.path().join("segment_001.mp4");
        write(&first, b"first").await;
        write(&last, b"last").await;
        let final_path = dir.path().join("final.mp4");

        let outcome = merger(PathBuf::from("/nonexistent/neorec-ffmpeg"))
            .merge(&[first, last], &dir.path().join("concat.txt"), &final_path)
            .await
            .unwrap();
        assert_eq!(outcome.status, MergeStatus::Fallback);
        assert_eq!(std::fs::read(&final_path).unwrap(), b"last");
    }
}

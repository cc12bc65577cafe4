//! Parsing of ffmpeg's diagnostic stream
//!
//! ffmpeg rewrites its progress line in place with carriage returns and
//! prints everything else with newlines, so [`LineSplitter`] treats both as
//! terminators. Output from DirectShow devices is often in the console code
//! page rather than UTF-8; [`decode_line`] tries a short list of encodings
//! before giving up and decoding lossily.

use encoding_rs::{Encoding, IBM866, UTF_8, WINDOWS_1251};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;

/// Encodings tried, in order, before lossy UTF-8
pub fn candidate_encodings() -> [&'static Encoding; 3] {
    [UTF_8, WINDOWS_1251, IBM866]
}

static PROGRESS_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"frame=\s*(\d+)\s+fps=\s*([\d.]+).*?size=\s*(\S+)\s+time=\s*(\S+)\s+bitrate=\s*(\S+).*?speed=\s*(\S+)",
    )
    .expect("progress pattern is valid")
});

static DROP_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"drop=\s*(\d+)").expect("drop pattern is valid"));

/// Words that make an unstructured encoder line worth a warning
const WARNING_KEYWORDS: &[&str] = &["error", "warning", "failed", "drop"];

/// Latest encoder telemetry for the active segment
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordingProgress {
    pub frame_count: u64,
    pub fps: f64,
    pub bitrate: String,
    pub size: String,
    pub encoded_time: String,
    pub speed: String,
    pub dropped_frames: u64,
}

/// Fields captured from one progress line
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressLine {
    pub frame_count: u64,
    pub fps: f64,
    pub size: String,
    pub encoded_time: String,
    pub bitrate: String,
    pub speed: String,
    /// Present only when the encoder printed `drop=` on the same line
    pub dropped_frames: Option<u64>,
}

impl RecordingProgress {
    /// Fold a parsed progress line into the current value
    pub fn apply(&mut self, line: &ProgressLine) {
        self.frame_count = line.frame_count;
        self.fps = line.fps;
        self.size = line.size.clone();
        self.encoded_time = line.encoded_time.clone();
        self.bitrate = line.bitrate.clone();
        self.speed = line.speed.clone();
        if let Some(dropped) = line.dropped_frames {
            self.dropped_frames = dropped;
        }
    }
}

/// Parse a structured progress line
///
/// Returns `None` for anything that is not a progress report.
pub fn parse_progress_line(line: &str) -> Option<ProgressLine> {
    let caps = PROGRESS_RE.captures(line)?;

    Some(ProgressLine {
        frame_count: caps[1].parse().ok()?,
        fps: caps[2].parse().ok()?,
        size: caps[3].to_string(),
        encoded_time: caps[4].to_string(),
        bitrate: caps[5].to_string(),
        speed: caps[6].to_string(),
        dropped_frames: parse_dropped_frames(line),
    })
}

/// Dropped-frame counter, matched independently of the progress pattern
pub fn parse_dropped_frames(line: &str) -> Option<u64> {
    DROP_RE
        .captures(line)
        .and_then(|caps| caps[1].parse().ok())
}

/// Whether an unstructured line should be surfaced as a warning
pub fn is_warning_line(line: &str) -> bool {
    let lower = line.to_lowercase();
    WARNING_KEYWORDS.iter().any(|kw| lower.contains(kw))
}

/// Decode raw encoder output
///
/// Each candidate encoding is tried strictly; the first one that decodes
/// without errors wins. Falls back to lossy UTF-8, so this never fails.
pub fn decode_line(bytes: &[u8]) -> Cow<'_, str> {
    for encoding in candidate_encodings() {
        if let Some(text) = encoding.decode_without_bom_handling_and_without_replacement(bytes) {
            return text;
        }
    }
    String::from_utf8_lossy(bytes)
}

/// Incremental splitter for `\n` / `\r` terminated lines
#[derive(Debug, Default)]
pub struct LineSplitter {
    pending: Vec<u8>,
}

impl LineSplitter {
    /// Feed a chunk, returning every line it completes
    ///
    /// Empty lines (e.g. the `\n` of a `\r\n` pair) are skipped.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        let mut lines = Vec::new();
        for &byte in chunk {
            if byte == b'\n' || byte == b'\r' {
                if !self.pending.is_empty() {
                    lines.push(std::mem::take(&mut self.pending));
                }
            } else {
                self.pending.push(byte);
            }
        }
        lines
    }

    /// Whatever is left once the stream has ended
    pub fn finish(&mut self) -> Option<Vec<u8>> {
        if self.pending.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.pending))
        }
    }
}

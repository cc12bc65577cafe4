//! NeoRecorder core
//!
//! Segmented screen recording on top of an external ffmpeg process: start
//! with hardware/backend fallback, pause and resume as separate segments,
//! live telemetry, and a lossless merge into the final file.

pub mod encode;
pub mod events;
pub mod merge;
mod monitor;
pub mod recorder;
pub mod request;
pub mod session;
mod supervisor;
pub mod telemetry;

#[cfg(test)]
mod test_support;

pub use encode::{
    best_encoder, build_args, detect_encoders, CaptureBackend, EncoderCapabilities, EncoderChoice,
    QualityPreset, SegmentCommand, FRAMERATE_OPTIONS,
};
pub use events::{EventReceiver, EventSender, RecorderEvent};
pub use merge::{concat_manifest, MergeOutcome, MergeStatus, SegmentMerger};
pub use monitor::SharedProgress;
pub use neorec_config as config;
pub use neorec_config::Config;
pub use recorder::{format_duration, Recorder, RecorderError, RecordingResult, SegmentSummary};
pub use request::{CaptureArea, CaptureRegion, RecordingRequest, RequestError};
pub use session::{ElapsedClock, Segment, SessionState};
pub use telemetry::{parse_progress_line, LineSplitter, RecordingProgress};

//! Encoder-facing modules: capability probing, presets and argument building

pub mod capabilities;
pub mod command;
pub mod preset;

pub use capabilities::{best_encoder, detect_encoders, EncoderCapabilities, EncoderChoice};
pub use command::{build_args, CaptureBackend, SegmentCommand};
pub use preset::{QualityPreset, FRAMERATE_OPTIONS};

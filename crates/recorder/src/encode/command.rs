//! ffmpeg argument construction for one recording segment
//!
//! Pure: the same inputs always produce the same argument list and nothing
//! here touches the filesystem or spawns processes.

use crate::encode::capabilities::EncoderChoice;
use crate::encode::preset::QualityPreset;
use crate::request::{CaptureArea, RecordingRequest};
use serde::Serialize;
use std::path::Path;

/// Hardware encoders use a constant-quality scale shifted against CRF
pub const HARDWARE_QUALITY_OFFSET: u8 = 5;

/// Frame rate ceiling of the GDI capture device
pub const GDI_MAX_FRAMERATE: u32 = 60;

/// How desktop pixels are obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureBackend {
    /// Desktop Duplication API (`ddagrab`), fast but unavailable on older systems
    DesktopDuplication,
    /// Legacy GDI capture (`gdigrab`), works everywhere, capped at 60 fps
    Gdi,
}

impl CaptureBackend {
    /// Backends in the order startup tries them
    pub const FALLBACK_ORDER: [CaptureBackend; 2] =
        [CaptureBackend::DesktopDuplication, CaptureBackend::Gdi];

    /// ffmpeg device name
    pub fn device(&self) -> &'static str {
        match self {
            CaptureBackend::DesktopDuplication => "ddagrab",
            CaptureBackend::Gdi => "gdigrab",
        }
    }

    /// Requested frame rate limited to what the backend can deliver
    pub fn clamp_framerate(&self, fps: u32) -> u32 {
        match self {
            CaptureBackend::DesktopDuplication => fps,
            CaptureBackend::Gdi => fps.min(GDI_MAX_FRAMERATE),
        }
    }
}

impl std::fmt::Display for CaptureBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.device())
    }
}

/// Inputs for one encoder invocation
#[derive(Debug, Clone)]
pub struct SegmentCommand<'a> {
    pub backend: CaptureBackend,
    pub encoder: EncoderChoice,
    pub preset: &'a QualityPreset,
    pub request: &'a RecordingRequest,
    /// DirectShow loopback device used when the request asks for system audio
    pub system_audio_device: &'a str,
    pub output_path: &'a Path,
}

impl SegmentCommand<'_> {
    /// Frame rate actually requested from the capture device
    pub fn framerate(&self) -> u32 {
        self.backend.clamp_framerate(self.request.framerate)
    }

    pub fn build_args(&self) -> Vec<String> {
        build_args(self)
    }
}

/// Build the complete ffmpeg argument vector for a segment
///
/// Layout:
/// - `-y`
/// - capture input for the backend, cropped to the sanitized region
/// - optional microphone / system audio inputs (DirectShow)
/// - video encoder with its rate-control flags
/// - `-pix_fmt yuv420p -fps_mode cfr`
/// - output path
pub fn build_args(cmd: &SegmentCommand<'_>) -> Vec<String> {
    let mut args: Vec<String> = vec!["-y".into()];
    let area = cmd.request.region.and_then(|r| r.sanitized());

    push_capture_input(&mut args, cmd.backend, cmd.framerate(), area);

    let audio_inputs = push_audio_inputs(&mut args, cmd);
    push_stream_mapping(&mut args, audio_inputs);

    args.push("-c:v".into());
    args.push(cmd.encoder.codec().into());
    push_rate_control(&mut args, cmd.encoder, cmd.preset);

    if audio_inputs > 0 {
        args.extend(["-c:a", "aac", "-b:a", "192k"].map(String::from));
    }

    args.extend(["-pix_fmt", "yuv420p", "-fps_mode", "cfr"].map(String::from));
    args.push(cmd.output_path.to_string_lossy().into_owned());

    args
}

fn push_capture_input(
    args: &mut Vec<String>,
    backend: CaptureBackend,
    fps: u32,
    area: Option<CaptureArea>,
) {
    match backend {
        CaptureBackend::DesktopDuplication => {
            // ddagrab is a lavfi source; frames live on the GPU until hwdownload
            let mut source = format!("ddagrab=output_idx=0:framerate={}", fps);
            if let Some(a) = area {
                source.push_str(&format!(
                    ":offset_x={}:offset_y={}:video_size={}x{}",
                    a.x, a.y, a.width, a.height
                ));
            }
            source.push_str(",hwdownload,format=bgra");

            args.extend(["-f".into(), "lavfi".into(), "-i".into(), source]);
        }
        CaptureBackend::Gdi => {
            args.extend(["-f", "gdigrab", "-framerate"].map(String::from));
            args.push(fps.to_string());
            if let Some(a) = area {
                args.extend([
                    "-offset_x".into(),
                    a.x.to_string(),
                    "-offset_y".into(),
                    a.y.to_string(),
                    "-video_size".into(),
                    format!("{}x{}", a.width, a.height),
                ]);
            }
            args.extend(["-i", "desktop"].map(String::from));
        }
    }
}

/// Returns the number of audio inputs added
fn push_audio_inputs(args: &mut Vec<String>, cmd: &SegmentCommand<'_>) -> usize {
    let mut devices: Vec<&str> = Vec::new();
    if let Some(mic) = cmd.request.microphone.as_deref() {
        devices.push(mic);
    }
    if cmd.request.system_audio {
        devices.push(cmd.system_audio_device);
    }

    for device in &devices {
        args.extend([
            "-f".into(),
            "dshow".into(),
            "-i".into(),
            format!("audio={}", device),
        ]);
    }

    devices.len()
}

fn push_stream_mapping(args: &mut Vec<String>, audio_inputs: usize) {
    match audio_inputs {
        0 => {}
        1 => args.extend(["-map", "0:v", "-map", "1:a"].map(String::from)),
        n => {
            let labels: String = (1..=n).map(|i| format!("[{}:a]", i)).collect();
            args.push("-filter_complex".into());
            args.push(format!(
                "{}amix=inputs={}:duration=longest[aout]",
                labels, n
            ));
            args.extend(["-map", "0:v", "-map", "[aout]"].map(String::from));
        }
    }
}

fn push_rate_control(args: &mut Vec<String>, encoder: EncoderChoice, preset: &QualityPreset) {
    let hw_quality = (preset.crf + HARDWARE_QUALITY_OFFSET).to_string();

    match encoder {
        EncoderChoice::Software => {
            args.extend([
                "-preset".into(),
                preset.speed.into(),
                "-tune".into(),
                "zerolatency".into(),
                "-crf".into(),
                preset.crf.to_string(),
            ]);
        }
        EncoderChoice::Nvenc => {
            args.extend(["-preset", "p4", "-tune", "ll", "-rc", "vbr", "-cq"].map(String::from));
            args.push(hw_quality);
            args.extend(["-b:v", "0"].map(String::from));
        }
        EncoderChoice::Qsv => {
            args.extend(["-preset", "faster", "-global_quality"].map(String::from));
            args.push(hw_quality);
        }
        EncoderChoice::Amf => {
            args.extend(["-quality", "speed", "-rc", "cqp", "-qp_i"].map(String::from));
            args.push(hw_quality.clone());
            args.push("-qp_p".into());
            args.push(hw_quality);
        }
    }
}

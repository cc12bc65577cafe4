//! CLI entry point for NeoRecorder
//!
//! `neorec record` runs one session in the foreground; `p`, `r` and `q`
//! on stdin pause, resume and stop it, as does Ctrl-C.

use chrono::Local;
use clap::{Args, Parser, Subcommand};
use log::{error, info, warn};
use neorec::{
    CaptureRegion, Config, QualityPreset, Recorder, RecorderEvent, RecordingRequest,
    RecordingResult, FRAMERATE_OPTIONS,
};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};

/// NeoRecorder - segmented screen recording driven by ffmpeg
#[derive(Parser, Debug)]
#[command(name = "neorec")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, default_value = "neorec.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Record the desktop until stopped
    Record(RecordArgs),
    /// Show which hardware encoders ffmpeg offers
    Encoders,
    /// List quality presets and frame rates
    Presets,
}

#[derive(Args, Debug)]
struct RecordArgs {
    /// Output file (default: Record_<timestamp>.mp4 in the output directory)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Capture rectangle as x1,y1,x2,y2
    #[arg(long)]
    region: Option<CaptureRegion>,

    /// DirectShow microphone device
    #[arg(long)]
    microphone: Option<String>,

    /// Also capture system audio
    #[arg(long, default_value = "false")]
    system_audio: bool,

    /// Frame rate (30, 60, 120, 144 or 240)
    #[arg(long)]
    fps: Option<u32>,

    /// Quality preset key
    #[arg(short, long)]
    quality: Option<String>,

    /// Stop automatically after this many seconds
    #[arg(long)]
    duration: Option<u64>,

    /// Print the result as JSON
    #[arg(long, default_value = "false")]
    json: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let config = match Config::load_or_default(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load {}: {}", cli.config.display(), e);
            return ExitCode::FAILURE;
        }
    };

    match cli.command {
        Command::Record(args) => record(config, args).await,
        Command::Encoders => encoders(config).await,
        Command::Presets => {
            presets();
            ExitCode::SUCCESS
        }
    }
}

fn default_output_dir(config: &Config) -> PathBuf {
    config
        .recording
        .output_dir
        .clone()
        .or_else(|| dirs::video_dir().map(|dir| dir.join("NeoRecorder")))
        .unwrap_or_else(|| PathBuf::from("."))
}

fn default_file_name() -> String {
    format!("Record_{}.mp4", Local::now().format("%Y-%m-%d_%H-%M-%S"))
}

fn build_request(config: &Config, args: &RecordArgs) -> RecordingRequest {
    let output = args
        .output
        .clone()
        .unwrap_or_else(|| default_output_dir(config).join(default_file_name()));

    let mut request = RecordingRequest::new(output)
        .with_framerate(args.fps.unwrap_or(config.recording.framerate))
        .with_quality(
            args.quality
                .clone()
                .unwrap_or_else(|| config.recording.quality.clone()),
        )
        .with_system_audio(args.system_audio);
    if let Some(region) = args.region {
        request = request.with_region(region);
    }
    if let Some(mic) = &args.microphone {
        request = request.with_microphone(mic.clone());
    }
    request
}

async fn record(config: Config, args: RecordArgs) -> ExitCode {
    let request = build_request(&config, &args);
    let (recorder, mut events) = Recorder::new(config);

    if let Err(e) = recorder.start_recording(request.clone()).await {
        eprintln!("Failed to start recording: {}", e);
        return ExitCode::FAILURE;
    }
    println!(
        "Recording to {} - p = pause, r = resume, q = stop",
        request.output_path.display()
    );

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let auto_stop = async {
        match args.duration {
            Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(auto_stop);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, stopping");
                break;
            }
            _ = &mut auto_stop => {
                info!("Duration reached, stopping");
                break;
            }
            line = stdin.next_line(), if stdin_open => match line {
                Ok(Some(line)) => match line.trim() {
                    "p" => {
                        if let Err(e) = recorder.pause_recording().await {
                            warn!("{}", e);
                        } else {
                            println!("Paused");
                        }
                    }
                    "r" => {
                        if let Err(e) = recorder.resume_recording().await {
                            warn!("{}", e);
                        } else {
                            println!("Resumed");
                        }
                    }
                    "q" => break,
                    "" => {}
                    other => println!("Unknown command '{}' (p, r or q)", other),
                },
                Ok(None) | Err(_) => stdin_open = false,
            },
            Some(event) = events.recv() => report(&event),
        }
    }

    match recorder.stop_recording().await {
        Ok(result) => {
            // drain whatever arrived during the stop
            while let Ok(event) = events.try_recv() {
                report(&event);
            }
            print_result(&result, args.json);
            if result.output_path.is_some() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Err(e) => {
            eprintln!("Failed to stop recording: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn report(event: &RecorderEvent) {
    match event {
        RecorderEvent::Started => info!("Encoder running"),
        RecorderEvent::Progress(p) => {
            eprint!(
                "\rframe={} fps={:.1} time={} size={} speed={} drop={}   ",
                p.frame_count, p.fps, p.encoded_time, p.size, p.speed, p.dropped_frames
            );
        }
        RecorderEvent::Warning(msg) => warn!("{}", msg),
        RecorderEvent::Error(msg) => error!("{}", msg),
        RecorderEvent::Stopped(_) => {}
    }
}

fn print_result(result: &RecordingResult, json: bool) {
    eprintln!();
    if json {
        match serde_json::to_string_pretty(result) {
            Ok(text) => println!("{}", text),
            Err(e) => eprintln!("Failed to serialize result: {}", e),
        }
        return;
    }

    match &result.output_path {
        Some(path) => println!("Saved {}", display_path(path)),
        None => println!("Nothing was recorded"),
    }
    println!(
        "Duration {} ({} segments, {:.1}s paused, {:?})",
        result.duration_formatted, result.segment_count, result.paused_secs, result.merge_status
    );
}

fn display_path(path: &Path) -> String {
    path.canonicalize()
        .unwrap_or_else(|_| path.to_path_buf())
        .display()
        .to_string()
}

async fn encoders(config: Config) -> ExitCode {
    let hardware_enabled = config.encoder.hardware_encoding;
    let (recorder, _events) = Recorder::new(config);
    let caps = recorder.capabilities();

    let available = caps.available().await;
    if available.is_empty() {
        println!("No hardware encoders detected");
    }
    for encoder in available {
        println!("  {}", encoder);
    }
    println!(
        "Selected: {}{}",
        caps.best(hardware_enabled).await,
        if hardware_enabled { "" } else { " (hardware encoding disabled)" }
    );
    ExitCode::SUCCESS
}

fn presets() {
    println!("{:<10} {:<10} {:>4}  speed", "key", "label", "crf");
    for preset in QualityPreset::all() {
        println!(
            "{:<10} {:<10} {:>4}  {}",
            preset.key, preset.label, preset.crf, preset.speed
        );
    }
    let rates: Vec<String> = FRAMERATE_OPTIONS.iter().map(|r| r.to_string()).collect();
    println!("\nframe rates: {}", rates.join(", "));
}

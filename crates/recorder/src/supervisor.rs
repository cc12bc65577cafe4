//! Encoder process supervision
//!
//! Starting a segment walks a fixed fallback ladder:
//! 1. primary capture backend with the session's encoder
//! 2. secondary backend (frame rate clamped)
//! 3. when the encoder was hardware: demote to software in safe mode and
//!    try both backends again
//!
//! An attempt fails when the process cannot be spawned or has already exited
//! once the settle interval is over. Stopping escalates from a graceful `q`
//! on stdin to a terminate request to a kill.

use crate::encode::{CaptureBackend, EncoderChoice, QualityPreset, SegmentCommand};
use crate::events::{emit, EventSender, RecorderEvent};
use crate::monitor::{spawn_monitor, MonitorContext, MonitorOutcome, SharedProgress};
use crate::request::RecordingRequest;
use crate::session::{Segment, SessionLayout, SharedState};
use log::{debug, info, warn};
use neorec_config::Config;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::process::{ChildStdin, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Suppresses the console window Windows would open for each child
#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Upper bound for collecting the output of a process that died during startup
const EARLY_EXIT_DRAIN: Duration = Duration::from_secs(2);

/// Why a single launch attempt failed
#[derive(Debug, Error)]
pub(crate) enum LaunchError {
    #[error("failed to spawn {binary}: {source}")]
    Spawn {
        binary: String,
        source: std::io::Error,
    },

    #[error("encoder exited during startup with {0}")]
    EarlyExit(ExitStatus),

    #[error("segment log {path}: {source}")]
    Log {
        path: String,
        source: std::io::Error,
    },

    #[error("encoder stderr was not captured")]
    MissingPipe,
}

/// Every attempt of the fallback ladder failed, or the ladder was cancelled
#[derive(Debug, Error)]
#[error("{reason} (after {attempts} attempts)")]
pub(crate) struct StartupError {
    pub attempts: usize,
    pub reason: String,
    /// The ladder reached its safe-mode half before giving up
    pub demoted: bool,
    /// A stop request ended the ladder early
    pub cancelled: bool,
}

/// Stopping a segment did not end cleanly
#[derive(Debug, Error)]
pub(crate) enum StopError {
    #[error("monitor task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Hide the console window of a spawned tool on Windows
#[cfg(windows)]
pub(crate) fn hide_console_window(cmd: &mut Command) {
    cmd.creation_flags(CREATE_NO_WINDOW);
}

#[cfg(not(windows))]
pub(crate) fn hide_console_window(_cmd: &mut Command) {}

/// One launch on the fallback ladder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct LaunchPlan {
    pub backend: CaptureBackend,
    pub encoder: EncoderChoice,
    pub safe_mode: bool,
}

/// The launches tried for one segment, in order
///
/// The safe-mode half is only appended when the starting encoder is
/// hardware; a session already on software gets two attempts.
pub(crate) fn fallback_ladder(encoder: EncoderChoice, safe_mode: bool) -> Vec<LaunchPlan> {
    let mut plans: Vec<LaunchPlan> = CaptureBackend::FALLBACK_ORDER
        .iter()
        .map(|&backend| LaunchPlan {
            backend,
            encoder,
            safe_mode,
        })
        .collect();

    if encoder.is_hardware() {
        plans.extend(CaptureBackend::FALLBACK_ORDER.iter().map(|&backend| LaunchPlan {
            backend,
            encoder: EncoderChoice::Software,
            safe_mode: true,
        }));
    }
    plans
}

/// A segment whose encoder is running
#[derive(Debug)]
pub(crate) struct RunningSegment {
    pub segment: Segment,
    pid: Option<u32>,
    stdin: Option<ChildStdin>,
    kill_tx: Option<oneshot::Sender<()>>,
    stop_requested: Arc<AtomicBool>,
    monitor: JoinHandle<MonitorOutcome>,
}

impl RunningSegment {
    /// Stop the encoder and wait for its monitor to finish
    ///
    /// `q` on stdin, then a terminate request, then a kill; each stage is
    /// bounded by its own timeout.
    pub async fn stop(
        mut self,
        graceful: Duration,
        terminate: Duration,
    ) -> Result<MonitorOutcome, StopError> {
        let index = self.segment.index;
        self.stop_requested.store(true, Ordering::SeqCst);

        if let Some(mut stdin) = self.stdin.take() {
            let quit = async {
                stdin.write_all(b"q").await?;
                stdin.flush().await
            };
            if let Err(e) = quit.await {
                // Already gone; the monitor will have the exit status
                debug!("Segment {}: could not send quit: {}", index, e);
            }
        }

        if let Ok(joined) = tokio::time::timeout(graceful, &mut self.monitor).await {
            return Ok(joined?);
        }

        warn!(
            "Segment {}: encoder ignored quit for {:?}, terminating",
            index, graceful
        );
        if let Some(pid) = self.pid {
            terminate_process(pid).await;
        }
        if let Ok(joined) = tokio::time::timeout(terminate, &mut self.monitor).await {
            return Ok(joined?);
        }

        warn!("Segment {}: encoder still alive after terminate", index);
        if let Some(kill_tx) = self.kill_tx.take() {
            let _ = kill_tx.send(());
        }
        Ok((&mut self.monitor).await?)
    }
}

/// Ask a process to exit without killing it outright
async fn terminate_process(pid: u32) {
    #[cfg(windows)]
    let mut cmd = {
        let mut cmd = Command::new("taskkill");
        cmd.arg("/PID").arg(pid.to_string());
        cmd
    };
    #[cfg(not(windows))]
    let mut cmd = {
        let mut cmd = Command::new("kill");
        cmd.arg("-TERM").arg(pid.to_string());
        cmd
    };

    cmd.stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    hide_console_window(&mut cmd);

    match cmd.status().await {
        Ok(status) if status.success() => debug!("Terminate request sent to pid {}", pid),
        Ok(status) => debug!("Terminate request for pid {} exited with {}", pid, status),
        Err(e) => warn!("Could not send terminate request to pid {}: {}", pid, e),
    }
}

/// A started segment and the encoder settings it ended up with
#[derive(Debug)]
pub(crate) struct StartedSegment {
    pub running: RunningSegment,
    pub encoder: EncoderChoice,
    pub safe_mode: bool,
    pub attempts: usize,
}

/// Launches encoder processes for a recorder
#[derive(Debug, Clone)]
pub(crate) struct ProcessSupervisor {
    binary: PathBuf,
    system_audio_device: String,
    settle: Duration,
    graceful_stop: Duration,
    terminate: Duration,
    progress: SharedProgress,
    state: SharedState,
    events: EventSender,
}

impl ProcessSupervisor {
    pub fn new(
        config: &Config,
        binary: PathBuf,
        progress: SharedProgress,
        state: SharedState,
        events: EventSender,
    ) -> Self {
        Self {
            binary,
            system_audio_device: config.recording.system_audio_device.clone(),
            settle: config.process.settle(),
            graceful_stop: config.process.graceful_stop(),
            terminate: config.process.terminate(),
            progress,
            state,
            events,
        }
    }

    pub fn graceful_stop(&self) -> Duration {
        self.graceful_stop
    }

    pub fn terminate_timeout(&self) -> Duration {
        self.terminate
    }

    /// Walk the fallback ladder until one launch survives the settle interval
    ///
    /// `cancel` is checked before every attempt.
    pub async fn start_segment(
        &self,
        index: usize,
        layout: &SessionLayout,
        request: &RecordingRequest,
        preset: &'static QualityPreset,
        encoder: EncoderChoice,
        safe_mode: bool,
        cancel: &AtomicBool,
    ) -> Result<StartedSegment, StartupError> {
        let media_path = layout.media_path(index);
        let log_path = layout.log_path(index);
        let mut attempts = 0;
        let mut last_reason = String::from("no launch attempted");
        let mut demotion_reported = false;

        for plan in fallback_ladder(encoder, safe_mode) {
            if cancel.load(Ordering::SeqCst) {
                info!("Segment {}: startup cancelled after {} attempts", index, attempts);
                return Err(StartupError {
                    attempts,
                    reason: "cancelled by stop request".to_string(),
                    demoted: demotion_reported,
                    cancelled: true,
                });
            }

            if plan.encoder != encoder && !demotion_reported {
                demotion_reported = true;
                let msg = format!(
                    "{} failed on every capture backend; switching to safe mode (software encoding) for the rest of the session",
                    encoder
                );
                warn!("{}", msg);
                emit(&self.events, RecorderEvent::Warning(msg));
            }

            let preset = if plan.safe_mode {
                preset.safe_mode()
            } else {
                preset.clone()
            };
            let cmd = SegmentCommand {
                backend: plan.backend,
                encoder: plan.encoder,
                preset: &preset,
                request,
                system_audio_device: &self.system_audio_device,
                output_path: &media_path,
            };

            attempts += 1;
            match self.launch(index, &cmd, &log_path).await {
                Ok(running) => {
                    info!(
                        "Segment {} started: {} via {} at {} fps (attempt {})",
                        index,
                        plan.encoder,
                        plan.backend,
                        cmd.framerate(),
                        attempts
                    );
                    return Ok(StartedSegment {
                        running,
                        encoder: plan.encoder,
                        safe_mode: plan.safe_mode,
                        attempts,
                    });
                }
                Err(e) => {
                    warn!(
                        "Segment {}: {} via {} failed: {}",
                        index, plan.encoder, plan.backend, e
                    );
                    last_reason = e.to_string();
                }
            }
        }

        Err(StartupError {
            attempts,
            reason: last_reason,
            demoted: demotion_reported,
            cancelled: false,
        })
    }

    /// Spawn one encoder and wait out the settle interval
    async fn launch(
        &self,
        index: usize,
        cmd: &SegmentCommand<'_>,
        log_path: &Path,
    ) -> Result<RunningSegment, LaunchError> {
        let args = cmd.build_args();
        let log_err = |source| LaunchError::Log {
            path: log_path.display().to_string(),
            source,
        };

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)
            .await
            .map_err(log_err)?;
        let mut log = BufWriter::new(file);
        log.write_all(log_header(cmd, &self.binary, &args).as_bytes())
            .await
            .map_err(log_err)?;
        log.flush().await.map_err(log_err)?;

        let mut command = Command::new(&self.binary);
        command
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        hide_console_window(&mut command);

        debug!("Launching {} {:?}", self.binary.display(), args);
        let started_at = Instant::now();
        let mut child = command.spawn().map_err(|source| LaunchError::Spawn {
            binary: self.binary.display().to_string(),
            source,
        })?;

        tokio::time::sleep(self.settle).await;

        let early_exit = child.try_wait().map_err(|source| LaunchError::Spawn {
            binary: self.binary.display().to_string(),
            source,
        })?;
        if let Some(status) = early_exit {
            if let Some(stderr) = child.stderr.take() {
                drain_into_log(stderr, &mut log).await;
            }
            let _ = log.flush().await;
            return Err(LaunchError::EarlyExit(status));
        }

        let stderr = child.stderr.take().ok_or(LaunchError::MissingPipe)?;
        let stdin = child.stdin.take();
        let pid = child.id();
        let stop_requested = Arc::new(AtomicBool::new(false));
        let (kill_tx, kill_rx) = oneshot::channel();

        let segment = Segment {
            index,
            media_path: cmd.output_path.to_path_buf(),
            log_path: log_path.to_path_buf(),
            started_at,
            encoder: cmd.encoder,
            backend: cmd.backend,
        };

        let monitor = spawn_monitor(
            child,
            stderr,
            log,
            kill_rx,
            MonitorContext {
                segment_index: index,
                progress: self.progress.clone(),
                state: self.state.clone(),
                events: self.events.clone(),
                stop_requested: stop_requested.clone(),
            },
        );

        Ok(RunningSegment {
            segment,
            pid,
            stdin,
            kill_tx: Some(kill_tx),
            stop_requested,
            monitor,
        })
    }
}

fn log_header(cmd: &SegmentCommand<'_>, binary: &Path, args: &[String]) -> String {
    format!(
        "=== encoder={} fps={} quality={} backend={} ===\ncommand: {} {}\n",
        cmd.encoder,
        cmd.framerate(),
        cmd.preset.key,
        cmd.backend,
        binary.display(),
        args.join(" ")
    )
}

async fn drain_into_log(mut stderr: tokio::process::ChildStderr, log: &mut BufWriter<File>) {
    let mut rest = Vec::new();
    let read = tokio::time::timeout(EARLY_EXIT_DRAIN, stderr.read_to_end(&mut rest)).await;
    if read.is_err() {
        debug!("Timed out collecting output of a failed launch");
    }
    if !rest.is_empty() {
        let _ = log.write_all(&rest).await;
        let _ = log.write_all(b"\n").await;
    }
}

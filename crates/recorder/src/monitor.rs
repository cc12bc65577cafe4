//! Background task that owns a live encoder process
//!
//! The task drains stderr, keeps the shared progress current, writes the
//! segment log and finally reaps the process. It is also the only place a
//! force kill is issued from, so the child handle never leaves the task.

use crate::events::{emit, EventSender, RecorderEvent};
use crate::session::{SessionState, SharedState};
use crate::telemetry::{decode_line, is_warning_line, parse_progress_line, LineSplitter, RecordingProgress};
use log::{debug, error, info, warn};
use std::process::ExitStatus;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::process::{Child, ChildStderr};
use tokio::sync::{oneshot, RwLock};
use tokio::task::JoinHandle;

/// Latest telemetry, shared between the monitor and the recorder
pub type SharedProgress = Arc<RwLock<RecordingProgress>>;

pub fn new_shared_progress() -> SharedProgress {
    Arc::new(RwLock::new(RecordingProgress::default()))
}

/// Shared handles a monitor publishes into
#[derive(Debug, Clone)]
pub(crate) struct MonitorContext {
    pub segment_index: usize,
    pub progress: SharedProgress,
    pub state: SharedState,
    pub events: EventSender,
    /// Set by whoever asks this process to stop
    pub stop_requested: Arc<AtomicBool>,
}

/// How the process ended
#[derive(Debug)]
pub(crate) struct MonitorOutcome {
    pub status: Option<ExitStatus>,
    /// Non-zero exit nobody asked for
    pub crashed: bool,
}

pub(crate) fn spawn_monitor(
    child: Child,
    stderr: ChildStderr,
    log: BufWriter<File>,
    kill_rx: oneshot::Receiver<()>,
    ctx: MonitorContext,
) -> JoinHandle<MonitorOutcome> {
    tokio::spawn(run_monitor(child, stderr, log, kill_rx, ctx))
}

async fn run_monitor(
    mut child: Child,
    mut stderr: ChildStderr,
    mut log: BufWriter<File>,
    mut kill_rx: oneshot::Receiver<()>,
    ctx: MonitorContext,
) -> MonitorOutcome {
    let mut splitter = LineSplitter::default();
    let mut buf = [0u8; 4096];
    let mut kill_armed = true;

    loop {
        tokio::select! {
            request = &mut kill_rx, if kill_armed => {
                kill_armed = false;
                if request.is_ok() {
                    force_kill(&mut child, ctx.segment_index);
                }
            }
            read = stderr.read(&mut buf) => {
                match read {
                    Ok(0) => break,
                    Ok(n) => {
                        for line in splitter.push(&buf[..n]) {
                            handle_line(&line, &mut log, &ctx).await;
                        }
                    }
                    Err(e) => {
                        warn!("Segment {}: reading encoder output failed: {}", ctx.segment_index, e);
                        break;
                    }
                }
            }
        }
    }
    if let Some(rest) = splitter.finish() {
        handle_line(&rest, &mut log, &ctx).await;
    }

    // stderr can close before the process is gone; keep honouring kills
    let status = loop {
        tokio::select! {
            request = &mut kill_rx, if kill_armed => {
                kill_armed = false;
                if request.is_ok() {
                    force_kill(&mut child, ctx.segment_index);
                }
            }
            waited = child.wait() => break waited,
        }
    };

    if let Err(e) = log.flush().await {
        warn!("Segment {}: could not flush log: {}", ctx.segment_index, e);
    }

    let status = match status {
        Ok(status) => status,
        Err(e) => {
            error!("Segment {}: could not collect exit status: {}", ctx.segment_index, e);
            return MonitorOutcome {
                status: None,
                crashed: false,
            };
        }
    };

    let user_stop = ctx.stop_requested.load(Ordering::SeqCst);
    let crashed = !status.success() && !user_stop;

    if crashed {
        report_crash(&ctx, status).await;
    } else if !user_stop {
        warn!(
            "Segment {}: encoder exited on its own with {}",
            ctx.segment_index, status
        );
    } else {
        info!("Segment {}: encoder exited with {}", ctx.segment_index, status);
    }

    MonitorOutcome {
        status: Some(status),
        crashed,
    }
}

fn force_kill(child: &mut Child, segment_index: usize) {
    warn!("Segment {}: force killing encoder", segment_index);
    if let Err(e) = child.start_kill() {
        warn!("Segment {}: kill failed: {}", segment_index, e);
    }
}

async fn handle_line(raw: &[u8], log: &mut BufWriter<File>, ctx: &MonitorContext) {
    let line = decode_line(raw);

    if let Some(parsed) = parse_progress_line(&line) {
        let snapshot = {
            let mut progress = ctx.progress.write().await;
            progress.apply(&parsed);
            progress.clone()
        };
        emit(&ctx.events, RecorderEvent::Progress(snapshot));
        return;
    }

    debug!("ffmpeg[{}]: {}", ctx.segment_index, line);
    if is_warning_line(&line) {
        warn!("Segment {}: {}", ctx.segment_index, line);
    }

    let written = async {
        log.write_all(line.as_bytes()).await?;
        log.write_all(b"\n").await
    };
    if let Err(e) = written.await {
        debug!("Segment {}: log write failed: {}", ctx.segment_index, e);
    }
}

/// Flag the session failed, unless it already left the running states
async fn report_crash(ctx: &MonitorContext, status: ExitStatus) {
    let mut state = ctx.state.write().await;
    if matches!(
        *state,
        SessionState::Starting | SessionState::Recording | SessionState::Paused
    ) {
        *state = SessionState::Failed;
        drop(state);

        let err = crate::recorder::RecorderError::EncoderCrash {
            segment: ctx.segment_index,
            status: status.to_string(),
        };
        error!("{}", err);
        emit(&ctx.events, RecorderEvent::Error(err.to_string()));
    }
}

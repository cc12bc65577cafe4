//! Recorder facade
//!
//! Owns the configuration, the cached encoder capabilities and at most one
//! session. Every state transition runs under one async mutex; the monitor
//! tasks only ever move a running session to `Failed`. Queries read the
//! shared state and snapshot and never wait for a transition.

use crate::encode::{CaptureBackend, EncoderCapabilities, EncoderChoice};
use crate::events::{emit, event_channel, EventReceiver, EventSender, RecorderEvent};
use crate::merge::{remove_session_dir, MergeOutcome, MergeStatus, SegmentMerger};
use crate::monitor::{new_shared_progress, SharedProgress};
use crate::request::{RecordingRequest, RequestError};
use crate::session::{
    create_session_dir, new_shared_snapshot, new_shared_state, ElapsedClock, Session,
    SessionLayout, SessionSnapshot, SessionState, SharedSnapshot, SharedState,
};
use crate::supervisor::{ProcessSupervisor, StartedSegment};
use crate::telemetry::RecordingProgress;
use log::{error, info, warn};
use neorec_config::Config;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Mutex;

/// Error type for recorder operations
#[derive(Debug, Error)]
pub enum RecorderError {
    /// No launch on the fallback ladder survived
    #[error("Encoder failed to start after {attempts} attempts: {reason}")]
    StartupFailure { attempts: usize, reason: String },

    /// Encoder exited with an error nobody asked for
    #[error("Encoder exited unexpectedly during segment {segment} ({status})")]
    EncoderCrash { segment: usize, status: String },

    /// A new segment could not be started; the session stays paused
    #[error("Could not resume recording after {attempts} attempts: {reason}")]
    ResumeFailure { attempts: usize, reason: String },

    /// Concatenation failed and the output degraded to the last segment
    #[error("Merging segments failed: {0}")]
    MergeFailure(String),

    #[error("Invalid recording request: {0}")]
    InvalidRequest(#[from] RequestError),

    #[error("Cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: SessionState,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Encoder and capture backend used by one segment
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SegmentSummary {
    pub index: usize,
    pub encoder: EncoderChoice,
    pub backend: CaptureBackend,
}

/// Everything known about a finished session
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordingResult {
    /// Final artifact; `None` when nothing was recorded
    pub output_path: Option<PathBuf>,
    /// Recorded time excluding pauses
    pub duration_secs: f64,
    pub paused_secs: f64,
    pub duration_formatted: String,
    pub segment_count: usize,
    pub last_progress: RecordingProgress,
    pub segments: Vec<SegmentSummary>,
    pub merge_status: MergeStatus,
}

/// `MM:SS`, or `HH:MM:SS` from one hour up
pub fn format_duration(duration: Duration) -> String {
    let total = duration.as_secs();
    let (hours, minutes, seconds) = (total / 3600, (total % 3600) / 60, total % 60);
    if hours > 0 {
        format!("{:02}:{:02}:{:02}", hours, minutes, seconds)
    } else {
        format!("{:02}:{:02}", minutes, seconds)
    }
}

/// Segmented screen recorder driving an external ffmpeg
pub struct Recorder {
    config: Config,
    capabilities: EncoderCapabilities,
    supervisor: ProcessSupervisor,
    merger: SegmentMerger,
    session: Mutex<Option<Session>>,
    state: SharedState,
    snapshot: SharedSnapshot,
    progress: SharedProgress,
    /// Raised by `stop_recording` to abandon in-flight fallback attempts
    cancel: Arc<AtomicBool>,
    events: EventSender,
}

impl Recorder {
    /// Create a recorder and the receiving end of its event stream
    ///
    /// Nothing is spawned here; the encoder probe runs on first use.
    pub fn new(config: Config) -> (Self, EventReceiver) {
        let (events, rx) = event_channel();
        let binary = config.encoder.resolve_binary();
        let state = new_shared_state();
        let progress = new_shared_progress();

        let recorder = Self {
            capabilities: EncoderCapabilities::new(binary.clone(), config.encoder.detect_timeout()),
            supervisor: ProcessSupervisor::new(
                &config,
                binary.clone(),
                progress.clone(),
                state.clone(),
                events.clone(),
            ),
            merger: SegmentMerger::new(binary, config.process.merge_timeout()),
            session: Mutex::new(None),
            state,
            snapshot: new_shared_snapshot(),
            progress,
            cancel: Arc::new(AtomicBool::new(false)),
            events,
            config,
        };
        (recorder, rx)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn capabilities(&self) -> &EncoderCapabilities {
        &self.capabilities
    }

    pub async fn state(&self) -> SessionState {
        *self.state.read().await
    }

    /// Latest telemetry; kept after stop until the next start
    pub async fn progress(&self) -> RecordingProgress {
        self.progress.read().await.clone()
    }

    /// Recorded time of the current session, zero without one
    pub async fn elapsed(&self) -> Duration {
        self.snapshot.read().await.elapsed_at(Instant::now())
    }

    /// Encoder the current session is using, after any demotion
    pub async fn active_encoder(&self) -> Option<EncoderChoice> {
        self.snapshot.read().await.encoder
    }

    async fn set_state(&self, next: SessionState) {
        *self.state.write().await = next;
    }

    /// Move to `next` only if nothing (a crash report) changed `expected`
    async fn advance_from(&self, expected: SessionState, next: SessionState) -> SessionState {
        let mut state = self.state.write().await;
        if *state == expected {
            *state = next;
        }
        *state
    }

    /// Stop the live encoder of `session`, if there is one
    async fn stop_active(&self, session: &mut Session) {
        let Some(running) = session.take_active() else {
            return;
        };
        let index = running.segment.index;
        match running
            .stop(self.supervisor.graceful_stop(), self.supervisor.terminate_timeout())
            .await
        {
            Ok(outcome) if outcome.crashed => {
                warn!("Segment {} had already crashed", index)
            }
            Ok(outcome) => match outcome.status {
                Some(status) => info!("Segment {} closed ({})", index, status),
                None => warn!("Segment {} closed with unknown status", index),
            },
            Err(e) => warn!("Segment {}: {}", index, e),
        }
    }

    /// Start a new session with segment 0
    pub async fn start_recording(&self, request: RecordingRequest) -> Result<(), RecorderError> {
        let preset = request.validate()?;
        let mut slot = self.session.lock().await;

        let prior = self.state().await;
        if !prior.can_start() {
            return Err(RecorderError::InvalidState {
                operation: "start recording",
                state: prior,
            });
        }

        self.cancel.store(false, Ordering::SeqCst);
        self.set_state(SessionState::Starting).await;
        *self.progress.write().await = RecordingProgress::default();

        let encoder = self
            .capabilities
            .best(self.config.encoder.hardware_encoding)
            .await;

        let dir = match create_session_dir(&self.config.session.temp_base()).await {
            Ok(dir) => dir,
            Err(e) => {
                self.set_state(prior).await;
                error!("Could not create session directory: {}", e);
                return Err(e.into());
            }
        };
        let layout = SessionLayout::new(dir, request.container_extension());
        info!(
            "Starting recording to {} ({} fps, {}, {}) in {}",
            request.output_path.display(),
            request.framerate,
            preset.key,
            encoder,
            layout.dir().display()
        );

        let mut session = Session::new(request, preset, encoder, layout);
        let started = self
            .supervisor
            .start_segment(
                0,
                &session.layout,
                &session.request,
                session.preset,
                session.encoder,
                session.safe_mode,
                &self.cancel,
            )
            .await;

        let (attempts, reason, cancelled) = match started {
            Ok(started) => {
                let attempts = started.attempts;
                adopt(&mut session, started);
                let now = self
                    .advance_from(SessionState::Starting, SessionState::Recording)
                    .await;
                if now == SessionState::Recording {
                    *self.snapshot.write().await = SessionSnapshot {
                        clock: Some(ElapsedClock::start(Instant::now())),
                        encoder: Some(session.encoder),
                    };
                    *slot = Some(session);
                    emit(&self.events, RecorderEvent::Started);
                    return Ok(());
                }
                // died between its settle check and here
                self.stop_active(&mut session).await;
                (attempts, format!("encoder exited right after startup ({})", now), false)
            }
            Err(e) => (e.attempts, e.reason, e.cancelled),
        };

        discard_unstarted(&session.layout).await;
        self.set_state(prior).await;
        let err = RecorderError::StartupFailure { attempts, reason };
        if cancelled {
            info!("{}", err);
        } else {
            error!("{}", err);
            emit(&self.events, RecorderEvent::Error(err.to_string()));
        }
        Err(err)
    }

    /// Stop the active encoder; the next resume starts a new segment
    pub async fn pause_recording(&self) -> Result<(), RecorderError> {
        let mut slot = self.session.lock().await;

        let state = self.state().await;
        let session = match slot.as_mut() {
            Some(session) if state == SessionState::Recording => session,
            _ => {
                return Err(RecorderError::InvalidState {
                    operation: "pause",
                    state,
                })
            }
        };

        self.stop_active(session).await;
        if let Some(clock) = self.snapshot.write().await.clock.as_mut() {
            clock.pause(Instant::now());
        }

        let now = self
            .advance_from(SessionState::Recording, SessionState::Paused)
            .await;
        if now != SessionState::Paused {
            // crashed while we were stopping it
            return Err(RecorderError::InvalidState {
                operation: "pause",
                state: now,
            });
        }
        info!("Recording paused after {} segments", session.segments.len());
        Ok(())
    }

    /// Continue a paused session in a new segment
    pub async fn resume_recording(&self) -> Result<(), RecorderError> {
        let mut slot = self.session.lock().await;

        let state = self.state().await;
        let session = match slot.as_mut() {
            Some(session) if state == SessionState::Paused => session,
            _ => {
                return Err(RecorderError::InvalidState {
                    operation: "resume",
                    state,
                })
            }
        };

        self.cancel.store(false, Ordering::SeqCst);
        let index = session.next_index();
        let started = self
            .supervisor
            .start_segment(
                index,
                &session.layout,
                &session.request,
                session.preset,
                session.encoder,
                session.safe_mode,
                &self.cancel,
            )
            .await;

        match started {
            Ok(started) => {
                adopt(session, started);
                let paused = {
                    let mut snapshot = self.snapshot.write().await;
                    snapshot.encoder = Some(session.encoder);
                    snapshot
                        .clock
                        .as_mut()
                        .map(|clock| clock.resume(Instant::now()))
                        .unwrap_or_default()
                };
                self.advance_from(SessionState::Paused, SessionState::Recording)
                    .await;
                info!("Recording resumed in segment {} after {:?} paused", index, paused);
                Ok(())
            }
            Err(e) => {
                if e.demoted && session.encoder != EncoderChoice::Software {
                    info!("Session demoted from {} to software (safe mode)", session.encoder);
                    session.encoder = EncoderChoice::Software;
                    session.safe_mode = true;
                    self.snapshot.write().await.encoder = Some(EncoderChoice::Software);
                }
                let err = RecorderError::ResumeFailure {
                    attempts: e.attempts,
                    reason: e.reason,
                };
                if e.cancelled {
                    info!("{}", err);
                } else {
                    error!("{}", err);
                    emit(&self.events, RecorderEvent::Error(err.to_string()));
                }
                Err(err)
            }
        }
    }

    /// Finish the session and produce the final artifact
    ///
    /// Works from `Recording`, `Paused` and `Failed`; whatever segments
    /// exist are merged.
    pub async fn stop_recording(&self) -> Result<RecordingResult, RecorderError> {
        // Seen by a start or resume currently holding the lock
        self.cancel.store(true, Ordering::SeqCst);
        let mut slot = self.session.lock().await;

        let state = self.state().await;
        let taken = if state.can_stop() { slot.take() } else { None };
        let Some(mut session) = taken else {
            return Err(RecorderError::InvalidState {
                operation: "stop",
                state,
            });
        };
        self.set_state(SessionState::Stopping).await;

        self.stop_active(&mut session).await;

        let now = Instant::now();
        let clock = self.snapshot.read().await.clock;
        let elapsed = clock.map(|c| c.elapsed_at(now)).unwrap_or_default();
        let paused = clock.map(|c| c.paused_at(now)).unwrap_or_default();

        let merged = self
            .merger
            .merge(
                &session.media_paths(),
                &session.layout.manifest_path(),
                &session.request.output_path,
            )
            .await;

        let outcome = match merged {
            Ok(outcome) => {
                if let Some(warning) = &outcome.warning {
                    emit(&self.events, RecorderEvent::Warning(warning.clone()));
                }
                remove_session_dir(session.layout.dir()).await;
                outcome
            }
            Err(e) => {
                // segments stay on disk for manual recovery
                let err = RecorderError::MergeFailure(e.to_string());
                error!("{}; segments kept in {}", err, session.layout.dir().display());
                emit(&self.events, RecorderEvent::Error(err.to_string()));
                MergeOutcome {
                    output_path: None,
                    status: MergeStatus::Fallback,
                    warning: Some(err.to_string()),
                }
            }
        };

        let result = RecordingResult {
            output_path: outcome.output_path,
            duration_secs: elapsed.as_secs_f64(),
            paused_secs: paused.as_secs_f64(),
            duration_formatted: format_duration(elapsed),
            segment_count: session.segments.len(),
            last_progress: self.progress().await,
            segments: session
                .segments
                .iter()
                .map(|s| SegmentSummary {
                    index: s.index,
                    encoder: s.encoder,
                    backend: s.backend,
                })
                .collect(),
            merge_status: outcome.status,
        };

        *self.snapshot.write().await = SessionSnapshot::default();
        self.set_state(SessionState::Stopped).await;
        info!(
            "Recording stopped: {} in {} segments ({:?})",
            result.duration_formatted, result.segment_count, result.merge_status
        );
        emit(&self.events, RecorderEvent::Stopped(result.clone()));
        Ok(result)
    }
}

/// Remove the directory of a session that never got going
///
/// Kept when the encoder already wrote media into it.
async fn discard_unstarted(layout: &SessionLayout) {
    let media = tokio::fs::metadata(layout.media_path(0))
        .await
        .map(|m| m.len())
        .unwrap_or(0);
    if media > 0 {
        warn!(
            "Keeping {} after failed start: it holds {} bytes of media",
            layout.dir().display(),
            media
        );
        return;
    }
    remove_session_dir(layout.dir()).await;
}

/// Take over a started segment, remembering any demotion
fn adopt(session: &mut Session, started: StartedSegment) {
    if started.attempts > 1 {
        info!(
            "Segment {} needed {} launch attempts",
            started.running.segment.index, started.attempts
        );
    }
    if started.encoder != session.encoder {
        info!(
            "Session demoted from {} to {} (safe mode)",
            session.encoder, started.encoder
        );
    }
    session.encoder = started.encoder;
    session.safe_mode = started.safe_mode;
    session.attach(started.running);
}

//! Session bookkeeping: lifecycle state, the pause-aware clock and the
//! segments produced so far.
//!
//! The encoder has no pause primitive, so a paused session is simply one
//! with no live process. Each resume starts a fresh encoder into the next
//! `segment_NNN` file of the session directory; [`ElapsedClock`] keeps the
//! logical recording time continuous across those gaps.

use crate::encode::{CaptureBackend, EncoderChoice, QualityPreset};
use crate::request::RecordingRequest;
use crate::supervisor::RunningSegment;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// Lifecycle of the one session a recorder owns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    #[default]
    Idle,
    Starting,
    Recording,
    Paused,
    Stopping,
    Stopped,
    Failed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Starting => "starting",
            SessionState::Recording => "recording",
            SessionState::Paused => "paused",
            SessionState::Stopping => "stopping",
            SessionState::Stopped => "stopped",
            SessionState::Failed => "failed",
        }
    }

    /// A new session may begin from here
    pub fn can_start(&self) -> bool {
        matches!(self, SessionState::Idle | SessionState::Stopped)
    }

    /// There is a session whose segments can still be finalized
    pub fn can_stop(&self) -> bool {
        matches!(
            self,
            SessionState::Recording | SessionState::Paused | SessionState::Failed
        )
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Session state shared with the monitor tasks
pub type SharedState = Arc<RwLock<SessionState>>;

pub fn new_shared_state() -> SharedState {
    Arc::new(RwLock::new(SessionState::Idle))
}

/// Wall clock minus paused intervals
///
/// All methods take `now` explicitly so the arithmetic can be tested
/// without sleeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElapsedClock {
    started_at: Instant,
    total_paused: Duration,
    pause_started: Option<Instant>,
}

impl ElapsedClock {
    pub fn start(now: Instant) -> Self {
        Self {
            started_at: now,
            total_paused: Duration::ZERO,
            pause_started: None,
        }
    }

    /// Begin a pause; a second call while paused keeps the first timestamp
    pub fn pause(&mut self, now: Instant) {
        if self.pause_started.is_none() {
            self.pause_started = Some(now);
        }
    }

    /// Close the current pause and return its length
    pub fn resume(&mut self, now: Instant) -> Duration {
        match self.pause_started.take() {
            Some(since) => {
                let interval = now.saturating_duration_since(since);
                self.total_paused += interval;
                interval
            }
            None => Duration::ZERO,
        }
    }

    /// Paused time including a pause still in progress
    pub fn paused_at(&self, now: Instant) -> Duration {
        let current = self
            .pause_started
            .map(|since| now.saturating_duration_since(since))
            .unwrap_or_default();
        self.total_paused + current
    }

    /// Recorded time, never negative
    pub fn elapsed_at(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.started_at)
            .saturating_sub(self.paused_at(now))
    }
}

/// The parts of a session that can be read while a transition is running
///
/// Pause, resume and stop hold the recorder's session lock across process
/// IO, so queries go through this copy instead.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub clock: Option<ElapsedClock>,
    pub encoder: Option<EncoderChoice>,
}

impl SessionSnapshot {
    /// Recorded time at `now`, zero without a session
    pub fn elapsed_at(&self, now: Instant) -> Duration {
        self.clock.map(|c| c.elapsed_at(now)).unwrap_or_default()
    }
}

pub type SharedSnapshot = Arc<RwLock<SessionSnapshot>>;

pub fn new_shared_snapshot() -> SharedSnapshot {
    Arc::new(RwLock::new(SessionSnapshot::default()))
}

/// One media file written by one encoder instance
#[derive(Debug, Clone, Serialize)]
pub struct Segment {
    pub index: usize,
    pub media_path: PathBuf,
    pub log_path: PathBuf,
    #[serde(skip)]
    pub started_at: Instant,
    pub encoder: EncoderChoice,
    pub backend: CaptureBackend,
}

/// File names inside a session directory
#[derive(Debug, Clone)]
pub struct SessionLayout {
    dir: PathBuf,
    extension: String,
}

impl SessionLayout {
    pub fn new(dir: PathBuf, extension: impl Into<String>) -> Self {
        Self {
            dir,
            extension: extension.into(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn media_path(&self, index: usize) -> PathBuf {
        self.dir
            .join(format!("segment_{:03}.{}", index, self.extension))
    }

    pub fn log_path(&self, index: usize) -> PathBuf {
        self.dir.join(format!("segment_{:03}.log", index))
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.dir.join("concat.txt")
    }
}

/// Unique per-session directory name under the temp base
pub fn session_dir_name() -> String {
    format!("neorec-{}", uuid::Uuid::new_v4())
}

/// Create a fresh session directory under `base`
pub async fn create_session_dir(base: &Path) -> std::io::Result<PathBuf> {
    let dir = base.join(session_dir_name());
    tokio::fs::create_dir_all(&dir).await?;
    Ok(dir)
}

/// Everything that belongs to one start..stop cycle
///
/// Owns the live encoder (if any) and the list of finished segments. The
/// encoder choice and safe-mode flag only ever move towards software.
#[derive(Debug)]
pub struct Session {
    pub request: RecordingRequest,
    pub preset: &'static QualityPreset,
    pub encoder: EncoderChoice,
    pub safe_mode: bool,
    pub layout: SessionLayout,
    pub segments: Vec<Segment>,
    pub(crate) active: Option<RunningSegment>,
}

impl Session {
    pub(crate) fn new(
        request: RecordingRequest,
        preset: &'static QualityPreset,
        encoder: EncoderChoice,
        layout: SessionLayout,
    ) -> Self {
        Self {
            request,
            preset,
            encoder,
            safe_mode: false,
            layout,
            segments: Vec::new(),
            active: None,
        }
    }

    pub fn next_index(&self) -> usize {
        self.segments.len()
    }

    /// Record a freshly started encoder as the active segment
    pub(crate) fn attach(&mut self, running: RunningSegment) {
        self.segments.push(running.segment.clone());
        self.active = Some(running);
    }

    pub(crate) fn take_active(&mut self) -> Option<RunningSegment> {
        self.active.take()
    }

    /// Media files in creation order
    pub fn media_paths(&self) -> Vec<PathBuf> {
        self.segments.iter().map(|s| s.media_path.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_clock_without_pauses() {
        let t0 = Instant::now();
        let clock = ElapsedClock::start(t0);
        assert_eq!(clock.elapsed_at(t0 + Duration::from_secs(5)), Duration::from_secs(5));
    }

    #[test]
    fn test_clock_excludes_pauses() {
        let t0 = Instant::now();
        let mut clock = ElapsedClock::start(t0);
        clock.pause(t0 + Duration::from_secs(3));
        // time frozen while paused
        assert_eq!(clock.elapsed_at(t0 + Duration::from_secs(10)), Duration::from_secs(3));

        let interval = clock.resume(t0 + Duration::from_secs(10));
        assert_eq!(interval, Duration::from_secs(7));
        assert_eq!(clock.elapsed_at(t0 + Duration::from_secs(12)), Duration::from_secs(5));
        assert_eq!(clock.paused_at(t0 + Duration::from_secs(12)), Duration::from_secs(7));
    }

    #[test]
    fn test_clock_double_pause_keeps_first() {
        let t0 = Instant::now();
        let mut clock = ElapsedClock::start(t0);
        clock.pause(t0 + Duration::from_secs(1));
        clock.pause(t0 + Duration::from_secs(4));
        assert_eq!(clock.resume(t0 + Duration::from_secs(6)), Duration::from_secs(5));
        assert_eq!(clock.resume(t0 + Duration::from_secs(7)), Duration::ZERO);
    }

    #[test]
    fn test_clock_never_negative_for_earlier_now() {
        let t0 = Instant::now();
        let later = t0 + Duration::from_secs(10);
        let mut clock = ElapsedClock::start(later);
        clock.pause(later);
        assert_eq!(clock.elapsed_at(t0), Duration::ZERO);
    }

    proptest! {
        #[test]
        fn prop_elapsed_is_wall_minus_paused(
            intervals in proptest::collection::vec((0u64..10_000, 0u64..10_000), 0..8),
            tail in 0u64..10_000,
        ) {
            let t0 = Instant::now();
            let mut clock = ElapsedClock::start(t0);
            let mut now = t0;
            let mut paused = Duration::ZERO;

            for (run_ms, pause_ms) in intervals {
                now += Duration::from_millis(run_ms);
                clock.pause(now);
                now += Duration::from_millis(pause_ms);
                paused += clock.resume(now);
            }
            now += Duration::from_millis(tail);

            let wall = now.duration_since(t0);
            prop_assert_eq!(clock.elapsed_at(now), wall - paused);
            prop_assert!(clock.elapsed_at(now) <= wall);
        }
    }

    #[test]
    fn test_snapshot_without_session_is_zero() {
        let snapshot = SessionSnapshot::default();
        assert_eq!(snapshot.elapsed_at(Instant::now()), Duration::ZERO);

        let t0 = Instant::now();
        let running = SessionSnapshot {
            clock: Some(ElapsedClock::start(t0)),
            encoder: Some(EncoderChoice::Software),
        };
        assert_eq!(running.elapsed_at(t0 + Duration::from_secs(2)), Duration::from_secs(2));
    }

    #[test]
    fn test_layout_paths() {
        let layout = SessionLayout::new(PathBuf::from("/tmp/neorec-x"), "mkv");
        assert_eq!(layout.media_path(0), PathBuf::from("/tmp/neorec-x/segment_000.mkv"));
        assert_eq!(layout.log_path(12), PathBuf::from("/tmp/neorec-x/segment_012.log"));
        assert_eq!(layout.manifest_path(), PathBuf::from("/tmp/neorec-x/concat.txt"));
    }

    #[test]
    fn test_session_dir_names_are_unique() {
        let a = session_dir_name();
        let b = session_dir_name();
        assert!(a.starts_with("neorec-"));
        assert_ne!(a, b);
    }

    #[test]
    fn test_state_transitions_allowed() {
        assert!(SessionState::Idle.can_start());
        assert!(SessionState::Stopped.can_start());
        assert!(!SessionState::Failed.can_start());
        assert!(!SessionState::Recording.can_start());

        assert!(SessionState::Failed.can_stop());
        assert!(SessionState::Paused.can_stop());
        assert!(!SessionState::Idle.can_stop());
        assert!(!SessionState::Stopping.can_stop());
    }
}

//! Notifications delivered to whoever owns the recorder

use crate::recorder::RecordingResult;
use crate::telemetry::RecordingProgress;
use serde::Serialize;
use tokio::sync::mpsc;

/// Something the application may want to react to
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum RecorderEvent {
    /// First segment is running
    Started,
    /// Fresh telemetry from the active encoder
    Progress(RecordingProgress),
    /// Non-fatal problem (safe mode, merge fallback, ...)
    Warning(String),
    /// Failure that did not come back through a method call
    Error(String),
    /// Session finished and the artifact is in place
    Stopped(RecordingResult),
}

pub type EventSender = mpsc::UnboundedSender<RecorderEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<RecorderEvent>;

pub fn event_channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

/// Send without caring whether anyone is still listening
pub(crate) fn emit(tx: &EventSender, event: RecorderEvent) {
    let _ = tx.send(event);
}

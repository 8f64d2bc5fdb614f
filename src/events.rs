use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::types::TaskOutcome;

pub const PROGRESS_EVENT: &str = "draw:task_progress";
pub const FINISHED_EVENT: &str = "draw:task_finished";
pub const RETRY_EVENT: &str = "draw:task_retry";

/// Emitted on every poll that reports a non-terminal status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskProgressEvent {
    pub unit_id: String,
    pub job_id: String,
    /// 0-100.
    pub progress: u8,
    pub status: String,
}

/// Emitted exactly once per unit, unless the unit was stopped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskFinishedEvent {
    pub unit_id: String,
    pub job_id: Option<String>,
    pub success: bool,
    /// Saved file path on success, failure message otherwise.
    pub result: String,
    /// `"Success"` or the failure's short reason.
    pub reason: String,
}

impl TaskFinishedEvent {
    pub fn from_outcome(unit_id: &str, job_id: Option<&str>, outcome: &TaskOutcome) -> Self {
        let (success, result, reason) = match outcome {
            Ok(path) => (true, path.display().to_string(), "Success".to_string()),
            Err(failure) => (
                false,
                failure.to_string(),
                failure.short_reason().to_string(),
            ),
        };
        Self {
            unit_id: unit_id.to_string(),
            job_id: job_id.map(str::to_string),
            success,
            result,
            reason,
        }
    }
}

/// Emitted by the retry wrapper when a failed attempt is about to be re-run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRetryEvent {
    pub unit_id: String,
    /// 1-based number of the retry about to start.
    pub attempt: u32,
    pub max_retries: u32,
    pub reason: String,
}

/// Receiver of task notifications (a UI layer, a channel, a Tauri window).
///
/// Called from the unit's own task; implementations must not block.
pub trait TaskEventSink: Send + Sync {
    fn on_progress(&self, event: TaskProgressEvent);

    fn on_finished(&self, event: TaskFinishedEvent);

    fn on_retry(&self, _event: TaskRetryEvent) {}
}

/// Any task notification, as delivered by [`ChannelSink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskEvent {
    Progress(TaskProgressEvent),
    Finished(TaskFinishedEvent),
    Retry(TaskRetryEvent),
}

/// Forwards every notification into an unbounded tokio channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<TaskEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TaskEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn send(&self, event: TaskEvent) {
        if self.tx.send(event).is_err() {
            tracing::debug!("task event receiver dropped");
        }
    }
}

impl TaskEventSink for ChannelSink {
    fn on_progress(&self, event: TaskProgressEvent) {
        self.send(TaskEvent::Progress(event));
    }

    fn on_finished(&self, event: TaskFinishedEvent) {
        self.send(TaskEvent::Finished(event));
    }

    fn on_retry(&self, event: TaskRetryEvent) {
        self.send(TaskEvent::Retry(event));
    }
}

/// Emits notifications as Tauri events to the frontend.
#[cfg(feature = "tauri")]
impl<R: tauri::Runtime> TaskEventSink for tauri::AppHandle<R> {
    fn on_progress(&self, event: TaskProgressEvent) {
        use tauri::Emitter;
        if let Err(e) = self.emit(PROGRESS_EVENT, event) {
            tracing::warn!(error = %e, "failed to emit progress event");
        }
    }

    fn on_finished(&self, event: TaskFinishedEvent) {
        use tauri::Emitter;
        if let Err(e) = self.emit(FINISHED_EVENT, event) {
            tracing::warn!(error = %e, "failed to emit finished event");
        }
    }

    fn on_retry(&self, event: TaskRetryEvent) {
        use tauri::Emitter;
        if let Err(e) = self.emit(RETRY_EVENT, event) {
            tracing::warn!(error = %e, "failed to emit retry event");
        }
    }
}

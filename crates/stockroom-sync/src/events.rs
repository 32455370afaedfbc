//! Notifications pushed to the UI layer.

use std::sync::Mutex;

use stockroom_core::{ConflictRecord, FlushSummary, SyncStatusSnapshot};

/// Receives sync notifications (implemented by the UI integration).
///
/// Called from sync tasks; implementations must not block.
pub trait SyncEventEmitter: Send + Sync {
    /// Queue counts or connectivity changed.
    fn emit_status(&self, status: &SyncStatusSnapshot);

    /// A flush run finished.
    fn emit_flush_completed(&self, summary: &FlushSummary);

    /// New conflicts need a user decision.
    fn emit_conflicts(&self, conflicts: &[ConflictRecord]);

    /// A sync run failed outside of per-mutation handling.
    fn emit_error(&self, message: &str, retryable: bool);
}

/// No-op event emitter for headless use and tests.
pub struct NoOpEmitter;

impl SyncEventEmitter for NoOpEmitter {
    fn emit_status(&self, _status: &SyncStatusSnapshot) {}
    fn emit_flush_completed(&self, _summary: &FlushSummary) {}
    fn emit_conflicts(&self, _conflicts: &[ConflictRecord]) {}
    fn emit_error(&self, _message: &str, _retryable: bool) {}
}

/// Event captured by [`RecordingEmitter`].
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    Status(SyncStatusSnapshot),
    FlushCompleted(FlushSummary),
    Conflicts(Vec<String>),
    Error { message: String, retryable: bool },
}

/// Emitter that keeps every event in memory, for tests and diagnostics.
#[derive(Default)]
pub struct RecordingEmitter {
    events: Mutex<Vec<SyncEvent>>,
}

impl RecordingEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<SyncEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    /// Flush summaries received so far.
    pub fn flushes(&self) -> Vec<FlushSummary> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                SyncEvent::FlushCompleted(summary) => Some(summary),
                _ => None,
            })
            .collect()
    }

    fn push(&self, event: SyncEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

impl SyncEventEmitter for RecordingEmitter {
    fn emit_status(&self, status: &SyncStatusSnapshot) {
        self.push(SyncEvent::Status(status.clone()));
    }

    fn emit_flush_completed(&self, summary: &FlushSummary) {
        self.push(SyncEvent::FlushCompleted(*summary));
    }

    fn emit_conflicts(&self, conflicts: &[ConflictRecord]) {
        self.push(SyncEvent::Conflicts(
            conflicts.iter().map(|c| c.id.clone()).collect(),
        ));
    }

    fn emit_error(&self, message: &str, retryable: bool) {
        self.push(SyncEvent::Error {
            message: message.to_string(),
            retryable,
        });
    }
}

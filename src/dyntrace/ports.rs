use std::path::PathBuf;
use std::time::Duration;

use serde_json::Value;

use super::event::AppCallerEvent;
use crate::error::CollectError;

/// Severity class of a published diagnostic event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Fault,
    Statistic,
    Behavior,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fault => "fault",
            Self::Statistic => "statistic",
            Self::Behavior => "behavior",
        }
    }
}

/// Black-box device trace recorder: open/close a recording session over the
/// shared trace buffer and toggle capture within it.
pub trait TraceSubsystem: Send + Sync {
    /// Opens a recording session configured by the argument string.
    fn open_recording(&self, args: &str) -> Result<(), CollectError>;

    /// Starts capturing into the open session.
    fn trace_on(&self) -> Result<(), CollectError>;

    /// Stops capturing and returns the dump files it produced.
    fn trace_off(&self) -> Result<Vec<PathBuf>, CollectError>;

    /// Closes the recording session.
    fn close(&self) -> Result<(), CollectError>;
}

/// Publishes curated events to app sandboxes and the analysis pipeline.
///
/// Both calls are fire-and-forget at the call site; delivery failures are the
/// implementation's to log.
pub trait EventPublisher: Send + Sync {
    /// Shares an event with the application identified by `uid`.
    fn push(&self, uid: i32, event_name: &str, kind: EventKind, payload: Value);

    /// Reports a device-level diagnostic event to the central pipeline.
    fn report(&self, event_name: &str, kind: EventKind, payload: Value);
}

/// Posts the delayed Start -> Dump auto-transition.
///
/// At-least-once with no cancellation handle: a firing that arrives after the
/// capture already moved past Start is rejected by the transition table.
pub trait DumpScheduler: Send + Sync {
    fn schedule_dump(&self, event: AppCallerEvent, delay: Duration);
}

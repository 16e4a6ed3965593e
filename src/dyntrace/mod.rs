//! Dynamic per-app trace capture state machine.
//!
//! A capture request moves through Start -> Dump -> Stop. Start claims the
//! single-flight gate and opens the device trace buffer for the requesting
//! pid; Dump closes the capture window, persists dedup bookkeeping and
//! publishes the artifact; Stop releases the buffer and resets the context
//! no matter which state preceded it. Transitions are validated by a pure
//! [`accept`] predicate, and each stage handler returns the follow-up
//! transition instead of re-entering the state machine, so one driving loop
//! under one non-recursive lock covers the whole sequence.

pub mod event;
pub mod gate;
pub mod ports;

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::clock::{self, Clock};
use crate::error::CollectError;
use crate::flow::{TraceFlowController, APP_TRACE_PREFIX};
use event::AppCallerEvent;
use gate::DynamicTraceGate;
use ports::{DumpScheduler, EventKind, EventPublisher, TraceSubsystem};

/// Event name under which capture results and jank reports are published.
pub const MAIN_THREAD_JANK: &str = "MAIN_THREAD_JANK";

/// Jank level at which a full trace (rather than a stack sample) is captured.
pub const JANK_LEVEL_TRACE: i32 = 2;

/// Lifecycle stage of a dynamic capture.
///
/// `Idle` exists only before the first transition; it is never a valid
/// target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceStage {
    Idle,
    Start,
    Dump,
    Stop,
}

impl TraceStage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Start => "start",
            Self::Dump => "dump",
            Self::Stop => "stop",
        }
    }
}

impl fmt::Display for TraceStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pure transition predicate.
///
/// Dump is only reachable from Start and only for the pid that started the
/// recording window; a second Stop is rejected as a no-op so a late timeout
/// firing cannot disturb the next capture.
pub fn accept(
    current: TraceStage,
    target: TraceStage,
    recorded_pid: i32,
    event_pid: i32,
) -> Result<(), CollectError> {
    match (current, target) {
        (TraceStage::Idle | TraceStage::Stop, TraceStage::Start) => Ok(()),
        (TraceStage::Start, TraceStage::Dump) => {
            if recorded_pid == event_pid {
                Ok(())
            } else {
                Err(CollectError::InconsistentProcess)
            }
        }
        (TraceStage::Start | TraceStage::Dump, TraceStage::Stop) => Ok(()),
        _ => Err(CollectError::InvalidTraceState),
    }
}

/// Capture knobs lifted out of the full config.
#[derive(Debug, Clone)]
pub struct CaptureSettings {
    /// Directory receiving renamed trace artifacts.
    pub share_dir: PathBuf,
    /// Recording window before the automatic dump.
    pub trace_duration: Duration,
    /// Trace categories passed to the recording session.
    pub trace_tags: String,
    /// Trace ring buffer size in KB.
    pub trace_buffer_kb: u32,
}

/// How far the trace subsystem was actually engaged, tracked so Stop can
/// unwind exactly what Start and Dump managed to do.
#[derive(Debug)]
struct ContextInner {
    stage: TraceStage,
    pid: i32,
    trace_begin: i64,
    is_open_trace: bool,
    is_trace_on: bool,
    is_dump_trace: bool,
    gate_held: bool,
}

impl ContextInner {
    fn reset(&mut self) {
        self.pid = 0;
        self.trace_begin = 0;
        self.is_open_trace = false;
        self.is_trace_on = false;
        self.is_dump_trace = false;
        self.gate_held = false;
    }
}

/// Read-only view of the context bookkeeping, for logging and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextSnapshot {
    pub stage: TraceStage,
    pub pid: i32,
    pub trace_begin: i64,
    pub is_open_trace: bool,
    pub is_trace_on: bool,
    pub is_dump_trace: bool,
}

/// Coordinates one in-flight dynamic capture.
pub struct AppTraceContext {
    inner: Mutex<ContextInner>,
    gate: Arc<DynamicTraceGate>,
    subsystem: Arc<dyn TraceSubsystem>,
    publisher: Arc<dyn EventPublisher>,
    scheduler: Arc<dyn DumpScheduler>,
    flow: TraceFlowController,
    clock: Arc<dyn Clock>,
    settings: CaptureSettings,
}

impl AppTraceContext {
    pub fn new(
        gate: Arc<DynamicTraceGate>,
        subsystem: Arc<dyn TraceSubsystem>,
        publisher: Arc<dyn EventPublisher>,
        scheduler: Arc<dyn DumpScheduler>,
        flow: TraceFlowController,
        clock: Arc<dyn Clock>,
        settings: CaptureSettings,
    ) -> Self {
        Self {
            inner: Mutex::new(ContextInner {
                stage: TraceStage::Idle,
                pid: 0,
                trace_begin: 0,
                is_open_trace: false,
                is_trace_on: false,
                is_dump_trace: false,
                gate_held: false,
            }),
            gate,
            subsystem,
            publisher,
            scheduler,
            flow,
            clock,
            settings,
        }
    }

    /// Drives the state machine to `target`, then through any follow-up
    /// transition the stage handler requests (a failed Start falls through
    /// to Stop, a finished Dump always ends in Stop).
    ///
    /// The first error encountered is returned and mirrored into the event's
    /// result code; follow-up cleanup still runs.
    pub fn transfer_to(
        &self,
        target: TraceStage,
        event: &mut AppCallerEvent,
    ) -> Result<(), CollectError> {
        let mut inner = self.inner.lock();
        let mut outcome = Ok(());
        let mut next = Some(target);

        while let Some(stage) = next.take() {
            if let Err(err) = accept(inner.stage, stage, inner.pid, event.pid) {
                debug!(
                    from = %inner.stage,
                    to = %stage,
                    uid = event.uid,
                    pid = event.pid,
                    "transition rejected"
                );
                event.result_code = Some(err);
                if outcome.is_ok() {
                    outcome = Err(err);
                }
                break;
            }
            inner.stage = stage;

            let (result, follow_up) = match stage {
                TraceStage::Idle => (Ok(()), None),
                TraceStage::Start => self.capture_start(&mut inner, event),
                TraceStage::Dump => self.capture_dump(&mut inner, event),
                TraceStage::Stop => self.capture_stop(&mut inner, event),
            };
            if let Err(err) = result {
                event.result_code = Some(err);
                if outcome.is_ok() {
                    outcome = Err(err);
                }
            }
            next = follow_up;
        }

        outcome
    }

    /// Current bookkeeping, for logging and tests.
    pub fn snapshot(&self) -> ContextSnapshot {
        let inner = self.inner.lock();
        ContextSnapshot {
            stage: inner.stage,
            pid: inner.pid,
            trace_begin: inner.trace_begin,
            is_open_trace: inner.is_open_trace,
            is_trace_on: inner.is_trace_on,
            is_dump_trace: inner.is_dump_trace,
        }
    }

    fn capture_start(
        &self,
        inner: &mut ContextInner,
        event: &mut AppCallerEvent,
    ) -> (Result<(), CollectError>, Option<TraceStage>) {
        if !self.gate.is_enabled() {
            warn!(uid = event.uid, pid = event.pid, "dynamic trace capture is disabled");
            return (Err(CollectError::Unsupported), Some(TraceStage::Stop));
        }
        if self.gate.is_open() {
            warn!(uid = event.uid, pid = event.pid, "capture already in flight");
            return (Err(CollectError::ExistsCaptureTask), Some(TraceStage::Stop));
        }

        // One trace file per app per day.
        if self.flow.has_call_once_today(event.uid, event.happen_time) {
            warn!(uid = event.uid, pid = event.pid, "app already captured a trace today");
            return (Err(CollectError::AlreadyCaptured), Some(TraceStage::Stop));
        }

        if !self.gate.try_acquire() {
            warn!(uid = event.uid, pid = event.pid, "lost the race for the capture gate");
            return (Err(CollectError::ExistsCaptureTask), Some(TraceStage::Stop));
        }
        inner.gate_held = true;
        inner.pid = event.pid;

        let args = format!(
            "tags:{} clockType:boot bufferSize:{} overwrite:1 appPid:{}",
            self.settings.trace_tags, self.settings.trace_buffer_kb, event.pid
        );
        if let Err(err) = self.subsystem.open_recording(&args) {
            warn!(uid = event.uid, pid = event.pid, code = err.code(), "failed to open recording session");
            return (Err(err), Some(TraceStage::Stop));
        }
        inner.is_open_trace = true;

        if let Err(err) = self.subsystem.trace_on() {
            warn!(uid = event.uid, pid = event.pid, code = err.code(), "failed to turn trace capture on");
            return (Err(err), Some(TraceStage::Stop));
        }
        inner.is_trace_on = true;
        inner.trace_begin = self.clock.now_ms();

        info!(
            uid = event.uid,
            pid = event.pid,
            delay = inner.trace_begin - event.happen_time,
            "trace recording started"
        );
        self.scheduler
            .schedule_dump(event.clone(), self.settings.trace_duration);
        (Ok(()), None)
    }

    fn capture_dump(
        &self,
        inner: &mut ContextInner,
        event: &mut AppCallerEvent,
    ) -> (Result<(), CollectError>, Option<TraceStage>) {
        // Dump always falls through to Stop, success or not.
        (self.do_dump(inner, event), Some(TraceStage::Stop))
    }

    fn do_dump(
        &self,
        inner: &mut ContextInner,
        event: &mut AppCallerEvent,
    ) -> Result<(), CollectError> {
        if !self.gate.is_open() {
            warn!(uid = event.uid, pid = event.pid, "no capture in flight to dump");
            return Err(CollectError::NoCaptureTask);
        }

        // Re-checked here: a capture for the same uid may have finished
        // between our Start and this Dump.
        if self.flow.has_call_once_today(event.uid, event.happen_time) {
            warn!(uid = event.uid, pid = event.pid, "app already captured a trace today");
            return Err(CollectError::AlreadyCaptured);
        }

        event.task_begin_time = inner.trace_begin;
        let files = self.subsystem.trace_off().map_err(|err| {
            warn!(uid = event.uid, pid = event.pid, code = err.code(), "failed to turn trace capture off");
            err
        })?;
        inner.is_trace_on = false;
        event.task_end_time = self.clock.now_ms();

        if files.is_empty() {
            warn!(uid = event.uid, pid = event.pid, "trace dump produced no files");
        } else {
            inner.is_dump_trace = true;
            let target = app_trace_file_name(
                &self.settings.share_dir,
                &event.bundle_name,
                event.pid,
                event.task_begin_time,
                event.task_end_time,
            );
            match fs::rename(&files[0], &target) {
                Ok(()) => event.external_log = target.to_string_lossy().into_owned(),
                Err(err) => warn!(
                    from = %files[0].display(),
                    to = %target.display(),
                    error = %err,
                    "failed to move trace artifact"
                ),
            }
        }

        self.share_app_event(event);
        self.flow.record_caller(event);
        self.flow.clean_old_app_trace();
        self.report_jank(event);

        info!(
            uid = event.uid,
            pid = event.pid,
            cost = event.task_end_time - event.happen_time,
            artifact = %event.external_log,
            "trace dump finished"
        );
        Ok(())
    }

    fn capture_stop(
        &self,
        inner: &mut ContextInner,
        event: &mut AppCallerEvent,
    ) -> (Result<(), CollectError>, Option<TraceStage>) {
        if inner.is_open_trace {
            if inner.is_trace_on {
                if let Err(err) = self.subsystem.trace_off() {
                    warn!(uid = event.uid, pid = event.pid, code = err.code(), "trace off during stop failed");
                }
            }
            if let Err(err) = self.subsystem.close() {
                warn!(uid = event.uid, pid = event.pid, code = err.code(), "closing recording session failed");
            }
            info!(
                uid = event.uid,
                pid = event.pid,
                dumped = inner.is_dump_trace,
                "trace recording stopped"
            );
        } else {
            debug!(uid = event.uid, pid = event.pid, "recording never opened, nothing to stop");
        }

        if inner.gate_held {
            self.gate.release();
        }
        inner.reset();
        (Ok(()), None)
    }

    fn share_app_event(&self, event: &AppCallerEvent) {
        let payload = json!({
            "uid": event.uid,
            "pid": event.pid,
            "time": event.happen_time,
            "bundle_name": event.bundle_name,
            "bundle_version": event.bundle_version,
            "begin_time": event.begin_time,
            "end_time": event.end_time,
            "external_log": [event.external_log],
        });
        debug!(uid = event.uid, pid = event.pid, "sharing capture result with app");
        self.publisher
            .push(event.uid, MAIN_THREAD_JANK, EventKind::Fault, payload);
    }

    fn report_jank(&self, event: &AppCallerEvent) {
        let payload = json!({
            "BUNDLE_NAME": event.bundle_name,
            "BUNDLE_VERSION": event.bundle_version,
            "BEGIN_TIME": event.begin_time,
            "END_TIME": event.end_time,
            "THREAD_NAME": event.thread_name,
            "FOREGROUND": event.foreground,
            "LOG_TIME": event.task_end_time,
            "JANK_LEVEL": 1,
        });
        self.publisher
            .report(MAIN_THREAD_JANK, EventKind::Fault, payload);
    }
}

/// Republishes a watchdog stack-capture event to the app sandbox.
///
/// Stacks are captured inside the application process; at or above
/// [`JANK_LEVEL_TRACE`] the state machine takes over with a full trace, so
/// only lower levels are shared here.
pub fn publish_stack_event(
    publisher: &dyn EventPublisher,
    event: &AppCallerEvent,
    jank_level: i32,
) {
    if jank_level >= JANK_LEVEL_TRACE {
        return;
    }
    let payload = json!({
        "uid": event.uid,
        "pid": event.pid,
        "time": event.happen_time,
        "bundle_name": event.bundle_name,
        "bundle_version": event.bundle_version,
        "begin_time": event.begin_time,
        "end_time": event.end_time,
        "external_log": [event.external_log],
    });
    debug!(uid = event.uid, pid = event.pid, jank_level, "sharing stack capture with app");
    publisher.push(event.uid, MAIN_THREAD_JANK, EventKind::Fault, payload);
}

/// Builds the caller-visible artifact path:
/// `APP_<bundle>_<pid>_<begin>_<end>_<cost_ms>.sys`.
fn app_trace_file_name(
    share_dir: &Path,
    bundle_name: &str,
    pid: i32,
    begin_ms: i64,
    end_ms: i64,
) -> PathBuf {
    let name = format!(
        "{APP_TRACE_PREFIX}{}_{}_{}_{}_{}.sys",
        bundle_name,
        pid,
        clock::timestamp_compact(begin_ms),
        clock::timestamp_compact(end_ms),
        end_ms - begin_ms
    );
    share_dir.join(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accept_from_idle() {
        assert!(accept(TraceStage::Idle, TraceStage::Start, 0, 555).is_ok());
        assert_eq!(
            accept(TraceStage::Idle, TraceStage::Dump, 0, 555),
            Err(CollectError::InvalidTraceState)
        );
        assert_eq!(
            accept(TraceStage::Idle, TraceStage::Stop, 0, 555),
            Err(CollectError::InvalidTraceState)
        );
    }

    #[test]
    fn test_accept_from_start() {
        assert!(accept(TraceStage::Start, TraceStage::Dump, 555, 555).is_ok());
        assert!(accept(TraceStage::Start, TraceStage::Stop, 555, 555).is_ok());
        assert_eq!(
            accept(TraceStage::Start, TraceStage::Start, 555, 555),
            Err(CollectError::InvalidTraceState)
        );
    }

    #[test]
    fn test_accept_rejects_pid_mismatch_on_dump() {
        assert_eq!(
            accept(TraceStage::Start, TraceStage::Dump, 555, 556),
            Err(CollectError::InconsistentProcess)
        );
    }

    #[test]
    fn test_accept_from_dump() {
        assert!(accept(TraceStage::Dump, TraceStage::Stop, 555, 555).is_ok());
        assert_eq!(
            accept(TraceStage::Dump, TraceStage::Start, 555, 555),
            Err(CollectError::InvalidTraceState)
        );
        assert_eq!(
            accept(TraceStage::Dump, TraceStage::Dump, 555, 555),
            Err(CollectError::InvalidTraceState)
        );
    }

    #[test]
    fn test_accept_from_stop() {
        assert!(accept(TraceStage::Stop, TraceStage::Start, 0, 555).is_ok());
        // A second Stop is a rejected no-op.
        assert_eq!(
            accept(TraceStage::Stop, TraceStage::Stop, 0, 555),
            Err(CollectError::InvalidTraceState)
        );
        assert_eq!(
            accept(TraceStage::Stop, TraceStage::Dump, 0, 555),
            Err(CollectError::InvalidTraceState)
        );
    }

    #[test]
    fn test_idle_is_never_a_target() {
        for current in [
            TraceStage::Idle,
            TraceStage::Start,
            TraceStage::Dump,
            TraceStage::Stop,
        ] {
            assert_eq!(
                accept(current, TraceStage::Idle, 0, 0),
                Err(CollectError::InvalidTraceState)
            );
        }
    }

    #[test]
    fn test_app_trace_file_name() {
        // 2024-06-14 10:00:00 UTC, 10s window.
        let begin = 1_718_359_200_000;
        let end = begin + 10_000;
        let path = app_trace_file_name(Path::new("/share"), "com.example.maps", 555, begin, end);
        assert_eq!(
            path,
            Path::new("/share/APP_com.example.maps_555_20240614100000_20240614100010_10000.sys")
        );
    }
}

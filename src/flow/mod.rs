//! Per-caller daily quota and per-app dedup gating around trace dumps.
//!
//! A [`TraceFlowController`] is instantiated for one caller class and keeps a
//! cached quota snapshot loaded from the store. Quota acceptance mutates the
//! cache only; [`TraceFlowController::store_db`] makes it durable. A crash in
//! between loses the increment, which deliberately fails open: diagnostics
//! must never block on their own bookkeeping.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use tracing::{debug, info, warn};

use crate::clock::{self, Clock};
use crate::dyntrace::event::AppCallerEvent;
use crate::storage::{AppTraceTask, QuotaStore, TaskState, TaskStore, TaskType, TraceDb};

const XPERF_SIZE: i64 = 1750 * 1024 * 1024;
const XPOWER_SIZE: i64 = 700 * 1024 * 1024;
const RELIABILITY_SIZE: i64 = 350 * 1024 * 1024;
const HIVIEW_SIZE: i64 = 350 * 1024 * 1024;
const FOUNDATION_SIZE: i64 = 150 * 1024 * 1024;
const LABORATORY_MULTIPLIER: i64 = 3;
const OVERSHOOT_TOLERANCE: f64 = 0.1;

const MS_PER_DAY: i64 = 24 * 60 * 60 * 1000;

/// Prefix of trace artifacts produced for app-triggered captures.
pub const APP_TRACE_PREFIX: &str = "APP_";

/// Subsystem requesting a trace capture.
///
/// Each tracked class has a daily byte budget; `App` and `Other` are
/// deliberately unlimited (product policy, not an oversight).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallerClass {
    Xperf,
    Xpower,
    Reliability,
    Hiview,
    Foundation,
    App,
    Other,
}

impl CallerClass {
    /// Name used as the store key and in logs.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Xperf => "Xperf",
            Self::Xpower => "Xpower",
            Self::Reliability => "Reliability",
            Self::Hiview => "Hiview",
            Self::Foundation => "Foundation",
            Self::App => "App",
            Self::Other => "Other",
        }
    }
}

impl fmt::Display for CallerClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Daily byte budget for a caller class, or `None` for unlimited.
///
/// Laboratory mode raises the reliability budget for lab/beta devices.
pub fn daily_quota(class: CallerClass, laboratory_mode: bool) -> Option<i64> {
    match class {
        CallerClass::Xperf => Some(XPERF_SIZE),
        CallerClass::Xpower => Some(XPOWER_SIZE),
        CallerClass::Reliability => {
            if laboratory_mode {
                Some(RELIABILITY_SIZE * LABORATORY_MULTIPLIER)
            } else {
                Some(RELIABILITY_SIZE)
            }
        }
        CallerClass::Hiview => Some(HIVIEW_SIZE),
        CallerClass::Foundation => Some(FOUNDATION_SIZE),
        CallerClass::App | CallerClass::Other => None,
    }
}

/// Budget check with a 10% overshoot tolerance, so an already-captured dump
/// that slightly exceeds the remaining quota is not discarded.
pub fn within_quota_limit(used_size: i64, trace_size: i64, limit: i64) -> bool {
    if limit == 0 {
        warn!("quota limit is zero, rejecting dump");
        return false;
    }
    let total = used_size + trace_size;
    if total < limit {
        return true;
    }
    (total - limit) as f64 / limit as f64 <= OVERSHOOT_TOLERANCE
}

/// Flow-control knobs lifted out of the full config.
#[derive(Debug, Clone)]
pub struct FlowSettings {
    /// Directory holding trace artifacts shared with applications.
    pub share_dir: PathBuf,
    /// Raises the reliability budget on lab/beta devices.
    pub laboratory_mode: bool,
    /// Days a finished task row is kept before purging.
    pub task_retention_days: i64,
    /// Newest app trace files kept in the share directory.
    pub app_share_file_limit: usize,
}

/// Cached quota snapshot for one caller class.
#[derive(Debug, Clone)]
struct QuotaRecord {
    day: String,
    used_size: i64,
}

/// Gates a single trace-dump attempt by daily byte quota and per-app-per-day
/// dedup, and persists the outcome.
pub struct TraceFlowController {
    caller: CallerClass,
    quota: QuotaStore,
    tasks: TaskStore,
    clock: Arc<dyn Clock>,
    settings: FlowSettings,
    record: QuotaRecord,
}

impl TraceFlowController {
    /// Creates a controller for one caller class, loading its cached quota
    /// snapshot from the store. A load failure logs and starts from zero,
    /// which temporarily bypasses enforcement rather than blocking capture.
    pub fn new(
        caller: CallerClass,
        db: Arc<TraceDb>,
        clock: Arc<dyn Clock>,
        settings: FlowSettings,
    ) -> Self {
        let quota = QuotaStore::new(Arc::clone(&db));
        let tasks = TaskStore::new(db);
        let today = clock::day_string(clock.now_ms());
        let record = match quota.get_usage(caller.as_str()) {
            Ok(Some((day, used_size))) => QuotaRecord { day, used_size },
            Ok(None) => QuotaRecord {
                day: today,
                used_size: 0,
            },
            Err(err) => {
                warn!(caller = %caller, error = %err, "failed to load quota snapshot, assuming zero usage");
                QuotaRecord {
                    day: today,
                    used_size: 0,
                }
            }
        };
        debug!(caller = %caller, day = %record.day, used = record.used_size, "quota snapshot loaded");
        Self {
            caller,
            quota,
            tasks,
            clock,
            settings,
            record,
        }
    }

    /// Whether a new dump may start under today's budget.
    ///
    /// Day rollover is detected lazily here: the first evaluation on a new
    /// calendar day resets the cached usage to zero.
    pub fn need_dump(&mut self) -> bool {
        if self.roll_over_if_new_day() {
            return true;
        }
        match daily_quota(self.caller, self.settings.laboratory_mode) {
            None => true,
            Some(limit) => self.record.used_size < limit,
        }
    }

    /// Whether a just-produced dump stays within budget (plus the 10%
    /// overshoot tolerance). On accept the cached usage grows by the dump
    /// size, in memory only; call [`Self::store_db`] to make it durable.
    pub fn need_upload(&mut self, output_files: &[PathBuf]) -> bool {
        let trace_size = total_file_size(output_files);
        self.roll_over_if_new_day();
        let Some(limit) = daily_quota(self.caller, self.settings.laboratory_mode) else {
            return true;
        };
        if !within_quota_limit(self.record.used_size, trace_size, limit) {
            warn!(
                caller = %self.caller,
                used = self.record.used_size,
                trace_size,
                limit,
                "trace dump rejected, daily quota exhausted"
            );
            return false;
        }
        self.record.used_size += trace_size;
        true
    }

    /// Persists the cached usage snapshot. Call exactly once per accepted
    /// dump, after [`Self::need_upload`] returned true.
    pub fn store_db(&self) {
        debug!(caller = %self.caller, day = %self.record.day, used = self.record.used_size, "persisting quota usage");
        if let Err(err) =
            self.quota
                .set_usage(self.caller.as_str(), &self.record.day, self.record.used_size)
        {
            warn!(caller = %self.caller, error = %err, "failed to persist quota usage");
        }
    }

    /// Whether `uid` already finished a capture on the day of
    /// `happen_time_ms`. Storage failures answer false (fail open).
    pub fn has_call_once_today(&self, uid: i32, happen_time_ms: i64) -> bool {
        let task_date = clock::day_compact(happen_time_ms);
        match self.tasks.find_task(uid, task_date) {
            Ok(task) => task.is_some(),
            Err(err) => {
                warn!(uid, error = %err, "task lookup failed, allowing capture");
                false
            }
        }
    }

    /// Records a finished capture so later requests from the same app are
    /// deduplicated for the rest of the day.
    pub fn record_caller(&self, event: &AppCallerEvent) -> bool {
        let resource_size = match fs::metadata(&event.external_log) {
            Ok(meta) => meta.len() as i64,
            Err(err) => {
                warn!(path = %event.external_log, error = %err, "trace artifact missing, recording zero size");
                0
            }
        };
        let task = AppTraceTask {
            id: 0,
            task_date: clock::day_compact(event.happen_time),
            task_type: TaskType::JankEvent as i32,
            uid: event.uid,
            pid: event.pid,
            bundle_name: event.bundle_name.clone(),
            bundle_version: event.bundle_version.clone(),
            start_time: event.task_begin_time,
            finish_time: event.task_end_time,
            resource_path: event.external_log.clone(),
            resource_size,
            cost_cpu: 0.0,
            state: TaskState::Finished as i32,
        };
        match self.tasks.insert_task(&task) {
            Ok(()) => true,
            Err(err) => {
                warn!(uid = event.uid, error = %err, "failed to record finished capture");
                false
            }
        }
    }

    /// Trims surplus app trace files from the share directory, then purges
    /// task rows past the retention window.
    pub fn clean_old_app_trace(&self) {
        remove_surplus_app_files(&self.settings.share_dir, self.settings.app_share_file_limit);

        let cutoff =
            clock::day_compact(self.clock.now_ms() - self.settings.task_retention_days * MS_PER_DAY);
        match self.tasks.purge_older_than(cutoff) {
            Ok(0) => {}
            Ok(removed) => info!(removed, cutoff, "purged expired capture tasks"),
            Err(err) => warn!(error = %err, "failed to purge expired capture tasks"),
        }
    }

    /// Cached usage bytes for the current day.
    pub fn cached_used_bytes(&self) -> i64 {
        self.record.used_size
    }

    /// Calendar day of the cached snapshot.
    pub fn cached_day(&self) -> &str {
        &self.record.day
    }

    fn roll_over_if_new_day(&mut self) -> bool {
        let today = clock::day_string(self.clock.now_ms());
        if today == self.record.day {
            return false;
        }
        info!(caller = %self.caller, day = %today, "quota day rolled over, resetting usage");
        self.record.day = today;
        self.record.used_size = 0;
        true
    }
}

fn total_file_size(paths: &[PathBuf]) -> i64 {
    let mut total = 0;
    for path in paths {
        match fs::metadata(path) {
            Ok(meta) => total += meta.len() as i64,
            Err(err) => warn!(path = %path.display(), error = %err, "dump file missing while sizing"),
        }
    }
    total
}

/// Keeps the newest `keep` app trace files in `dir` and removes the rest.
fn remove_surplus_app_files(dir: &Path, keep: usize) {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) => {
            debug!(dir = %dir.display(), error = %err, "share directory not readable, skipping clean");
            return;
        }
    };

    let mut app_files = Vec::new();
    for entry in entries.flatten() {
        let name = entry.file_name();
        if !name.to_string_lossy().starts_with(APP_TRACE_PREFIX) {
            continue;
        }
        let modified = entry
            .metadata()
            .and_then(|meta| meta.modified())
            .unwrap_or(UNIX_EPOCH);
        app_files.push((modified, entry.path()));
    }

    if app_files.len() <= keep {
        return;
    }

    app_files.sort_by(|a, b| b.0.cmp(&a.0));
    for (_, path) in app_files.split_off(keep) {
        match fs::remove_file(&path) {
            Ok(()) => info!(path = %path.display(), "removed old app trace file"),
            Err(err) => warn!(path = %path.display(), error = %err, "failed to remove old app trace file"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::clock::ManualClock;

    // 2024-06-14 10:00:00 UTC
    const T: i64 = 1_718_359_200_000;

    fn controller(
        caller: CallerClass,
        db: &Arc<TraceDb>,
        clock: &Arc<ManualClock>,
        share_dir: PathBuf,
    ) -> TraceFlowController {
        TraceFlowController::new(
            caller,
            Arc::clone(db),
            Arc::clone(clock) as Arc<dyn Clock>,
            FlowSettings {
                share_dir,
                laboratory_mode: false,
                task_retention_days: 3,
                app_share_file_limit: 20,
            },
        )
    }

    fn write_file(dir: &Path, name: &str, bytes: usize) -> PathBuf {
        let path = dir.join(name);
        let mut file = fs::File::create(&path).expect("create");
        file.write_all(&vec![0u8; bytes]).expect("write");
        path
    }

    #[test]
    fn test_tolerance_accepts_five_percent_overshoot() {
        assert!(within_quota_limit(0, 1050, 1000));
    }

    #[test]
    fn test_tolerance_rejects_twenty_percent_overshoot() {
        assert!(!within_quota_limit(0, 1200, 1000));
    }

    #[test]
    fn test_tolerance_boundary_is_inclusive() {
        assert!(within_quota_limit(0, 1100, 1000));
        assert!(!within_quota_limit(0, 1101, 1000));
    }

    #[test]
    fn test_zero_limit_rejects() {
        assert!(!within_quota_limit(0, 1, 0));
    }

    #[test]
    fn test_laboratory_mode_raises_reliability_budget() {
        let base = daily_quota(CallerClass::Reliability, false).expect("limit");
        let lab = daily_quota(CallerClass::Reliability, true).expect("limit");
        assert_eq!(lab, base * 3);
    }

    #[test]
    fn test_untracked_callers_are_unlimited() {
        assert!(daily_quota(CallerClass::App, false).is_none());
        assert!(daily_quota(CallerClass::Other, false).is_none());
    }

    #[test]
    fn test_quota_usage_is_monotonic_and_durable() {
        let db = Arc::new(TraceDb::open_in_memory().expect("open"));
        let clock = Arc::new(ManualClock::new(T));
        let dir = tempfile::tempdir().expect("tempdir");
        let mut flow = controller(CallerClass::Xperf, &db, &clock, dir.path().to_path_buf());

        let dump_a = write_file(dir.path(), "a.sys", 100);
        let dump_b = write_file(dir.path(), "b.sys", 50);

        assert!(flow.need_dump());
        assert!(flow.need_upload(&[dump_a]));
        assert_eq!(flow.cached_used_bytes(), 100);
        flow.store_db();

        assert!(flow.need_upload(&[dump_b]));
        assert_eq!(flow.cached_used_bytes(), 150);
        flow.store_db();

        // A fresh controller sees the persisted usage.
        let reloaded = controller(CallerClass::Xperf, &db, &clock, dir.path().to_path_buf());
        assert_eq!(reloaded.cached_used_bytes(), 150);
        assert_eq!(reloaded.cached_day(), "2024-06-14");
    }

    #[test]
    fn test_day_rollover_resets_usage() {
        let db = Arc::new(TraceDb::open_in_memory().expect("open"));
        let clock = Arc::new(ManualClock::new(T));
        let dir = tempfile::tempdir().expect("tempdir");

        let quota = QuotaStore::new(Arc::clone(&db));
        let limit = daily_quota(CallerClass::Reliability, false).expect("limit");
        quota
            .set_usage("Reliability", "2024-06-14", limit * 2)
            .expect("seed");

        let mut flow = controller(CallerClass::Reliability, &db, &clock, dir.path().to_path_buf());
        assert!(!flow.need_dump());

        clock.advance(MS_PER_DAY);
        assert!(flow.need_dump());
        assert_eq!(flow.cached_used_bytes(), 0);
        assert_eq!(flow.cached_day(), "2024-06-15");
    }

    #[test]
    fn test_need_upload_rejects_when_over_tolerance() {
        let db = Arc::new(TraceDb::open_in_memory().expect("open"));
        let clock = Arc::new(ManualClock::new(T));
        let dir = tempfile::tempdir().expect("tempdir");

        let quota = QuotaStore::new(Arc::clone(&db));
        let limit = daily_quota(CallerClass::Xpower, false).expect("limit");
        // Seeded past 110% of the budget: any further dump must be rejected.
        quota
            .set_usage("Xpower", "2024-06-14", limit + limit / 5)
            .expect("seed");

        let mut flow = controller(CallerClass::Xpower, &db, &clock, dir.path().to_path_buf());
        let dump = write_file(dir.path(), "c.sys", 10);
        let before = flow.cached_used_bytes();
        assert!(!flow.need_upload(&[dump]));
        assert_eq!(flow.cached_used_bytes(), before);
    }

    #[test]
    fn test_dedup_round_trip() {
        let db = Arc::new(TraceDb::open_in_memory().expect("open"));
        let clock = Arc::new(ManualClock::new(T));
        let dir = tempfile::tempdir().expect("tempdir");
        let flow = controller(CallerClass::App, &db, &clock, dir.path().to_path_buf());

        assert!(!flow.has_call_once_today(100, T));

        let artifact = write_file(dir.path(), "APP_com.example_555.sys", 32);
        let mut event = AppCallerEvent::new(100, 555, "com.example", "1.0", T);
        event.task_begin_time = T;
        event.task_end_time = T + 10_000;
        event.external_log = artifact.to_string_lossy().into_owned();

        assert!(flow.record_caller(&event));
        assert!(flow.has_call_once_today(100, T));
        // Another uid on the same day is unaffected.
        assert!(!flow.has_call_once_today(101, T));
        // Same uid on the next day is unaffected.
        assert!(!flow.has_call_once_today(100, T + MS_PER_DAY));
    }

    #[test]
    fn test_clean_removes_surplus_app_files_and_old_tasks() {
        let db = Arc::new(TraceDb::open_in_memory().expect("open"));
        let clock = Arc::new(ManualClock::new(T));
        let dir = tempfile::tempdir().expect("tempdir");

        let mut settings_flow = controller(CallerClass::App, &db, &clock, dir.path().to_path_buf());
        settings_flow.settings.app_share_file_limit = 2;

        write_file(dir.path(), "APP_one.sys", 8);
        write_file(dir.path(), "APP_two.sys", 8);
        write_file(dir.path(), "APP_three.sys", 8);
        write_file(dir.path(), "other.log", 8);

        let tasks = TaskStore::new(Arc::clone(&db));
        let mut old_task = AppTraceTask {
            uid: 42,
            task_date: clock::day_compact(T - 5 * MS_PER_DAY),
            ..Default::default()
        };
        tasks.insert_task(&old_task).expect("insert");
        old_task.uid = 43;
        old_task.task_date = clock::day_compact(T);
        tasks.insert_task(&old_task).expect("insert");

        settings_flow.clean_old_app_trace();

        let app_files = fs::read_dir(dir.path())
            .expect("read dir")
            .flatten()
            .filter(|e| e.file_name().to_string_lossy().starts_with(APP_TRACE_PREFIX))
            .count();
        assert_eq!(app_files, 2);
        assert!(dir.path().join("other.log").exists());

        assert!(tasks
            .find_task(42, clock::day_compact(T - 5 * MS_PER_DAY))
            .expect("find")
            .is_none());
        assert!(tasks
            .find_task(43, clock::day_compact(T))
            .expect("find")
            .is_some());
    }
}

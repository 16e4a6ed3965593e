use std::sync::Arc;

use anyhow::{Context, Result};
use rusqlite::{params, OptionalExtension, Row};

use super::TraceDb;

/// Kind of capture that produced a task row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum TaskType {
    JankEvent = 1,
}

/// Lifecycle state of a recorded task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum TaskState {
    Finished = 1,
}

/// One finished app capture; the (uid, task_date) pair is what the
/// once-per-day dedup check queries by.
#[derive(Debug, Clone, Default)]
pub struct AppTraceTask {
    pub id: i64,
    /// Capture day as a compact integer, e.g. 20240614.
    pub task_date: i64,
    pub task_type: i32,
    pub uid: i32,
    pub pid: i32,
    pub bundle_name: String,
    pub bundle_version: String,
    pub start_time: i64,
    pub finish_time: i64,
    /// Path of the produced trace artifact.
    pub resource_path: String,
    pub resource_size: i64,
    pub cost_cpu: f64,
    pub state: i32,
}

impl AppTraceTask {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            task_date: row.get(1)?,
            task_type: row.get(2)?,
            uid: row.get(3)?,
            pid: row.get(4)?,
            bundle_name: row.get(5)?,
            bundle_version: row.get(6)?,
            start_time: row.get(7)?,
            finish_time: row.get(8)?,
            resource_path: row.get(9)?,
            resource_size: row.get(10)?,
            cost_cpu: row.get(11)?,
            state: row.get(12)?,
        })
    }
}

/// Persistent dedup and bookkeeping records for finished app captures.
pub struct TaskStore {
    db: Arc<TraceDb>,
}

impl TaskStore {
    pub fn new(db: Arc<TraceDb>) -> Self {
        Self { db }
    }

    /// Looks up the task captured by `uid` on `task_date`, if any.
    pub fn find_task(&self, uid: i32, task_date: i64) -> Result<Option<AppTraceTask>> {
        self.db
            .with_conn(|conn| {
                conn.query_row(
                    "SELECT id, task_date, task_type, uid, pid, bundle_name, bundle_version, \
                     start_time, finish_time, resource_path, resource_size, cost_cpu, state \
                     FROM unified_collection_task WHERE uid = ?1 AND task_date = ?2",
                    params![uid, task_date],
                    AppTraceTask::from_row,
                )
                .optional()
            })
            .with_context(|| format!("querying task for uid {uid} on {task_date}"))
    }

    /// Persists a finished capture record.
    pub fn insert_task(&self, task: &AppTraceTask) -> Result<()> {
        self.db
            .with_conn(|conn| {
                conn.execute(
                    "INSERT INTO unified_collection_task (task_date, task_type, uid, pid, \
                     bundle_name, bundle_version, start_time, finish_time, resource_path, \
                     resource_size, cost_cpu, state) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                    params![
                        task.task_date,
                        task.task_type,
                        task.uid,
                        task.pid,
                        task.bundle_name,
                        task.bundle_version,
                        task.start_time,
                        task.finish_time,
                        task.resource_path,
                        task.resource_size,
                        task.cost_cpu,
                        task.state,
                    ],
                )?;
                Ok(())
            })
            .with_context(|| format!("inserting task for uid {}", task.uid))
    }

    /// Deletes rows older than the cutoff day; returns how many were removed.
    pub fn purge_older_than(&self, cutoff_date: i64) -> Result<usize> {
        self.db
            .with_conn(|conn| {
                conn.execute(
                    "DELETE FROM unified_collection_task WHERE task_date < ?1",
                    params![cutoff_date],
                )
            })
            .with_context(|| format!("purging tasks older than {cutoff_date}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> TaskStore {
        TaskStore::new(Arc::new(TraceDb::open_in_memory().expect("open")))
    }

    fn task(uid: i32, task_date: i64) -> AppTraceTask {
        AppTraceTask {
            task_date,
            task_type: TaskType::JankEvent as i32,
            uid,
            pid: 555,
            bundle_name: "com.example.maps".to_string(),
            bundle_version: "1.2.0".to_string(),
            start_time: 1_718_359_200_000,
            finish_time: 1_718_359_210_000,
            resource_path: "/tmp/trace.sys".to_string(),
            resource_size: 2048,
            state: TaskState::Finished as i32,
            ..Default::default()
        }
    }

    #[test]
    fn test_find_absent_is_none() {
        let store = store();
        assert!(store.find_task(100, 20_240_614).expect("find").is_none());
    }

    #[test]
    fn test_insert_then_find() {
        let store = store();
        store.insert_task(&task(100, 20_240_614)).expect("insert");

        let found = store
            .find_task(100, 20_240_614)
            .expect("find")
            .expect("row");
        assert!(found.id > 0);
        assert_eq!(found.uid, 100);
        assert_eq!(found.task_date, 20_240_614);
        assert_eq!(found.bundle_name, "com.example.maps");
        assert_eq!(found.state, TaskState::Finished as i32);
    }

    #[test]
    fn test_find_is_keyed_by_uid_and_date() {
        let store = store();
        store.insert_task(&task(100, 20_240_614)).expect("insert");
        assert!(store.find_task(101, 20_240_614).expect("find").is_none());
        assert!(store.find_task(100, 20_240_615).expect("find").is_none());
    }

    #[test]
    fn test_purge_older_than() {
        let store = store();
        store.insert_task(&task(100, 20_240_611)).expect("insert");
        store.insert_task(&task(101, 20_240_612)).expect("insert");
        store.insert_task(&task(102, 20_240_614)).expect("insert");

        let removed = store.purge_older_than(20_240_613).expect("purge");
        assert_eq!(removed, 2);
        assert!(store.find_task(100, 20_240_611).expect("find").is_none());
        assert!(store.find_task(102, 20_240_614).expect("find").is_some());
    }
}

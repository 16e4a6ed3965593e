pub mod quota;
pub mod task;

use std::path::Path;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::Connection;

pub use quota::QuotaStore;
pub use task::{AppTraceTask, TaskState, TaskStore, TaskType};

const SCHEMA: &str = "\
CREATE TABLE IF NOT EXISTS trace_flow_control (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    system_time TEXT,
    caller_name TEXT,
    used_size INTEGER
);
CREATE TABLE IF NOT EXISTS unified_collection_task (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    task_date INTEGER,
    task_type INTEGER,
    uid INTEGER,
    pid INTEGER,
    bundle_name TEXT,
    bundle_version TEXT,
    start_time INTEGER,
    finish_time INTEGER,
    resource_path TEXT,
    resource_size INTEGER,
    cost_cpu REAL,
    state INTEGER
);";

/// Embedded store backing quota and task bookkeeping.
///
/// One connection guarded by a mutex; the capture path is low volume, so
/// connection pooling would buy nothing here.
pub struct TraceDb {
    conn: Mutex<Connection>,
}

impl TraceDb {
    /// Opens (or creates) the database at `path` and ensures the schema.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("creating database directory {}", dir.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("opening database {}", path.display()))?;
        Self::init(conn)
    }

    /// Opens an in-memory database, used by tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("opening in-memory database")?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)
            .context("creating collection tables")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub(crate) fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> rusqlite::Result<T>,
    ) -> rusqlite::Result<T> {
        f(&self.conn.lock())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_creates_both_tables() {
        let db = TraceDb::open_in_memory().expect("open");
        let count: i64 = db
            .with_conn(|conn| {
                conn.query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' \
                     AND name IN ('trace_flow_control', 'unified_collection_task')",
                    [],
                    |row| row.get(0),
                )
            })
            .expect("query");
        assert_eq!(count, 2);
    }

    #[test]
    fn test_open_creates_parent_directory() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested/collection.db");
        TraceDb::open(&path).expect("open");
        assert!(path.exists());
    }
}

use std::sync::Arc;

use anyhow::{Context, Result};
use rusqlite::{params, OptionalExtension};

use super::TraceDb;

/// Persistent per-caller daily byte usage for trace captures.
///
/// One row per caller name; the row content is overwritten whenever the
/// calendar day advances, so rows are never deleted.
pub struct QuotaStore {
    db: Arc<TraceDb>,
}

impl QuotaStore {
    pub fn new(db: Arc<TraceDb>) -> Self {
        Self { db }
    }

    /// Returns the stored (day, used bytes) for a caller, if a row exists.
    pub fn get_usage(&self, caller: &str) -> Result<Option<(String, i64)>> {
        self.db
            .with_conn(|conn| {
                conn.query_row(
                    "SELECT system_time, used_size FROM trace_flow_control \
                     WHERE caller_name = ?1",
                    params![caller],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()
            })
            .with_context(|| format!("querying quota usage for caller {caller}"))
    }

    /// Upserts the usage row for a caller.
    pub fn set_usage(&self, caller: &str, day: &str, used_size: i64) -> Result<()> {
        self.db
            .with_conn(|conn| {
                let updated = conn.execute(
                    "UPDATE trace_flow_control SET system_time = ?2, used_size = ?3 \
                     WHERE caller_name = ?1",
                    params![caller, day, used_size],
                )?;
                if updated == 0 {
                    conn.execute(
                        "INSERT INTO trace_flow_control (system_time, caller_name, used_size) \
                         VALUES (?2, ?1, ?3)",
                        params![caller, day, used_size],
                    )?;
                }
                Ok(())
            })
            .with_context(|| format!("storing quota usage for caller {caller}"))
    }
}

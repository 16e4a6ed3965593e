use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::dyntrace::CaptureSettings;
use crate::flow::FlowSettings;

/// Top-level configuration for the traceflow agent.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Logging verbosity (trace, debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Path of the embedded bookkeeping database.
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// Directory receiving trace artifacts shared with applications.
    #[serde(default = "default_share_dir")]
    pub share_dir: PathBuf,

    /// Raises the reliability quota on lab/beta devices.
    #[serde(default)]
    pub laboratory_mode: bool,

    /// Whether app-triggered dynamic captures are enabled at all.
    #[serde(default = "default_true")]
    pub enable_dynamic_trace: bool,

    /// Recording window before the automatic dump. Default: 10s.
    #[serde(default = "default_trace_duration", with = "humantime_serde")]
    pub trace_duration: Duration,

    /// Days a finished task row is kept before purging. Default: 3.
    #[serde(default = "default_task_retention_days")]
    pub task_retention_days: i64,

    /// Newest app trace files kept in the share directory. Default: 20.
    #[serde(default = "default_app_share_file_limit")]
    pub app_share_file_limit: usize,

    /// Trace categories passed to the recording session.
    #[serde(default = "default_trace_tags")]
    pub trace_tags: String,

    /// Trace ring buffer size in KB. Default: 1024.
    #[serde(default = "default_trace_buffer_kb")]
    pub trace_buffer_kb: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            db_path: default_db_path(),
            share_dir: default_share_dir(),
            laboratory_mode: false,
            enable_dynamic_trace: true,
            trace_duration: default_trace_duration(),
            task_retention_days: default_task_retention_days(),
            app_share_file_limit: default_app_share_file_limit(),
            trace_tags: default_trace_tags(),
            trace_buffer_kb: default_trace_buffer_kb(),
        }
    }
}

impl Config {
    /// Loads and validates a YAML config file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.trace_duration.is_zero() {
            bail!("trace_duration must be > 0");
        }

        if self.task_retention_days <= 0 {
            bail!("task_retention_days must be > 0");
        }

        if self.trace_tags.is_empty() {
            bail!("trace_tags is required");
        }

        if self.trace_buffer_kb == 0 {
            bail!("trace_buffer_kb must be > 0");
        }

        Ok(())
    }

    /// Flow-control view of the config.
    pub fn flow_settings(&self) -> FlowSettings {
        FlowSettings {
            share_dir: self.share_dir.clone(),
            laboratory_mode: self.laboratory_mode,
            task_retention_days: self.task_retention_days,
            app_share_file_limit: self.app_share_file_limit,
        }
    }

    /// Capture view of the config.
    pub fn capture_settings(&self) -> CaptureSettings {
        CaptureSettings {
            share_dir: self.share_dir.clone(),
            trace_duration: self.trace_duration,
            trace_tags: self.trace_tags.clone(),
            trace_buffer_kb: self.trace_buffer_kb,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_db_path() -> PathBuf {
    PathBuf::from("/var/lib/traceflow/collection.db")
}

fn default_share_dir() -> PathBuf {
    PathBuf::from("/var/log/traceflow/share")
}

fn default_true() -> bool {
    true
}

fn default_trace_duration() -> Duration {
    Duration::from_secs(10)
}

fn default_task_retention_days() -> i64 {
    3
}

fn default_app_share_file_limit() -> usize {
    20
}

fn default_trace_tags() -> String {
    "graphic,ace,app".to_string()
}

fn default_trace_buffer_kb() -> u32 {
    1024
}

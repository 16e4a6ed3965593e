use crate::error::CollectError;

/// One application-triggered capture request, alive for the duration of the
/// Start/Dump/Stop lifecycle.
///
/// Times are epoch milliseconds. `begin_time`/`end_time` delimit the jank
/// handler window reported by the app; `task_begin_time`/`task_end_time`
/// delimit the actual trace-capture window.
#[derive(Debug, Clone, Default)]
pub struct AppCallerEvent {
    pub uid: i32,
    pub pid: i32,
    pub bundle_name: String,
    pub bundle_version: String,
    pub thread_name: String,
    pub foreground: bool,
    /// When the triggering jank happened.
    pub happen_time: i64,
    pub begin_time: i64,
    pub end_time: i64,
    pub task_begin_time: i64,
    pub task_end_time: i64,
    /// Path of the produced artifact; empty until Dump succeeds.
    pub external_log: String,
    pub result_code: Option<CollectError>,
}

impl AppCallerEvent {
    pub fn new(
        uid: i32,
        pid: i32,
        bundle_name: &str,
        bundle_version: &str,
        happen_time: i64,
    ) -> Self {
        Self {
            uid,
            pid,
            bundle_name: bundle_name.to_string(),
            bundle_version: bundle_version.to_string(),
            happen_time,
            ..Default::default()
        }
    }

    /// Wire code reported back over the capture RPC; 0 on success.
    pub fn wire_code(&self) -> i32 {
        self.result_code.map_or(0, CollectError::code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_code_defaults_to_success() {
        let event = AppCallerEvent::new(100, 555, "com.example.maps", "1.2.0", 1_718_359_200_000);
        assert_eq!(event.wire_code(), 0);
    }

    #[test]
    fn test_wire_code_reflects_result() {
        let mut event = AppCallerEvent::new(100, 555, "com.example.maps", "1.2.0", 0);
        event.result_code = Some(CollectError::AlreadyCaptured);
        assert_eq!(event.wire_code(), CollectError::AlreadyCaptured.code());
    }
}

use thiserror::Error;

/// Result code observed by trace capture callers.
///
/// The `code()` values travel back over the capture RPC and must stay stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CollectError {
    /// Dynamic trace capture is disabled on this build.
    #[error("trace capture is not supported on this build")]
    Unsupported,

    /// Reading from the bookkeeping store failed.
    #[error("failed to read from the collection store")]
    StorageReadFailed,

    /// Writing to the bookkeeping store failed.
    #[error("failed to write to the collection store")]
    StorageWriteFailed,

    /// An open/close/on/off call into the trace subsystem failed.
    #[error("trace subsystem call failed")]
    TraceSubsystem,

    /// The caller's daily byte budget is exhausted.
    #[error("daily trace quota exceeded")]
    QuotaExceeded,

    /// A produced dump overflows the budget beyond the accepted tolerance.
    #[error("trace dump overflows the daily quota tolerance")]
    Overflow,

    /// The requested state transition is not in the transition table.
    #[error("invalid trace state transition")]
    InvalidTraceState,

    /// Dump was requested by a pid other than the one that started recording.
    #[error("capture request pid differs from the recording pid")]
    InconsistentProcess,

    /// The app already finished a capture today.
    #[error("app already captured a trace today")]
    AlreadyCaptured,

    /// Another dynamic capture currently holds the trace buffer.
    #[error("a dynamic trace capture is already in flight")]
    ExistsCaptureTask,

    /// Dump was requested while no capture session is open.
    #[error("no dynamic trace capture is in flight")]
    NoCaptureTask,

    /// A required collaborator is missing or unusable.
    #[error("required collaborator is missing")]
    SystemError,
}

impl CollectError {
    /// Stable wire code for the capture RPC result.
    pub fn code(self) -> i32 {
        match self {
            Self::Unsupported => 1,
            Self::StorageReadFailed => 2,
            Self::StorageWriteFailed => 3,
            Self::TraceSubsystem => 4,
            Self::QuotaExceeded => 5,
            Self::Overflow => 6,
            Self::InvalidTraceState => 7,
            Self::InconsistentProcess => 8,
            Self::AlreadyCaptured => 9,
            Self::ExistsCaptureTask => 10,
            Self::NoCaptureTask => 11,
            Self::SystemError => 12,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_distinct() {
        let all = [
            CollectError::Unsupported,
            CollectError::StorageReadFailed,
            CollectError::StorageWriteFailed,
            CollectError::TraceSubsystem,
            CollectError::QuotaExceeded,
            CollectError::Overflow,
            CollectError::InvalidTraceState,
            CollectError::InconsistentProcess,
            CollectError::AlreadyCaptured,
            CollectError::ExistsCaptureTask,
            CollectError::NoCaptureTask,
            CollectError::SystemError,
        ];
        let mut codes: Vec<i32> = all.iter().map(|e| e.code()).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), all.len());
    }
}

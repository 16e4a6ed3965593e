use std::sync::atomic::{AtomicBool, Ordering};

/// Process-wide single-flight gate for dynamic trace captures.
///
/// The device trace buffer is a single shared resource: only one
/// app-triggered capture may hold it at a time. The open flag is checked and
/// claimed with a compare-and-swap so concurrent Start requests cannot both
/// pass. The gate is injected into the state machine, never read as a global.
#[derive(Debug)]
pub struct DynamicTraceGate {
    enabled: AtomicBool,
    open: AtomicBool,
}

impl DynamicTraceGate {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled: AtomicBool::new(enabled),
            open: AtomicBool::new(false),
        }
    }

    /// Whether dynamic captures are enabled at all on this device.
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    /// Whether a capture currently holds the gate.
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Claims the gate; false if another capture is already in flight.
    pub fn try_acquire(&self) -> bool {
        self.open
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Releases the gate so the next capture may start.
    pub fn release(&self) {
        self.open.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_flight() {
        let gate = DynamicTraceGate::new(true);
        assert!(!gate.is_open());
        assert!(gate.try_acquire());
        assert!(gate.is_open());
        assert!(!gate.try_acquire());
        gate.release();
        assert!(gate.try_acquire());
    }

    #[test]
    fn test_enabled_switch() {
        let gate = DynamicTraceGate::new(false);
        assert!(!gate.is_enabled());
        gate.set_enabled(true);
        assert!(gate.is_enabled());
    }
}

//! Shared atomic helpers for parallel number distribution and early-stop coordination.
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Atomically distributed monotonically increasing numbers.
#[derive(Debug)]
pub struct NonceSource {
    next: AtomicU64,
}

impl NonceSource {
    /// Create a source starting from `start`.
    pub const fn new(start: u64) -> Self {
        Self {
            next: AtomicU64::new(start),
        }
    }

    /// Reserve and return the next number.
    #[inline]
    pub fn fetch(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

/// One-shot cancellation signal observed by every worker.
#[derive(Debug, Default)]
pub struct StopFlag {
    stop: AtomicBool,
}

impl StopFlag {
    pub const fn new() -> Self {
        Self {
            stop: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn should_stop(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    pub fn force_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nonce_source_increments() {
        let ns = NonceSource::new(5);
        assert_eq!(ns.fetch(), 5);
        assert_eq!(ns.fetch(), 6);
    }

    #[test]
    fn stop_flag_latches() {
        let stop = StopFlag::new();
        assert!(!stop.should_stop());
        stop.force_stop();
        assert!(stop.should_stop());
        stop.force_stop();
        assert!(stop.should_stop());
    }
}

//! Circuit breaker for credential failures.
//!
//! A rejected credential is not retried at the request level, but one bad
//! response can be a fluke. The breaker counts AUTH failures across a whole
//! phase and trips once the threshold is reached; a tripped breaker stays open
//! for the rest of the run.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// Run-scoped breaker over AUTH failures.
#[derive(Debug)]
pub struct CircuitBreaker {
    failures: AtomicU32,
    tripped: AtomicBool,
    threshold: u32,
}

impl CircuitBreaker {
    pub fn new(threshold: u32) -> Self {
        Self {
            failures: AtomicU32::new(0),
            tripped: AtomicBool::new(false),
            threshold: threshold.max(1),
        }
    }

    /// Default breaker: trips on the second AUTH failure.
    pub fn auth_default() -> Self {
        Self::new(2)
    }

    /// Whether requests are still allowed.
    pub fn is_allowed(&self) -> bool {
        !self.tripped.load(Ordering::SeqCst)
    }

    /// Record an AUTH failure. Returns true if this failure tripped the breaker.
    pub fn record_failure(&self) -> bool {
        let n = self.failures.fetch_add(1, Ordering::SeqCst) + 1;
        if n >= self.threshold {
            return !self.tripped.swap(true, Ordering::SeqCst);
        }
        false
    }

    pub fn failures(&self) -> u32 {
        self.failures.load(Ordering::SeqCst)
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::auth_default()
    }
}

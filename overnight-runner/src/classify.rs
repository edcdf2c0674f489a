//! Failure classification and retry/backoff policy.
//!
//! [`classify`] is a pure mapping from a raw failure to an [`ErrorClass`];
//! [`RetryPolicy`] turns a class and attempt number into "sleep this long and
//! retry" or "give up".

use crate::config::RetryConfig;
use overnight_core::data::{ProviderError, TransportKind};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::time::Duration;

/// Stable failure tag recorded with every per-unit failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorClass {
    #[serde(rename = "AUTH")]
    Auth,
    #[serde(rename = "RATE_LIMIT")]
    RateLimit,
    #[serde(rename = "UPSTREAM_5XX")]
    Upstream5xx,
    #[serde(rename = "NETWORK")]
    Network,
    #[serde(rename = "TIMEOUT")]
    Timeout,
    #[serde(rename = "DISK")]
    Disk,
    #[serde(rename = "UNKNOWN")]
    Unknown,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Auth => "AUTH",
            ErrorClass::RateLimit => "RATE_LIMIT",
            ErrorClass::Upstream5xx => "UPSTREAM_5XX",
            ErrorClass::Network => "NETWORK",
            ErrorClass::Timeout => "TIMEOUT",
            ErrorClass::Disk => "DISK",
            ErrorClass::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A raw failure, as observed by a phase runner.
#[derive(Debug, Clone, Copy)]
pub enum FailureSignal<'a> {
    Provider(&'a ProviderError),
    Io(&'a io::Error),
    /// The work was abandoned because its deadline passed.
    Deadline,
}

pub fn classify(signal: FailureSignal<'_>) -> ErrorClass {
    match signal {
        FailureSignal::Provider(e) => classify_provider(e),
        FailureSignal::Io(e) => classify_io(e),
        FailureSignal::Deadline => ErrorClass::Timeout,
    }
}

pub fn classify_provider(error: &ProviderError) -> ErrorClass {
    match error {
        ProviderError::Http { status, .. } => match status {
            401 | 403 => ErrorClass::Auth,
            429 => ErrorClass::RateLimit,
            500..=599 => ErrorClass::Upstream5xx,
            _ => ErrorClass::Unknown,
        },
        ProviderError::Transport { kind, .. } => match kind {
            TransportKind::Timeout
            | TransportKind::ConnectionRefused
            | TransportKind::ConnectionReset => ErrorClass::Network,
            TransportKind::Other => ErrorClass::Unknown,
        },
        ProviderError::MissingCredential => ErrorClass::Auth,
        ProviderError::ResponseFormat(_) => ErrorClass::Unknown,
    }
}

pub fn classify_io(error: &io::Error) -> ErrorClass {
    if is_disk_full(error) {
        return ErrorClass::Disk;
    }
    match error.kind() {
        io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionRefused
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::TimedOut => ErrorClass::Network,
        _ => ErrorClass::Unknown,
    }
}

/// Out of space or over quota.
pub fn is_disk_full(error: &io::Error) -> bool {
    #[cfg(unix)]
    {
        matches!(error.raw_os_error(), Some(code) if code == libc::ENOSPC || code == libc::EDQUOT)
    }
    #[cfg(not(unix))]
    {
        let _ = error;
        false
    }
}

// ── Retry policy ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAfter(Duration),
    GiveUp,
}

/// Bounded retry with exponential backoff and retry-after support.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// One backoff unit. Exponential backoff is `min(2^attempt, cap_units)` units.
    pub unit: Duration,
    pub cap_units: u64,
    pub retry_after_cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            unit: Duration::from_millis(config.backoff_unit_ms),
            cap_units: config.backoff_cap_units,
            retry_after_cap: Duration::from_secs(config.retry_after_cap_secs),
        }
    }

    /// Backoff before the next attempt, ignoring the attempt budget.
    ///
    /// `attempt` is the 1-based number of the attempt that just failed.
    /// `None` means the class is never retried.
    pub fn backoff(&self, class: ErrorClass, attempt: u32, retry_after: Option<Duration>) -> Option<Duration> {
        match class {
            ErrorClass::Network | ErrorClass::Upstream5xx | ErrorClass::Timeout => {
                Some(self.exponential(attempt))
            }
            ErrorClass::RateLimit => Some(match retry_after {
                Some(hint) => hint.min(self.retry_after_cap),
                None => self.exponential(attempt),
            }),
            ErrorClass::Auth | ErrorClass::Disk | ErrorClass::Unknown => None,
        }
    }

    pub fn decide(&self, class: ErrorClass, attempt: u32, retry_after: Option<Duration>) -> RetryDecision {
        if attempt >= self.max_attempts {
            return RetryDecision::GiveUp;
        }
        match self.backoff(class, attempt, retry_after) {
            Some(delay) => RetryDecision::RetryAfter(delay),
            None => RetryDecision::GiveUp,
        }
    }

    fn exponential(&self, attempt: u32) -> Duration {
        let units = 1u64
            .checked_shl(attempt.min(63))
            .unwrap_or(u64::MAX)
            .min(self.cap_units);
        self.unit.saturating_mul(u32::try_from(units).unwrap_or(u32::MAX))
    }
}

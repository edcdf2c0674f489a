//! Upstream request statistics.
//!
//! A [`RequestMeter`] is shared by every bars worker; each finished provider
//! call is recorded once, and [`RequestMeter::snapshot`] produces the
//! serializable [`RequestStats`] that goes into the status document.

use overnight_core::data::ProviderError;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use std::time::Duration;

/// Aggregate request statistics for the run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestStats {
    pub requests_total: u64,
    pub http_429_count: u64,
    pub http_5xx_count: u64,
    pub network_error_count: u64,
    pub auth_failure_count: u64,
    /// Mean latency over every recorded request; `None` before the first.
    pub avg_latency_ms: Option<u64>,
}

#[derive(Debug, Default)]
struct MeterState {
    stats: RequestStats,
    latency_total_ms: u128,
}

/// Thread-safe request counter.
#[derive(Debug, Default)]
pub struct RequestMeter {
    state: Mutex<MeterState>,
}

impl RequestMeter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one finished request and its outcome.
    pub fn record<T>(&self, result: &Result<T, ProviderError>, latency: Duration) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.stats.requests_total += 1;
        state.latency_total_ms += latency.as_millis();

        if let Err(e) = result {
            match e {
                ProviderError::Http { status: 429, .. } => state.stats.http_429_count += 1,
                ProviderError::Http { status: 401 | 403, .. } => {
                    state.stats.auth_failure_count += 1
                }
                ProviderError::Http { status, .. } if *status >= 500 => {
                    state.stats.http_5xx_count += 1
                }
                ProviderError::Transport { .. } => state.stats.network_error_count += 1,
                _ => {}
            }
        }

        let avg = state.latency_total_ms / u128::from(state.stats.requests_total);
        state.stats.avg_latency_ms = Some(u64::try_from(avg).unwrap_or(u64::MAX));
    }

    pub fn snapshot(&self) -> RequestStats {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .stats
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use overnight_core::data::TransportKind;

    #[test]
    fn counts_by_outcome() {
        let meter = RequestMeter::new();
        let ok: Result<(), ProviderError> = Ok(());
        meter.record(&ok, Duration::from_millis(100));
        meter.record::<()>(
            &Err(ProviderError::Http {
                status: 429,
                retry_after: None,
            }),
            Duration::from_millis(300),
        );
        meter.record::<()>(
            &Err(ProviderError::Http {
                status: 502,
                retry_after: None,
            }),
            Duration::from_millis(200),
        );
        meter.record::<()>(
            &Err(ProviderError::Transport {
                kind: TransportKind::Timeout,
                message: "t".into(),
            }),
            Duration::from_millis(0),
        );
        meter.record::<()>(
            &Err(ProviderError::Http {
                status: 403,
                retry_after: None,
            }),
            Duration::from_millis(0),
        );

        let s = meter.snapshot();
        assert_eq!(s.requests_total, 5);
        assert_eq!(s.http_429_count, 1);
        assert_eq!(s.http_5xx_count, 1);
        assert_eq!(s.network_error_count, 1);
        assert_eq!(s.auth_failure_count, 1);
        assert_eq!(s.avg_latency_ms, Some(120));
    }

    #[test]
    fn empty_meter_has_no_latency() {
        assert_eq!(RequestMeter::new().snapshot().avg_latency_ms, None);
    }
}

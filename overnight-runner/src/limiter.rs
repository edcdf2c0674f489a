//! Token-bucket limiter with a concurrency cap.
//!
//! Tokens refill continuously at `rate_per_sec` up to `bucket_size`. A caller
//! is admitted once it can debit a whole token while fewer than
//! `max_inflight` permits are outstanding. Waiting is cooperative polling with
//! sleeps sized toward the next token, clamped to 20..=250 ms.

use crate::config::LimiterConfig;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

const MIN_POLL: Duration = Duration::from_millis(20);
const MAX_POLL: Duration = Duration::from_millis(250);
/// Poll interval when waiting only for a concurrency slot.
const SLOT_POLL: Duration = Duration::from_millis(100);

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
    inflight: usize,
}

/// Shared limiter for upstream requests.
#[derive(Debug)]
pub struct TokenBucket {
    max_inflight: usize,
    rate_per_sec: f64,
    bucket_size: f64,
    state: Mutex<BucketState>,
}

/// Admission to run one request. Dropping it frees the concurrency slot.
#[derive(Debug)]
pub struct Permit<'a> {
    bucket: &'a TokenBucket,
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        self.bucket.release();
    }
}

impl TokenBucket {
    /// Starts full.
    pub fn new(config: &LimiterConfig) -> Self {
        let bucket_size = config.bucket_size.max(1.0);
        Self {
            max_inflight: config.max_inflight.max(1),
            rate_per_sec: config.rate_per_sec,
            bucket_size,
            state: Mutex::new(BucketState {
                tokens: bucket_size,
                last_refill: Instant::now(),
                inflight: 0,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BucketState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Debit a token and take a slot, or report how long to wait.
    fn try_acquire(&self) -> Result<(), Duration> {
        let mut state = self.lock();
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.rate_per_sec).min(self.bucket_size);
        state.last_refill = now;

        if state.tokens >= 1.0 && state.inflight < self.max_inflight {
            state.tokens -= 1.0;
            state.inflight += 1;
            return Ok(());
        }

        let wait = if state.tokens < 1.0 {
            Duration::from_secs_f64((1.0 - state.tokens) / self.rate_per_sec)
        } else {
            SLOT_POLL
        };
        Err(wait.clamp(MIN_POLL, MAX_POLL))
    }

    /// Wait for a token and a free slot.
    pub async fn acquire(&self) -> Permit<'_> {
        loop {
            match self.try_acquire() {
                Ok(()) => return Permit { bucket: self },
                Err(wait) => tokio::time::sleep(wait).await,
            }
        }
    }

    fn release(&self) {
        let mut state = self.lock();
        state.inflight = state.inflight.saturating_sub(1);
    }

    #[cfg(test)]
    fn inflight(&self) -> usize {
        self.lock().inflight
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bucket(max_inflight: usize, rate: f64, size: f64) -> TokenBucket {
        TokenBucket::new(&LimiterConfig {
            max_inflight,
            rate_per_sec: rate,
            bucket_size: size,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn burst_then_rate() {
        let b = bucket(10, 1.0, 2.0);
        let start = Instant::now();
        drop(b.acquire().await);
        drop(b.acquire().await);
        assert!(start.elapsed() < Duration::from_millis(1));

        drop(b.acquire().await);
        let third = start.elapsed();
        assert!(third >= Duration::from_millis(900), "third admitted after {third:?}");
        assert!(third <= Duration::from_millis(1300), "third admitted after {third:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn permit_drop_frees_slot() {
        let b = bucket(1, 100.0, 10.0);
        let p = b.acquire().await;
        assert_eq!(b.inflight(), 1);
        assert!(b.try_acquire().is_err());
        drop(p);
        assert_eq!(b.inflight(), 0);
        assert!(b.try_acquire().is_ok());
    }

    #[test]
    fn wait_is_clamped() {
        let b = bucket(1, 0.01, 1.0);
        assert!(b.try_acquire().is_ok());
        b.release();
        // Empty bucket at 0.01/s would mean ~100 s; the poll is capped.
        assert_eq!(b.try_acquire(), Err(MAX_POLL));
    }
}

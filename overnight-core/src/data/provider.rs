//! Bar provider trait and structured error types.
//!
//! The `BarProvider` trait abstracts over the upstream OHLCV source so the
//! orchestrator can be driven by the HTTP client in production and by a
//! scripted provider in tests. Providers make exactly one request per call;
//! retry and backoff policy lives with the caller.

use crate::domain::{merge_bars, Bar};
use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

/// Raw daily bar as returned by the provider, before validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawBar {
    pub date: Option<String>,
    #[serde(default)]
    pub open: Option<f64>,
    #[serde(default)]
    pub high: Option<f64>,
    #[serde(default)]
    pub low: Option<f64>,
    #[serde(default)]
    pub close: Option<f64>,
    #[serde(default)]
    pub volume: Option<f64>,
}

impl RawBar {
    /// Normalize into a [`Bar`]. Rows without a parseable date or a positive
    /// close are dropped.
    pub fn into_bar(self) -> Option<Bar> {
        let date = NaiveDate::parse_from_str(self.date.as_deref()?, "%Y-%m-%d").ok()?;
        let close = self.close.filter(|c| c.is_finite() && *c > 0.0)?;
        let positive = |v: Option<f64>| v.filter(|x| x.is_finite() && *x > 0.0);
        Some(Bar {
            date,
            open: positive(self.open),
            high: positive(self.high),
            low: positive(self.low),
            close,
            volume: self
                .volume
                .filter(|v| v.is_finite() && *v >= 0.0)
                .map(|v| v as u64),
        })
    }
}

/// Normalize a provider payload: drop unusable rows, sort by date, de-duplicate.
pub fn normalize_bars(raw: Vec<RawBar>) -> Vec<Bar> {
    let bars: Vec<Bar> = raw.into_iter().filter_map(RawBar::into_bar).collect();
    merge_bars(&[], &bars)
}

/// Low-level transport failure kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportKind {
    Timeout,
    ConnectionRefused,
    ConnectionReset,
    Other,
}

/// Structured failure of a single provider request.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("HTTP {status} from provider")]
    Http {
        status: u16,
        retry_after: Option<Duration>,
    },

    #[error("transport error ({kind:?}): {message}")]
    Transport { kind: TransportKind, message: String },

    #[error("response format changed: {0}")]
    ResponseFormat(String),

    #[error("no provider credential configured")]
    MissingCredential,
}

/// One bars request: a symbol and an inclusive date window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub symbol: String,
    pub from: NaiveDate,
    pub to: NaiveDate,
}

/// Result of the credential probe request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProbeOutcome {
    /// HTTP status, if a response arrived at all.
    pub status: Option<u16>,
    pub retry_after_secs: Option<u64>,
    /// Response headers mentioning rate limits or remaining quota.
    pub rate_limit_headers: BTreeMap<String, String>,
    /// Transport-level error message when no response arrived.
    pub error: Option<String>,
}

/// Upstream source of daily OHLCV bars.
#[async_trait]
pub trait BarProvider: Send + Sync {
    /// Human-readable name of this provider.
    fn name(&self) -> &str;

    /// Whether a credential was supplied at construction.
    fn has_credential(&self) -> bool;

    /// One real request that validates the credential.
    async fn probe(&self) -> ProbeOutcome;

    /// Fetch bars for one symbol over an inclusive window. Exactly one request.
    async fn fetch(&self, request: &FetchRequest) -> Result<Vec<RawBar>, ProviderError>;
}

/// Parse a `Retry-After` value given in delta-seconds.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

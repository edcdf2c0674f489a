//! EODHD end-of-day data provider.
//!
//! Fetches daily OHLCV bars from the `/eod/{SYMBOL}.{EXCHANGE}` endpoint. One
//! call is one HTTP request: status codes and transport failures are surfaced
//! as structured [`ProviderError`]s for the caller's classifier.

use super::provider::{
    parse_retry_after, BarProvider, FetchRequest, ProbeOutcome, ProviderError, RawBar,
    TransportKind,
};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::error::Error as _;
use std::time::Duration;

/// Connection settings for [`EodhdProvider`].
#[derive(Debug, Clone)]
pub struct EodhdSettings {
    pub base_url: String,
    /// Exchange suffix appended to bare symbols (`AAPL` → `AAPL.US`).
    pub exchange: String,
    /// Symbol used for the credential probe.
    pub probe_symbol: String,
    pub request_timeout: Duration,
}

impl Default for EodhdSettings {
    fn default() -> Self {
        Self {
            base_url: "https://eodhd.com/api".into(),
            exchange: "US".into(),
            probe_symbol: "AAPL".into(),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// EODHD data provider.
pub struct EodhdProvider {
    client: reqwest::Client,
    api_key: Option<String>,
    settings: EodhdSettings,
}

impl EodhdProvider {
    pub fn new(api_key: Option<String>, settings: EodhdSettings) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .timeout(settings.request_timeout)
            .user_agent(concat!("overnight/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ProviderError::Transport {
                kind: TransportKind::Other,
                message: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self {
            client,
            api_key: api_key.filter(|k| !k.trim().is_empty()),
            settings,
        })
    }

    fn qualified(&self, symbol: &str) -> String {
        if symbol.contains('.') {
            symbol.to_string()
        } else {
            format!("{symbol}.{}", self.settings.exchange)
        }
    }

    fn eod_url(&self, symbol: &str) -> String {
        format!(
            "{}/eod/{}",
            self.settings.base_url.trim_end_matches('/'),
            self.qualified(symbol)
        )
    }

    fn api_key(&self) -> Result<&str, ProviderError> {
        self.api_key.as_deref().ok_or(ProviderError::MissingCredential)
    }

    /// Transport error with the request URL dropped and the key masked, so
    /// the message is safe to persist.
    fn redacted_error(&self, e: reqwest::Error) -> ProviderError {
        match transport_error(e) {
            ProviderError::Transport { kind, message } => ProviderError::Transport {
                kind,
                message: redact(&message, self.api_key.as_deref()),
            },
            other => other,
        }
    }
}

fn redact(message: &str, key: Option<&str>) -> String {
    match key {
        Some(key) if !key.is_empty() => message.replace(key, "***"),
        _ => message.to_string(),
    }
}

/// Map a reqwest transport error onto the coarse kinds the classifier needs.
/// The URL carries the API token and is never part of the message.
fn transport_error(e: reqwest::Error) -> ProviderError {
    let e = e.without_url();
    let kind = if e.is_timeout() {
        TransportKind::Timeout
    } else if e.is_connect() {
        TransportKind::ConnectionRefused
    } else if is_reset(&e) {
        TransportKind::ConnectionReset
    } else {
        TransportKind::Other
    };
    ProviderError::Transport {
        kind,
        message: e.to_string(),
    }
}

fn is_reset(e: &reqwest::Error) -> bool {
    let mut source = e.source();
    while let Some(err) = source {
        if let Some(io) = err.downcast_ref::<std::io::Error>() {
            return matches!(
                io.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
            );
        }
        source = err.source();
    }
    false
}

fn retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_retry_after)
}

#[async_trait]
impl BarProvider for EodhdProvider {
    fn name(&self) -> &str {
        "eodhd"
    }

    fn has_credential(&self) -> bool {
        self.api_key.is_some()
    }

    async fn probe(&self) -> ProbeOutcome {
        let mut outcome = ProbeOutcome::default();
        let key = match self.api_key() {
            Ok(k) => k,
            Err(e) => {
                outcome.error = Some(e.to_string());
                return outcome;
            }
        };

        let response = self
            .client
            .get(self.eod_url(&self.settings.probe_symbol))
            .query(&[("api_token", key), ("fmt", "json"), ("limit", "1")])
            .send()
            .await;

        match response {
            Ok(resp) => {
                outcome.status = Some(resp.status().as_u16());
                outcome.retry_after_secs = retry_after(resp.headers()).map(|d| d.as_secs());
                let mut captured = BTreeMap::new();
                for (name, value) in resp.headers() {
                    let lower = name.as_str().to_ascii_lowercase();
                    if lower.contains("limit") || lower.contains("remaining") {
                        if let Ok(v) = value.to_str() {
                            captured.insert(lower, v.to_string());
                        }
                    }
                }
                outcome.rate_limit_headers = captured;
            }
            Err(e) => outcome.error = Some(self.redacted_error(e).to_string()),
        }
        outcome
    }

    async fn fetch(&self, request: &FetchRequest) -> Result<Vec<RawBar>, ProviderError> {
        let key = self.api_key()?;
        let from = request.from.format("%Y-%m-%d").to_string();
        let to = request.to.format("%Y-%m-%d").to_string();

        let resp = self
            .client
            .get(self.eod_url(&request.symbol))
            .query(&[
                ("api_token", key),
                ("fmt", "json"),
                ("order", "a"),
                ("from", from.as_str()),
                ("to", to.as_str()),
            ])
            .send()
            .await
            .map_err(|e| self.redacted_error(e))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(ProviderError::Http {
                status: status.as_u16(),
                retry_after: retry_after(resp.headers()),
            });
        }

        let body = resp.text().await.map_err(|e| self.redacted_error(e))?;
        serde_json::from_str::<Vec<RawBar>>(&body).map_err(|e| {
            ProviderError::ResponseFormat(format!(
                "expected a JSON array of bars for {}: {e}",
                request.symbol
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider(key: Option<&str>) -> EodhdProvider {
        EodhdProvider::new(key.map(String::from), EodhdSettings::default()).unwrap()
    }

    #[test]
    fn bare_symbols_get_exchange_suffix() {
        let p = provider(Some("k"));
        assert_eq!(p.eod_url("AAPL"), "https://eodhd.com/api/eod/AAPL.US");
        assert_eq!(p.eod_url("BRK-B.US"), "https://eodhd.com/api/eod/BRK-B.US");
    }

    #[test]
    fn blank_key_counts_as_missing() {
        assert!(!provider(Some("   ")).has_credential());
        assert!(!provider(None).has_credential());
        assert!(provider(Some("demo")).has_credential());
    }

    #[tokio::test]
    async fn fetch_without_key_fails_before_network() {
        let p = provider(None);
        let req = FetchRequest {
            symbol: "AAPL".into(),
            from: chrono::NaiveDate::from_ymd_opt(2026, 1, 2).unwrap(),
            to: chrono::NaiveDate::from_ymd_opt(2026, 1, 5).unwrap(),
        };
        assert!(matches!(
            p.fetch(&req).await,
            Err(ProviderError::MissingCredential)
        ));
    }

    fn unreachable(key: &str) -> EodhdProvider {
        let settings = EodhdSettings {
            base_url: "http://127.0.0.1:1/api".into(),
            request_timeout: Duration::from_secs(5),
            ..EodhdSettings::default()
        };
        EodhdProvider::new(Some(key.into()), settings).unwrap()
    }

    #[tokio::test]
    async fn transport_errors_never_carry_the_key() {
        let p = unreachable("SUPERSECRETKEY");
        let req = FetchRequest {
            symbol: "AAPL".into(),
            from: chrono::NaiveDate::from_ymd_opt(2026, 1, 2).unwrap(),
            to: chrono::NaiveDate::from_ymd_opt(2026, 1, 5).unwrap(),
        };
        let err = p.fetch(&req).await.unwrap_err();
        assert!(matches!(err, ProviderError::Transport { .. }), "{err}");
        assert!(!err.to_string().contains("SUPERSECRETKEY"), "{err}");
        assert!(!format!("{err:?}").contains("SUPERSECRETKEY"));

        let probe = p.probe().await;
        let message = probe.error.expect("probe against a closed port fails");
        assert!(!message.contains("SUPERSECRETKEY"), "{message}");
    }

    #[test]
    fn redact_masks_every_occurrence() {
        assert_eq!(
            redact("url?api_token=abc123&x=abc123", Some("abc123")),
            "url?api_token=***&x=***"
        );
        assert_eq!(redact("plain", None), "plain");
    }
}

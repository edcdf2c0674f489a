//! Shared fixtures for the runner integration tests: a throwaway repository
//! on disk and a scripted bar provider.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::NaiveDate;
use overnight_core::calendar::TradingCalendar;
use overnight_core::data::{BarHistoryStore, BarProvider, FetchRequest, ProbeOutcome, ProviderError, RawBar};
use overnight_core::domain::Bar;
use overnight_runner::{OvernightConfig, RunOptions, RunPaths, StatusDocument};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::Notify;

pub const HEAD_SHA: &str = "0123456789abcdef0123456789abcdef01234567";
pub const POLICY: &str = r#"{"min_history_bars": 20, "lookback_bars": 30, "vol_window": 5}"#;

pub fn d(s: &str) -> NaiveDate {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
}

/// Friday; the expected last trading day is the same date.
pub fn as_of() -> NaiveDate {
    d("2026-10-16")
}

/// A repository root with a fake checkout, a universe and a policy.
pub fn fake_repo(symbols: &[&str]) -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    let git = dir.path().join(".git");
    std::fs::create_dir_all(&git).unwrap();
    std::fs::write(git.join("HEAD"), format!("{HEAD_SHA}\n")).unwrap();

    let data = dir.path().join("data");
    std::fs::create_dir_all(&data).unwrap();
    let universe: Vec<_> = symbols
        .iter()
        .map(|s| serde_json::json!({ "ticker": s }))
        .collect();
    std::fs::write(data.join("universe.json"), serde_json::to_vec(&universe).unwrap()).unwrap();
    std::fs::write(data.join("policy.json"), POLICY).unwrap();
    dir
}

/// Config tuned for tests: no disk floors, a fast limiter, no external steps.
pub fn test_config() -> OvernightConfig {
    let mut config = OvernightConfig::default();
    config.preflight.min_free_bytes = 0;
    config.preflight.min_free_inodes = 0;
    config.limiter.max_inflight = 4;
    config.limiter.rate_per_sec = 1000.0;
    config.limiter.bucket_size = 100.0;
    config.bars.workers = 3;
    config.bars.full_history_start = d("2026-06-01");
    config.retry.backoff_unit_ms = 1;
    config.forecast.forecast_cmd = Vec::new();
    config.forecast.schema_cmd = Vec::new();
    config.forecast.registry_cmd = Vec::new();
    config.forecast.determinism_cmd = Vec::new();
    config.forecast.ui_smoke_cmd = Vec::new();
    config
}

pub fn options(phases: &str, tickers: Option<&str>) -> RunOptions {
    let mut options = RunOptions {
        as_of: Some(as_of()),
        ..RunOptions::default()
    };
    if !phases.is_empty() {
        options.phases = phases.split(',').map(|p| p.parse().unwrap()).collect();
    }
    options.tickers = tickers.map(|t| t.split(',').map(String::from).collect());
    options
}

pub fn paths(repo: &Path, config: &OvernightConfig) -> RunPaths {
    RunPaths::resolve(repo, &config.paths)
}

/// One bar per trading day in `from..=to`, closes drifting upward.
pub fn trading_bars(from: NaiveDate, to: NaiveDate) -> Vec<Bar> {
    let calendar = TradingCalendar::us_equities();
    from.iter_days()
        .take_while(|day| *day <= to)
        .filter(|day| calendar.is_trading_day(*day))
        .enumerate()
        .map(|(i, date)| {
            let close = 100.0 + i as f64 * 0.5 + if i % 3 == 0 { 1.0 } else { 0.0 };
            Bar {
                date,
                open: Some(close - 0.2),
                high: Some(close + 0.5),
                low: Some(close - 0.5),
                close,
                volume: Some(1_000_000),
            }
        })
        .collect()
}

pub fn seed_history(repo: &Path, config: &OvernightConfig, symbol: &str, from: &str, to: &str) {
    let store = BarHistoryStore::new(paths(repo, config).bars_dir);
    store.write(symbol, &trading_bars(d(from), d(to))).unwrap();
}

pub fn read_status(paths: &RunPaths) -> StatusDocument {
    serde_json::from_str(&std::fs::read_to_string(&paths.status).unwrap()).unwrap()
}

pub fn read_events(paths: &RunPaths) -> Vec<serde_json::Value> {
    std::fs::read_to_string(&paths.events)
        .unwrap()
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect()
}

/// Provider that serves one bar per trading day of the requested window,
/// except for symbols told to fail.
pub struct ScriptedProvider {
    calls: Mutex<Vec<FetchRequest>>,
    failing: HashMap<String, u16>,
    flaky: Mutex<HashMap<String, u32>>,
    throttled: Mutex<HashMap<String, (u32, Duration)>>,
    probe_status: u16,
    hang: bool,
    pub fetch_started: Notify,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            failing: HashMap::new(),
            flaky: Mutex::new(HashMap::new()),
            throttled: Mutex::new(HashMap::new()),
            probe_status: 200,
            hang: false,
            fetch_started: Notify::new(),
        }
    }

    /// Fetches for these symbols answer HTTP 404.
    pub fn failing(self, symbols: &[&str]) -> Self {
        self.failing_with(symbols, 404)
    }

    /// Fetches for these symbols answer `status`.
    pub fn failing_with(mut self, symbols: &[&str], status: u16) -> Self {
        self.failing
            .extend(symbols.iter().map(|s| (s.to_string(), status)));
        self
    }

    /// The first `times` fetches for `symbol` answer HTTP 503.
    pub fn flaky(self, symbol: &str, times: u32) -> Self {
        self.flaky.lock().unwrap().insert(symbol.to_string(), times);
        self
    }

    /// The first `times` fetches for `symbol` answer HTTP 429 with a
    /// `retry-after` of `wait`.
    pub fn throttled(self, symbol: &str, times: u32, wait: Duration) -> Self {
        self.throttled
            .lock()
            .unwrap()
            .insert(symbol.to_string(), (times, wait));
        self
    }

    pub fn probe_status(mut self, status: u16) -> Self {
        self.probe_status = status;
        self
    }

    /// Every fetch blocks forever.
    pub fn hanging(mut self) -> Self {
        self.hang = true;
        self
    }

    pub fn calls(&self) -> Vec<FetchRequest> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl BarProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    fn has_credential(&self) -> bool {
        true
    }

    async fn probe(&self) -> ProbeOutcome {
        ProbeOutcome {
            status: Some(self.probe_status),
            ..ProbeOutcome::default()
        }
    }

    async fn fetch(&self, request: &FetchRequest) -> Result<Vec<RawBar>, ProviderError> {
        self.calls.lock().unwrap().push(request.clone());
        self.fetch_started.notify_one();
        if self.hang {
            std::future::pending::<()>().await;
        }
        if let Some(&status) = self.failing.get(&request.symbol) {
            return Err(ProviderError::Http {
                status,
                retry_after: None,
            });
        }
        if let Some((left, wait)) = self.throttled.lock().unwrap().get_mut(&request.symbol) {
            if *left > 0 {
                *left -= 1;
                return Err(ProviderError::Http {
                    status: 429,
                    retry_after: Some(*wait),
                });
            }
        }
        if let Some(left) = self.flaky.lock().unwrap().get_mut(&request.symbol) {
            if *left > 0 {
                *left -= 1;
                return Err(ProviderError::Http {
                    status: 503,
                    retry_after: None,
                });
            }
        }
        Ok(trading_bars(request.from, request.to)
            .into_iter()
            .map(|b| RawBar {
                date: Some(b.date.to_string()),
                open: b.open,
                high: b.high,
                low: b.low,
                close: Some(b.close),
                volume: b.volume.map(|v| v as f64),
            })
            .collect())
    }
}

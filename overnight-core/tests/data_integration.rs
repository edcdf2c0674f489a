//! Integration tests across the history store, statistics and artifact store.
//!
//! Tests:
//! 1. Incremental merge into an existing history is persisted and re-read
//! 2. Training from stored history produces an artifact tied to its last bar date
//! 3. Raw provider payloads normalize into usable history

use chrono::{Duration, NaiveDate, Utc};
use overnight_core::artifact::{ArtifactStore, TickerArtifact};
use overnight_core::data::{normalize_bars, BarHistoryStore, HistoryState, RawBar};
use overnight_core::domain::{merge_bars, Bar};
use overnight_core::policy::PolicyDocument;
use overnight_core::stats::TickerStats;

// ──────────────────────────────────────────────
// Helpers
// ──────────────────────────────────────────────

fn bars_from(start: NaiveDate, n: usize) -> Vec<Bar> {
    (0..n)
        .map(|i| Bar {
            date: start + Duration::days(i as i64),
            open: Some(100.0),
            high: Some(101.0),
            low: Some(99.0),
            close: 100.0 + i as f64 * 0.25,
            volume: Some(1_000),
        })
        .collect()
}

fn d(s: &str) -> NaiveDate {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
}

// ──────────────────────────────────────────────
// Tests
// ──────────────────────────────────────────────

#[test]
fn incremental_merge_extends_history() {
    let dir = tempfile::tempdir().unwrap();
    let store = BarHistoryStore::new(dir.path().join("bars"));

    store.write("AAPL", &bars_from(d("2026-01-01"), 10)).unwrap();
    let existing = store.load("AAPL").unwrap();
    let incoming = bars_from(d("2026-01-09"), 5);
    store.write("AAPL", &merge_bars(&existing, &incoming)).unwrap();

    match store.state("AAPL") {
        HistoryState::Present {
            first_date,
            last_date,
            bar_count,
        } => {
            assert_eq!(first_date, d("2026-01-01"));
            assert_eq!(last_date, d("2026-01-13"));
            assert_eq!(bar_count, 13);
        }
        HistoryState::Missing => panic!("expected history"),
    }
}

#[test]
fn artifact_records_training_inputs() {
    let dir = tempfile::tempdir().unwrap();
    let history = BarHistoryStore::new(dir.path().join("bars"));
    let artifacts = ArtifactStore::new(dir.path().join("artifacts"));
    let policy = PolicyDocument::from_bytes(br#"{"min_history_bars": 10, "lookback_bars": 20}"#)
        .unwrap();

    history.write("MSFT", &bars_from(d("2026-01-01"), 40)).unwrap();
    let bars = history.load("MSFT").unwrap();
    let stats = TickerStats::compute(&bars, &policy.policy).unwrap();
    let artifact = TickerArtifact::new("MSFT", policy.hash.clone(), stats, Utc::now());
    artifacts.write_ticker(&artifact).unwrap();

    let loaded = artifacts.load_ticker("MSFT").unwrap();
    assert_eq!(loaded.policy_hash, policy.hash);
    assert_eq!(loaded.bars_last_date, d("2026-02-09"));
    assert_eq!(loaded.stats.window_bars, 21);
    assert!(loaded.stats.drift > 0.0);
}

#[test]
fn raw_payload_normalizes() {
    let raw: Vec<RawBar> = serde_json::from_str(
        r#"[
            {"date": "2026-10-15", "open": 1, "high": 2, "low": 0.5, "close": 1.5, "volume": 100},
            {"date": "2026-10-14", "close": 1.2},
            {"date": "garbage", "close": 1.0},
            {"date": "2026-10-16", "close": null}
        ]"#,
    )
    .unwrap();

    let bars = normalize_bars(raw);
    let dates: Vec<NaiveDate> = bars.iter().map(|b| b.date).collect();
    assert_eq!(dates, vec![d("2026-10-14"), d("2026-10-15")]);
}

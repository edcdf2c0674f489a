//! Checkpoints and the skip-vs-redo rules built on them.
//!
//! Three shapes, one per phase class:
//! - bars: what was last written for a symbol, keyed by freshness of the data
//! - per-symbol training: valid only under the current policy hash and for the
//!   history the artifact was trained on
//! - global training: valid only for the exact input digest it was built from
//!
//! Each successful unit of work overwrites its own checkpoint atomically.

use chrono::{DateTime, NaiveDate, Utc};
use overnight_core::artifact::ArtifactStore;
use overnight_core::atomic::atomic_write_json;
use overnight_core::calendar::TradingCalendar;
use overnight_core::data::HistoryState;
use overnight_core::domain::{InputDigest, PolicyHash};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

// ── Freshness ────────────────────────────────────────────────────────

/// Local history relative to the expected last trading day.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    Missing,
    Stale {
        last_date: NaiveDate,
        /// Trading days between the last local bar and the expected day.
        behind: usize,
    },
    Fresh {
        last_date: NaiveDate,
    },
}

impl Freshness {
    /// Queue priority: lower runs first.
    pub fn priority(&self) -> u8 {
        match self {
            Freshness::Missing => 0,
            Freshness::Stale { .. } => 1,
            Freshness::Fresh { .. } => 2,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Freshness::Missing => "MISSING",
            Freshness::Stale { .. } => "STALE",
            Freshness::Fresh { .. } => "FRESH",
        }
    }
}

pub fn classify_freshness(
    state: &HistoryState,
    expected: NaiveDate,
    calendar: &TradingCalendar,
) -> Freshness {
    match state.last_date() {
        None => Freshness::Missing,
        Some(last_date) if last_date >= expected => Freshness::Fresh { last_date },
        Some(last_date) => Freshness::Stale {
            last_date,
            behind: calendar.trading_days_between(last_date, expected),
        },
    }
}

// ── Checkpoint shapes ────────────────────────────────────────────────

/// How a symbol's bars were fetched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BarsMode {
    /// Whole history from the configured start date.
    Full,
    /// Only the days after the last local bar.
    Incremental,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BarsCheckpoint {
    pub symbol: String,
    pub mode: BarsMode,
    pub last_date: NaiveDate,
    /// Successful writes for this symbol across runs.
    pub attempts: u32,
    pub written_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainCheckpoint {
    pub symbol: String,
    pub policy_hash: PolicyHash,
    pub artifact_path: String,
    pub bars_last_date: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalCheckpoint {
    pub policy_hash: PolicyHash,
    pub input_digest: InputDigest,
    pub artifact_path: String,
}

// ── Validity ─────────────────────────────────────────────────────────

/// Why a checkpoint could not be reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedoReason {
    ResumeDisabled,
    Forced,
    NoCheckpoint,
    PolicyChanged,
    ArtifactMissing,
    ArtifactPolicyMismatch,
    HistoryAdvanced,
    InputsChanged,
}

impl RedoReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RedoReason::ResumeDisabled => "resume_disabled",
            RedoReason::Forced => "forced",
            RedoReason::NoCheckpoint => "no_checkpoint",
            RedoReason::PolicyChanged => "policy_changed",
            RedoReason::ArtifactMissing => "artifact_missing",
            RedoReason::ArtifactPolicyMismatch => "artifact_policy_mismatch",
            RedoReason::HistoryAdvanced => "history_advanced",
            RedoReason::InputsChanged => "inputs_changed",
        }
    }
}

impl fmt::Display for RedoReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The run-wide switches that gate every reuse decision.
#[derive(Debug, Clone, Copy)]
pub struct ReuseMode {
    pub resume: bool,
    pub force: bool,
}

impl ReuseMode {
    fn check(&self) -> Result<(), RedoReason> {
        if self.force {
            Err(RedoReason::Forced)
        } else if !self.resume {
            Err(RedoReason::ResumeDisabled)
        } else {
            Ok(())
        }
    }
}

/// A per-symbol training checkpoint is reusable only if it was produced under
/// `policy_hash`, its artifact still exists and embeds the same hash, and it
/// was trained on history ending at `current_last_date`.
pub fn train_checkpoint_reusable(
    checkpoint: Option<&TrainCheckpoint>,
    mode: ReuseMode,
    policy_hash: &PolicyHash,
    current_last_date: NaiveDate,
    artifacts: &ArtifactStore,
) -> Result<(), RedoReason> {
    mode.check()?;
    let cp = checkpoint.ok_or(RedoReason::NoCheckpoint)?;
    if &cp.policy_hash != policy_hash {
        return Err(RedoReason::PolicyChanged);
    }
    let artifact = artifacts
        .load_ticker(&cp.symbol)
        .map_err(|_| RedoReason::ArtifactMissing)?;
    if &artifact.policy_hash != policy_hash {
        return Err(RedoReason::ArtifactPolicyMismatch);
    }
    if cp.bars_last_date != current_last_date || artifact.bars_last_date != current_last_date {
        return Err(RedoReason::HistoryAdvanced);
    }
    Ok(())
}

/// The global checkpoint is reusable only for the exact digest it stored.
pub fn global_checkpoint_reusable(
    checkpoint: Option<&GlobalCheckpoint>,
    mode: ReuseMode,
    policy_hash: &PolicyHash,
    digest: &InputDigest,
    artifacts: &ArtifactStore,
) -> Result<(), RedoReason> {
    mode.check()?;
    let cp = checkpoint.ok_or(RedoReason::NoCheckpoint)?;
    if &cp.policy_hash != policy_hash {
        return Err(RedoReason::PolicyChanged);
    }
    if &cp.input_digest != digest {
        return Err(RedoReason::InputsChanged);
    }
    let artifact = artifacts
        .load_global()
        .map_err(|_| RedoReason::ArtifactMissing)?;
    if &artifact.input_digest != digest {
        return Err(RedoReason::InputsChanged);
    }
    Ok(())
}

// ── Store ────────────────────────────────────────────────────────────

/// Checkpoint files under the ops directory.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    bars_dir: PathBuf,
    train_dir: PathBuf,
    global_path: PathBuf,
}

impl CheckpointStore {
    pub fn new(bars_dir: PathBuf, train_dir: PathBuf, global_path: PathBuf) -> Self {
        Self {
            bars_dir,
            train_dir,
            global_path,
        }
    }

    pub fn bars_path(&self, symbol: &str) -> PathBuf {
        self.bars_dir.join(format!("{symbol}.json"))
    }

    pub fn train_path(&self, symbol: &str) -> PathBuf {
        self.train_dir.join(format!("{symbol}.json"))
    }

    pub fn global_path(&self) -> &Path {
        &self.global_path
    }

    pub fn load_bars(&self, symbol: &str) -> Option<BarsCheckpoint> {
        read_optional(&self.bars_path(symbol))
    }

    pub fn write_bars(&self, cp: &BarsCheckpoint) -> io::Result<()> {
        atomic_write_json(&self.bars_path(&cp.symbol), cp)
    }

    pub fn load_train(&self, symbol: &str) -> Option<TrainCheckpoint> {
        read_optional(&self.train_path(symbol))
    }

    pub fn write_train(&self, cp: &TrainCheckpoint) -> io::Result<()> {
        atomic_write_json(&self.train_path(&cp.symbol), cp)
    }

    pub fn load_global(&self) -> Option<GlobalCheckpoint> {
        read_optional(&self.global_path)
    }

    pub fn write_global(&self, cp: &GlobalCheckpoint) -> io::Result<()> {
        atomic_write_json(&self.global_path, cp)
    }
}

/// Missing and unreadable checkpoints both read as absent.
fn read_optional<T: DeserializeOwned>(path: &Path) -> Option<T> {
    let content = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return None,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "unreadable checkpoint");
            return None;
        }
    };
    match serde_json::from_str(&content) {
        Ok(v) => Some(v),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "corrupt checkpoint ignored");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use overnight_core::artifact::TickerArtifact;
    use overnight_core::domain::Bar;
    use overnight_core::policy::TrainingPolicy;
    use overnight_core::stats::TickerStats;

    fn d(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn present(last: &str) -> HistoryState {
        HistoryState::Present {
            first_date: d("2020-01-02"),
            last_date: d(last),
            bar_count: 100,
        }
    }

    #[test]
    fn freshness_against_expected_day() {
        let cal = TradingCalendar::us_equities();
        let expected = d("2026-10-16");
        assert_eq!(classify_freshness(&HistoryState::Missing, expected, &cal), Freshness::Missing);
        assert_eq!(
            classify_freshness(&present("2026-10-16"), expected, &cal),
            Freshness::Fresh { last_date: d("2026-10-16") }
        );
        assert_eq!(
            classify_freshness(&present("2026-10-13"), expected, &cal),
            Freshness::Stale {
                last_date: d("2026-10-13"),
                behind: 3
            }
        );
    }

    fn store_with_artifact(policy: &PolicyHash, last: NaiveDate) -> (tempfile::TempDir, ArtifactStore) {
        let dir = tempfile::tempdir().unwrap();
        let artifacts = ArtifactStore::new(dir.path().join("artifacts"));
        let bars: Vec<Bar> = (0..3)
            .map(|i| Bar {
                date: last - chrono::Duration::days(2 - i),
                open: None,
                high: None,
                low: None,
                close: 10.0 + i as f64,
                volume: None,
            })
            .collect();
        let stats = TickerStats::compute(&bars, &TrainingPolicy::default()).unwrap();
        artifacts
            .write_ticker(&TickerArtifact::new("AAPL", policy.clone(), stats, Utc::now()))
            .unwrap();
        (dir, artifacts)
    }

    #[test]
    fn train_checkpoint_rules() {
        let h = PolicyHash::of_bytes(b"{}");
        let last = d("2026-10-16");
        let (_dir, artifacts) = store_with_artifact(&h, last);
        let cp = TrainCheckpoint {
            symbol: "AAPL".into(),
            policy_hash: h.clone(),
            artifact_path: "x".into(),
            bars_last_date: last,
        };
        let on = ReuseMode {
            resume: true,
            force: false,
        };

        assert_eq!(train_checkpoint_reusable(Some(&cp), on, &h, last, &artifacts), Ok(()));
        assert_eq!(
            train_checkpoint_reusable(Some(&cp), on, &PolicyHash::of_bytes(b"{ }"), last, &artifacts),
            Err(RedoReason::PolicyChanged)
        );
        assert_eq!(
            train_checkpoint_reusable(Some(&cp), on, &h, d("2026-10-19"), &artifacts),
            Err(RedoReason::HistoryAdvanced)
        );
        assert_eq!(
            train_checkpoint_reusable(None, on, &h, last, &artifacts),
            Err(RedoReason::NoCheckpoint)
        );
        assert_eq!(
            train_checkpoint_reusable(Some(&cp), ReuseMode { resume: true, force: true }, &h, last, &artifacts),
            Err(RedoReason::Forced)
        );
        assert_eq!(
            train_checkpoint_reusable(Some(&cp), ReuseMode { resume: false, force: false }, &h, last, &artifacts),
            Err(RedoReason::ResumeDisabled)
        );

        fs::remove_file(artifacts.ticker_path("AAPL")).unwrap();
        assert_eq!(
            train_checkpoint_reusable(Some(&cp), on, &h, last, &artifacts),
            Err(RedoReason::ArtifactMissing)
        );
    }

    #[test]
    fn store_roundtrip_and_corrupt_reads_absent() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(
            dir.path().join("bars"),
            dir.path().join("train"),
            dir.path().join("global.json"),
        );
        let cp = BarsCheckpoint {
            symbol: "MSFT".into(),
            mode: BarsMode::Incremental,
            last_date: d("2026-10-16"),
            attempts: 2,
            written_at: Utc::now(),
        };
        store.write_bars(&cp).unwrap();
        assert_eq!(store.load_bars("MSFT"), Some(cp));

        fs::write(store.bars_path("BAD"), "nope").unwrap();
        assert_eq!(store.load_bars("BAD"), None);
        assert_eq!(store.load_global(), None);
    }
}

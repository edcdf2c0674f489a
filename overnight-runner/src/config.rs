//! Run configuration: the TOML config file plus per-invocation options.
//!
//! Every field has a default, so an absent `overnight.toml` is a valid
//! configuration. CLI flags are applied on top through [`LimiterOverrides`].
//!
//! ```toml
//! [limiter]
//! max_inflight = 3
//! rate_per_sec = 2.0
//! bucket_size = 5
//!
//! [bars]
//! workers = 3
//!
//! [forecast]
//! ui_smoke_cmd = ["npm", "run", "test:forecast-ui"]
//! ```

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Name of the config file looked up at the repository root.
pub const DEFAULT_CONFIG_FILE: &str = "overnight.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read '{path}': {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("could not parse '{path}': {message}")]
    Parse { path: String, message: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

// ── Config file ──────────────────────────────────────────────────────

/// Top-level configuration, one section per concern.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OvernightConfig {
    pub paths: PathsConfig,
    pub limiter: LimiterConfig,
    pub retry: RetryConfig,
    pub preflight: PreflightConfig,
    pub bars: BarsConfig,
    pub training: TrainingConfig,
    pub forecast: ForecastConfig,
    pub calendar: CalendarConfig,
    pub status: StatusConfig,
}

/// `[paths]`: data and ops locations, relative to the repository root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub universe: PathBuf,
    pub policy: PathBuf,
    pub bars_dir: PathBuf,
    pub artifacts_dir: PathBuf,
    pub ops_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            universe: "data/universe.json".into(),
            policy: "data/policy.json".into(),
            bars_dir: "data/bars".into(),
            artifacts_dir: "data/artifacts".into(),
            ops_dir: "ops".into(),
        }
    }
}

/// `[limiter]`: upstream request budget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimiterConfig {
    pub max_inflight: usize,
    pub rate_per_sec: f64,
    pub bucket_size: f64,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            max_inflight: 3,
            rate_per_sec: 2.0,
            bucket_size: 5.0,
        }
    }
}

/// `[retry]`: per-request retry budget and backoff caps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    /// Length of one backoff unit; exponential backoff is `2^attempt` units.
    pub backoff_unit_ms: u64,
    /// Exponential backoff cap, in units.
    pub backoff_cap_units: u64,
    pub retry_after_cap_secs: u64,
    /// AUTH failures across a phase that abort the run.
    pub auth_failure_limit: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_unit_ms: 1_000,
            backoff_cap_units: 60,
            retry_after_cap_secs: 120,
            auth_failure_limit: 2,
        }
    }
}

/// `[preflight]`: environment gates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreflightConfig {
    /// Environment variable holding the provider API key.
    pub api_key_env: String,
    pub min_free_bytes: u64,
    pub min_free_inodes: u64,
    /// Oldest orchestrator version allowed to run against this repository.
    pub min_version: String,
    /// When set, the repository root must resolve to this path.
    pub expected_repo_root: Option<PathBuf>,
    pub git_status_timeout_secs: u64,
}

impl Default for PreflightConfig {
    fn default() -> Self {
        Self {
            api_key_env: "EODHD_API_KEY".into(),
            min_free_bytes: 5 * 1024 * 1024 * 1024,
            min_free_inodes: 100_000,
            min_version: "0.1.0".into(),
            expected_repo_root: None,
            git_status_timeout_secs: 10,
        }
    }
}

/// `[bars]`: backfill worker pool and abort thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BarsConfig {
    pub workers: usize,
    /// First date requested for a symbol with no local history.
    pub full_history_start: NaiveDate,
    pub max_failure_rate: f64,
    /// Failures required before the rate is checked mid-phase.
    pub min_failure_sample: usize,
}

impl Default for BarsConfig {
    fn default() -> Self {
        Self {
            workers: 3,
            full_history_start: NaiveDate::from_ymd_opt(1996, 1, 1).unwrap_or_default(),
            max_failure_rate: 0.2,
            min_failure_sample: 10,
        }
    }
}

/// `[training]`: hard timeouts for the compute steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    pub ticker_timeout_secs: u64,
    pub global_timeout_secs: u64,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            ticker_timeout_secs: 30,
            global_timeout_secs: 120,
        }
    }
}

/// `[forecast]`: downstream commands, as argv vectors run from the repo root.
///
/// An empty vector skips that step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ForecastConfig {
    pub forecast_cmd: Vec<String>,
    pub schema_cmd: Vec<String>,
    pub registry_cmd: Vec<String>,
    pub determinism_cmd: Vec<String>,
    pub ui_smoke_cmd: Vec<String>,
    pub forecast_timeout_secs: u64,
    pub validation_timeout_secs: u64,
    pub ui_timeout_secs: u64,
    pub ui_attempts: u32,
    pub ui_retry_delay_secs: u64,
}

impl Default for ForecastConfig {
    fn default() -> Self {
        Self {
            forecast_cmd: vec!["bin/forecast-daily".into()],
            schema_cmd: vec!["bin/validate-schemas".into()],
            registry_cmd: vec!["bin/validate-registry".into()],
            determinism_cmd: vec!["bin/check-determinism".into()],
            ui_smoke_cmd: vec!["bin/ui-smoke".into()],
            forecast_timeout_secs: 300,
            validation_timeout_secs: 60,
            ui_timeout_secs: 120,
            ui_attempts: 3,
            ui_retry_delay_secs: 5,
        }
    }
}

/// `[calendar]`: market-local date and extra closures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalendarConfig {
    pub utc_offset_hours: i32,
    pub extra_holidays: Vec<NaiveDate>,
}

impl Default for CalendarConfig {
    fn default() -> Self {
        Self {
            utc_offset_hours: -5,
            extra_holidays: Vec::new(),
        }
    }
}

/// `[status]`: heartbeat and progress cadence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatusConfig {
    pub heartbeat_secs: u64,
    /// Persist progress every N completed symbols.
    pub progress_every: usize,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            heartbeat_secs: 300,
            progress_every: 50,
        }
    }
}

/// Limiter/worker values given on the command line.
#[derive(Debug, Clone, Default)]
pub struct LimiterOverrides {
    pub max_inflight: Option<usize>,
    pub rate_per_sec: Option<f64>,
    pub bucket_size: Option<f64>,
    pub workers: Option<usize>,
}

impl OvernightConfig {
    pub fn from_toml_str(content: &str, origin: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(|e| ConfigError::Parse {
            path: origin.to_string(),
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            source: e,
        })?;
        Self::from_toml_str(&content, &path.display().to_string())
    }

    /// Load the config for a repository.
    ///
    /// An explicit path must exist. Otherwise `<repo_root>/overnight.toml` is
    /// used when present, and defaults when not.
    pub fn load_for_repo(repo_root: &Path, explicit: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = explicit {
            return Self::from_file(path);
        }
        let default_path = repo_root.join(DEFAULT_CONFIG_FILE);
        if default_path.is_file() {
            Self::from_file(&default_path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn apply_overrides(&mut self, overrides: &LimiterOverrides) -> Result<(), ConfigError> {
        if let Some(v) = overrides.max_inflight {
            self.limiter.max_inflight = v;
        }
        if let Some(v) = overrides.rate_per_sec {
            self.limiter.rate_per_sec = v;
        }
        if let Some(v) = overrides.bucket_size {
            self.limiter.bucket_size = v;
        }
        if let Some(v) = overrides.workers {
            self.bars.workers = v;
        }
        self.validate()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let l = &self.limiter;
        if l.max_inflight == 0 {
            return Err(ConfigError::Invalid("limiter.max_inflight must be at least 1".into()));
        }
        if !(l.rate_per_sec.is_finite() && l.rate_per_sec > 0.0) {
            return Err(ConfigError::Invalid("limiter.rate_per_sec must be positive".into()));
        }
        if !(l.bucket_size.is_finite() && l.bucket_size >= 1.0) {
            return Err(ConfigError::Invalid("limiter.bucket_size must be at least 1".into()));
        }
        if self.bars.workers == 0 {
            return Err(ConfigError::Invalid("bars.workers must be at least 1".into()));
        }
        if !(0.0..=1.0).contains(&self.bars.max_failure_rate) {
            return Err(ConfigError::Invalid("bars.max_failure_rate must be within 0..=1".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid("retry.max_attempts must be at least 1".into()));
        }
        if self.status.heartbeat_secs == 0 {
            return Err(ConfigError::Invalid("status.heartbeat_secs must be positive".into()));
        }
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.status.heartbeat_secs)
    }
}

// ── Resolved paths ───────────────────────────────────────────────────

/// Every file the run reads or writes, resolved against the repository root.
#[derive(Debug, Clone)]
pub struct RunPaths {
    pub repo_root: PathBuf,
    pub universe: PathBuf,
    pub policy: PathBuf,
    pub bars_dir: PathBuf,
    pub artifacts_dir: PathBuf,
    pub ops_dir: PathBuf,
    pub lock: PathBuf,
    pub status: PathBuf,
    pub events: PathBuf,
    pub summary_md: PathBuf,
    pub summary_json: PathBuf,
    pub evidence: PathBuf,
    pub checkpoints_bars: PathBuf,
    pub checkpoints_train: PathBuf,
    pub checkpoint_global: PathBuf,
    pub logs_dir: PathBuf,
}

impl RunPaths {
    pub fn resolve(repo_root: &Path, paths: &PathsConfig) -> Self {
        let abs = |p: &Path| {
            if p.is_absolute() {
                p.to_path_buf()
            } else {
                repo_root.join(p)
            }
        };
        let ops = abs(&paths.ops_dir);
        let checkpoints = ops.join("checkpoints");
        Self {
            repo_root: repo_root.to_path_buf(),
            universe: abs(&paths.universe),
            policy: abs(&paths.policy),
            bars_dir: abs(&paths.bars_dir),
            artifacts_dir: abs(&paths.artifacts_dir),
            lock: ops.join("overnight.lock"),
            status: ops.join("overnight_status.json"),
            events: ops.join("overnight_events.ndjson"),
            summary_md: ops.join("overnight_summary.md"),
            summary_json: ops.join("overnight_summary.json"),
            evidence: ops.join("preflight_evidence.json"),
            checkpoints_bars: checkpoints.join("bars"),
            checkpoints_train: checkpoints.join("train"),
            checkpoint_global: checkpoints.join("global.json"),
            logs_dir: ops.join("logs"),
            ops_dir: ops,
        }
    }

    pub fn log_file(&self, run_id: &str) -> PathBuf {
        self.logs_dir.join(format!("overnight-{run_id}.log"))
    }
}

// ── Per-invocation options ───────────────────────────────────────────

/// The four phases, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PhaseKind {
    Bars,
    TrainTicker,
    TrainGlobal,
    Forecast,
}

impl PhaseKind {
    pub const ALL: [PhaseKind; 4] = [
        PhaseKind::Bars,
        PhaseKind::TrainTicker,
        PhaseKind::TrainGlobal,
        PhaseKind::Forecast,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PhaseKind::Bars => "BARS",
            PhaseKind::TrainTicker => "TRAIN_TICKER",
            PhaseKind::TrainGlobal => "TRAIN_GLOBAL",
            PhaseKind::Forecast => "FORECAST",
        }
    }
}

impl fmt::Display for PhaseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PhaseKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "BARS" => Ok(PhaseKind::Bars),
            "TRAIN_TICKER" => Ok(PhaseKind::TrainTicker),
            "TRAIN_GLOBAL" => Ok(PhaseKind::TrainGlobal),
            "FORECAST" => Ok(PhaseKind::Forecast),
            other => Err(format!(
                "unknown phase '{other}' (expected BARS, TRAIN_TICKER, TRAIN_GLOBAL or FORECAST)"
            )),
        }
    }
}

/// Options for a single invocation.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub resume: bool,
    /// Disable every skip rule.
    pub force: bool,
    pub phases: BTreeSet<PhaseKind>,
    /// Restrict bars and per-symbol training to these symbols.
    pub tickers: Option<Vec<String>>,
    /// Market date to run as; defaults to today in market time.
    pub as_of: Option<NaiveDate>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            resume: true,
            force: false,
            phases: PhaseKind::ALL.into_iter().collect(),
            tickers: None,
            as_of: None,
        }
    }
}

impl RunOptions {
    pub fn runs(&self, phase: PhaseKind) -> bool {
        self.phases.contains(&phase)
    }

    pub fn phase_list(&self) -> Vec<&'static str> {
        self.phases.iter().map(|p| p.as_str()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_is_all_defaults() {
        let config = OvernightConfig::from_toml_str("", "inline").unwrap();
        assert_eq!(config, OvernightConfig::default());
        assert_eq!(config.bars.full_history_start.to_string(), "1996-01-01");
        assert_eq!(config.limiter.max_inflight, 3);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = OvernightConfig::from_toml_str(
            r#"
            [limiter]
            rate_per_sec = 1.0

            [forecast]
            ui_smoke_cmd = []

            [calendar]
            extra_holidays = ["2026-10-16"]
            "#,
            "inline",
        )
        .unwrap();
        assert_eq!(config.limiter.rate_per_sec, 1.0);
        assert_eq!(config.limiter.bucket_size, 5.0);
        assert!(config.forecast.ui_smoke_cmd.is_empty());
        assert_eq!(config.forecast.ui_attempts, 3);
        assert_eq!(config.calendar.extra_holidays.len(), 1);
    }

    #[test]
    fn rejects_zero_workers() {
        let err = OvernightConfig::from_toml_str("[bars]\nworkers = 0", "inline").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn rejects_bad_toml() {
        let err = OvernightConfig::from_toml_str("[limiter\n", "inline").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn overrides_apply_and_validate() {
        let mut config = OvernightConfig::default();
        config
            .apply_overrides(&LimiterOverrides {
                max_inflight: Some(1),
                workers: Some(8),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(config.limiter.max_inflight, 1);
        assert_eq!(config.bars.workers, 8);

        let bad = config.apply_overrides(&LimiterOverrides {
            rate_per_sec: Some(0.0),
            ..Default::default()
        });
        assert!(bad.is_err());
    }

    #[test]
    fn missing_default_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = OvernightConfig::load_for_repo(dir.path(), None).unwrap();
        assert_eq!(config.status.heartbeat_secs, 300);

        let missing = OvernightConfig::load_for_repo(dir.path(), Some(&dir.path().join("x.toml")));
        assert!(matches!(missing, Err(ConfigError::Read { .. })));
    }

    #[test]
    fn paths_resolve_under_repo() {
        let paths = RunPaths::resolve(Path::new("/repo"), &PathsConfig::default());
        assert_eq!(paths.lock, Path::new("/repo/ops/overnight.lock"));
        assert_eq!(paths.checkpoints_bars, Path::new("/repo/ops/checkpoints/bars"));
        assert_eq!(paths.log_file("ab12cd34"), Path::new("/repo/ops/logs/overnight-ab12cd34.log"));
    }

    #[test]
    fn phase_names_parse() {
        assert_eq!("train_ticker".parse::<PhaseKind>(), Ok(PhaseKind::TrainTicker));
        assert!("TRAIN".parse::<PhaseKind>().is_err());
        assert_eq!(RunOptions::default().phase_list(), vec!["BARS", "TRAIN_TICKER", "TRAIN_GLOBAL", "FORECAST"]);
    }
}

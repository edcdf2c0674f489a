//! Phase runners and the context they share.
//!
//! Phases run strictly in the order BARS → TRAIN_TICKER → TRAIN_GLOBAL →
//! FORECAST, each only when selected. A phase either completes (recording
//! per-unit failures as it goes) or returns a [`RunError`] that aborts the run.

pub mod bars;
pub mod forecast;
pub mod train_global;
pub mod train_ticker;

use crate::checkpoint::{CheckpointStore, ReuseMode};
use crate::classify::RetryPolicy;
use crate::config::{OvernightConfig, PhaseKind, RunOptions, RunPaths};
use crate::error::RunError;
use crate::external::CommandOutcome;
use crate::limiter::TokenBucket;
use crate::metrics::RequestMeter;
use crate::recorder::{Recorder, UiStatus};
use chrono::NaiveDate;
use overnight_core::artifact::ArtifactStore;
use overnight_core::calendar::TradingCalendar;
use overnight_core::data::{BarHistoryStore, BarProvider, CircuitBreaker};
use overnight_core::domain::InputDigest;
use overnight_core::policy::PolicyDocument;
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard};

// ── Reports ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize)]
pub struct BarsReport {
    pub queued: usize,
    pub done: usize,
    pub failed: usize,
    /// FRESH symbols not fetched.
    pub skipped: usize,
    pub failed_symbols: Vec<String>,
    /// Stopped before the queue drained.
    pub aborted: bool,
}

impl BarsReport {
    /// Symbols whose fetch finished, successfully or not.
    pub fn attempted(&self) -> usize {
        self.done + self.failed
    }

    pub fn failure_rate(&self) -> f64 {
        match self.attempted() {
            0 => 0.0,
            n => self.failed as f64 / n as f64,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TrainReport {
    pub trained: usize,
    /// Valid checkpoint found; nothing recomputed.
    pub reused: usize,
    /// Below the policy's minimum history.
    pub insufficient: usize,
    pub failed: usize,
    pub failed_symbols: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GlobalReport {
    Trained { digest: InputDigest, symbols: usize },
    Reused { digest: InputDigest },
    /// No per-symbol artifacts under the current policy.
    Skipped,
    Failed { error: String },
}

/// One external step as it ran.
#[derive(Debug, Clone, Serialize)]
pub struct StepRecord {
    pub label: String,
    pub command: String,
    pub ok: bool,
    pub outcome: String,
    pub attempts: u32,
}

impl StepRecord {
    pub fn new(label: &str, command: String, outcome: &CommandOutcome, attempts: u32) -> Self {
        Self {
            label: label.to_string(),
            command,
            ok: outcome.is_success(),
            outcome: outcome.describe(),
            attempts,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ForecastReport {
    pub steps: Vec<StepRecord>,
    pub ui_status: UiStatus,
}

impl Default for ForecastReport {
    fn default() -> Self {
        Self {
            steps: Vec::new(),
            ui_status: UiStatus::Unknown,
        }
    }
}

/// What each phase did. A phase that never started stays `None`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PhaseReports {
    pub bars: Option<BarsReport>,
    pub train: Option<TrainReport>,
    pub global: Option<GlobalReport>,
    pub forecast: Option<ForecastReport>,
}

// ── Context ──────────────────────────────────────────────────────────

/// Everything a phase needs, built once after the lock is held.
pub struct RunContext {
    pub run_id: String,
    pub config: OvernightConfig,
    pub paths: RunPaths,
    pub options: RunOptions,
    pub recorder: Recorder,
    pub provider: Arc<dyn BarProvider>,
    pub limiter: TokenBucket,
    pub meter: RequestMeter,
    pub breaker: CircuitBreaker,
    pub retry: RetryPolicy,
    pub calendar: TradingCalendar,
    /// Newest trading day whose bars should exist.
    pub expected_day: NaiveDate,
    /// Universe after the `--tickers` filter.
    pub symbols: Vec<String>,
    pub policy: PolicyDocument,
    pub history: BarHistoryStore,
    pub artifacts: ArtifactStore,
    pub checkpoints: CheckpointStore,
    reports: Mutex<PhaseReports>,
}

impl RunContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        run_id: &str,
        config: OvernightConfig,
        paths: RunPaths,
        options: RunOptions,
        recorder: Recorder,
        provider: Arc<dyn BarProvider>,
        calendar: TradingCalendar,
        expected_day: NaiveDate,
        symbols: Vec<String>,
        policy: PolicyDocument,
    ) -> Self {
        Self {
            run_id: run_id.to_string(),
            limiter: TokenBucket::new(&config.limiter),
            meter: RequestMeter::new(),
            breaker: CircuitBreaker::new(config.retry.auth_failure_limit),
            retry: RetryPolicy::from_config(&config.retry),
            calendar,
            expected_day,
            symbols,
            policy,
            history: BarHistoryStore::new(&paths.bars_dir),
            artifacts: ArtifactStore::new(&paths.artifacts_dir),
            checkpoints: CheckpointStore::new(
                paths.checkpoints_bars.clone(),
                paths.checkpoints_train.clone(),
                paths.checkpoint_global.clone(),
            ),
            reports: Mutex::new(PhaseReports::default()),
            config,
            paths,
            options,
            recorder,
            provider,
        }
    }

    pub fn reuse_mode(&self) -> ReuseMode {
        ReuseMode {
            resume: self.options.resume,
            force: self.options.force,
        }
    }

    fn lock_reports(&self) -> MutexGuard<'_, PhaseReports> {
        self.reports.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn with_reports<R>(&self, f: impl FnOnce(&mut PhaseReports) -> R) -> R {
        f(&mut self.lock_reports())
    }

    pub fn reports(&self) -> PhaseReports {
        self.lock_reports().clone()
    }

    /// Copy the in-memory phase counters and request stats into the status
    /// document in a single write.
    pub fn publish_progress(&self) {
        let stats = self.meter.snapshot();
        let reports = self.reports();
        self.recorder.update(|doc| {
            if let Some(bars) = &reports.bars {
                doc.progress.bars_done = bars.done;
                doc.progress.bars_failed = bars.failed;
                doc.progress.bars_skipped = bars.skipped;
            }
            if let Some(train) = &reports.train {
                doc.progress.train_done = train.trained;
                doc.progress.train_failed = train.failed;
                doc.progress.train_skipped = train.reused + train.insufficient;
            }
            doc.request_stats = stats;
        });
    }
}

/// Run every selected phase in order.
pub async fn run_selected(ctx: &Arc<RunContext>) -> Result<(), RunError> {
    for phase in PhaseKind::ALL {
        if !ctx.options.runs(phase) {
            tracing::debug!(phase = %phase, "phase not selected");
            continue;
        }
        tracing::info!(phase = %phase, "phase starting");
        match phase {
            PhaseKind::Bars => bars::run(ctx).await?,
            PhaseKind::TrainTicker => train_ticker::run(ctx).await?,
            PhaseKind::TrainGlobal => train_global::run(ctx).await,
            PhaseKind::Forecast => forecast::run(ctx).await?,
        }
        tracing::info!(phase = %phase, "phase finished");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bars_failure_rate_counts_finished_symbols() {
        let mut report = BarsReport::default();
        assert_eq!(report.failure_rate(), 0.0);
        report.done = 3;
        report.failed = 1;
        assert_eq!(report.attempted(), 4);
        assert!((report.failure_rate() - 0.25).abs() < 1e-12);
    }

    #[test]
    fn global_report_serializes_tagged() {
        let json = serde_json::to_value(GlobalReport::Reused {
            digest: InputDigest::from_hash("abc"),
        })
        .unwrap();
        assert_eq!(json["status"], "REUSED");
        assert_eq!(json["digest"], "abc");
    }
}

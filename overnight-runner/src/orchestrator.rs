//! Top-level run: preflight, lock, status, phases, finalizer.
//!
//! A termination signal is watched for the whole run. Before the lock is
//! held it simply ends the process path; afterwards it abandons in-flight
//! work and routes through the finalizer like any other exit.

use crate::config::{OvernightConfig, RunOptions, RunPaths};
use crate::error::{ErrorCode, RunError, TerminationSignal};
use crate::finalize::{finalize, RunOutcome, RunReport};
use crate::lock::{LockError, LockManager, LockRecord};
use crate::phases::{run_selected, RunContext};
use crate::preflight::run_preflight;
use crate::recorder::{Recorder, RecorderPaths, StatusDocument};
use chrono::Utc;
use overnight_core::calendar::{market_date, TradingCalendar};
use overnight_core::data::BarProvider;
use rand::Rng;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;

pub const WARN_STALE_LOCK: &str = "STALE_LOCK_REMOVED";
pub const WARN_UNKNOWN_TICKERS: &str = "UNKNOWN_TICKERS";

/// Fresh 8-hex-char run identifier.
pub fn new_run_id() -> String {
    format!("{:08x}", rand::thread_rng().gen::<u32>())
}

pub struct Orchestrator {
    run_id: String,
    config: OvernightConfig,
    options: RunOptions,
    paths: RunPaths,
    provider: Arc<dyn BarProvider>,
}

impl Orchestrator {
    pub fn new(
        config: OvernightConfig,
        options: RunOptions,
        repo_root: &Path,
        provider: Arc<dyn BarProvider>,
    ) -> Self {
        let paths = RunPaths::resolve(repo_root, &config.paths);
        Self {
            run_id: new_run_id(),
            config,
            options,
            paths,
            provider,
        }
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = run_id.into();
        self
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn paths(&self) -> &RunPaths {
        &self.paths
    }

    /// Run until done or until SIGINT / SIGTERM / SIGHUP.
    pub async fn run(self) -> RunReport {
        self.run_with_shutdown(termination_signal()).await
    }

    /// Run until done or until `shutdown` resolves.
    pub async fn run_with_shutdown<F>(self, shutdown: F) -> RunReport
    where
        F: Future<Output = TerminationSignal>,
    {
        tokio::pin!(shutdown);
        let Orchestrator {
            run_id,
            config,
            options,
            paths,
            provider,
        } = self;
        let started_at = Utc::now();
        tracing::info!(%run_id, repo = %paths.repo_root.display(), phases = ?options.phase_list(), "overnight run starting");

        let preflight = tokio::select! {
            result = run_preflight(&config, &paths, provider.as_ref(), &run_id) => result,
            signal = &mut shutdown => return early_signal(&run_id, signal),
        };
        let preflight = match preflight {
            Ok(p) => p,
            Err(error) => return early_failure(&run_id, error),
        };

        let record = LockRecord::for_current_process(&run_id, &preflight.head_sha, started_at);
        let acquired = match LockManager::new(&paths.lock).acquire(&record) {
            Ok(a) => a,
            Err(LockError::AlreadyRunning { owner }) => {
                let details = serde_json::to_value(&owner).unwrap_or_default();
                return early_failure(
                    &run_id,
                    RunError::new(
                        ErrorCode::AlreadyRunning,
                        format!("run {} (pid {}) holds the lock", owner.run_id, owner.pid),
                    )
                    .with_details(details),
                );
            }
            Err(e @ LockError::Unreadable { .. }) => {
                return early_failure(&run_id, RunError::new(ErrorCode::AlreadyRunning, e.to_string()))
            }
            Err(e @ LockError::Io { .. }) => {
                return early_failure(&run_id, RunError::new(ErrorCode::LockIo, e.to_string()))
            }
        };

        let mut doc = StatusDocument::new(&run_id, &preflight.head_sha, started_at);
        doc.resume = options.resume;
        doc.force = options.force;
        doc.phases = options.phase_list().iter().map(|p| p.to_string()).collect();
        doc.universe_count = preflight.universe.len();
        doc.warnings = preflight.warnings.clone();
        doc.rate_limit = preflight.probe.rate_limit_headers.clone();

        let recorder_paths = RecorderPaths {
            status: paths.status.clone(),
            events: paths.events.clone(),
        };
        let recorder = match Recorder::start(recorder_paths, doc) {
            Ok(r) => r,
            Err(e) => {
                acquired.guard.release();
                return early_failure(
                    &run_id,
                    RunError::new(ErrorCode::StatusWrite, format!("cannot write status: {e}")),
                );
            }
        };

        recorder.event(
            "RUN_START",
            serde_json::json!({
                "head_sha": preflight.head_sha,
                "pid": record.pid,
                "phases": options.phase_list(),
                "resume": options.resume,
                "force": options.force,
                "limiter": {
                    "max_inflight": config.limiter.max_inflight,
                    "rate_per_sec": config.limiter.rate_per_sec,
                    "bucket_size": config.limiter.bucket_size,
                    "workers": config.bars.workers,
                },
            }),
        );
        if let Some(previous) = &acquired.replaced_stale {
            recorder.add_warning(WARN_STALE_LOCK);
            recorder.event("LOCK_STALE_REMOVED", serde_json::json!({ "previous": previous }));
        }
        recorder.start_heartbeat(config.heartbeat_interval());

        let (symbols, unknown) = match &options.tickers {
            Some(wanted) => preflight.universe.select(wanted),
            None => (preflight.universe.symbols().to_vec(), Vec::new()),
        };
        if !unknown.is_empty() {
            tracing::warn!(?unknown, "tickers not in the universe are ignored");
            recorder.add_warning(WARN_UNKNOWN_TICKERS);
            recorder.event("UNKNOWN_TICKERS", serde_json::json!({ "tickers": unknown }));
        }

        let calendar = TradingCalendar::us_equities()
            .with_extra_holidays(config.calendar.extra_holidays.iter().copied());
        let as_of = options
            .as_of
            .unwrap_or_else(|| market_date(Utc::now(), config.calendar.utc_offset_hours));
        let expected_day = calendar.expected_last_trading_day(as_of);
        tracing::info!(%as_of, %expected_day, symbols = symbols.len(), "run context ready");

        let ctx = Arc::new(RunContext::new(
            &run_id,
            config,
            paths,
            options,
            recorder,
            provider,
            calendar,
            expected_day,
            symbols,
            preflight.policy,
        ));

        let outcome = tokio::select! {
            result = run_selected(&ctx) => match result {
                Ok(()) => RunOutcome::Completed,
                Err(error) => RunOutcome::Aborted(error),
            },
            signal = &mut shutdown => RunOutcome::Signalled(signal),
        };

        finalize(&ctx, outcome, &acquired.guard).await
    }
}

fn early_failure(run_id: &str, error: RunError) -> RunReport {
    tracing::error!(code = %error.code, message = %error.message, "run stopped before it started");
    RunReport {
        run_id: run_id.to_string(),
        verdict: None,
        exit_code: error.exit_code(),
        summary_path: None,
        error: Some(error),
    }
}

fn early_signal(run_id: &str, signal: TerminationSignal) -> RunReport {
    tracing::warn!(signal = signal.name(), "terminated during preflight");
    RunReport {
        run_id: run_id.to_string(),
        verdict: None,
        exit_code: signal.exit_code(),
        summary_path: None,
        error: None,
    }
}

/// Resolves on the first SIGINT, SIGTERM or SIGHUP.
pub async fn termination_signal() -> TerminationSignal {
    let interrupt = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => TerminationSignal::Interrupt,
            Err(e) => {
                tracing::warn!(error = %e, "cannot listen for SIGINT");
                std::future::pending().await
            }
        }
    };

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        async fn next(kind: SignalKind) {
            match signal(kind) {
                Ok(mut stream) => {
                    if stream.recv().await.is_none() {
                        std::future::pending::<()>().await;
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "cannot install signal handler");
                    std::future::pending::<()>().await;
                }
            }
        }

        tokio::select! {
            s = interrupt => s,
            () = next(SignalKind::terminate()) => TerminationSignal::Terminate,
            () = next(SignalKind::hangup()) => TerminationSignal::Hangup,
        }
    }

    #[cfg(not(unix))]
    {
        interrupt.await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_ids_are_eight_hex_chars() {
        let id = new_run_id();
        assert_eq!(id.len(), 8);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }
}

//! BARS: bring every symbol's local history up to the expected trading day.
//!
//! Symbols are classified MISSING / STALE / FRESH and queued in that order;
//! FRESH symbols are skipped without a request unless forced. A fixed pool of
//! workers drains the queue, each request gated by the shared token bucket.
//! The phase aborts the run when too large a share of symbols fail, when the
//! AUTH breaker trips, or when history cannot be written.

use super::{BarsReport, RunContext};
use crate::checkpoint::{classify_freshness, BarsCheckpoint, BarsMode, Freshness};
use crate::classify::{classify_io, classify_provider, ErrorClass, RetryDecision};
use crate::error::{ErrorCode, RunError};
use crate::recorder::{FailureRecord, Phase};
use chrono::{NaiveDate, Utc};
use overnight_core::data::{normalize_bars, FetchRequest, HistoryError, ProviderError, RawBar};
use overnight_core::domain::merge_bars;
use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinSet;
use tokio::time::Instant;

pub const STAGE: &str = "BARS";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BarJob {
    pub symbol: String,
    pub freshness: Freshness,
}

/// Why one symbol did not complete.
#[derive(Debug)]
enum SymbolFailure {
    /// Recorded; the phase goes on.
    Unit { class: ErrorClass, message: String },
    /// Aborts the whole run.
    Fatal(RunError),
}

/// Work shared by the worker pool.
struct Queue {
    jobs: Mutex<VecDeque<BarJob>>,
    abort: AtomicBool,
    fatal: Mutex<Option<RunError>>,
}

impl Queue {
    fn next(&self) -> Option<BarJob> {
        if self.abort.load(Ordering::SeqCst) {
            return None;
        }
        self.jobs.lock().unwrap_or_else(|e| e.into_inner()).pop_front()
    }

    /// First fatal error wins.
    fn fail(&self, error: RunError) {
        let mut slot = self.fatal.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_none() {
            *slot = Some(error);
        }
        self.abort.store(true, Ordering::SeqCst);
    }

    fn take_fatal(&self) -> Option<RunError> {
        self.fatal.lock().unwrap_or_else(|e| e.into_inner()).take()
    }
}

/// Classify every symbol and order the work: MISSING, then STALE, then
/// (only when forced) FRESH. Returns the queue and the FRESH symbols skipped.
pub fn plan(ctx: &RunContext) -> (Vec<BarJob>, Vec<String>) {
    let mut jobs = Vec::new();
    let mut skipped = Vec::new();
    for symbol in &ctx.symbols {
        let state = ctx.history.state(symbol);
        let freshness = classify_freshness(&state, ctx.expected_day, &ctx.calendar);
        if matches!(freshness, Freshness::Fresh { .. }) && !ctx.options.force {
            skipped.push(symbol.clone());
            continue;
        }
        jobs.push(BarJob {
            symbol: symbol.clone(),
            freshness,
        });
    }
    // Stable: universe order is kept within a class.
    jobs.sort_by_key(|j| j.freshness.priority());
    (jobs, skipped)
}

/// Date window for one job. STALE resumes the day after the last local bar.
pub fn fetch_window(job: &BarJob, full_history_start: NaiveDate, expected: NaiveDate) -> (BarsMode, NaiveDate) {
    match job.freshness {
        Freshness::Stale { last_date, .. } => (
            BarsMode::Incremental,
            last_date.succ_opt().unwrap_or(last_date),
        ),
        Freshness::Missing | Freshness::Fresh { .. } => (BarsMode::Full, full_history_start.min(expected)),
    }
}

pub async fn run(ctx: &Arc<RunContext>) -> Result<(), RunError> {
    let recorder = &ctx.recorder;
    recorder.set_phase(Phase::BarsRunning);

    let (jobs, skipped) = plan(ctx);
    let missing = jobs.iter().filter(|j| j.freshness == Freshness::Missing).count();
    tracing::info!(
        queued = jobs.len(),
        missing,
        stale = jobs.len() - missing,
        skipped = skipped.len(),
        expected = %ctx.expected_day,
        "bars queue built"
    );
    recorder.event(
        "BARS_QUEUE",
        serde_json::json!({
            "queued": jobs.len(),
            "missing": missing,
            "skipped_fresh": skipped.len(),
            "expected_day": ctx.expected_day,
        }),
    );
    ctx.with_reports(|r| {
        r.bars = Some(BarsReport {
            queued: jobs.len(),
            skipped: skipped.len(),
            ..Default::default()
        })
    });
    ctx.publish_progress();

    let workers = ctx.config.bars.workers.max(1).min(jobs.len());
    let queue = Arc::new(Queue {
        jobs: Mutex::new(jobs.into()),
        abort: AtomicBool::new(false),
        fatal: Mutex::new(None),
    });

    let mut pool = JoinSet::new();
    for worker in 0..workers {
        let ctx = Arc::clone(ctx);
        let queue = Arc::clone(&queue);
        pool.spawn(async move { worker_loop(worker, &ctx, &queue).await });
    }
    while let Some(joined) = pool.join_next().await {
        if let Err(e) = joined {
            tracing::error!(error = %e, "bars worker panicked");
            queue.fail(RunError::new(ErrorCode::Internal, format!("bars worker panicked: {e}")));
        }
    }

    let report = ctx.with_reports(|r| {
        let report = r.bars.get_or_insert_with(BarsReport::default);
        report.aborted = queue.abort.load(Ordering::SeqCst);
        report.clone()
    });
    ctx.publish_progress();

    if let Some(fatal) = queue.take_fatal() {
        return Err(fatal);
    }
    if report.failure_rate() > ctx.config.bars.max_failure_rate {
        return Err(failure_rate_error(&report, ctx.config.bars.max_failure_rate));
    }

    recorder.event(
        "BARS_DONE",
        serde_json::json!({ "done": report.done, "failed": report.failed, "skipped": report.skipped }),
    );
    recorder.set_phase(Phase::BarsDone);
    Ok(())
}

async fn worker_loop(worker: usize, ctx: &RunContext, queue: &Queue) {
    while let Some(job) = queue.next() {
        let failure = match process_symbol(ctx, &job).await {
            Ok(updated) => {
                tracing::debug!(worker, symbol = %job.symbol, last_date = %updated.last_date, "bars updated");
                ctx.recorder.event(
                    "BARS_OK",
                    serde_json::json!({
                        "symbol": job.symbol,
                        "freshness": job.freshness.label(),
                        "last_date": updated.last_date,
                        "mode": updated.mode,
                        "count": updated.count,
                    }),
                );
                None
            }
            Err(SymbolFailure::Fatal(error)) => {
                tracing::error!(worker, symbol = %job.symbol, code = %error.code, "bars phase aborting");
                ctx.recorder.event(
                    "BARS_FAIL",
                    serde_json::json!({ "symbol": job.symbol, "code": error.code, "error": &error.message }),
                );
                queue.fail(error);
                return;
            }
            Err(SymbolFailure::Unit { class, message }) => Some((class, message)),
        };

        let report = ctx.with_reports(|r| {
            let report = r.bars.get_or_insert_with(BarsReport::default);
            if failure.is_some() {
                report.failed += 1;
                report.failed_symbols.push(job.symbol.clone());
            } else {
                report.done += 1;
            }
            report.clone()
        });

        if let Some((class, message)) = failure {
            tracing::warn!(worker, symbol = %job.symbol, %class, error = %message, "symbol failed");
            ctx.recorder.event(
                "BARS_FAIL",
                serde_json::json!({ "symbol": job.symbol, "class": class.as_str(), "error": &message }),
            );
            ctx.recorder.add_failure(FailureRecord::new(
                Some(job.symbol.as_str()),
                STAGE,
                class.as_str(),
                message,
            ));
            ctx.publish_progress();

            let bars = &ctx.config.bars;
            if report.failed > bars.min_failure_sample && report.failure_rate() > bars.max_failure_rate {
                queue.fail(failure_rate_error(&report, bars.max_failure_rate));
                return;
            }
            continue;
        }

        if report.attempted() % ctx.config.status.progress_every.max(1) == 0 {
            ctx.publish_progress();
            tracing::info!(
                done = report.done,
                failed = report.failed,
                remaining = report.queued.saturating_sub(report.attempted()),
                "bars progress"
            );
        }
    }
}

fn failure_rate_error(report: &BarsReport, limit: f64) -> RunError {
    RunError::new(
        ErrorCode::BarsFailureRate,
        format!(
            "{} of {} symbols failed ({:.1}% > {:.0}%)",
            report.failed,
            report.attempted(),
            report.failure_rate() * 100.0,
            limit * 100.0
        ),
    )
    .with_details(serde_json::json!({
        "attempted": report.attempted(),
        "failed": report.failed,
        "failed_symbols": report.failed_symbols,
    }))
}

/// A symbol whose history now reaches the expected day.
#[derive(Debug)]
struct Updated {
    last_date: NaiveDate,
    mode: BarsMode,
    /// Bars returned by the provider after normalization.
    count: usize,
}

/// Fetch, merge, persist and checkpoint one symbol.
async fn process_symbol(ctx: &RunContext, job: &BarJob) -> Result<Updated, SymbolFailure> {
    let (mode, from) = fetch_window(job, ctx.config.bars.full_history_start, ctx.expected_day);
    let request = FetchRequest {
        symbol: job.symbol.clone(),
        from,
        to: ctx.expected_day,
    };

    let raw = fetch_with_retry(ctx, &request).await?;
    let incoming = normalize_bars(raw);
    let count = incoming.len();
    let existing = ctx.history.load_or_empty(&job.symbol);
    let merged = merge_bars(&existing, &incoming);

    let newest = merged.last().map(|b| b.date);
    let last_date = match newest {
        Some(d) if d >= ctx.expected_day => d,
        _ => {
            return Err(SymbolFailure::Unit {
                class: ErrorClass::Unknown,
                message: format!(
                    "history ends at {} after fetch; expected {}",
                    newest.map_or_else(|| "nothing".to_string(), |d| d.to_string()),
                    ctx.expected_day
                ),
            })
        }
    };

    ctx.history.write(&job.symbol, &merged).map_err(|e| match e {
        HistoryError::Io { path, source } => disk_failure(&path, &source),
        other => SymbolFailure::Unit {
            class: ErrorClass::Unknown,
            message: other.to_string(),
        },
    })?;

    let attempts = ctx
        .checkpoints
        .load_bars(&job.symbol)
        .map_or(0, |cp| cp.attempts)
        .saturating_add(1);
    let checkpoint = BarsCheckpoint {
        symbol: job.symbol.clone(),
        mode,
        last_date,
        attempts,
        written_at: Utc::now(),
    };
    ctx.checkpoints.write_bars(&checkpoint).map_err(|e| {
        let path = ctx.checkpoints.bars_path(&job.symbol);
        disk_failure(&path.display().to_string(), &e)
    })?;

    Ok(Updated {
        last_date,
        mode,
        count,
    })
}

fn disk_failure(path: &str, error: &io::Error) -> SymbolFailure {
    SymbolFailure::Fatal(
        RunError::new(ErrorCode::DiskWrite, format!("cannot write {path}: {error}")).with_details(
            serde_json::json!({ "path": path, "class": classify_io(error).as_str() }),
        ),
    )
}

/// One symbol's request, retried per the retry policy.
async fn fetch_with_retry(ctx: &RunContext, request: &FetchRequest) -> Result<Vec<RawBar>, SymbolFailure> {
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        if !ctx.breaker.is_allowed() {
            return Err(SymbolFailure::Fatal(auth_repeated(ctx)));
        }

        let result = {
            let _permit = ctx.limiter.acquire().await;
            let started = Instant::now();
            let result = ctx.provider.fetch(request).await;
            ctx.meter.record(&result, started.elapsed());
            result
        };
        let error = match result {
            Ok(raw) => return Ok(raw),
            Err(e) => e,
        };

        let class = classify_provider(&error);
        if class == ErrorClass::Auth {
            if ctx.breaker.record_failure() {
                return Err(SymbolFailure::Fatal(auth_repeated(ctx)));
            }
            return Err(SymbolFailure::Unit {
                class,
                message: error.to_string(),
            });
        }

        let retry_after = match &error {
            ProviderError::Http { retry_after, .. } => *retry_after,
            _ => None,
        };
        match ctx.retry.decide(class, attempt, retry_after) {
            RetryDecision::RetryAfter(delay) => {
                tracing::warn!(
                    symbol = %request.symbol,
                    attempt,
                    %class,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "fetch failed; retrying"
                );
                ctx.recorder.event(
                    "BARS_RETRY",
                    serde_json::json!({
                        "symbol": request.symbol,
                        "attempt": attempt,
                        "class": class.as_str(),
                        "delay_ms": delay.as_millis() as u64,
                    }),
                );
                tokio::time::sleep(delay).await;
            }
            RetryDecision::GiveUp => {
                return Err(SymbolFailure::Unit {
                    class,
                    message: format!("{error} (after {attempt} attempt(s))"),
                })
            }
        }
    }
}

fn auth_repeated(ctx: &RunContext) -> RunError {
    RunError::new(
        ErrorCode::AuthRepeated,
        "provider rejected the credential repeatedly; aborting",
    )
    .with_details(serde_json::json!({ "auth_failures": ctx.breaker.failures() }))
}

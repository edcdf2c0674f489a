//! TRAIN_TICKER: one statistics artifact per symbol, one symbol at a time.
//!
//! A symbol is reused when its checkpoint is valid for the current policy
//! hash and history, skipped when its history is shorter than the policy
//! minimum, and otherwise trained under a hard timeout.

use super::{RunContext, TrainReport};
use crate::checkpoint::{train_checkpoint_reusable, TrainCheckpoint};
use crate::classify::{classify_io, ErrorClass};
use crate::error::{ErrorCode, RunError};
use crate::recorder::{FailureRecord, Phase};
use chrono::{NaiveDate, Utc};
use overnight_core::artifact::{ArtifactError, TickerArtifact};
use overnight_core::domain::Bar;
use overnight_core::stats::TickerStats;
use std::time::Duration;

pub const STAGE: &str = "TRAIN_TICKER";

/// What happened to one symbol.
#[derive(Debug)]
enum Outcome {
    Trained,
    Reused,
    Insufficient { usable: usize },
    Failed { class: ErrorClass, message: String },
}

pub async fn run(ctx: &RunContext) -> Result<(), RunError> {
    ctx.recorder.set_phase(Phase::TrainTickerRunning);
    ctx.with_reports(|r| r.train = Some(TrainReport::default()));

    let timeout = Duration::from_secs(ctx.config.training.ticker_timeout_secs);
    let every = ctx.config.status.progress_every.max(1);
    let required = ctx.policy.policy.min_history_bars;
    for (index, symbol) in ctx.symbols.iter().enumerate() {
        let outcome = train_symbol(ctx, symbol, timeout).await?;
        match &outcome {
            Outcome::Trained => tracing::debug!(%symbol, "trained"),
            Outcome::Reused => tracing::debug!(%symbol, "checkpoint reused"),
            Outcome::Insufficient { usable } => {
                tracing::debug!(%symbol, usable, "insufficient history");
                ctx.recorder.event(
                    "TRAIN_SKIP_INSUFFICIENT",
                    serde_json::json!({ "symbol": symbol, "usable": usable, "required": required }),
                );
            }
            Outcome::Failed { class, message } => {
                tracing::warn!(%symbol, %class, error = %message, "training failed");
                ctx.recorder.event(
                    "TRAIN_FAIL",
                    serde_json::json!({ "symbol": symbol, "class": class.as_str(), "error": message }),
                );
            }
        }

        ctx.with_reports(|r| {
            let report = r.train.get_or_insert_with(TrainReport::default);
            match &outcome {
                Outcome::Trained => report.trained += 1,
                Outcome::Reused => report.reused += 1,
                Outcome::Insufficient { .. } => report.insufficient += 1,
                Outcome::Failed { .. } => {
                    report.failed += 1;
                    report.failed_symbols.push(symbol.clone());
                }
            }
        });
        if let Outcome::Failed { class, message } = outcome {
            ctx.recorder
                .add_failure(FailureRecord::new(Some(symbol.as_str()), STAGE, class.as_str(), message));
            ctx.publish_progress();
        } else if (index + 1) % every == 0 {
            ctx.publish_progress();
        }
    }

    let report = ctx.with_reports(|r| r.train.clone().unwrap_or_default());
    ctx.publish_progress();
    tracing::info!(
        trained = report.trained,
        reused = report.reused,
        insufficient = report.insufficient,
        failed = report.failed,
        "per-symbol training finished"
    );
    ctx.recorder.event("TRAIN_TICKER_DONE", serde_json::to_value(&report).unwrap_or_default());
    ctx.recorder.set_phase(Phase::TrainTickerDone);
    Ok(())
}

/// Last date among usable bars; the date artifacts and checkpoints key on.
fn last_usable_date(bars: &[Bar]) -> Option<NaiveDate> {
    bars.iter().rev().find(|b| b.is_usable()).map(|b| b.date)
}

async fn train_symbol(ctx: &RunContext, symbol: &str, timeout: Duration) -> Result<Outcome, RunError> {
    let bars = ctx.history.load_or_empty(symbol);
    let usable = bars.iter().filter(|b| b.is_usable()).count();
    let policy = &ctx.policy.policy;
    let last_date = match last_usable_date(&bars) {
        Some(d) if usable >= policy.min_history_bars => d,
        _ => return Ok(Outcome::Insufficient { usable }),
    };

    let hash = &ctx.policy.hash;
    let checkpoint = ctx.checkpoints.load_train(symbol);
    match train_checkpoint_reusable(checkpoint.as_ref(), ctx.reuse_mode(), hash, last_date, &ctx.artifacts) {
        Ok(()) => return Ok(Outcome::Reused),
        Err(reason) => tracing::debug!(%symbol, %reason, "retraining"),
    }

    let training_policy = policy.clone();
    let task = tokio::task::spawn_blocking(move || TickerStats::compute(&bars, &training_policy));
    let stats = match tokio::time::timeout(timeout, task).await {
        Err(_) => {
            return Ok(Outcome::Failed {
                class: ErrorClass::Timeout,
                message: format!("training exceeded {}s", timeout.as_secs()),
            })
        }
        Ok(Err(join)) => {
            return Ok(Outcome::Failed {
                class: ErrorClass::Unknown,
                message: format!("training task failed: {join}"),
            })
        }
        Ok(Ok(None)) => return Ok(Outcome::Insufficient { usable }),
        Ok(Ok(Some(stats))) => stats,
    };

    let artifact = TickerArtifact::new(symbol, hash.clone(), stats, Utc::now());
    let artifact_path = ctx.artifacts.write_ticker(&artifact).map_err(artifact_write_error)?;
    let checkpoint = TrainCheckpoint {
        symbol: symbol.to_string(),
        policy_hash: hash.clone(),
        artifact_path: artifact_path.display().to_string(),
        bars_last_date: artifact.bars_last_date,
    };
    ctx.checkpoints.write_train(&checkpoint).map_err(|e| {
        let path = ctx.checkpoints.train_path(symbol);
        disk_write(&path.display().to_string(), &e)
    })?;
    Ok(Outcome::Trained)
}

fn artifact_write_error(error: ArtifactError) -> RunError {
    match error {
        ArtifactError::Io { path, source } => disk_write(&path, &source),
        other => RunError::new(ErrorCode::Internal, other.to_string()),
    }
}

fn disk_write(path: &str, error: &std::io::Error) -> RunError {
    RunError::new(ErrorCode::DiskWrite, format!("cannot write {path}: {error}"))
        .with_details(serde_json::json!({ "path": path, "class": classify_io(error).as_str() }))
}

//! TRAIN_GLOBAL: aggregate every per-symbol artifact into one.
//!
//! The aggregate is keyed by a digest over the policy hash and the sorted
//! artifact summaries, so any changed input invalidates it. Failures are
//! recorded but never abort the run.

use super::{GlobalReport, RunContext};
use crate::checkpoint::{global_checkpoint_reusable, GlobalCheckpoint};
use crate::classify::{classify_io, ErrorClass};
use crate::recorder::{FailureRecord, Phase};
use chrono::Utc;
use overnight_core::artifact::{GlobalArtifact, GLOBAL_ARTIFACT_SCHEMA};
use overnight_core::fingerprint::{global_input_digest, ArtifactSummary};
use overnight_core::stats::{GlobalStats, TickerStats};
use std::time::Duration;

pub const STAGE: &str = "TRAIN_GLOBAL";
pub const WARN_GLOBAL_FAILED: &str = "GLOBAL_TRAIN_FAILED";

struct GlobalFailure {
    class: ErrorClass,
    message: String,
}

pub async fn run(ctx: &RunContext) {
    ctx.recorder.set_phase(Phase::TrainGlobalRunning);

    let report = match train(ctx).await {
        Ok(report) => report,
        Err(failure) => {
            tracing::warn!(class = %failure.class, error = %failure.message, "global training failed");
            ctx.recorder.add_warning(WARN_GLOBAL_FAILED);
            ctx.recorder.add_failure(FailureRecord::new(
                None,
                STAGE,
                failure.class.as_str(),
                failure.message.clone(),
            ));
            GlobalReport::Failed {
                error: failure.message,
            }
        }
    };

    let done = matches!(report, GlobalReport::Trained { .. } | GlobalReport::Reused { .. });
    ctx.recorder.update(|doc| doc.progress.global_done = done);
    ctx.recorder
        .event("TRAIN_GLOBAL_DONE", serde_json::to_value(&report).unwrap_or_default());
    ctx.with_reports(|r| r.global = Some(report));
    ctx.recorder.set_phase(Phase::TrainGlobalDone);
}

async fn train(ctx: &RunContext) -> Result<GlobalReport, GlobalFailure> {
    let hash = &ctx.policy.hash;
    let artifacts = ctx.artifacts.tickers_for_policy(hash).map_err(|e| GlobalFailure {
        class: e.io_error().map_or(ErrorClass::Unknown, classify_io),
        message: e.to_string(),
    })?;
    if artifacts.is_empty() {
        tracing::info!(policy = hash.short(), "no per-symbol artifacts; global training skipped");
        return Ok(GlobalReport::Skipped);
    }

    let summaries: Vec<ArtifactSummary> = artifacts.iter().map(|a| a.summary()).collect();
    let digest = global_input_digest(hash, &summaries);

    let checkpoint = ctx.checkpoints.load_global();
    match global_checkpoint_reusable(checkpoint.as_ref(), ctx.reuse_mode(), hash, &digest, &ctx.artifacts) {
        Ok(()) => {
            tracing::info!(digest = %digest, "global checkpoint reused");
            return Ok(GlobalReport::Reused { digest });
        }
        Err(reason) => tracing::info!(%reason, "global model retraining"),
    }

    let symbols: Vec<String> = artifacts.iter().map(|a| a.symbol.clone()).collect();
    let stats: Vec<TickerStats> = artifacts.into_iter().map(|a| a.stats).collect();
    let timeout = Duration::from_secs(ctx.config.training.global_timeout_secs);
    let task = tokio::task::spawn_blocking(move || {
        let refs: Vec<&TickerStats> = stats.iter().collect();
        GlobalStats::aggregate(&refs)
    });
    let stats = match tokio::time::timeout(timeout, task).await {
        Ok(Ok(stats)) => stats,
        Ok(Err(join)) => {
            return Err(GlobalFailure {
                class: ErrorClass::Unknown,
                message: format!("aggregation task failed: {join}"),
            })
        }
        Err(_) => {
            return Err(GlobalFailure {
                class: ErrorClass::Timeout,
                message: format!("aggregation exceeded {}s", timeout.as_secs()),
            })
        }
    };

    let artifact = GlobalArtifact {
        schema: GLOBAL_ARTIFACT_SCHEMA.into(),
        policy_hash: hash.clone(),
        input_digest: digest.clone(),
        trained_at: Utc::now(),
        symbols,
        stats,
    };
    let path = ctx.artifacts.write_global(&artifact).map_err(|e| GlobalFailure {
        class: e.io_error().map_or(ErrorClass::Unknown, classify_io),
        message: e.to_string(),
    })?;
    let checkpoint = GlobalCheckpoint {
        policy_hash: hash.clone(),
        input_digest: digest.clone(),
        artifact_path: path.display().to_string(),
    };
    ctx.checkpoints.write_global(&checkpoint).map_err(|e| GlobalFailure {
        class: classify_io(&e),
        message: format!("cannot write global checkpoint: {e}"),
    })?;

    Ok(GlobalReport::Trained {
        digest,
        symbols: artifact.symbols.len(),
    })
}

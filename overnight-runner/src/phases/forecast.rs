//! FORECAST: run the downstream forecast, the validation gates, and the UI
//! smoke check.
//!
//! The forecast and each validation are hard gates. The UI smoke check is
//! retried and, if it still fails, only degrades the run. A step with an
//! empty command is skipped.

use super::{ForecastReport, RunContext, StepRecord};
use crate::error::{ErrorCode, RunError};
use crate::external::{run_command, CommandOutcome, CommandSpec};
use crate::recorder::{FailureRecord, Phase, UiStatus};
use std::time::Duration;

pub const STAGE: &str = "FORECAST";
pub const WARN_UI_SMOKE_FAILED: &str = "UI_SMOKE_FAILED";

pub async fn run(ctx: &RunContext) -> Result<(), RunError> {
    ctx.recorder.set_phase(Phase::ForecastRunning);
    ctx.with_reports(|r| r.forecast = Some(ForecastReport::default()));
    let fc = &ctx.config.forecast;

    let forecast = CommandSpec::new(
        "forecast",
        &fc.forecast_cmd,
        Duration::from_secs(fc.forecast_timeout_secs),
    );
    gate(ctx, &forecast, ErrorCode::ForecastFailed).await?;

    let validation_timeout = Duration::from_secs(fc.validation_timeout_secs);
    for (label, argv) in [
        ("schema", &fc.schema_cmd),
        ("registry", &fc.registry_cmd),
        ("determinism", &fc.determinism_cmd),
    ] {
        let spec = CommandSpec::new(label, argv, validation_timeout);
        gate(ctx, &spec, ErrorCode::ValidationFailed).await?;
    }

    let ui = CommandSpec::new("ui_smoke", &fc.ui_smoke_cmd, Duration::from_secs(fc.ui_timeout_secs));
    let ui_status = ui_smoke(ctx, &ui, fc.ui_attempts.max(1), Duration::from_secs(fc.ui_retry_delay_secs)).await;
    ctx.recorder.update(|doc| doc.ui_status = ui_status);
    ctx.with_reports(|r| {
        if let Some(report) = r.forecast.as_mut() {
            report.ui_status = ui_status;
        }
    });

    ctx.recorder.set_phase(Phase::ForecastDone);
    Ok(())
}

fn record_step(ctx: &RunContext, record: StepRecord) {
    ctx.recorder.event("STEP", serde_json::to_value(&record).unwrap_or_default());
    ctx.with_reports(|r| {
        if let Some(report) = r.forecast.as_mut() {
            report.steps.push(record);
        }
    });
}

/// Run one hard-gate step; failure aborts with `code`.
async fn gate(ctx: &RunContext, spec: &CommandSpec, code: ErrorCode) -> Result<(), RunError> {
    if spec.is_empty() {
        tracing::info!(step = %spec.label, "no command configured; step skipped");
        ctx.recorder
            .event("STEP_SKIPPED", serde_json::json!({ "label": spec.label }));
        return Ok(());
    }

    tracing::info!(step = %spec.label, command = %spec.display(), "running step");
    let outcome = run_command(spec, &ctx.paths.repo_root).await;
    record_step(ctx, StepRecord::new(&spec.label, spec.display(), &outcome, 1));
    if outcome.is_success() {
        return Ok(());
    }

    tracing::error!(step = %spec.label, outcome = %outcome.describe(), "step failed");
    ctx.recorder.add_failure(FailureRecord::new(
        None,
        STAGE,
        outcome_class(&outcome),
        format!("{}: {}", spec.label, outcome.describe()),
    ));
    Err(RunError::new(code, format!("{} step failed: {}", spec.label, outcome.describe())).with_details(
        serde_json::json!({ "step": spec.label, "command": spec.display() }),
    ))
}

fn outcome_class(outcome: &CommandOutcome) -> &'static str {
    match outcome {
        CommandOutcome::TimedOut { .. } => "TIMEOUT",
        _ => "UNKNOWN",
    }
}

/// Retry the UI smoke check; the result never aborts the run.
async fn ui_smoke(ctx: &RunContext, spec: &CommandSpec, attempts: u32, delay: Duration) -> UiStatus {
    if spec.is_empty() {
        tracing::info!("no UI smoke command configured");
        ctx.recorder
            .event("STEP_SKIPPED", serde_json::json!({ "label": spec.label }));
        return UiStatus::Skipped;
    }

    let mut last = None;
    for attempt in 1..=attempts {
        let outcome = run_command(spec, &ctx.paths.repo_root).await;
        if outcome.is_success() {
            record_step(ctx, StepRecord::new(&spec.label, spec.display(), &outcome, attempt));
            return UiStatus::Ok;
        }
        tracing::warn!(attempt, attempts, outcome = %outcome.describe(), "UI smoke check failed");
        if attempt < attempts {
            tokio::time::sleep(delay).await;
        }
        last = Some((outcome, attempt));
    }

    let Some((outcome, attempt)) = last else {
        return UiStatus::Unknown;
    };
    record_step(ctx, StepRecord::new(&spec.label, spec.display(), &outcome, attempt));
    ctx.recorder.add_warning(WARN_UI_SMOKE_FAILED);
    ctx.recorder.add_failure(FailureRecord::new(
        None,
        "UI_SMOKE",
        outcome_class(&outcome),
        outcome.describe(),
    ));
    match outcome {
        // Nothing ran at all: the check itself is broken.
        CommandOutcome::SpawnFailed { .. } => UiStatus::Failed,
        _ => UiStatus::Degraded,
    }
}

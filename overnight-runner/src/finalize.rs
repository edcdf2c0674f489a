//! Run finalizer: verdict, summary, last status write, lock release.
//!
//! Runs on every exit path once the lock is held: normal completion, a
//! [`RunError`] from a phase, or a termination signal.

use crate::config::RunPaths;
use crate::error::{RunError, TerminationSignal, EXIT_DONE, EXIT_UI_DEGRADED};
use crate::lock::LockGuard;
use crate::phases::{GlobalReport, PhaseReports, RunContext};
use crate::recorder::{FailureRecord, Phase, StatusDocument, UiStatus};
use chrono::{DateTime, Utc};
use overnight_core::atomic::{atomic_write, atomic_write_json};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Failures listed in the summary.
const SUMMARY_FAILURE_LIMIT: usize = 20;

/// Terminal classification of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Verdict {
    #[serde(rename = "DONE")]
    Done,
    #[serde(rename = "DONE (UI DEGRADED)")]
    DoneUiDegraded,
    #[serde(rename = "FAILED")]
    Failed,
}

impl Verdict {
    pub fn label(&self) -> &'static str {
        match self {
            Verdict::Done => "DONE",
            Verdict::DoneUiDegraded => "DONE (UI DEGRADED)",
            Verdict::Failed => "FAILED",
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// How the phases ended.
#[derive(Debug, Clone)]
pub enum RunOutcome {
    Completed,
    Aborted(RunError),
    Signalled(TerminationSignal),
}

pub fn verdict_for(outcome: &RunOutcome, ui_status: UiStatus) -> Verdict {
    match outcome {
        RunOutcome::Aborted(_) | RunOutcome::Signalled(_) => Verdict::Failed,
        RunOutcome::Completed if matches!(ui_status, UiStatus::Degraded | UiStatus::Failed) => {
            Verdict::DoneUiDegraded
        }
        RunOutcome::Completed => Verdict::Done,
    }
}

pub fn exit_code_for(outcome: &RunOutcome, verdict: Verdict) -> i32 {
    match outcome {
        RunOutcome::Signalled(signal) => signal.exit_code(),
        RunOutcome::Aborted(error) => error.exit_code(),
        RunOutcome::Completed if verdict == Verdict::DoneUiDegraded => EXIT_UI_DEGRADED,
        RunOutcome::Completed => EXIT_DONE,
    }
}

/// What the caller gets back from a run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: String,
    /// `None` when the run stopped before it held the lock.
    pub verdict: Option<Verdict>,
    pub exit_code: i32,
    pub summary_path: Option<PathBuf>,
    pub error: Option<RunError>,
}

#[derive(Debug, Serialize)]
struct SummaryJson<'a> {
    run_id: &'a str,
    verdict: Verdict,
    exit_code: i32,
    summary_path: String,
}

/// Inputs to the Markdown summary.
pub struct SummaryInput<'a> {
    pub status: &'a StatusDocument,
    pub reports: &'a PhaseReports,
    pub outcome: &'a RunOutcome,
    pub verdict: Verdict,
    pub ended_at: DateTime<Utc>,
    /// UI smoke command line, for the remediation hint.
    pub ui_command: Option<String>,
}

/// Finalize a run that held the lock.
pub async fn finalize(ctx: &RunContext, outcome: RunOutcome, lock: &LockGuard) -> RunReport {
    let recorder = &ctx.recorder;
    recorder.stop_heartbeat();

    match &outcome {
        RunOutcome::Completed => {}
        RunOutcome::Aborted(error) => {
            tracing::error!(code = %error.code, message = %error.message, "run aborted");
            recorder.add_failure(FailureRecord::new(None, "RUN", error.code.as_str(), error.message.clone()));
        }
        RunOutcome::Signalled(signal) => {
            tracing::warn!(signal = signal.name(), "terminated by signal");
            recorder.add_warning(&format!("SIGNAL_{}", signal.name()));
            recorder.event("SIGNAL", serde_json::json!({ "signal": signal.name() }));
        }
    }
    ctx.publish_progress();

    let ended_at = Utc::now();
    let status = recorder.snapshot();
    let verdict = verdict_for(&outcome, status.ui_status);
    let exit_code = exit_code_for(&outcome, verdict);
    let reports = ctx.reports();
    let ui_command = Some(ctx.config.forecast.ui_smoke_cmd.join(" ")).filter(|c| !c.is_empty());

    let markdown = render_summary(&SummaryInput {
        status: &status,
        reports: &reports,
        outcome: &outcome,
        verdict,
        ended_at,
        ui_command,
    });
    let summary_path = write_summaries(&ctx.paths, &ctx.run_id, &markdown, verdict, exit_code);

    recorder.update(|doc| {
        doc.ended_at = Some(ended_at);
        doc.verdict = Some(verdict.label().to_string());
    });
    recorder.set_phase(if verdict == Verdict::Failed {
        Phase::Failed
    } else {
        Phase::Done
    });
    let error = match &outcome {
        RunOutcome::Aborted(e) => Some(e.clone()),
        _ => None,
    };
    recorder.event(
        "RUN_END",
        serde_json::json!({
            "verdict": verdict.label(),
            "exit_code": exit_code,
            "error": error,
        }),
    );
    recorder.flush().await;
    if recorder.write_errors() > 0 {
        tracing::warn!(errors = recorder.write_errors(), "some status or event writes failed");
    }

    lock.release();
    tracing::info!(verdict = %verdict, exit_code, "run finished");

    RunReport {
        run_id: ctx.run_id.clone(),
        verdict: Some(verdict),
        exit_code,
        summary_path,
        error,
    }
}

fn write_summaries(
    paths: &RunPaths,
    run_id: &str,
    markdown: &str,
    verdict: Verdict,
    exit_code: i32,
) -> Option<PathBuf> {
    if let Err(e) = atomic_write(&paths.summary_md, markdown.as_bytes()) {
        tracing::error!(path = %paths.summary_md.display(), error = %e, "could not write summary");
        return None;
    }
    let json = SummaryJson {
        run_id,
        verdict,
        exit_code,
        summary_path: paths.summary_md.display().to_string(),
    };
    if let Err(e) = atomic_write_json(&paths.summary_json, &json) {
        tracing::error!(path = %paths.summary_json.display(), error = %e, "could not write summary json");
    }
    Some(paths.summary_md.clone())
}

/// Symbols with a failure recorded at `stage`, first occurrence order.
pub fn failed_symbols(status: &StatusDocument, stage: &str) -> Vec<String> {
    let mut seen = Vec::new();
    for failure in status.failures.iter().filter(|f| f.stage == stage) {
        if let Some(symbol) = &failure.symbol {
            if !seen.contains(symbol) {
                seen.push(symbol.clone());
            }
        }
    }
    seen
}

fn format_duration(seconds: i64) -> String {
    let s = seconds.max(0);
    match (s / 3600, (s % 3600) / 60, s % 60) {
        (0, 0, sec) => format!("{sec}s"),
        (0, m, sec) => format!("{m}m {sec}s"),
        (h, m, sec) => format!("{h}h {m}m {sec}s"),
    }
}

fn escape_cell(text: &str) -> String {
    let one_line: String = text.chars().map(|c| if c == '\n' { ' ' } else { c }).collect();
    let short: String = one_line.chars().take(160).collect();
    short.replace('|', "\\|")
}

/// Render the human-readable summary.
pub fn render_summary(input: &SummaryInput<'_>) -> String {
    let status = input.status;
    let progress = &status.progress;
    let duration = (input.ended_at - status.started_at).num_seconds();

    let mut md = format!(
        "# Overnight Run Summary\n\n\
## Run Metadata\n\n\
| Field | Value |\n\
|-------|-------|\n\
| Run ID | `{}` |\n\
| HEAD | `{}` |\n\
| Started | {} |\n\
| Ended | {} |\n\
| Duration | {} |\n\
| Universe | {} symbols |\n\
| Phases | {} |\n\
| Resume / Force | {} / {} |\n",
        status.run_id,
        status.head_sha,
        status.started_at.to_rfc3339(),
        input.ended_at.to_rfc3339(),
        format_duration(duration),
        status.universe_count,
        status.phases.join(", "),
        status.resume,
        status.force,
    );

    md.push_str("\n## Phase Results\n\n");
    md.push_str(&format!(
        "### Bars\n- Done: {}\n- Failed: {}\n- Skipped (fresh): {}\n",
        progress.bars_done, progress.bars_failed, progress.bars_skipped
    ));
    if input.reports.bars.as_ref().is_some_and(|b| b.aborted) {
        md.push_str("- Stopped before the queue drained\n");
    }

    md.push_str("\n### Per-Symbol Training\n");
    match &input.reports.train {
        Some(t) => md.push_str(&format!(
            "- Trained: {}\n- Reused: {}\n- Insufficient history: {}\n- Failed: {}\n",
            t.trained, t.reused, t.insufficient, t.failed
        )),
        None => md.push_str("- Not run\n"),
    }

    md.push_str("\n### Global Training\n");
    md.push_str(&match &input.reports.global {
        Some(GlobalReport::Trained { digest, symbols }) => {
            format!("- Trained over {symbols} symbols (digest `{}`)\n", short(&digest.0))
        }
        Some(GlobalReport::Reused { digest }) => format!("- Reused (digest `{}`)\n", short(&digest.0)),
        Some(GlobalReport::Skipped) => "- Skipped: no per-symbol artifacts\n".to_string(),
        Some(GlobalReport::Failed { error }) => format!("- Failed: {}\n", escape_cell(error)),
        None => "- Not run\n".to_string(),
    });

    md.push_str("\n### Forecast\n");
    match &input.reports.forecast {
        Some(f) => {
            for step in &f.steps {
                md.push_str(&format!(
                    "- {}: {} (`{}`)\n",
                    step.label,
                    if step.ok { "ok" } else { step.outcome.as_str() },
                    step.command
                ));
            }
        }
        None => md.push_str("- Not run\n"),
    }
    md.push_str(&format!("- UI status: {}\n", ui_label(status.ui_status)));

    md.push_str("\n## Request Stats\n\n```json\n");
    md.push_str(&serde_json::to_string_pretty(&status.request_stats).unwrap_or_default());
    md.push_str("\n```\n");

    md.push_str("\n## Warnings\n\n");
    if status.warnings.is_empty() {
        md.push_str("None.\n");
    }
    for warning in &status.warnings {
        md.push_str(&format!("- {warning}\n"));
    }

    md.push_str(&format!("\n## Failures (Top {SUMMARY_FAILURE_LIMIT})\n\n"));
    if status.failures.is_empty() {
        md.push_str("None.\n");
    } else {
        md.push_str("| Symbol | Stage | Class | Error |\n");
        md.push_str("|--------|-------|-------|-------|\n");
        for f in status.failures.iter().take(SUMMARY_FAILURE_LIMIT) {
            md.push_str(&format!(
                "| {} | {} | {} | {} |\n",
                f.symbol.as_deref().unwrap_or("-"),
                f.stage,
                f.class,
                escape_cell(&f.error)
            ));
        }
        if status.failures.len() > SUMMARY_FAILURE_LIMIT {
            md.push_str(&format!(
                "\n_{} more not shown; see the event log._\n",
                status.failures.len() - SUMMARY_FAILURE_LIMIT
            ));
        }
    }

    md.push_str("\n## Next Actions\n\n");
    let actions = next_actions(input);
    if actions.is_empty() {
        md.push_str("None.\n");
    }
    for action in actions {
        md.push_str(&format!("- {action}\n"));
    }

    md.push_str(&format!("\n## Verdict\n\n**{}**\n", input.verdict.label()));
    md
}

fn short(hash: &str) -> &str {
    &hash[..hash.len().min(12)]
}

fn ui_label(status: UiStatus) -> &'static str {
    match status {
        UiStatus::Unknown => "UNKNOWN",
        UiStatus::Ok => "OK",
        UiStatus::Degraded => "DEGRADED",
        UiStatus::Failed => "FAILED",
        UiStatus::Skipped => "SKIPPED",
    }
}

/// Remediation commands for whatever went wrong.
pub fn next_actions(input: &SummaryInput<'_>) -> Vec<String> {
    use crate::error::ErrorCode;

    let mut actions = Vec::new();
    let bars_failed = failed_symbols(input.status, crate::phases::bars::STAGE);
    if !bars_failed.is_empty() {
        actions.push(format!(
            "Rerun bars for failed tickers: `overnight --phases=BARS --tickers={}`",
            bars_failed.join(",")
        ));
    }
    let train_failed = failed_symbols(input.status, crate::phases::train_ticker::STAGE);
    if !train_failed.is_empty() {
        actions.push(format!(
            "Retrain failed tickers: `overnight --phases=TRAIN_TICKER --tickers={}`",
            train_failed.join(",")
        ));
    }
    if matches!(input.reports.global, Some(GlobalReport::Failed { .. })) {
        actions.push("Retry global training: `overnight --phases=TRAIN_GLOBAL`".to_string());
    }

    match input.outcome {
        RunOutcome::Aborted(error) => match error.code {
            ErrorCode::AuthRepeated => actions.push(
                "Check the provider API key, then rerun: `overnight --resume`".to_string(),
            ),
            ErrorCode::BarsFailureRate => actions.push(
                "Upstream looks unhealthy; rerun later to continue: `overnight --resume`".to_string(),
            ),
            ErrorCode::DiskWrite => {
                actions.push("Free disk space, then rerun: `overnight --resume`".to_string())
            }
            ErrorCode::ForecastFailed | ErrorCode::ValidationFailed => actions.push(
                "Fix the failing step, then rerun it: `overnight --phases=FORECAST`".to_string(),
            ),
            _ => actions.push("Rerun to continue from checkpoints: `overnight --resume`".to_string()),
        },
        RunOutcome::Signalled(signal) => actions.push(format!(
            "Run stopped by {}; rerun to continue from checkpoints: `overnight --resume`",
            signal.name()
        )),
        RunOutcome::Completed => {}
    }

    if matches!(input.status.ui_status, UiStatus::Degraded | UiStatus::Failed) {
        match &input.ui_command {
            Some(cmd) => actions.push(format!("Rerun the UI smoke check: `{cmd}`")),
            None => actions.push("Rerun the UI smoke check".to_string()),
        }
    }
    actions
}

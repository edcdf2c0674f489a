//! External command steps (forecast generation, validators, UI smoke).
//!
//! A step is an argv vector run from the repository root and judged only by
//! its exit status within a hard timeout. A child that outlives its timeout is
//! killed.

use serde::Serialize;
use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;

/// Bytes of stderr kept for the failure record.
const STDERR_TAIL: usize = 2_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandSpec {
    pub label: String,
    pub argv: Vec<String>,
    pub timeout: Duration,
}

impl CommandSpec {
    pub fn new(label: &str, argv: &[String], timeout: Duration) -> Self {
        Self {
            label: label.to_string(),
            argv: argv.to_vec(),
            timeout,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.argv.is_empty()
    }

    pub fn display(&self) -> String {
        self.argv.join(" ")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    Success { elapsed: Duration },
    Failed { code: Option<i32>, stderr_tail: String },
    TimedOut { after: Duration },
    SpawnFailed { message: String },
}

impl CommandOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, CommandOutcome::Success { .. })
    }

    pub fn describe(&self) -> String {
        match self {
            CommandOutcome::Success { elapsed } => format!("ok in {:.1}s", elapsed.as_secs_f64()),
            CommandOutcome::Failed { code, stderr_tail } => match code {
                Some(c) if stderr_tail.is_empty() => format!("exit code {c}"),
                Some(c) => format!("exit code {c}: {stderr_tail}"),
                None => "terminated by signal".to_string(),
            },
            CommandOutcome::TimedOut { after } => format!("timed out after {}s", after.as_secs()),
            CommandOutcome::SpawnFailed { message } => format!("could not start: {message}"),
        }
    }
}

/// Run one step to completion or timeout.
pub async fn run_command(spec: &CommandSpec, cwd: &Path) -> CommandOutcome {
    let Some((program, args)) = spec.argv.split_first() else {
        return CommandOutcome::SpawnFailed {
            message: "empty command".into(),
        };
    };

    // Relative paths with a separator are relative to the repo root, not to
    // our own working directory.
    let program_path = Path::new(program);
    let program = if program_path.is_relative() && program.contains('/') {
        cwd.join(program_path).into_os_string()
    } else {
        program.into()
    };

    let started = Instant::now();
    let child = Command::new(&program)
        .args(args)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn();
    let child = match child {
        Ok(c) => c,
        Err(e) => {
            return CommandOutcome::SpawnFailed {
                message: e.to_string(),
            }
        }
    };

    match tokio::time::timeout(spec.timeout, child.wait_with_output()).await {
        Ok(Ok(output)) if output.status.success() => CommandOutcome::Success {
            elapsed: started.elapsed(),
        },
        Ok(Ok(output)) => CommandOutcome::Failed {
            code: output.status.code(),
            stderr_tail: tail(&String::from_utf8_lossy(&output.stderr)),
        },
        Ok(Err(e)) => CommandOutcome::SpawnFailed {
            message: e.to_string(),
        },
        // Dropping the wait future drops the child, which kills it.
        Err(_) => CommandOutcome::TimedOut { after: spec.timeout },
    }
}

fn tail(text: &str) -> String {
    let trimmed = text.trim();
    if trimmed.len() <= STDERR_TAIL {
        return trimmed.to_string();
    }
    let mut start = trimmed.len() - STDERR_TAIL;
    while !trimmed.is_char_boundary(start) {
        start += 1;
    }
    trimmed[start..].to_string()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str, timeout: Duration) -> CommandSpec {
        CommandSpec::new(
            "test",
            &["sh".to_string(), "-c".to_string(), script.to_string()],
            timeout,
        )
    }

    #[tokio::test]
    async fn success_and_failure() {
        let dir = tempfile::tempdir().unwrap();
        assert!(run_command(&sh("exit 0", Duration::from_secs(10)), dir.path())
            .await
            .is_success());

        let failed = run_command(&sh("echo boom >&2; exit 3", Duration::from_secs(10)), dir.path()).await;
        assert_eq!(
            failed,
            CommandOutcome::Failed {
                code: Some(3),
                stderr_tail: "boom".into()
            }
        );
    }

    #[tokio::test]
    async fn runs_in_repo_root() {
        let dir = tempfile::tempdir().unwrap();
        run_command(&sh("touch marker", Duration::from_secs(10)), dir.path()).await;
        assert!(dir.path().join("marker").exists());
    }

    #[tokio::test]
    async fn slow_command_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let outcome = run_command(&sh("sleep 5", Duration::from_millis(200)), dir.path()).await;
        assert!(matches!(outcome, CommandOutcome::TimedOut { .. }));
    }

    #[tokio::test]
    async fn missing_program_fails_to_spawn() {
        let dir = tempfile::tempdir().unwrap();
        let spec = CommandSpec::new("x", &["bin/not-there".to_string()], Duration::from_secs(1));
        assert!(matches!(
            run_command(&spec, dir.path()).await,
            CommandOutcome::SpawnFailed { .. }
        ));
    }

    #[test]
    fn tail_keeps_end() {
        let long = "x".repeat(STDERR_TAIL + 10) + "END";
        assert!(tail(&long).ends_with("END"));
        assert_eq!(tail(&long).len(), STDERR_TAIL);
    }
}

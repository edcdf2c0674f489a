//! Run-level error taxonomy and process exit codes.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Clean run.
pub const EXIT_DONE: i32 = 0;
/// A run that started and then failed.
pub const EXIT_FAILED: i32 = 1;
/// Nothing was changed: the run stopped in preflight.
pub const EXIT_PREFLIGHT: i32 = 3;
/// All hard gates passed but the UI smoke check did not.
pub const EXIT_UI_DEGRADED: i32 = 4;

/// Where a failure happened, which decides the exit path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStage {
    /// Before the lock was taken; no run state was written.
    Preflight,
    /// After the lock was taken; partial artifacts may exist.
    MidRun,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    RepoCheckFailed,
    VersionTooOld,
    ConfigInvalid,
    UniverseInvalid,
    PolicyInvalid,
    DiskLow,
    CredentialMissing,
    InvalidApiKey,
    RateLimitAlreadyHit,
    ProviderProbeFailed,
    AlreadyRunning,
    LockIo,
    StatusWrite,
    BarsFailureRate,
    AuthRepeated,
    DiskWrite,
    ForecastFailed,
    ValidationFailed,
    Internal,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::RepoCheckFailed => "REPO_CHECK_FAILED",
            ErrorCode::VersionTooOld => "VERSION_TOO_OLD",
            ErrorCode::ConfigInvalid => "CONFIG_INVALID",
            ErrorCode::UniverseInvalid => "UNIVERSE_INVALID",
            ErrorCode::PolicyInvalid => "POLICY_INVALID",
            ErrorCode::DiskLow => "DISK_LOW",
            ErrorCode::CredentialMissing => "CREDENTIAL_MISSING",
            ErrorCode::InvalidApiKey => "INVALID_API_KEY",
            ErrorCode::RateLimitAlreadyHit => "RATE_LIMIT_ALREADY_HIT",
            ErrorCode::ProviderProbeFailed => "PROVIDER_PROBE_FAILED",
            ErrorCode::AlreadyRunning => "ALREADY_RUNNING",
            ErrorCode::LockIo => "LOCK_IO",
            ErrorCode::StatusWrite => "STATUS_WRITE",
            ErrorCode::BarsFailureRate => "BARS_FAILURE_RATE",
            ErrorCode::AuthRepeated => "AUTH_REPEATED",
            ErrorCode::DiskWrite => "DISK_WRITE",
            ErrorCode::ForecastFailed => "FORECAST_FAILED",
            ErrorCode::ValidationFailed => "VALIDATION_FAILED",
            ErrorCode::Internal => "INTERNAL",
        }
    }

    pub fn stage(&self) -> RunStage {
        match self {
            ErrorCode::RepoCheckFailed
            | ErrorCode::VersionTooOld
            | ErrorCode::ConfigInvalid
            | ErrorCode::UniverseInvalid
            | ErrorCode::PolicyInvalid
            | ErrorCode::DiskLow
            | ErrorCode::CredentialMissing
            | ErrorCode::InvalidApiKey
            | ErrorCode::RateLimitAlreadyHit
            | ErrorCode::ProviderProbeFailed
            | ErrorCode::AlreadyRunning
            | ErrorCode::LockIo
            | ErrorCode::StatusWrite => RunStage::Preflight,
            ErrorCode::BarsFailureRate
            | ErrorCode::AuthRepeated
            | ErrorCode::DiskWrite
            | ErrorCode::ForecastFailed
            | ErrorCode::ValidationFailed
            | ErrorCode::Internal => RunStage::MidRun,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tagged run failure: `{code, message, details}`.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("{code}: {message}")]
pub struct RunError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub details: serde_json::Value,
}

impl RunError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: serde_json::Value::Null,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }

    pub fn stage(&self) -> RunStage {
        self.code.stage()
    }

    pub fn exit_code(&self) -> i32 {
        match self.stage() {
            RunStage::Preflight => EXIT_PREFLIGHT,
            RunStage::MidRun => EXIT_FAILED,
        }
    }
}

/// Termination signals the run reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TerminationSignal {
    Interrupt,
    Terminate,
    Hangup,
}

impl TerminationSignal {
    pub fn name(&self) -> &'static str {
        match self {
            TerminationSignal::Interrupt => "SIGINT",
            TerminationSignal::Terminate => "SIGTERM",
            TerminationSignal::Hangup => "SIGHUP",
        }
    }

    /// `128 + signo`.
    pub fn exit_code(&self) -> i32 {
        match self {
            TerminationSignal::Interrupt => 130,
            TerminationSignal::Terminate => 143,
            TerminationSignal::Hangup => 129,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preflight_codes_exit_three() {
        assert_eq!(RunError::new(ErrorCode::AlreadyRunning, "x").exit_code(), EXIT_PREFLIGHT);
        assert_eq!(RunError::new(ErrorCode::InvalidApiKey, "x").exit_code(), EXIT_PREFLIGHT);
        assert_eq!(RunError::new(ErrorCode::BarsFailureRate, "x").exit_code(), EXIT_FAILED);
    }

    #[test]
    fn code_serializes_screaming_snake() {
        let err = RunError::new(ErrorCode::RateLimitAlreadyHit, "slow down");
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["code"], "RATE_LIMIT_ALREADY_HIT");
        assert!(json.get("details").is_none());
        assert_eq!(err.to_string(), "RATE_LIMIT_ALREADY_HIT: slow down");
    }

    #[test]
    fn signal_exit_codes() {
        assert_eq!(TerminationSignal::Interrupt.exit_code(), 130);
        assert_eq!(TerminationSignal::Terminate.exit_code(), 143);
        assert_eq!(TerminationSignal::Hangup.exit_code(), 129);
    }
}

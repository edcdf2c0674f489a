//! Overnight runner: orchestration of the nightly market-data pipeline.
//!
//! This crate builds on `overnight-core` to provide:
//! - Preflight checks with an evidence file on every run
//! - A single-instance PID lock with stale-lock recovery
//! - A token-bucket limiter shared by the bars workers
//! - Failure classification with bounded retry and backoff
//! - Checkpoints keyed by freshness, policy hash and input digest
//! - A serialized status/event recorder with heartbeat
//! - The BARS → TRAIN_TICKER → TRAIN_GLOBAL → FORECAST phases
//! - A finalizer that always writes a summary and releases the lock

pub mod checkpoint;
pub mod classify;
pub mod config;
pub mod error;
pub mod external;
pub mod finalize;
pub mod limiter;
pub mod lock;
pub mod metrics;
pub mod orchestrator;
pub mod phases;
pub mod preflight;
pub mod recorder;

pub use checkpoint::{
    classify_freshness, BarsCheckpoint, BarsMode, CheckpointStore, Freshness, GlobalCheckpoint,
    RedoReason, ReuseMode, TrainCheckpoint,
};
pub use classify::{classify, ErrorClass, FailureSignal, RetryDecision, RetryPolicy};
pub use config::{
    ConfigError, LimiterOverrides, OvernightConfig, PhaseKind, RunOptions, RunPaths,
    DEFAULT_CONFIG_FILE,
};
pub use error::{ErrorCode, RunError, RunStage, TerminationSignal};
pub use external::{run_command, CommandOutcome, CommandSpec};
pub use finalize::{RunOutcome, RunReport, Verdict};
pub use limiter::{Permit, TokenBucket};
pub use lock::{LockError, LockGuard, LockManager, LockRecord};
pub use metrics::{RequestMeter, RequestStats};
pub use orchestrator::{new_run_id, termination_signal, Orchestrator};
pub use phases::{PhaseReports, RunContext};
pub use preflight::{run_preflight, PreflightEvidence, PreflightOutcome};
pub use recorder::{EventRecord, Phase, Recorder, StatusDocument, UiStatus};

//! Status snapshot and event stream.
//!
//! Callers mutate the in-memory [`StatusDocument`] under a mutex; every
//! mutation bumps `sequence_id` and hands a snapshot to a single writer task
//! over a channel, so disk writes happen in submission order and never
//! overlap. Events go through the same channel, which keeps the NDJSON log in
//! the order events were emitted. A heartbeat task re-persists the status on a
//! fixed interval so a monitor can tell "stalled" from "still running".

use crate::metrics::RequestStats;
use chrono::{DateTime, Utc};
use overnight_core::atomic::atomic_write_json;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

pub const STATUS_SCHEMA: &str = "overnight_status_v1";

// ── Document types ───────────────────────────────────────────────────

/// Run phase. Moves only forward; `Done` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    PreflightOk,
    BarsRunning,
    BarsDone,
    TrainTickerRunning,
    TrainTickerDone,
    TrainGlobalRunning,
    TrainGlobalDone,
    ForecastRunning,
    ForecastDone,
    Done,
    Failed,
}

impl Phase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Done | Phase::Failed)
    }

    /// Forward jumps are allowed (unselected phases are skipped).
    pub fn can_advance_to(&self, next: Phase) -> bool {
        !self.is_terminal() && next > *self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UiStatus {
    Unknown,
    Ok,
    Degraded,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    pub bars_done: usize,
    pub bars_failed: usize,
    pub bars_skipped: usize,
    pub train_done: usize,
    pub train_failed: usize,
    pub train_skipped: usize,
    pub global_done: bool,
}

/// One per-unit or phase-level failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
    pub stage: String,
    pub class: String,
    pub error: String,
    pub ts: DateTime<Utc>,
}

impl FailureRecord {
    pub fn new(symbol: Option<&str>, stage: &str, class: &str, error: impl Into<String>) -> Self {
        Self {
            symbol: symbol.map(str::to_string),
            stage: stage.to_string(),
            class: class.to_string(),
            error: error.into(),
            ts: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusDocument {
    pub schema: String,
    pub run_id: String,
    pub head_sha: String,
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub sequence_id: u64,
    pub phase: Phase,
    pub resume: bool,
    pub force: bool,
    pub phases: Vec<String>,
    pub universe_count: usize,
    pub progress: Progress,
    pub warnings: Vec<String>,
    pub failures: Vec<FailureRecord>,
    pub request_stats: RequestStats,
    pub rate_limit: BTreeMap<String, String>,
    pub ui_status: UiStatus,
    pub verdict: Option<String>,
}

impl StatusDocument {
    pub fn new(run_id: &str, head_sha: &str, started_at: DateTime<Utc>) -> Self {
        Self {
            schema: STATUS_SCHEMA.into(),
            run_id: run_id.to_string(),
            head_sha: head_sha.to_string(),
            pid: std::process::id(),
            started_at,
            updated_at: started_at,
            ended_at: None,
            last_heartbeat: None,
            sequence_id: 0,
            phase: Phase::PreflightOk,
            resume: true,
            force: false,
            phases: Vec::new(),
            universe_count: 0,
            progress: Progress::default(),
            warnings: Vec::new(),
            failures: Vec::new(),
            request_stats: RequestStats::default(),
            rate_limit: BTreeMap::new(),
            ui_status: UiStatus::Unknown,
            verdict: None,
        }
    }
}

/// One line of the event stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub ts: DateTime<Utc>,
    pub run_id: String,
    pub event: String,
    pub payload: serde_json::Value,
}

// ── Recorder ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct RecorderPaths {
    pub status: PathBuf,
    pub events: PathBuf,
}

enum WriteOp {
    Status(Box<StatusDocument>),
    Event(String),
    Flush(oneshot::Sender<()>),
}

struct Inner {
    run_id: String,
    status: Mutex<StatusDocument>,
    tx: mpsc::UnboundedSender<WriteOp>,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
    write_errors: Arc<AtomicU64>,
}

/// Handle to the run's status document and event stream. Cheap to clone.
#[derive(Clone)]
pub struct Recorder {
    inner: Arc<Inner>,
}

impl Recorder {
    /// Persist the initial document synchronously, then start the writer task.
    ///
    /// Must be called inside a tokio runtime.
    pub fn start(paths: RecorderPaths, mut initial: StatusDocument) -> io::Result<Self> {
        initial.sequence_id = 1;
        initial.updated_at = Utc::now();
        atomic_write_json(&paths.status, &initial)?;
        if let Some(parent) = paths.events.parent() {
            fs::create_dir_all(parent)?;
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let write_errors = Arc::new(AtomicU64::new(0));
        tokio::spawn(writer_loop(rx, paths, Arc::clone(&write_errors)));

        Ok(Self {
            inner: Arc::new(Inner {
                run_id: initial.run_id.clone(),
                status: Mutex::new(initial),
                tx,
                heartbeat: Mutex::new(None),
                write_errors,
            }),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StatusDocument> {
        self.inner.status.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Mutate the document and queue a snapshot.
    pub fn update<F: FnOnce(&mut StatusDocument)>(&self, f: F) {
        let mut doc = self.lock();
        f(&mut doc);
        doc.sequence_id += 1;
        doc.updated_at = Utc::now();
        // Sent under the lock so queue order matches sequence order.
        if self.inner.tx.send(WriteOp::Status(Box::new(doc.clone()))).is_err() {
            tracing::error!("status writer is gone; snapshot dropped");
        }
    }

    /// Re-persist without a logical change.
    pub fn persist(&self) {
        self.update(|_| {});
    }

    /// Move to `phase` if that is a forward move. Returns whether it moved.
    pub fn set_phase(&self, phase: Phase) -> bool {
        let mut moved = false;
        self.update(|doc| {
            if doc.phase.can_advance_to(phase) {
                doc.phase = phase;
                moved = true;
            } else {
                tracing::warn!(from = ?doc.phase, to = ?phase, "rejected phase transition");
            }
        });
        if moved {
            self.event("PHASE", serde_json::json!({ "phase": phase }));
        }
        moved
    }

    /// Add a warning code once.
    pub fn add_warning(&self, code: &str) {
        self.update(|doc| {
            if !doc.warnings.iter().any(|w| w == code) {
                doc.warnings.push(code.to_string());
            }
        });
    }

    pub fn add_failure(&self, failure: FailureRecord) {
        self.update(|doc| doc.failures.push(failure));
    }

    /// Append one event to the stream.
    pub fn event(&self, event: &str, payload: serde_json::Value) {
        let record = EventRecord {
            ts: Utc::now(),
            run_id: self.inner.run_id.clone(),
            event: event.to_string(),
            payload,
        };
        match serde_json::to_string(&record) {
            Ok(line) => {
                if self.inner.tx.send(WriteOp::Event(line)).is_err() {
                    tracing::error!(event, "event writer is gone; event dropped");
                }
            }
            Err(e) => tracing::error!(event, error = %e, "event not serializable"),
        }
    }

    pub fn snapshot(&self) -> StatusDocument {
        self.lock().clone()
    }

    /// Wait until everything queued so far is on disk.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.inner.tx.send(WriteOp::Flush(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    /// Writes that failed since start.
    pub fn write_errors(&self) -> u64 {
        self.inner.write_errors.load(Ordering::Relaxed)
    }

    pub fn start_heartbeat(&self, every: Duration) {
        self.stop_heartbeat();
        let recorder = self.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
            loop {
                ticker.tick().await;
                recorder.update(|doc| doc.last_heartbeat = Some(Utc::now()));
                tracing::debug!("heartbeat");
            }
        });
        *self.inner.heartbeat.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
    }

    pub fn stop_heartbeat(&self) {
        let handle = self
            .inner
            .heartbeat
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(h) = handle {
            h.abort();
        }
    }
}

async fn writer_loop(
    mut rx: mpsc::UnboundedReceiver<WriteOp>,
    paths: RecorderPaths,
    errors: Arc<AtomicU64>,
) {
    let mut events: Option<File> = None;
    while let Some(op) = rx.recv().await {
        match op {
            WriteOp::Status(doc) => {
                if let Err(e) = atomic_write_json(&paths.status, doc.as_ref()) {
                    errors.fetch_add(1, Ordering::Relaxed);
                    tracing::error!(path = %paths.status.display(), error = %e, "status write failed");
                }
            }
            WriteOp::Event(line) => {
                if let Err(e) = append_line(&mut events, &paths.events, &line) {
                    events = None;
                    errors.fetch_add(1, Ordering::Relaxed);
                    tracing::error!(path = %paths.events.display(), error = %e, "event append failed");
                }
            }
            WriteOp::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
}

fn append_line(file: &mut Option<File>, path: &std::path::Path, line: &str) -> io::Result<()> {
    if file.is_none() {
        *file = Some(OpenOptions::new().create(true).append(true).open(path)?);
    }
    match file.as_mut() {
        Some(f) => {
            let mut buf = Vec::with_capacity(line.len() + 1);
            buf.extend_from_slice(line.as_bytes());
            buf.push(b'\n');
            f.write_all(&buf)
        }
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paths(dir: &std::path::Path) -> RecorderPaths {
        RecorderPaths {
            status: dir.join("ops/status.json"),
            events: dir.join("ops/events.ndjson"),
        }
    }

    fn read_status(p: &RecorderPaths) -> StatusDocument {
        serde_json::from_str(&fs::read_to_string(&p.status).unwrap()).unwrap()
    }

    #[test]
    fn phase_moves_forward_only() {
        assert!(Phase::PreflightOk.can_advance_to(Phase::BarsRunning));
        assert!(Phase::BarsDone.can_advance_to(Phase::ForecastRunning));
        assert!(!Phase::TrainTickerDone.can_advance_to(Phase::BarsRunning));
        assert!(Phase::BarsRunning.can_advance_to(Phase::Failed));
        assert!(!Phase::Done.can_advance_to(Phase::Failed));
        assert!(!Phase::Failed.can_advance_to(Phase::Done));
    }

    #[tokio::test]
    async fn writes_in_sequence_order() {
        let dir = tempfile::tempdir().unwrap();
        let p = paths(dir.path());
        let rec = Recorder::start(p.clone(), StatusDocument::new("r1", "sha", Utc::now())).unwrap();
        assert_eq!(read_status(&p).sequence_id, 1);

        rec.set_phase(Phase::BarsRunning);
        rec.update(|d| d.progress.bars_done = 7);
        rec.add_warning("GIT_DIRTY");
        rec.add_warning("GIT_DIRTY");
        rec.flush().await;

        // Every update persists, including the no-op duplicate warning.
        let doc = read_status(&p);
        assert_eq!(doc.sequence_id, 5);
        assert_eq!(doc.phase, Phase::BarsRunning);
        assert_eq!(doc.progress.bars_done, 7);
        assert_eq!(doc.warnings, vec!["GIT_DIRTY".to_string()]);
        assert_eq!(doc.schema, STATUS_SCHEMA);
    }

    #[tokio::test]
    async fn backward_phase_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let rec = Recorder::start(paths(dir.path()), StatusDocument::new("r1", "sha", Utc::now())).unwrap();
        assert!(rec.set_phase(Phase::TrainTickerRunning));
        assert!(!rec.set_phase(Phase::BarsRunning));
        assert_eq!(rec.snapshot().phase, Phase::TrainTickerRunning);
    }

    #[tokio::test]
    async fn events_keep_emission_order() {
        let dir = tempfile::tempdir().unwrap();
        let p = paths(dir.path());
        let rec = Recorder::start(p.clone(), StatusDocument::new("r1", "sha", Utc::now())).unwrap();

        let mut tasks = Vec::new();
        for i in 0..20 {
            rec.event("TICK", serde_json::json!({ "i": i }));
            let r = rec.clone();
            tasks.push(tokio::spawn(async move { r.persist() }));
        }
        for t in tasks {
            t.await.unwrap();
        }
        rec.flush().await;

        let lines: Vec<EventRecord> = fs::read_to_string(&p.events)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        let order: Vec<i64> = lines.iter().map(|e| e.payload["i"].as_i64().unwrap()).collect();
        assert_eq!(order, (0..20).collect::<Vec<i64>>());
        assert!(lines.iter().all(|e| e.run_id == "r1"));
        assert_eq!(read_status(&p).sequence_id, 21);
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_repersists() {
        let dir = tempfile::tempdir().unwrap();
        let p = paths(dir.path());
        let rec = Recorder::start(p.clone(), StatusDocument::new("r1", "sha", Utc::now())).unwrap();
        rec.start_heartbeat(Duration::from_secs(300));

        tokio::time::sleep(Duration::from_secs(601)).await;
        rec.stop_heartbeat();
        rec.flush().await;

        let doc = read_status(&p);
        assert_eq!(doc.sequence_id, 3);
        assert!(doc.last_heartbeat.is_some());
    }
}

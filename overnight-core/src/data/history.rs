//! Bar history store with one JSON file per symbol.
//!
//! Layout: `{bars_dir}/{SYMBOL}.json`, a JSON array of [`Bar`]s sorted by date.
//!
//! - Atomic writes (temp file + rename), so a crash mid-write never leaves a
//!   truncated history behind
//! - Unparseable files are reported as corrupt and treated by callers as
//!   missing history
//! - Writes are sorted and de-duplicated by date before they hit disk

use crate::atomic::atomic_write_json;
use crate::domain::{merge_bars, Bar};
use chrono::NaiveDate;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("no history for '{symbol}'")]
    NotFound { symbol: String },

    #[error("corrupt history file {path}: {reason}")]
    Corrupt { path: String, reason: String },

    #[error("history I/O on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
}

impl HistoryError {
    /// Underlying OS error, if any (used for disk-full classification).
    pub fn io_error(&self) -> Option<&io::Error> {
        match self {
            HistoryError::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// What is known about a symbol's local history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HistoryState {
    /// No file, an empty array, or an unreadable file.
    Missing,
    Present {
        first_date: NaiveDate,
        last_date: NaiveDate,
        bar_count: usize,
    },
}

impl HistoryState {
    pub fn last_date(&self) -> Option<NaiveDate> {
        match self {
            HistoryState::Missing => None,
            HistoryState::Present { last_date, .. } => Some(*last_date),
        }
    }
}

/// Per-symbol bar history on disk.
#[derive(Debug, Clone)]
pub struct BarHistoryStore {
    bars_dir: PathBuf,
}

impl BarHistoryStore {
    pub fn new(bars_dir: impl Into<PathBuf>) -> Self {
        Self {
            bars_dir: bars_dir.into(),
        }
    }

    pub fn bars_dir(&self) -> &Path {
        &self.bars_dir
    }

    /// Path to a symbol's history file.
    pub fn path(&self, symbol: &str) -> PathBuf {
        self.bars_dir.join(format!("{symbol}.json"))
    }

    /// Load a symbol's history, sorted by date ascending.
    pub fn load(&self, symbol: &str) -> Result<Vec<Bar>, HistoryError> {
        let path = self.path(symbol);
        let content = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(HistoryError::NotFound {
                    symbol: symbol.to_string(),
                })
            }
            Err(e) => {
                return Err(HistoryError::Io {
                    path: path.display().to_string(),
                    source: e,
                })
            }
        };
        let mut bars: Vec<Bar> =
            serde_json::from_str(&content).map_err(|e| HistoryError::Corrupt {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;
        bars.sort_by_key(|b| b.date);
        Ok(bars)
    }

    /// Load, treating a missing or corrupt file as empty history.
    pub fn load_or_empty(&self, symbol: &str) -> Vec<Bar> {
        match self.load(symbol) {
            Ok(bars) => bars,
            Err(HistoryError::NotFound { .. }) => Vec::new(),
            Err(e) => {
                tracing::warn!(symbol, error = %e, "ignoring unreadable history");
                Vec::new()
            }
        }
    }

    /// Summarize a symbol's history without keeping the bars around.
    pub fn state(&self, symbol: &str) -> HistoryState {
        let bars = self.load_or_empty(symbol);
        match (bars.first(), bars.last()) {
            (Some(first), Some(last)) => HistoryState::Present {
                first_date: first.date,
                last_date: last.date,
                bar_count: bars.len(),
            },
            _ => HistoryState::Missing,
        }
    }

    /// Write a full history atomically. Bars are sorted and de-duplicated.
    pub fn write(&self, symbol: &str, bars: &[Bar]) -> Result<(), HistoryError> {
        let normalized = merge_bars(&[], bars);
        let path = self.path(symbol);
        atomic_write_json(&path, &normalized).map_err(|e| HistoryError::Io {
            path: path.display().to_string(),
            source: e,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bar(y: i32, m: u32, d: u32, close: f64) -> Bar {
        Bar {
            date: NaiveDate::from_ymd_opt(y, m, d).unwrap(),
            open: None,
            high: None,
            low: None,
            close,
            volume: None,
        }
    }

    #[test]
    fn write_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = BarHistoryStore::new(dir.path());

        store
            .write("SPY", &[bar(2026, 1, 5, 2.0), bar(2026, 1, 2, 1.0)])
            .unwrap();
        let loaded = store.load("SPY").unwrap();

        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].close, 1.0);
    }

    #[test]
    fn state_reports_missing_and_present() {
        let dir = tempfile::tempdir().unwrap();
        let store = BarHistoryStore::new(dir.path());
        assert_eq!(store.state("QQQ"), HistoryState::Missing);

        store.write("QQQ", &[bar(2026, 1, 2, 1.0), bar(2026, 1, 5, 2.0)]).unwrap();
        assert_eq!(
            store.state("QQQ"),
            HistoryState::Present {
                first_date: NaiveDate::from_ymd_opt(2026, 1, 2).unwrap(),
                last_date: NaiveDate::from_ymd_opt(2026, 1, 5).unwrap(),
                bar_count: 2,
            }
        );
    }

    #[test]
    fn corrupt_file_is_missing_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = BarHistoryStore::new(dir.path());
        fs::write(store.path("BAD"), "{not json").unwrap();

        assert!(matches!(store.load("BAD"), Err(HistoryError::Corrupt { .. })));
        assert_eq!(store.state("BAD"), HistoryState::Missing);
    }

    #[test]
    fn empty_array_is_missing_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = BarHistoryStore::new(dir.path());
        fs::write(store.path("NIL"), "[]").unwrap();
        assert_eq!(store.state("NIL"), HistoryState::Missing);
    }
}

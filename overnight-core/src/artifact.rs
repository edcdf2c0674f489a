//! Training artifacts and their on-disk store.
//!
//! Layout under the artifacts root:
//! - `ticker/{SYMBOL}.json`: one [`TickerArtifact`] per trained symbol
//! - `global.json`: the single [`GlobalArtifact`]
//!
//! Every artifact embeds the policy hash it was trained under.

use crate::atomic::atomic_write_json;
use crate::domain::{InputDigest, PolicyHash};
use crate::fingerprint::ArtifactSummary;
use crate::stats::{GlobalStats, TickerStats};
use chrono::{DateTime, NaiveDate, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const TICKER_ARTIFACT_SCHEMA: &str = "ticker_model_v1";
pub const GLOBAL_ARTIFACT_SCHEMA: &str = "global_model_v1";

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("artifact not found: {0}")]
    NotFound(String),

    #[error("corrupt artifact {path}: {reason}")]
    Corrupt { path: String, reason: String },

    #[error("artifact I/O on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
}

impl ArtifactError {
    pub fn io_error(&self) -> Option<&io::Error> {
        match self {
            ArtifactError::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Per-symbol model output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickerArtifact {
    pub schema: String,
    pub symbol: String,
    pub policy_hash: PolicyHash,
    /// Last bar date of the history the model was trained on.
    pub bars_last_date: NaiveDate,
    pub trained_at: DateTime<Utc>,
    pub stats: TickerStats,
}

impl TickerArtifact {
    pub fn new(symbol: &str, policy_hash: PolicyHash, stats: TickerStats, now: DateTime<Utc>) -> Self {
        Self {
            schema: TICKER_ARTIFACT_SCHEMA.into(),
            symbol: symbol.to_string(),
            policy_hash,
            bars_last_date: stats.last_date,
            trained_at: now,
            stats,
        }
    }

    pub fn summary(&self) -> ArtifactSummary {
        ArtifactSummary {
            symbol: self.symbol.clone(),
            last_date: self.bars_last_date,
            bar_count: self.stats.bar_count,
            mean_return: self.stats.mean_return,
            volatility: self.stats.volatility,
            drift: self.stats.drift,
            max_drawdown: self.stats.max_drawdown,
        }
    }
}

/// Cross-sectional model output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalArtifact {
    pub schema: String,
    pub policy_hash: PolicyHash,
    pub input_digest: InputDigest,
    pub trained_at: DateTime<Utc>,
    pub symbols: Vec<String>,
    pub stats: GlobalStats,
}

/// Filesystem store for training artifacts.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn ticker_dir(&self) -> PathBuf {
        self.root.join("ticker")
    }

    pub fn ticker_path(&self, symbol: &str) -> PathBuf {
        self.ticker_dir().join(format!("{symbol}.json"))
    }

    pub fn global_path(&self) -> PathBuf {
        self.root.join("global.json")
    }

    pub fn load_ticker(&self, symbol: &str) -> Result<TickerArtifact, ArtifactError> {
        read_json(&self.ticker_path(symbol))
    }

    pub fn write_ticker(&self, artifact: &TickerArtifact) -> Result<PathBuf, ArtifactError> {
        let path = self.ticker_path(&artifact.symbol);
        write_json(&path, artifact)?;
        Ok(path)
    }

    /// Every readable per-symbol artifact trained under `policy_hash`, sorted by symbol.
    ///
    /// Unreadable files and artifacts from other policies are skipped.
    pub fn tickers_for_policy(&self, policy_hash: &PolicyHash) -> Result<Vec<TickerArtifact>, ArtifactError> {
        let dir = self.ticker_dir();
        let entries = match fs::read_dir(&dir) {
            Ok(e) => e,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(ArtifactError::Io {
                    path: dir.display().to_string(),
                    source: e,
                })
            }
        };

        let mut artifacts = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match read_json::<TickerArtifact>(&path) {
                Ok(a) if &a.policy_hash == policy_hash => artifacts.push(a),
                Ok(_) => {}
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "skipping unreadable artifact"),
            }
        }
        artifacts.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        Ok(artifacts)
    }

    pub fn load_global(&self) -> Result<GlobalArtifact, ArtifactError> {
        read_json(&self.global_path())
    }

    pub fn write_global(&self, artifact: &GlobalArtifact) -> Result<PathBuf, ArtifactError> {
        let path = self.global_path();
        write_json(&path, artifact)?;
        Ok(path)
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, ArtifactError> {
    let content = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(ArtifactError::NotFound(path.display().to_string()))
        }
        Err(e) => {
            return Err(ArtifactError::Io {
                path: path.display().to_string(),
                source: e,
            })
        }
    };
    serde_json::from_str(&content).map_err(|e| ArtifactError::Corrupt {
        path: path.display().to_string(),
        reason: e.to_string(),
    })
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), ArtifactError> {
    atomic_write_json(path, value).map_err(|e| ArtifactError::Io {
        path: path.display().to_string(),
        source: e,
    })
}

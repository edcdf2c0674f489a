//! Training policy document.
//!
//! The policy is a JSON document whose raw-byte hash is the cache key for every
//! training artifact. Only a few fields parameterize the statistics; the rest
//! is carried along untouched but still participates in the hash.

use crate::domain::PolicyHash;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("policy document not found: {0}")]
    NotFound(String),

    #[error("read policy document: {0}")]
    Read(#[from] std::io::Error),

    #[error("parse policy document: {0}")]
    Parse(String),

    #[error("invalid policy: {0}")]
    Invalid(String),
}

/// Recognized policy parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingPolicy {
    /// Symbols with fewer bars are skipped, not failed.
    pub min_history_bars: usize,
    /// Trailing window of bars the statistics are computed over.
    pub lookback_bars: usize,
    /// Window for the short-horizon volatility estimate.
    pub vol_window: usize,
}

impl Default for TrainingPolicy {
    fn default() -> Self {
        Self {
            min_history_bars: 252,
            lookback_bars: 252,
            vol_window: 20,
        }
    }
}

/// A loaded policy together with its content hash.
#[derive(Debug, Clone)]
pub struct PolicyDocument {
    pub hash: PolicyHash,
    pub policy: TrainingPolicy,
}

impl PolicyDocument {
    pub fn from_file(path: &Path) -> Result<Self, PolicyError> {
        if !path.exists() {
            return Err(PolicyError::NotFound(path.display().to_string()));
        }
        let bytes = std::fs::read(path)?;
        Self::from_bytes(&bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, PolicyError> {
        let policy: TrainingPolicy =
            serde_json::from_slice(bytes).map_err(|e| PolicyError::Parse(e.to_string()))?;
        if policy.lookback_bars < 2 || policy.vol_window < 2 {
            return Err(PolicyError::Invalid(
                "lookback_bars and vol_window must be at least 2".into(),
            ));
        }
        Ok(Self {
            hash: PolicyHash::of_bytes(bytes),
            policy,
        })
    }
}

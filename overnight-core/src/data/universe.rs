//! Universe manifest: the list of symbols the overnight run covers.
//!
//! The manifest is a JSON array. Entries are either bare strings or objects
//! carrying a `ticker` or `symbol` field; any other fields are ignored.

use serde_json::Value;
use std::collections::BTreeSet;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum UniverseError {
    #[error("universe file not found: {0}")]
    NotFound(String),

    #[error("read universe file: {0}")]
    Read(#[from] std::io::Error),

    #[error("parse universe JSON: {0}")]
    Parse(String),

    #[error("universe must be a non-empty JSON array")]
    NotAnArray,

    #[error("universe has no valid symbols ({rejected} entries rejected)")]
    Empty { rejected: usize },
}

/// Validated, de-duplicated symbol list in manifest order.
#[derive(Debug, Clone, PartialEq)]
pub struct Universe {
    symbols: Vec<String>,
    rejected: Vec<String>,
}

impl Universe {
    /// Load a universe from a JSON manifest file.
    pub fn from_file(path: &Path) -> Result<Self, UniverseError> {
        if !path.exists() {
            return Err(UniverseError::NotFound(path.display().to_string()));
        }
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    /// Parse a universe from a JSON manifest string.
    pub fn from_json(content: &str) -> Result<Self, UniverseError> {
        let value: Value =
            serde_json::from_str(content).map_err(|e| UniverseError::Parse(e.to_string()))?;
        let entries = value.as_array().ok_or(UniverseError::NotAnArray)?;

        let mut seen = BTreeSet::new();
        let mut symbols = Vec::new();
        let mut rejected = Vec::new();
        for entry in entries {
            let raw = match entry {
                Value::String(s) => Some(s.as_str()),
                Value::Object(obj) => obj
                    .get("ticker")
                    .or_else(|| obj.get("symbol"))
                    .and_then(Value::as_str),
                _ => None,
            };
            match raw.map(normalize_symbol) {
                Some(Some(sym)) => {
                    if seen.insert(sym.clone()) {
                        symbols.push(sym);
                    }
                }
                _ => rejected.push(entry.to_string()),
            }
        }

        if symbols.is_empty() {
            return Err(UniverseError::Empty {
                rejected: rejected.len(),
            });
        }
        Ok(Self { symbols, rejected })
    }

    pub fn symbols(&self) -> &[String] {
        &self.symbols
    }

    /// Entries that were dropped as invalid, rendered as JSON.
    pub fn rejected(&self) -> &[String] {
        &self.rejected
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    /// First `n` symbols, for evidence and logs.
    pub fn sample(&self, n: usize) -> Vec<String> {
        self.symbols.iter().take(n).cloned().collect()
    }

    /// Restrict to `wanted`, preserving manifest order.
    ///
    /// Returns the filtered symbols and the requested symbols that are not in
    /// the universe.
    pub fn select(&self, wanted: &[String]) -> (Vec<String>, Vec<String>) {
        let wanted: BTreeSet<String> = wanted.iter().filter_map(|s| normalize_symbol(s)).collect();
        let selected: Vec<String> = self
            .symbols
            .iter()
            .filter(|s| wanted.contains(*s))
            .cloned()
            .collect();
        let unknown = wanted
            .into_iter()
            .filter(|w| !self.symbols.contains(w))
            .collect();
        (selected, unknown)
    }
}

/// Upper-case and validate a ticker: 1-15 chars of `A-Z 0-9 . - _`.
pub fn normalize_symbol(raw: &str) -> Option<String> {
    let sym = raw.trim().to_ascii_uppercase();
    let valid = !sym.is_empty()
        && sym.len() <= 15
        && sym
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'));
    valid.then_some(sym)
}

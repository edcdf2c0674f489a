//! Input fingerprinting for aggregate training.
//!
//! The global model is a function of the policy and of every per-symbol
//! artifact trained under it. [`global_input_digest`] hashes a canonical
//! rendering of that input set so a rerun can tell whether anything changed.

use crate::domain::{InputDigest, PolicyHash};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// The slice of a per-symbol artifact that feeds the global model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactSummary {
    pub symbol: String,
    pub last_date: NaiveDate,
    pub bar_count: usize,
    pub mean_return: f64,
    pub volatility: f64,
    pub drift: f64,
    pub max_drawdown: f64,
}

#[derive(Serialize)]
struct DigestInput<'a> {
    policy_hash: &'a PolicyHash,
    artifacts: Vec<&'a ArtifactSummary>,
}

/// BLAKE3 over canonical JSON of the policy hash and summaries sorted by symbol.
///
/// Order of `summaries` does not matter.
pub fn global_input_digest(policy_hash: &PolicyHash, summaries: &[ArtifactSummary]) -> InputDigest {
    let mut artifacts: Vec<&ArtifactSummary> = summaries.iter().collect();
    artifacts.sort_by(|a, b| a.symbol.cmp(&b.symbol));
    let input = DigestInput {
        policy_hash,
        artifacts,
    };
    // Plain structs with string/number fields always serialize.
    let json = serde_json::to_vec(&input).unwrap_or_default();
    InputDigest::from_hash(&blake3::hash(&json).to_hex())
}

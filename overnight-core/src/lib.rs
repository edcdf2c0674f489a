//! Overnight Core: data, domain types and deterministic training math.
//!
//! Everything the orchestrator acts on but nothing about how a run is sequenced:
//! - Domain types (bars, policy hashes, input digests)
//! - US trading calendar
//! - Provider client (EODHD) behind the [`data::BarProvider`] trait
//! - Per-symbol bar history and training artifact stores with atomic writes
//! - Training policy, per-symbol statistics and the global input digest

pub mod artifact;
pub mod atomic;
pub mod calendar;
pub mod data;
pub mod domain;
pub mod fingerprint;
pub mod policy;
pub mod stats;

//! Market data: provider client, bar history, universe manifest.

pub mod circuit_breaker;
pub mod eodhd;
pub mod history;
pub mod provider;
pub mod universe;

pub use circuit_breaker::CircuitBreaker;
pub use eodhd::{EodhdProvider, EodhdSettings};
pub use history::{BarHistoryStore, HistoryError, HistoryState};
pub use provider::{
    normalize_bars, BarProvider, FetchRequest, ProbeOutcome, ProviderError, RawBar, TransportKind,
};
pub use universe::{normalize_symbol, Universe, UniverseError};

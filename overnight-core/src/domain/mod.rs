//! Domain types shared by the data layer and the orchestrator.

pub mod bar;
pub mod ids;

pub use bar::{merge_bars, Bar};
pub use ids::{InputDigest, PolicyHash};

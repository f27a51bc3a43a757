//! Envreport core: pure environment lookup and document normalization.
mod document;
mod env;
mod outcome;

pub use document::{normalize, normalize_at, ResultDocument};
pub use env::{display_value, lookup_map, lookup_scalar, EnvironmentMap, NESTED_KEY};
pub use outcome::ProcessingOutcome;

//! Decaying per-project momentum score, trend and stalled classification.
//!
//! `score` holds the pure factor math; `engine` reads the activity log,
//! persists scores and snapshots, and flags stalled projects.

pub mod engine;
pub mod score;

pub use engine::{MomentumEngine, MomentumReport, ProjectMomentum};
pub use score::MomentumFactors;

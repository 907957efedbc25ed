//! Domain model for the structured store and its document mirror.
//!
//! # Responsibility
//! - Define canonical records used by reconciliation and momentum logic.
//! - Own validation rules that every repository write must respect.
//!
//! # Invariants
//! - Every project/task is identified by a stable UUID.
//! - Activity events are immutable once written.
//! - Sync baselines are only changed by the sync applier.

pub mod activity;
pub mod project;
pub mod sync;
pub mod task;

use std::error::Error;
use std::fmt::{Display, Formatter};

/// Validation failure raised before any persistence happens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// Title is blank after trim.
    EmptyTitle,
    /// Momentum score outside `[0, 1]` or not finite.
    ScoreOutOfRange(String),
    /// Task lifecycle fields disagree (`completed_at` without completed status).
    InconsistentCompletion,
    /// A tag is blank or not normalized.
    InvalidTag(String),
}

impl Display for ValidationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyTitle => write!(f, "title must not be blank"),
            Self::ScoreOutOfRange(value) => {
                write!(f, "momentum score must be within [0, 1], got {value}")
            }
            Self::InconsistentCompletion => {
                write!(f, "completed_at is only valid for completed tasks")
            }
            Self::InvalidTag(value) => write!(f, "invalid tag `{value}`"),
        }
    }
}

impl Error for ValidationError {}

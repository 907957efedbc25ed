//! Sync bookkeeping model: baselines, document records and audit entries.
//!
//! # Responsibility
//! - Describe the last mutually agreed state between store and document.
//! - Describe the audit trail left by conflict resolution.
//!
//! # Invariants
//! - A baseline is never the live value; it is what both sides agreed on at
//!   the end of the last successful apply.
//! - `pending` exists only between an apply commit and its promotion; when
//!   present it supersedes `baseline`.

use crate::model::activity::{EntityType, Origin};
use crate::model::project::{ProjectId, ProjectStatus};
use crate::model::task::MarkerId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

/// Logical state shared by a project row set and its document.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SyncSnapshot {
    pub title: Option<String>,
    pub status: Option<ProjectStatus>,
    pub tags: Vec<String>,
    /// Completion flag per task marker present in the document.
    pub tasks: BTreeMap<MarkerId, bool>,
}

/// One side of the journal: the agreed digest/version/state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Baseline {
    pub digest: String,
    pub version: i64,
    pub snapshot: SyncSnapshot,
    /// Highest activity event id observed when the baseline was taken.
    pub event_id: i64,
}

/// Per (project, document) reconciliation baseline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncState {
    pub project_uuid: ProjectId,
    pub document_path: String,
    pub baseline: Baseline,
    pub pending: Option<Baseline>,
    pub synced_at: i64,
}

impl SyncState {
    /// Baseline the detector must compare against.
    pub fn effective(&self) -> &Baseline {
        self.pending.as_ref().unwrap_or(&self.baseline)
    }
}

/// Last synchronized view of one document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub path: String,
    pub project_uuid: Option<ProjectId>,
    pub digest: String,
    pub marker_ids: BTreeSet<MarkerId>,
    pub synced_at: i64,
}

/// Field compared during reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncField {
    Title,
    Status,
    Tags,
    TaskCompletion,
}

impl SyncField {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Title => "title",
            Self::Status => "status",
            Self::Tags => "tags",
            Self::TaskCompletion => "task_completion",
        }
    }
}

/// Which policy rule decided a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionRule {
    /// The side with the most recent activity event won.
    MostRecentEvent,
    /// Both sides carry events with the same timestamp; store wins.
    TieStoreWins,
    /// Neither side has provenance; store wins.
    StoreFallback,
}

impl ResolutionRule {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MostRecentEvent => "most_recent_event",
            Self::TieStoreWins => "tie_store_wins",
            Self::StoreFallback => "store_fallback",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "most_recent_event" => Some(Self::MostRecentEvent),
            "tie_store_wins" => Some(Self::TieStoreWins),
            "store_fallback" => Some(Self::StoreFallback),
            _ => None,
        }
    }
}

/// Record of a discarded value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub project_uuid: ProjectId,
    pub entity_type: EntityType,
    pub entity_uuid: Uuid,
    pub field: SyncField,
    pub discarded_value: String,
    pub discarded_source: Origin,
    pub winning_value: String,
    pub winning_source: Origin,
    pub rule: ResolutionRule,
    pub decided_at: i64,
}

/// Text form used in audit entries and event values.
pub fn completion_value(completed: bool) -> &'static str {
    if completed {
        "completed"
    } else {
        "pending"
    }
}

/// Persisted content digest plus the cheap metadata used as a change hint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint {
    pub path: String,
    pub digest: String,
    pub size_bytes: u64,
    pub modified_ms: Option<i64>,
    pub observed_at: i64,
}

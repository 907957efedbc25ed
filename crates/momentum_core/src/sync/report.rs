//! Cycle reports handed to callers.
//!
//! Each cycle returns its own report; nothing here is shared between cycles.

use crate::model::project::ProjectId;
use crate::model::sync::AuditEntry;
use crate::sync::detector::ChangeClass;
use crate::sync::{SyncError, SyncErrorKind};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleMode {
    /// Classification only; nothing is written.
    Scan,
    Reconcile,
}

impl CycleMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Scan => "scan",
            Self::Reconcile => "reconcile",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleCounts {
    pub unchanged: usize,
    pub doc_changed: usize,
    pub store_changed: usize,
    pub conflicts_resolved: usize,
    pub errors: usize,
    pub skipped: usize,
}

/// What happened to one linked project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ProjectOutcome {
    Unchanged,
    /// Scan mode: what reconcile would do.
    Planned {
        store_writes: usize,
        document_write: bool,
    },
    Applied {
        store_writes: usize,
        document_written: bool,
    },
    Skipped {
        reason: String,
    },
    Failed {
        kind: SyncErrorKind,
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectReport {
    pub project_uuid: ProjectId,
    pub document_path: String,
    pub classification: Option<ChangeClass>,
    #[serde(flatten)]
    pub outcome: ProjectOutcome,
}

/// Something worth surfacing that did not fail a project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleWarning {
    pub path: Option<String>,
    pub project_uuid: Option<ProjectId>,
    pub message: String,
}

/// Unmanaged document seen during the scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredDocument {
    pub path: String,
    pub digest: String,
    pub task_markers: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleReport {
    pub cycle_id: Uuid,
    pub mode: CycleMode,
    pub started_at: i64,
    pub finished_at: i64,
    pub counts: CycleCounts,
    pub projects: Vec<ProjectReport>,
    pub audit: Vec<AuditEntry>,
    pub warnings: Vec<CycleWarning>,
    pub discovered: Vec<DiscoveredDocument>,
    /// Set when `StoreUnavailable` stopped the cycle early.
    pub aborted: Option<String>,
    pub cancelled: bool,
}

impl CycleReport {
    pub fn new(mode: CycleMode, started_at: i64) -> Self {
        Self {
            cycle_id: Uuid::new_v4(),
            mode,
            started_at,
            finished_at: started_at,
            counts: CycleCounts::default(),
            projects: Vec::new(),
            audit: Vec::new(),
            warnings: Vec::new(),
            discovered: Vec::new(),
            aborted: None,
            cancelled: false,
        }
    }

    pub fn project(&self, project_uuid: ProjectId) -> Option<&ProjectReport> {
        self.projects
            .iter()
            .find(|report| report.project_uuid == project_uuid)
    }

    pub fn warn(&mut self, path: Option<&str>, project_uuid: Option<ProjectId>, message: impl Into<String>) {
        self.warnings.push(CycleWarning {
            path: path.map(str::to_string),
            project_uuid,
            message: message.into(),
        });
    }

    /// Counts a classification that was carried through.
    pub(crate) fn record_class(&mut self, class: ChangeClass) {
        match class {
            ChangeClass::Unchanged => self.counts.unchanged += 1,
            ChangeClass::DocChanged => self.counts.doc_changed += 1,
            ChangeClass::StoreChanged => self.counts.store_changed += 1,
            ChangeClass::Conflict => self.counts.conflicts_resolved += 1,
        }
    }

    /// Records a per-project failure. Access denial counts as skipped.
    pub(crate) fn record_failure(
        &mut self,
        project_uuid: ProjectId,
        document_path: &str,
        classification: Option<ChangeClass>,
        error: &SyncError,
    ) {
        let outcome = match error {
            SyncError::ConcurrentAccessDenied { .. } => {
                self.counts.skipped += 1;
                ProjectOutcome::Skipped {
                    reason: error.to_string(),
                }
            }
            _ => {
                self.counts.errors += 1;
                ProjectOutcome::Failed {
                    kind: error.kind(),
                    message: error.to_string(),
                }
            }
        };
        self.projects.push(ProjectReport {
            project_uuid,
            document_path: document_path.to_string(),
            classification,
            outcome,
        });
    }

    pub(crate) fn record_skip(&mut self, project_uuid: ProjectId, document_path: &str, reason: &str) {
        self.counts.skipped += 1;
        self.projects.push(ProjectReport {
            project_uuid,
            document_path: document_path.to_string(),
            classification: None,
            outcome: ProjectOutcome::Skipped {
                reason: reason.to_string(),
            },
        });
    }
}

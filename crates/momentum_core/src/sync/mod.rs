//! Document ⇄ store reconciliation.
//!
//! # Responsibility
//! - Fingerprint and decode documents in parallel, classify each linked
//!   project against its baseline, resolve conflicts and apply the merged
//!   state to both sides.
//! - Report every cycle as a returned value; there is no global sync status.
//!
//! # Invariants
//! - A project's apply is all-or-nothing: store rows, events, audit rows and
//!   the pending baseline commit together, and only after the document write
//!   succeeded.
//! - `StoreUnavailable` aborts the cycle; every other error is confined to
//!   the project (or document) that raised it.

pub mod applier;
pub mod codec;
pub mod detector;
pub mod engine;
pub mod fingerprint;
pub mod lock;
pub mod report;
pub mod resolver;
pub mod scan;
pub mod scheduler;
pub mod source;

use crate::model::project::ProjectId;
use crate::repo::RepoError;
use codec::CodecError;
use serde::{Deserialize, Serialize};
use source::SourceError;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub type SyncResult<T> = Result<T, SyncError>;

/// Reconciliation failure taxonomy.
#[derive(Debug)]
pub enum SyncError {
    /// Header present but unparsable. Skipped this cycle, retried next cycle.
    MalformedDocument { path: String, source: CodecError },
    /// Document missing, locked, too large or timed out. Skips one project.
    DocumentUnavailable { path: String, source: SourceError },
    /// Provenance too ambiguous for the event rule. Always settled by the
    /// store-wins fallback and reported as a cycle warning, never returned.
    ConflictUnresolvable { project_uuid: ProjectId, reason: String },
    /// Store cannot be read or written. Aborts the whole cycle.
    StoreUnavailable(RepoError),
    /// Another cycle holds the project lock, or moved its baseline since
    /// the scan. Counted as skipped.
    ConcurrentAccessDenied { project_uuid: ProjectId },
    /// The named project is not in the store. Confined to that project.
    ProjectNotFound { project_uuid: ProjectId },
}

/// Serializable discriminant of [`SyncError`] for reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncErrorKind {
    MalformedDocument,
    DocumentUnavailable,
    ConflictUnresolvable,
    StoreUnavailable,
    ConcurrentAccessDenied,
    ProjectNotFound,
}

impl SyncError {
    pub fn kind(&self) -> SyncErrorKind {
        match self {
            Self::MalformedDocument { .. } => SyncErrorKind::MalformedDocument,
            Self::DocumentUnavailable { .. } => SyncErrorKind::DocumentUnavailable,
            Self::ConflictUnresolvable { .. } => SyncErrorKind::ConflictUnresolvable,
            Self::StoreUnavailable(_) => SyncErrorKind::StoreUnavailable,
            Self::ConcurrentAccessDenied { .. } => SyncErrorKind::ConcurrentAccessDenied,
            Self::ProjectNotFound { .. } => SyncErrorKind::ProjectNotFound,
        }
    }

    /// Whether the current cycle must stop.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_))
    }
}

impl Display for SyncError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MalformedDocument { path, source } => {
                write!(f, "malformed document `{path}`: {source}")
            }
            Self::DocumentUnavailable { path, source } => {
                write!(f, "document `{path}` unavailable: {source}")
            }
            Self::ConflictUnresolvable {
                project_uuid,
                reason,
            } => write!(f, "conflict in project {project_uuid} unresolvable: {reason}"),
            Self::StoreUnavailable(err) => write!(f, "store unavailable: {err}"),
            Self::ConcurrentAccessDenied { project_uuid } => {
                write!(f, "project {project_uuid} is locked by another cycle")
            }
            Self::ProjectNotFound { project_uuid } => {
                write!(f, "project {project_uuid} not found")
            }
        }
    }
}

impl Error for SyncError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::MalformedDocument { source, .. } => Some(source),
            Self::DocumentUnavailable { source, .. } => Some(source),
            Self::StoreUnavailable(err) => Some(err),
            Self::ConflictUnresolvable { .. }
            | Self::ConcurrentAccessDenied { .. }
            | Self::ProjectNotFound { .. } => None,
        }
    }
}

impl From<RepoError> for SyncError {
    fn from(value: RepoError) -> Self {
        Self::StoreUnavailable(value)
    }
}

impl SyncError {
    /// Maps a store error raised while looking up `project_uuid`, turning
    /// its `NotFound` into [`SyncError::ProjectNotFound`].
    pub fn from_project_lookup(project_uuid: ProjectId, err: RepoError) -> Self {
        match err {
            RepoError::NotFound(id) if id == project_uuid => Self::ProjectNotFound { project_uuid },
            other => Self::StoreUnavailable(other),
        }
    }
}

impl From<rusqlite::Error> for SyncError {
    fn from(value: rusqlite::Error) -> Self {
        Self::StoreUnavailable(RepoError::from(value))
    }
}

/// Cooperative cancellation flag shared between a cycle and its caller.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Re-arms the token for the next cycle.
    pub fn reset(&self) {
        self.cancelled.store(false, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

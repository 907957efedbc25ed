//! Activity event model.
//!
//! # Responsibility
//! - Define the append-only event record feeding momentum and provenance.
//!
//! # Invariants
//! - Events are immutable once written (enforced by schema triggers).
//! - `id` is assigned by storage and strictly increases with insertion order.

use crate::model::project::ProjectId;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Which record an event refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Project,
    Task,
}

impl EntityType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Project => "project",
            Self::Task => "task",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "project" => Some(Self::Project),
            "task" => Some(Self::Task),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    Created,
    Completed,
    Touched,
    StatusChanged,
}

impl ActivityKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Completed => "completed",
            Self::Touched => "touched",
            Self::StatusChanged => "status_changed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "created" => Some(Self::Created),
            "completed" => Some(Self::Completed),
            "touched" => Some(Self::Touched),
            "status_changed" => Some(Self::StatusChanged),
            _ => None,
        }
    }
}

/// Side of the sync boundary a change came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    Store,
    Document,
}

impl Origin {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Store => "store",
            Self::Document => "document",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "store" => Some(Self::Store),
            "document" => Some(Self::Document),
            _ => None,
        }
    }
}

/// Persisted activity event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityEvent {
    pub id: i64,
    pub entity_type: EntityType,
    pub entity_uuid: Uuid,
    /// Owning project, used for momentum and the stalled trigger.
    pub project_uuid: Option<ProjectId>,
    pub kind: ActivityKind,
    pub origin: Origin,
    /// Value the change produced, rendered as text (e.g. `completed`).
    pub value: Option<String>,
    pub occurred_at: i64,
}

/// Event to append; `id` is assigned on insert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewActivityEvent {
    pub entity_type: EntityType,
    pub entity_uuid: Uuid,
    pub project_uuid: Option<ProjectId>,
    pub kind: ActivityKind,
    pub origin: Origin,
    pub value: Option<String>,
    pub occurred_at: i64,
}

impl NewActivityEvent {
    pub fn task(
        task_uuid: Uuid,
        project_uuid: Option<ProjectId>,
        kind: ActivityKind,
        origin: Origin,
        value: Option<String>,
        occurred_at: i64,
    ) -> Self {
        Self {
            entity_type: EntityType::Task,
            entity_uuid: task_uuid,
            project_uuid,
            kind,
            origin,
            value,
            occurred_at,
        }
    }

    pub fn project(
        project_uuid: ProjectId,
        kind: ActivityKind,
        origin: Origin,
        value: Option<String>,
        occurred_at: i64,
    ) -> Self {
        Self {
            entity_type: EntityType::Project,
            entity_uuid: project_uuid,
            project_uuid: Some(project_uuid),
            kind,
            origin,
            value,
            occurred_at,
        }
    }
}

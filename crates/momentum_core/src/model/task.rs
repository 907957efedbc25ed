//! Task domain model.
//!
//! # Responsibility
//! - Define the task record and its lifecycle states.
//! - Expose the completion boolean used as the document-comparable value.
//!
//! # Invariants
//! - `marker_id` is stable and unique across all tasks; it ties a document
//!   line to this row.
//! - `completed_at` is set iff `status == Completed`.

use crate::model::project::ProjectId;
use crate::model::ValidationError;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stable identifier for tasks.
pub type TaskId = Uuid;

/// Stable identifier embedded in documents next to a task line.
pub type MarkerId = Uuid;

/// Task lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    /// Designated next action for its project.
    NextAction,
    InProgress,
    Completed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::NextAction => "next_action",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "next_action" => Some(Self::NextAction),
            "in_progress" => Some(Self::InProgress),
            "completed" => Some(Self::Completed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

/// Canonical task record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub uuid: TaskId,
    /// `None` means the task sits in the inbox.
    pub project_uuid: Option<ProjectId>,
    pub marker_id: MarkerId,
    pub title: String,
    pub status: TaskStatus,
    pub completed_at: Option<i64>,
    pub due_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Task {
    /// Creates a pending task with generated task and marker IDs.
    pub fn new(project_uuid: Option<ProjectId>, title: impl Into<String>, now_ms: i64) -> Self {
        Self::with_marker(project_uuid, Uuid::new_v4(), title, now_ms)
    }

    /// Creates a pending task bound to an existing document marker.
    pub fn with_marker(
        project_uuid: Option<ProjectId>,
        marker_id: MarkerId,
        title: impl Into<String>,
        now_ms: i64,
    ) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            project_uuid,
            marker_id,
            title: title.into(),
            status: TaskStatus::Pending,
            completed_at: None,
            due_at: None,
            created_at: now_ms,
            updated_at: now_ms,
        }
    }

    /// The value compared against a document checkbox.
    pub fn is_completed(&self) -> bool {
        self.status == TaskStatus::Completed
    }

    /// Moves the task to `status`, keeping `completed_at` consistent.
    pub fn set_status(&mut self, status: TaskStatus, now_ms: i64) {
        if status == TaskStatus::Completed && self.status != TaskStatus::Completed {
            self.completed_at = Some(now_ms);
        } else if status != TaskStatus::Completed {
            self.completed_at = None;
        }
        self.status = status;
        self.updated_at = now_ms;
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.title.trim().is_empty() {
            return Err(ValidationError::EmptyTitle);
        }
        if self.completed_at.is_some() != (self.status == TaskStatus::Completed) {
            return Err(ValidationError::InconsistentCompletion);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{Task, TaskStatus};

    #[test]
    fn set_status_tracks_completion_timestamp() {
        let mut task = Task::new(None, "water plants", 10);
        task.set_status(TaskStatus::Completed, 20);
        assert_eq!(task.completed_at, Some(20));
        assert!(task.validate().is_ok());

        task.set_status(TaskStatus::Pending, 30);
        assert_eq!(task.completed_at, None);
        assert!(task.validate().is_ok());
    }

    #[test]
    fn completing_twice_keeps_first_timestamp() {
        let mut task = Task::new(None, "file taxes", 0);
        task.set_status(TaskStatus::Completed, 5);
        task.set_status(TaskStatus::Completed, 9);
        assert_eq!(task.completed_at, Some(5));
    }
}

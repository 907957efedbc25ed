//! Store-side project/task use-cases.
//!
//! # Responsibility
//! - Offer the mutations callers make directly against the store.
//! - Append the matching `origin=store` activity event for every mutation.
//!
//! # Invariants
//! - Each mutation and its event commit in one transaction.
//! - A completion can refresh the project's momentum right away when the
//!   service was built with a momentum engine.

use crate::clock::Clock;
use crate::config::MomentumConfig;
use crate::db::{self, SharedConnection};
use crate::model::activity::{ActivityKind, NewActivityEvent, Origin};
use crate::model::project::{normalize_tags, Area, AreaId, Project, ProjectId, ProjectStatus};
use crate::model::task::{Task, TaskId, TaskStatus};
use crate::momentum::{MomentumEngine, ProjectMomentum};
use crate::repo::activity_repo::{ActivityRepository, SqliteActivityRepository};
use crate::repo::project_repo::{ProjectRepository, SqliteProjectRepository};
use crate::repo::task_repo::{SqliteTaskRepository, TaskRepository};
use crate::repo::RepoError;
use log::info;
use rusqlite::Connection;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::{Arc, MutexGuard};
use uuid::Uuid;

/// Service error for project/task use-cases.
#[derive(Debug)]
pub enum ProjectServiceError {
    ProjectNotFound(ProjectId),
    TaskNotFound(TaskId),
    /// Persistence-layer failure, including validation.
    Repo(RepoError),
}

impl Display for ProjectServiceError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ProjectNotFound(id) => write!(f, "project not found: {id}"),
            Self::TaskNotFound(id) => write!(f, "task not found: {id}"),
            Self::Repo(err) => write!(f, "{err}"),
        }
    }
}

impl Error for ProjectServiceError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Repo(err) => Some(err),
            _ => None,
        }
    }
}

impl From<RepoError> for ProjectServiceError {
    fn from(value: RepoError) -> Self {
        Self::Repo(value)
    }
}

impl From<rusqlite::Error> for ProjectServiceError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Repo(RepoError::from(value))
    }
}

pub type ProjectServiceResult<T> = Result<T, ProjectServiceError>;

/// Result of completing a task.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletedTask {
    pub task: Task,
    /// Fresh momentum for the owning project, when recomputed.
    pub momentum: Option<ProjectMomentum>,
}

pub struct ProjectService {
    store: SharedConnection,
    clock: Arc<dyn Clock>,
    momentum: Option<MomentumEngine>,
}

impl ProjectService {
    pub fn new(store: SharedConnection, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            momentum: None,
        }
    }

    /// Recomputes the owning project's momentum after every completion.
    pub fn with_momentum(mut self, config: MomentumConfig) -> Self {
        self.momentum = Some(MomentumEngine::new(config));
        self
    }

    pub fn create_area(&self, name: impl Into<String>) -> ProjectServiceResult<Area> {
        let area = Area {
            uuid: Uuid::new_v4(),
            name: name.into(),
            created_at: self.clock.now_ms(),
        };
        let conn = self.lock_store();
        SqliteProjectRepository::new(&conn).create_area(&area)?;
        Ok(area)
    }

    pub fn create_project(
        &self,
        title: impl Into<String>,
        area_uuid: Option<AreaId>,
        tags: &[&str],
    ) -> ProjectServiceResult<Project> {
        let now_ms = self.clock.now_ms();
        let mut project = Project::new(title, now_ms);
        project.area_uuid = area_uuid;
        project.tags = normalize_tags(tags);

        let mut conn = self.lock_store();
        let tx = conn.transaction()?;
        SqliteProjectRepository::new(&tx).create_project(&project)?;
        SqliteActivityRepository::new(&tx).append(&NewActivityEvent::project(
            project.uuid,
            ActivityKind::Created,
            Origin::Store,
            None,
            now_ms,
        ))?;
        let stored = read_project(&tx, project.uuid)?;
        tx.commit()?;
        info!(
            "event=project_create module=service status=ok project_uuid={}",
            project.uuid
        );
        Ok(stored)
    }

    pub fn set_project_status(
        &self,
        project_uuid: ProjectId,
        status: ProjectStatus,
    ) -> ProjectServiceResult<Project> {
        self.update_project(project_uuid, ActivityKind::StatusChanged, |project| {
            project.status = status;
            Some(status.as_str().to_string())
        })
    }

    pub fn rename_project(
        &self,
        project_uuid: ProjectId,
        title: impl Into<String>,
    ) -> ProjectServiceResult<Project> {
        let title = title.into();
        self.update_project(project_uuid, ActivityKind::Touched, move |project| {
            project.title = title;
            Some("title".to_string())
        })
    }

    pub fn set_project_tags(&self, project_uuid: ProjectId, tags: &[&str]) -> ProjectServiceResult<Project> {
        let tags = normalize_tags(tags);
        self.update_project(project_uuid, ActivityKind::Touched, move |project| {
            project.tags = tags;
            Some("tags".to_string())
        })
    }

    /// Creates a task, in a project or in the inbox.
    pub fn create_task(
        &self,
        project_uuid: Option<ProjectId>,
        title: impl Into<String>,
    ) -> ProjectServiceResult<Task> {
        let now_ms = self.clock.now_ms();
        let task = Task::new(project_uuid, title, now_ms);

        let mut conn = self.lock_store();
        let tx = conn.transaction()?;
        if let Some(project_uuid) = project_uuid {
            read_project(&tx, project_uuid)?;
        }
        SqliteTaskRepository::new(&tx).create_task(&task)?;
        SqliteActivityRepository::new(&tx).append(&NewActivityEvent::task(
            task.uuid,
            project_uuid,
            ActivityKind::Created,
            Origin::Store,
            None,
            now_ms,
        ))?;
        tx.commit()?;
        Ok(task)
    }

    pub fn set_task_status(&self, task_uuid: TaskId, status: TaskStatus) -> ProjectServiceResult<Task> {
        let mut conn = self.lock_store();
        self.write_task_status(&mut conn, task_uuid, status)
    }

    /// Marks a task as the project's designated next action.
    pub fn designate_next_action(&self, task_uuid: TaskId) -> ProjectServiceResult<Task> {
        self.set_task_status(task_uuid, TaskStatus::NextAction)
    }

    /// Completes a task and, when configured, refreshes its project's
    /// momentum in the same call.
    pub fn complete_task(&self, task_uuid: TaskId) -> ProjectServiceResult<CompletedTask> {
        let mut conn = self.lock_store();
        let task = self.write_task_status(&mut conn, task_uuid, TaskStatus::Completed)?;

        let momentum = match (&self.momentum, task.project_uuid) {
            (Some(engine), Some(project_uuid)) => engine
                .recompute(&mut conn, Some(project_uuid), self.clock.now_ms())?
                .project(project_uuid)
                .cloned(),
            _ => None,
        };
        Ok(CompletedTask { task, momentum })
    }

    pub fn get_project(&self, project_uuid: ProjectId) -> ProjectServiceResult<Project> {
        let conn = self.lock_store();
        read_project(&conn, project_uuid)
    }

    pub fn list_project_tasks(&self, project_uuid: ProjectId) -> ProjectServiceResult<Vec<Task>> {
        let conn = self.lock_store();
        Ok(SqliteTaskRepository::new(&conn).list_project_tasks(project_uuid)?)
    }

    fn update_project<F>(
        &self,
        project_uuid: ProjectId,
        kind: ActivityKind,
        change: F,
    ) -> ProjectServiceResult<Project>
    where
        F: FnOnce(&mut Project) -> Option<String>,
    {
        let now_ms = self.clock.now_ms();
        let mut conn = self.lock_store();
        let tx = conn.transaction()?;
        let projects = SqliteProjectRepository::new(&tx);

        let mut project = read_project(&tx, project_uuid)?;
        let value = change(&mut project);
        project.updated_at = now_ms;
        projects.update_project(&project)?;
        SqliteActivityRepository::new(&tx).append(&NewActivityEvent::project(
            project_uuid,
            kind,
            Origin::Store,
            value,
            now_ms,
        ))?;
        let stored = read_project(&tx, project_uuid)?;
        tx.commit()?;
        Ok(stored)
    }

    fn write_task_status(
        &self,
        conn: &mut Connection,
        task_uuid: TaskId,
        status: TaskStatus,
    ) -> ProjectServiceResult<Task> {
        let now_ms = self.clock.now_ms();
        let tx = conn.transaction()?;
        let tasks = SqliteTaskRepository::new(&tx);

        let mut task = tasks
            .get_task(task_uuid)?
            .ok_or(ProjectServiceError::TaskNotFound(task_uuid))?;
        task.set_status(status, now_ms);
        tasks.update_task(&task)?;

        let (kind, value) = if status == TaskStatus::Completed {
            (ActivityKind::Completed, None)
        } else {
            (ActivityKind::StatusChanged, Some(status.as_str().to_string()))
        };
        SqliteActivityRepository::new(&tx).append(&NewActivityEvent::task(
            task.uuid,
            task.project_uuid,
            kind,
            Origin::Store,
            value,
            now_ms,
        ))?;
        tx.commit()?;
        info!(
            "event=task_status module=service status=ok task_uuid={} task_status={}",
            task.uuid,
            status.as_str()
        );
        Ok(task)
    }

    fn lock_store(&self) -> MutexGuard<'_, Connection> {
        db::lock_store(&self.store)
    }
}

fn read_project(conn: &Connection, project_uuid: ProjectId) -> ProjectServiceResult<Project> {
    SqliteProjectRepository::new(conn)
        .get_project(project_uuid)?
        .ok_or(ProjectServiceError::ProjectNotFound(project_uuid))
}

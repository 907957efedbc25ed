//! Task repository contracts and SQLite implementation.
//!
//! # Responsibility
//! - Provide CRUD APIs over `tasks`, including lookup by document marker.
//!
//! # Invariants
//! - Write paths validate the task before SQL mutations.
//! - Project version bumps come from schema triggers, never from here.

use crate::model::project::ProjectId;
use crate::model::task::{MarkerId, Task, TaskId, TaskStatus};
use crate::repo::{parse_optional_uuid, parse_uuid, RepoError, RepoResult};
use rusqlite::{params, Connection, Row};

const TASK_SELECT_SQL: &str = "SELECT
    uuid,
    project_uuid,
    marker_id,
    title,
    status,
    completed_at,
    due_at,
    created_at,
    updated_at
FROM tasks";

/// Repository interface for task CRUD operations.
pub trait TaskRepository {
    fn create_task(&self, task: &Task) -> RepoResult<TaskId>;
    fn update_task(&self, task: &Task) -> RepoResult<()>;
    fn get_task(&self, id: TaskId) -> RepoResult<Option<Task>>;
    fn get_task_by_marker(&self, marker_id: MarkerId) -> RepoResult<Option<Task>>;
    /// Lists tasks of one project ordered by creation.
    fn list_project_tasks(&self, project_uuid: ProjectId) -> RepoResult<Vec<Task>>;
    /// Lists unlinked (inbox) tasks.
    fn list_inbox_tasks(&self) -> RepoResult<Vec<Task>>;
    /// Whether any task of the project is a designated next action.
    fn has_next_action(&self, project_uuid: ProjectId) -> RepoResult<bool>;
}

/// SQLite-backed task repository.
pub struct SqliteTaskRepository<'conn> {
    conn: &'conn Connection,
}

impl<'conn> SqliteTaskRepository<'conn> {
    pub fn new(conn: &'conn Connection) -> Self {
        Self { conn }
    }

    fn query_tasks(&self, sql: &str, param: Option<String>) -> RepoResult<Vec<Task>> {
        let mut stmt = self.conn.prepare(sql)?;
        let mut rows = match param {
            Some(value) => stmt.query([value])?,
            None => stmt.query([])?,
        };
        let mut tasks = Vec::new();
        while let Some(row) = rows.next()? {
            tasks.push(parse_task_row(row)?);
        }
        Ok(tasks)
    }
}

impl TaskRepository for SqliteTaskRepository<'_> {
    fn create_task(&self, task: &Task) -> RepoResult<TaskId> {
        task.validate()?;

        self.conn.execute(
            "INSERT INTO tasks (
                uuid,
                project_uuid,
                marker_id,
                title,
                status,
                completed_at,
                due_at,
                created_at,
                updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9);",
            params![
                task.uuid.to_string(),
                task.project_uuid.map(|id| id.to_string()),
                task.marker_id.to_string(),
                task.title.as_str(),
                task.status.as_str(),
                task.completed_at,
                task.due_at,
                task.created_at,
                task.updated_at,
            ],
        )?;

        Ok(task.uuid)
    }

    fn update_task(&self, task: &Task) -> RepoResult<()> {
        task.validate()?;

        let changed = self.conn.execute(
            "UPDATE tasks
             SET
                project_uuid = ?1,
                title = ?2,
                status = ?3,
                completed_at = ?4,
                due_at = ?5,
                updated_at = ?6
             WHERE uuid = ?7;",
            params![
                task.project_uuid.map(|id| id.to_string()),
                task.title.as_str(),
                task.status.as_str(),
                task.completed_at,
                task.due_at,
                task.updated_at,
                task.uuid.to_string(),
            ],
        )?;

        if changed == 0 {
            return Err(RepoError::NotFound(task.uuid));
        }
        Ok(())
    }

    fn get_task(&self, id: TaskId) -> RepoResult<Option<Task>> {
        let tasks = self.query_tasks(
            &format!("{TASK_SELECT_SQL} WHERE uuid = ?1;"),
            Some(id.to_string()),
        )?;
        Ok(tasks.into_iter().next())
    }

    fn get_task_by_marker(&self, marker_id: MarkerId) -> RepoResult<Option<Task>> {
        let tasks = self.query_tasks(
            &format!("{TASK_SELECT_SQL} WHERE marker_id = ?1;"),
            Some(marker_id.to_string()),
        )?;
        Ok(tasks.into_iter().next())
    }

    fn list_project_tasks(&self, project_uuid: ProjectId) -> RepoResult<Vec<Task>> {
        self.query_tasks(
            &format!("{TASK_SELECT_SQL} WHERE project_uuid = ?1 ORDER BY created_at ASC, uuid ASC;"),
            Some(project_uuid.to_string()),
        )
    }

    fn list_inbox_tasks(&self) -> RepoResult<Vec<Task>> {
        self.query_tasks(
            &format!("{TASK_SELECT_SQL} WHERE project_uuid IS NULL ORDER BY created_at ASC, uuid ASC;"),
            None,
        )
    }

    fn has_next_action(&self, project_uuid: ProjectId) -> RepoResult<bool> {
        let exists: i64 = self.conn.query_row(
            "SELECT EXISTS(
                SELECT 1
                FROM tasks
                WHERE project_uuid = ?1 AND status = ?2
            );",
            params![project_uuid.to_string(), TaskStatus::NextAction.as_str()],
            |row| row.get(0),
        )?;
        Ok(exists == 1)
    }
}

fn parse_task_row(row: &Row<'_>) -> RepoResult<Task> {
    let uuid_text: String = row.get("uuid")?;
    let marker_text: String = row.get("marker_id")?;
    let status_text: String = row.get("status")?;
    let status = TaskStatus::parse(&status_text).ok_or_else(|| {
        RepoError::InvalidData(format!("invalid task status `{status_text}` in tasks.status"))
    })?;

    let task = Task {
        uuid: parse_uuid(&uuid_text, "tasks.uuid")?,
        project_uuid: parse_optional_uuid(row.get("project_uuid")?, "tasks.project_uuid")?,
        marker_id: parse_uuid(&marker_text, "tasks.marker_id")?,
        title: row.get("title")?,
        status,
        completed_at: row.get("completed_at")?,
        due_at: row.get("due_at")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    };
    task.validate()?;
    Ok(task)
}

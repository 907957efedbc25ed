//! Project/area repository contracts and SQLite implementation.
//!
//! # Responsibility
//! - Provide CRUD APIs over `projects` and `areas`.
//! - Keep sync-owned and momentum-owned columns out of the generic update.
//!
//! # Invariants
//! - `update_project` never writes momentum columns, `version` or
//!   `last_activity_at`; those belong to triggers and the momentum engine.
//! - Read paths reject invalid persisted state instead of masking it.

use crate::model::project::{
    Area, AreaId, DocumentRef, MomentumTrend, Project, ProjectId, ProjectStatus,
};
use crate::repo::{from_json, parse_optional_uuid, parse_uuid, to_json, RepoError, RepoResult};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};

const PROJECT_SELECT_SQL: &str = "SELECT
    uuid,
    area_uuid,
    title,
    status,
    tags,
    version,
    momentum_score,
    momentum_trend,
    momentum_computed_at,
    last_activity_at,
    stalled_since,
    document_path,
    document_digest,
    reviewed_at,
    created_at,
    updated_at
FROM projects";

/// Query options for listing projects.
#[derive(Debug, Clone, Default)]
pub struct ProjectListQuery {
    pub status: Option<ProjectStatus>,
    pub area_uuid: Option<AreaId>,
    /// Only projects with a linked document.
    pub linked_only: bool,
    pub limit: Option<u32>,
}

/// Repository interface for project CRUD operations.
pub trait ProjectRepository {
    fn create_project(&self, project: &Project) -> RepoResult<ProjectId>;
    /// Writes user-editable fields: area, title, status, tags, review time.
    fn update_project(&self, project: &Project) -> RepoResult<()>;
    fn get_project(&self, id: ProjectId) -> RepoResult<Option<Project>>;
    fn list_projects(&self, query: &ProjectListQuery) -> RepoResult<Vec<Project>>;
    /// Records the document reference observed at the last successful sync.
    fn set_document_ref(&self, id: ProjectId, document: Option<&DocumentRef>) -> RepoResult<()>;
    fn create_area(&self, area: &Area) -> RepoResult<AreaId>;
    fn list_areas(&self) -> RepoResult<Vec<Area>>;
}

/// SQLite-backed project repository.
pub struct SqliteProjectRepository<'conn> {
    conn: &'conn Connection,
}

impl<'conn> SqliteProjectRepository<'conn> {
    pub fn new(conn: &'conn Connection) -> Self {
        Self { conn }
    }

    /// Current store version of one project.
    pub fn version(&self, id: ProjectId) -> RepoResult<i64> {
        self.conn
            .query_row(
                "SELECT version FROM projects WHERE uuid = ?1;",
                [id.to_string()],
                |row| row.get::<_, i64>(0),
            )
            .optional()?
            .ok_or(RepoError::NotFound(id))
    }
}

impl ProjectRepository for SqliteProjectRepository<'_> {
    fn create_project(&self, project: &Project) -> RepoResult<ProjectId> {
        project.validate()?;

        self.conn.execute(
            "INSERT INTO projects (
                uuid,
                area_uuid,
                title,
                status,
                tags,
                momentum_score,
                momentum_trend,
                document_path,
                document_digest,
                reviewed_at,
                created_at,
                updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12);",
            params![
                project.uuid.to_string(),
                project.area_uuid.map(|id| id.to_string()),
                project.title.as_str(),
                project.status.as_str(),
                to_json(&project.tags, "projects.tags")?,
                project.momentum_score,
                project.momentum_trend.as_str(),
                project.document.as_ref().map(|doc| doc.path.as_str()),
                project.document.as_ref().map(|doc| doc.digest.as_str()),
                project.reviewed_at,
                project.created_at,
                project.updated_at,
            ],
        )?;

        Ok(project.uuid)
    }

    fn update_project(&self, project: &Project) -> RepoResult<()> {
        project.validate()?;

        let changed = self.conn.execute(
            "UPDATE projects
             SET
                area_uuid = ?1,
                title = ?2,
                status = ?3,
                tags = ?4,
                reviewed_at = ?5,
                updated_at = ?6
             WHERE uuid = ?7;",
            params![
                project.area_uuid.map(|id| id.to_string()),
                project.title.as_str(),
                project.status.as_str(),
                to_json(&project.tags, "projects.tags")?,
                project.reviewed_at,
                project.updated_at,
                project.uuid.to_string(),
            ],
        )?;

        if changed == 0 {
            return Err(RepoError::NotFound(project.uuid));
        }

        Ok(())
    }

    fn get_project(&self, id: ProjectId) -> RepoResult<Option<Project>> {
        let mut stmt = self
            .conn
            .prepare(&format!("{PROJECT_SELECT_SQL} WHERE uuid = ?1;"))?;
        let mut rows = stmt.query([id.to_string()])?;
        if let Some(row) = rows.next()? {
            return Ok(Some(parse_project_row(row)?));
        }
        Ok(None)
    }

    fn list_projects(&self, query: &ProjectListQuery) -> RepoResult<Vec<Project>> {
        let mut sql = format!("{PROJECT_SELECT_SQL} WHERE 1 = 1");
        let mut bind_values: Vec<Value> = Vec::new();

        if let Some(status) = query.status {
            sql.push_str(" AND status = ?");
            bind_values.push(Value::Text(status.as_str().to_string()));
        }
        if let Some(area) = query.area_uuid {
            sql.push_str(" AND area_uuid = ?");
            bind_values.push(Value::Text(area.to_string()));
        }
        if query.linked_only {
            sql.push_str(" AND document_path IS NOT NULL");
        }

        sql.push_str(" ORDER BY created_at ASC, uuid ASC");

        if let Some(limit) = query.limit {
            sql.push_str(" LIMIT ?");
            bind_values.push(Value::Integer(i64::from(limit)));
        }

        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query(params_from_iter(bind_values))?;
        let mut projects = Vec::new();
        while let Some(row) = rows.next()? {
            projects.push(parse_project_row(row)?);
        }
        Ok(projects)
    }

    fn set_document_ref(&self, id: ProjectId, document: Option<&DocumentRef>) -> RepoResult<()> {
        let changed = self.conn.execute(
            "UPDATE projects
             SET document_path = ?1, document_digest = ?2
             WHERE uuid = ?3;",
            params![
                document.map(|doc| doc.path.as_str()),
                document.map(|doc| doc.digest.as_str()),
                id.to_string(),
            ],
        )?;
        if changed == 0 {
            return Err(RepoError::NotFound(id));
        }
        Ok(())
    }

    fn create_area(&self, area: &Area) -> RepoResult<AreaId> {
        if area.name.trim().is_empty() {
            return Err(RepoError::Validation(
                crate::model::ValidationError::EmptyTitle,
            ));
        }
        self.conn.execute(
            "INSERT INTO areas (uuid, name, created_at) VALUES (?1, ?2, ?3);",
            params![area.uuid.to_string(), area.name.as_str(), area.created_at],
        )?;
        Ok(area.uuid)
    }

    fn list_areas(&self) -> RepoResult<Vec<Area>> {
        let mut stmt = self
            .conn
            .prepare("SELECT uuid, name, created_at FROM areas ORDER BY name COLLATE NOCASE ASC;")?;
        let mut rows = stmt.query([])?;
        let mut areas = Vec::new();
        while let Some(row) = rows.next()? {
            let uuid_text: String = row.get("uuid")?;
            areas.push(Area {
                uuid: parse_uuid(&uuid_text, "areas.uuid")?,
                name: row.get("name")?,
                created_at: row.get("created_at")?,
            });
        }
        Ok(areas)
    }
}

fn parse_project_row(row: &Row<'_>) -> RepoResult<Project> {
    let uuid_text: String = row.get("uuid")?;
    let uuid = parse_uuid(&uuid_text, "projects.uuid")?;

    let status_text: String = row.get("status")?;
    let status = ProjectStatus::parse(&status_text).ok_or_else(|| {
        RepoError::InvalidData(format!(
            "invalid project status `{status_text}` in projects.status"
        ))
    })?;

    let trend_text: String = row.get("momentum_trend")?;
    let momentum_trend = MomentumTrend::parse(&trend_text).ok_or_else(|| {
        RepoError::InvalidData(format!(
            "invalid trend `{trend_text}` in projects.momentum_trend"
        ))
    })?;

    let tags_text: String = row.get("tags")?;
    let tags: Vec<String> = from_json(&tags_text, "projects.tags")?;

    let document = match (
        row.get::<_, Option<String>>("document_path")?,
        row.get::<_, Option<String>>("document_digest")?,
    ) {
        (Some(path), digest) => Some(DocumentRef {
            path,
            digest: digest.unwrap_or_default(),
        }),
        (None, _) => None,
    };

    let project = Project {
        uuid,
        area_uuid: parse_optional_uuid(row.get("area_uuid")?, "projects.area_uuid")?,
        title: row.get("title")?,
        status,
        tags,
        version: row.get("version")?,
        momentum_score: row.get("momentum_score")?,
        momentum_trend,
        momentum_computed_at: row.get("momentum_computed_at")?,
        last_activity_at: row.get("last_activity_at")?,
        stalled_since: row.get("stalled_since")?,
        document,
        reviewed_at: row.get("reviewed_at")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    };
    project.validate()?;
    Ok(project)
}

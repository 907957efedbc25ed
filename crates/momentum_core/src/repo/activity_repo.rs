//! Activity log repository.
//!
//! # Responsibility
//! - Append immutable activity events.
//! - Answer the provenance and windowed queries used by conflict resolution
//!   and momentum scoring.
//!
//! # Invariants
//! - There is no update or delete API; the schema rejects both anyway.
//! - Appending an event clears the owning project's stalled flag (trigger).

use crate::model::activity::{ActivityEvent, ActivityKind, EntityType, NewActivityEvent, Origin};
use crate::model::project::ProjectId;
use crate::repo::{parse_optional_uuid, parse_uuid, RepoError, RepoResult};
use rusqlite::{params, Connection, Row};
use uuid::Uuid;

const EVENT_SELECT_SQL: &str = "SELECT
    id,
    entity_type,
    entity_uuid,
    project_uuid,
    kind,
    origin,
    value,
    occurred_at
FROM activity_events";

/// Repository interface for the append-only activity log.
pub trait ActivityRepository {
    /// Appends one event and returns its storage id.
    fn append(&self, event: &NewActivityEvent) -> RepoResult<i64>;
    /// Highest event id written so far (0 when empty).
    fn latest_event_id(&self) -> RepoResult<i64>;
    /// Most recent event for one entity from one origin with `id > after_id`.
    fn latest_for_entity(
        &self,
        entity_uuid: Uuid,
        origin: Origin,
        after_id: i64,
    ) -> RepoResult<Option<ActivityEvent>>;
    /// Events of one project with `occurred_at > since_ms`, oldest first.
    fn list_project_events_since(
        &self,
        project_uuid: ProjectId,
        since_ms: i64,
    ) -> RepoResult<Vec<ActivityEvent>>;
    /// Highest event id recorded for one project (0 when none).
    fn latest_project_event_id(&self, project_uuid: ProjectId) -> RepoResult<i64>;
}

/// SQLite-backed activity repository.
pub struct SqliteActivityRepository<'conn> {
    conn: &'conn Connection,
}

impl<'conn> SqliteActivityRepository<'conn> {
    pub fn new(conn: &'conn Connection) -> Self {
        Self { conn }
    }
}

impl ActivityRepository for SqliteActivityRepository<'_> {
    fn append(&self, event: &NewActivityEvent) -> RepoResult<i64> {
        self.conn.execute(
            "INSERT INTO activity_events (
                entity_type,
                entity_uuid,
                project_uuid,
                kind,
                origin,
                value,
                occurred_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7);",
            params![
                event.entity_type.as_str(),
                event.entity_uuid.to_string(),
                event.project_uuid.map(|id| id.to_string()),
                event.kind.as_str(),
                event.origin.as_str(),
                event.value.as_deref(),
                event.occurred_at,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    fn latest_event_id(&self) -> RepoResult<i64> {
        let id: i64 = self.conn.query_row(
            "SELECT COALESCE(MAX(id), 0) FROM activity_events;",
            [],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    fn latest_for_entity(
        &self,
        entity_uuid: Uuid,
        origin: Origin,
        after_id: i64,
    ) -> RepoResult<Option<ActivityEvent>> {
        let mut stmt = self.conn.prepare(&format!(
            "{EVENT_SELECT_SQL}
             WHERE entity_uuid = ?1 AND origin = ?2 AND id > ?3
             ORDER BY occurred_at DESC, id DESC
             LIMIT 1;"
        ))?;
        let mut rows = stmt.query(params![entity_uuid.to_string(), origin.as_str(), after_id])?;
        if let Some(row) = rows.next()? {
            return Ok(Some(parse_event_row(row)?));
        }
        Ok(None)
    }

    fn list_project_events_since(
        &self,
        project_uuid: ProjectId,
        since_ms: i64,
    ) -> RepoResult<Vec<ActivityEvent>> {
        let mut stmt = self.conn.prepare(&format!(
            "{EVENT_SELECT_SQL}
             WHERE project_uuid = ?1 AND occurred_at > ?2
             ORDER BY occurred_at ASC, id ASC;"
        ))?;
        let mut rows = stmt.query(params![project_uuid.to_string(), since_ms])?;
        let mut events = Vec::new();
        while let Some(row) = rows.next()? {
            events.push(parse_event_row(row)?);
        }
        Ok(events)
    }

    fn latest_project_event_id(&self, project_uuid: ProjectId) -> RepoResult<i64> {
        let id: i64 = self.conn.query_row(
            "SELECT COALESCE(MAX(id), 0) FROM activity_events WHERE project_uuid = ?1;",
            [project_uuid.to_string()],
            |row| row.get(0),
        )?;
        Ok(id)
    }
}

fn parse_event_row(row: &Row<'_>) -> RepoResult<ActivityEvent> {
    let entity_text: String = row.get("entity_type")?;
    let entity_type = EntityType::parse(&entity_text).ok_or_else(|| {
        RepoError::InvalidData(format!(
            "invalid entity type `{entity_text}` in activity_events.entity_type"
        ))
    })?;
    let kind_text: String = row.get("kind")?;
    let kind = ActivityKind::parse(&kind_text).ok_or_else(|| {
        RepoError::InvalidData(format!("invalid kind `{kind_text}` in activity_events.kind"))
    })?;
    let origin_text: String = row.get("origin")?;
    let origin = Origin::parse(&origin_text).ok_or_else(|| {
        RepoError::InvalidData(format!(
            "invalid origin `{origin_text}` in activity_events.origin"
        ))
    })?;
    let entity_uuid: String = row.get("entity_uuid")?;

    Ok(ActivityEvent {
        id: row.get("id")?,
        entity_type,
        entity_uuid: parse_uuid(&entity_uuid, "activity_events.entity_uuid")?,
        project_uuid: parse_optional_uuid(row.get("project_uuid")?, "activity_events.project_uuid")?,
        kind,
        origin,
        value: row.get("value")?,
        occurred_at: row.get("occurred_at")?,
    })
}

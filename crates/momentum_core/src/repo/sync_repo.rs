//! Sync bookkeeping repository: baselines, document records, fingerprints
//! and the persisted audit trail.
//!
//! # Responsibility
//! - Keep every SQL detail of the baseline journal in one place.
//!
//! # Invariants
//! - `stage_pending` is only called inside the apply transaction that also
//!   writes the store changes it baselines.
//! - `promote_pending` only moves pending into baseline; it never invents a
//!   baseline.

use crate::model::activity::{EntityType, Origin};
use crate::model::project::ProjectId;
use crate::model::sync::{
    AuditEntry, Baseline, DocumentRecord, Fingerprint, ResolutionRule, SyncField, SyncSnapshot,
    SyncState,
};
use crate::repo::{from_json, parse_optional_uuid, parse_uuid, to_json, RepoError, RepoResult};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::BTreeSet;
use uuid::Uuid;

const STATE_SELECT_SQL: &str = "SELECT
    project_uuid,
    document_path,
    baseline_digest,
    baseline_version,
    baseline_snapshot,
    baseline_event_id,
    pending_digest,
    pending_version,
    pending_snapshot,
    pending_event_id,
    synced_at
FROM sync_state";

/// SQLite-backed sync bookkeeping repository.
pub struct SqliteSyncRepository<'conn> {
    conn: &'conn Connection,
}

impl<'conn> SqliteSyncRepository<'conn> {
    pub fn new(conn: &'conn Connection) -> Self {
        Self { conn }
    }

    pub fn get_state(&self, project_uuid: ProjectId) -> RepoResult<Option<SyncState>> {
        self.query_one_state("project_uuid", project_uuid.to_string())
    }

    pub fn get_state_by_path(&self, path: &str) -> RepoResult<Option<SyncState>> {
        self.query_one_state("document_path", path.to_string())
    }

    pub fn list_states(&self) -> RepoResult<Vec<SyncState>> {
        let mut stmt = self
            .conn
            .prepare(&format!("{STATE_SELECT_SQL} ORDER BY document_path ASC;"))?;
        let mut rows = stmt.query([])?;
        let mut states = Vec::new();
        while let Some(row) = rows.next()? {
            states.push(parse_state_row(row)?);
        }
        Ok(states)
    }

    /// Records the baseline an in-flight apply will establish.
    ///
    /// A first link inserts the row with identical baseline and pending
    /// values, so a crash before promotion still leaves a usable baseline.
    pub fn stage_pending(
        &self,
        project_uuid: ProjectId,
        document_path: &str,
        pending: &Baseline,
        now_ms: i64,
    ) -> RepoResult<()> {
        let snapshot = to_json(&pending.snapshot, "sync_state.pending_snapshot")?;
        self.conn.execute(
            "INSERT INTO sync_state (
                project_uuid,
                document_path,
                baseline_digest,
                baseline_version,
                baseline_snapshot,
                baseline_event_id,
                pending_digest,
                pending_version,
                pending_snapshot,
                pending_event_id,
                synced_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(project_uuid) DO UPDATE SET
                document_path = excluded.document_path,
                pending_digest = excluded.pending_digest,
                pending_version = excluded.pending_version,
                pending_snapshot = excluded.pending_snapshot,
                pending_event_id = excluded.pending_event_id,
                synced_at = excluded.synced_at;",
            params![
                project_uuid.to_string(),
                document_path,
                pending.digest.as_str(),
                pending.version,
                snapshot,
                pending.event_id,
                now_ms,
            ],
        )?;
        Ok(())
    }

    /// Moves pending into baseline. Returns whether anything was promoted.
    pub fn promote_pending(&self, project_uuid: ProjectId) -> RepoResult<bool> {
        let changed = self.conn.execute(
            "UPDATE sync_state
             SET
                baseline_digest = pending_digest,
                baseline_version = pending_version,
                baseline_snapshot = pending_snapshot,
                baseline_event_id = pending_event_id,
                pending_digest = NULL,
                pending_version = NULL,
                pending_snapshot = NULL,
                pending_event_id = NULL
             WHERE project_uuid = ?1 AND pending_digest IS NOT NULL;",
            [project_uuid.to_string()],
        )?;
        Ok(changed > 0)
    }

    pub fn upsert_document_record(&self, record: &DocumentRecord) -> RepoResult<()> {
        self.conn.execute(
            "INSERT INTO document_records (path, project_uuid, digest, marker_ids, synced_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(path) DO UPDATE SET
                project_uuid = excluded.project_uuid,
                digest = excluded.digest,
                marker_ids = excluded.marker_ids,
                synced_at = excluded.synced_at;",
            params![
                record.path.as_str(),
                record.project_uuid.map(|id| id.to_string()),
                record.digest.as_str(),
                to_json(&record.marker_ids, "document_records.marker_ids")?,
                record.synced_at,
            ],
        )?;
        Ok(())
    }

    pub fn get_document_record(&self, path: &str) -> RepoResult<Option<DocumentRecord>> {
        let row = self
            .conn
            .query_row(
                "SELECT path, project_uuid, digest, marker_ids, synced_at
                 FROM document_records
                 WHERE path = ?1;",
                [path],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, i64>(4)?,
                    ))
                },
            )
            .optional()?;

        match row {
            Some((path, project_uuid, digest, markers, synced_at)) => {
                let marker_ids: BTreeSet<Uuid> =
                    from_json(&markers, "document_records.marker_ids")?;
                Ok(Some(DocumentRecord {
                    path,
                    project_uuid: parse_optional_uuid(project_uuid, "document_records.project_uuid")?,
                    digest,
                    marker_ids,
                    synced_at,
                }))
            }
            None => Ok(None),
        }
    }

    pub fn get_fingerprint(&self, path: &str) -> RepoResult<Option<Fingerprint>> {
        let fingerprint = self
            .conn
            .query_row(
                "SELECT path, digest, size_bytes, modified_ms, observed_at
                 FROM document_fingerprints
                 WHERE path = ?1;",
                [path],
                |row| {
                    Ok(Fingerprint {
                        path: row.get(0)?,
                        digest: row.get(1)?,
                        size_bytes: row.get::<_, i64>(2)?.max(0) as u64,
                        modified_ms: row.get(3)?,
                        observed_at: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(fingerprint)
    }

    pub fn upsert_fingerprint(&self, fingerprint: &Fingerprint) -> RepoResult<()> {
        let size = i64::try_from(fingerprint.size_bytes).map_err(|_| {
            RepoError::InvalidData(format!(
                "document size {} does not fit in document_fingerprints.size_bytes",
                fingerprint.size_bytes
            ))
        })?;
        self.conn.execute(
            "INSERT INTO document_fingerprints (path, digest, size_bytes, modified_ms, observed_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(path) DO UPDATE SET
                digest = excluded.digest,
                size_bytes = excluded.size_bytes,
                modified_ms = excluded.modified_ms,
                observed_at = excluded.observed_at;",
            params![
                fingerprint.path.as_str(),
                fingerprint.digest.as_str(),
                size,
                fingerprint.modified_ms,
                fingerprint.observed_at,
            ],
        )?;
        Ok(())
    }

    pub fn insert_audit(&self, cycle_id: Uuid, entry: &AuditEntry) -> RepoResult<()> {
        self.conn.execute(
            "INSERT INTO sync_audit (
                cycle_id,
                project_uuid,
                entity_type,
                entity_uuid,
                field,
                discarded_value,
                discarded_source,
                winning_value,
                winning_source,
                rule,
                decided_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11);",
            params![
                cycle_id.to_string(),
                entry.project_uuid.to_string(),
                entry.entity_type.as_str(),
                entry.entity_uuid.to_string(),
                entry.field.as_str(),
                entry.discarded_value.as_str(),
                entry.discarded_source.as_str(),
                entry.winning_value.as_str(),
                entry.winning_source.as_str(),
                entry.rule.as_str(),
                entry.decided_at,
            ],
        )?;
        Ok(())
    }

    /// Persisted audit entries of one project, oldest first.
    pub fn list_audit(&self, project_uuid: ProjectId) -> RepoResult<Vec<AuditEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT
                project_uuid,
                entity_type,
                entity_uuid,
                field,
                discarded_value,
                discarded_source,
                winning_value,
                winning_source,
                rule,
                decided_at
             FROM sync_audit
             WHERE project_uuid = ?1
             ORDER BY decided_at ASC, id ASC;",
        )?;
        let mut rows = stmt.query([project_uuid.to_string()])?;
        let mut entries = Vec::new();
        while let Some(row) = rows.next()? {
            entries.push(parse_audit_row(row)?);
        }
        Ok(entries)
    }

    fn query_one_state(&self, column: &str, value: String) -> RepoResult<Option<SyncState>> {
        let mut stmt = self
            .conn
            .prepare(&format!("{STATE_SELECT_SQL} WHERE {column} = ?1;"))?;
        let mut rows = stmt.query([value])?;
        if let Some(row) = rows.next()? {
            return Ok(Some(parse_state_row(row)?));
        }
        Ok(None)
    }
}

fn parse_state_row(row: &Row<'_>) -> RepoResult<SyncState> {
    let project_text: String = row.get("project_uuid")?;
    let baseline_snapshot: String = row.get("baseline_snapshot")?;
    let baseline = Baseline {
        digest: row.get("baseline_digest")?,
        version: row.get("baseline_version")?,
        snapshot: from_json::<SyncSnapshot>(&baseline_snapshot, "sync_state.baseline_snapshot")?,
        event_id: row.get("baseline_event_id")?,
    };

    let pending = match (
        row.get::<_, Option<String>>("pending_digest")?,
        row.get::<_, Option<i64>>("pending_version")?,
        row.get::<_, Option<String>>("pending_snapshot")?,
        row.get::<_, Option<i64>>("pending_event_id")?,
    ) {
        (Some(digest), Some(version), Some(snapshot), Some(event_id)) => Some(Baseline {
            digest,
            version,
            snapshot: from_json(&snapshot, "sync_state.pending_snapshot")?,
            event_id,
        }),
        (None, None, None, None) => None,
        _ => {
            return Err(RepoError::InvalidData(format!(
                "partially written pending baseline for project {project_text}"
            )))
        }
    };

    Ok(SyncState {
        project_uuid: parse_uuid(&project_text, "sync_state.project_uuid")?,
        document_path: row.get("document_path")?,
        baseline,
        pending,
        synced_at: row.get("synced_at")?,
    })
}

fn parse_audit_row(row: &Row<'_>) -> RepoResult<AuditEntry> {
    let project_text: String = row.get("project_uuid")?;
    let entity_text: String = row.get("entity_uuid")?;
    let entity_type_text: String = row.get("entity_type")?;
    let field_text: String = row.get("field")?;
    let discarded_source: String = row.get("discarded_source")?;
    let winning_source: String = row.get("winning_source")?;
    let rule_text: String = row.get("rule")?;

    let field = match field_text.as_str() {
        "title" => SyncField::Title,
        "status" => SyncField::Status,
        "tags" => SyncField::Tags,
        "task_completion" => SyncField::TaskCompletion,
        other => {
            return Err(RepoError::InvalidData(format!(
                "invalid field `{other}` in sync_audit.field"
            )))
        }
    };
    let invalid = |column: &str, value: &str| {
        RepoError::InvalidData(format!("invalid value `{value}` in sync_audit.{column}"))
    };

    Ok(AuditEntry {
        project_uuid: parse_uuid(&project_text, "sync_audit.project_uuid")?,
        entity_type: EntityType::parse(&entity_type_text)
            .ok_or_else(|| invalid("entity_type", &entity_type_text))?,
        entity_uuid: parse_uuid(&entity_text, "sync_audit.entity_uuid")?,
        field,
        discarded_value: row.get("discarded_value")?,
        discarded_source: Origin::parse(&discarded_source)
            .ok_or_else(|| invalid("discarded_source", &discarded_source))?,
        winning_value: row.get("winning_value")?,
        winning_source: Origin::parse(&winning_source)
            .ok_or_else(|| invalid("winning_source", &winning_source))?,
        rule: ResolutionRule::parse(&rule_text).ok_or_else(|| invalid("rule", &rule_text))?,
        decided_at: row.get("decided_at")?,
    })
}

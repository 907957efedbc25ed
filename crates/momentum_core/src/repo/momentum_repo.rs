//! Momentum persistence: score columns, stalled flag and trend snapshots.
//!
//! # Invariants
//! - Only momentum-owned columns are written; `version` never moves.
//! - `stalled_since` is only set when `last_activity_at` still matches what
//!   the caller scored, so an event appended mid-recompute always wins.

use crate::model::project::{MomentumTrend, ProjectId};
use crate::repo::{RepoError, RepoResult};
use rusqlite::{params, Connection, OptionalExtension};

/// One stored momentum score.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MomentumSnapshot {
    pub score: f64,
    pub computed_at: i64,
}

/// SQLite-backed momentum repository.
pub struct SqliteMomentumRepository<'conn> {
    conn: &'conn Connection,
}

impl<'conn> SqliteMomentumRepository<'conn> {
    pub fn new(conn: &'conn Connection) -> Self {
        Self { conn }
    }

    pub fn update_score(
        &self,
        project_uuid: ProjectId,
        score: f64,
        trend: MomentumTrend,
        computed_at: i64,
    ) -> RepoResult<()> {
        let changed = self.conn.execute(
            "UPDATE projects
             SET
                momentum_score = ?1,
                momentum_trend = ?2,
                momentum_computed_at = ?3
             WHERE uuid = ?4;",
            params![score, trend.as_str(), computed_at, project_uuid.to_string()],
        )?;
        if changed == 0 {
            return Err(RepoError::NotFound(project_uuid));
        }
        Ok(())
    }

    /// Marks a project stalled unless new activity landed since it was read.
    ///
    /// Returns whether the flag was written.
    pub fn mark_stalled(
        &self,
        project_uuid: ProjectId,
        stalled_since: i64,
        observed_last_activity: Option<i64>,
    ) -> RepoResult<bool> {
        let changed = self.conn.execute(
            "UPDATE projects
             SET stalled_since = ?1
             WHERE uuid = ?2
               AND stalled_since IS NULL
               AND last_activity_at IS ?3;",
            params![stalled_since, project_uuid.to_string(), observed_last_activity],
        )?;
        Ok(changed > 0)
    }

    pub fn insert_snapshot(&self, project_uuid: ProjectId, snapshot: MomentumSnapshot) -> RepoResult<()> {
        self.conn.execute(
            "INSERT INTO momentum_snapshots (project_uuid, score, computed_at)
             VALUES (?1, ?2, ?3);",
            params![project_uuid.to_string(), snapshot.score, snapshot.computed_at],
        )?;
        Ok(())
    }

    /// Newest snapshot computed at or before `at_ms`.
    pub fn snapshot_at_or_before(
        &self,
        project_uuid: ProjectId,
        at_ms: i64,
    ) -> RepoResult<Option<MomentumSnapshot>> {
        let snapshot = self
            .conn
            .query_row(
                "SELECT score, computed_at
                 FROM momentum_snapshots
                 WHERE project_uuid = ?1 AND computed_at <= ?2
                 ORDER BY computed_at DESC, id DESC
                 LIMIT 1;",
                params![project_uuid.to_string(), at_ms],
                |row| {
                    Ok(MomentumSnapshot {
                        score: row.get(0)?,
                        computed_at: row.get(1)?,
                    })
                },
            )
            .optional()?;
        Ok(snapshot)
    }

    /// Deletes snapshots older than `horizon_ms`, keeping the newest of them
    /// so a trend lookback reaching past the horizon still has an anchor.
    pub fn prune_snapshots(&self, project_uuid: ProjectId, horizon_ms: i64) -> RepoResult<usize> {
        let removed = self.conn.execute(
            "DELETE FROM momentum_snapshots
             WHERE project_uuid = ?1
               AND computed_at < ?2
               AND id <> COALESCE((
                    SELECT id
                    FROM momentum_snapshots
                    WHERE project_uuid = ?1 AND computed_at < ?2
                    ORDER BY computed_at DESC, id DESC
                    LIMIT 1
               ), -1);",
            params![project_uuid.to_string(), horizon_ms],
        )?;
        Ok(removed)
    }

    pub fn count_snapshots(&self, project_uuid: ProjectId) -> RepoResult<usize> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM momentum_snapshots WHERE project_uuid = ?1;",
            [project_uuid.to_string()],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as usize)
    }
}

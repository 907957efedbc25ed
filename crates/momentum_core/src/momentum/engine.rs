//! Momentum recompute over the activity log.
//!
//! # Responsibility
//! - Score tracked projects, derive their trend from stored snapshots and
//!   flag projects that crossed the stalled threshold.
//!
//! # Invariants
//! - Writes only momentum-owned columns and `momentum_snapshots`; never
//!   touches fields the sync applier writes.
//! - `stalled_since` is only ever set here and only cleared by an activity
//!   event (schema trigger).

use crate::config::MomentumConfig;
use crate::model::project::{MomentumTrend, Project, ProjectId};
use crate::momentum::score::{compute_factors, days_ms, event_horizon, trend, MomentumFactors, ScoreInput};
use crate::repo::activity_repo::{ActivityRepository, SqliteActivityRepository};
use crate::repo::momentum_repo::{MomentumSnapshot, SqliteMomentumRepository};
use crate::repo::project_repo::{ProjectListQuery, ProjectRepository, SqliteProjectRepository};
use crate::repo::task_repo::{SqliteTaskRepository, TaskRepository};
use crate::repo::{RepoError, RepoResult};
use log::{debug, info};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::time::Instant;

/// Result of scoring one project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectMomentum {
    pub project_uuid: ProjectId,
    pub score: f64,
    pub trend: MomentumTrend,
    pub factors: MomentumFactors,
    pub stalled_since: Option<i64>,
    /// This recompute set the stalled flag.
    pub became_stalled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MomentumReport {
    pub computed_at: i64,
    pub projects: Vec<ProjectMomentum>,
}

impl MomentumReport {
    pub fn project(&self, project_uuid: ProjectId) -> Option<&ProjectMomentum> {
        self.projects
            .iter()
            .find(|entry| entry.project_uuid == project_uuid)
    }
}

pub struct MomentumEngine {
    config: MomentumConfig,
}

impl MomentumEngine {
    pub fn new(config: MomentumConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &MomentumConfig {
        &self.config
    }

    /// Recomputes one project, or every tracked project when `project` is
    /// `None`. A named project that is completed or archived keeps its last
    /// score and is left out of the report.
    ///
    /// # Errors
    /// - `NotFound` when `project` names no stored project.
    pub fn recompute(
        &self,
        conn: &mut Connection,
        project: Option<ProjectId>,
        now_ms: i64,
    ) -> RepoResult<MomentumReport> {
        let started = Instant::now();
        let targets: Vec<Project> = {
            let projects = SqliteProjectRepository::new(conn);
            match project {
                Some(id) => vec![projects.get_project(id)?.ok_or(RepoError::NotFound(id))?],
                None => projects.list_projects(&ProjectListQuery::default())?,
            }
        };

        let mut report = MomentumReport {
            computed_at: now_ms,
            projects: Vec::new(),
        };
        for target in targets.iter().filter(|project| project.status.is_tracked()) {
            let tx = conn.transaction()?;
            let entry = self.recompute_one(&tx, target.uuid, now_ms)?;
            tx.commit()?;
            if let Some(entry) = entry {
                report.projects.push(entry);
            }
        }

        info!(
            "event=momentum_recompute module=momentum status=ok projects={} stalled={} duration_ms={}",
            report.projects.len(),
            report
                .projects
                .iter()
                .filter(|entry| entry.stalled_since.is_some())
                .count(),
            started.elapsed().as_millis()
        );
        Ok(report)
    }

    fn recompute_one(
        &self,
        conn: &Connection,
        project_uuid: ProjectId,
        now_ms: i64,
    ) -> RepoResult<Option<ProjectMomentum>> {
        let projects = SqliteProjectRepository::new(conn);
        let tasks = SqliteTaskRepository::new(conn);
        let events = SqliteActivityRepository::new(conn);
        let momentum = SqliteMomentumRepository::new(conn);

        // Re-read inside the transaction; `last_activity_at` must match what
        // `mark_stalled` compares against.
        let Some(project) = projects.get_project(project_uuid)? else {
            return Ok(None);
        };
        if !project.status.is_tracked() {
            return Ok(None);
        }

        let horizon = event_horizon(&self.config, now_ms, project.last_activity_at);
        let recent = events.list_project_events_since(project_uuid, horizon)?;
        let factors = compute_factors(
            &self.config,
            &ScoreInput {
                now_ms,
                last_activity_at: project.last_activity_at,
                has_next_action: tasks.has_next_action(project_uuid)?,
                events: &recent,
            },
        );
        let score = factors.score();

        let lookback_at = now_ms - days_ms(self.config.trend_lookback_days);
        let previous = momentum
            .snapshot_at_or_before(project_uuid, lookback_at)?
            .map(|snapshot| snapshot.score);
        let trend = trend(&self.config, score, previous);

        momentum.update_score(project_uuid, score, trend, now_ms)?;
        momentum.insert_snapshot(
            project_uuid,
            MomentumSnapshot {
                score,
                computed_at: now_ms,
            },
        )?;
        let horizon_ms = now_ms - days_ms(self.config.snapshot_retention_days);
        let pruned = momentum.prune_snapshots(project_uuid, horizon_ms)?;

        let mut stalled_since = project.stalled_since;
        let mut became_stalled = false;
        if stalled_since.is_none() {
            let anchor = project.last_activity_at.unwrap_or(project.created_at);
            let threshold = days_ms(self.config.stalled_threshold_days);
            if now_ms - anchor >= threshold {
                let since = anchor + threshold;
                if momentum.mark_stalled(project_uuid, since, project.last_activity_at)? {
                    stalled_since = Some(since);
                    became_stalled = true;
                    info!(
                        "event=stalled_transition module=momentum status=ok project_uuid={} stalled_since={}",
                        project_uuid, since
                    );
                }
            }
        }

        debug!(
            "event=momentum_project module=momentum status=ok project_uuid={} score={:.4} trend={} snapshots_pruned={}",
            project_uuid,
            score,
            trend.as_str(),
            pruned
        );

        Ok(Some(ProjectMomentum {
            project_uuid,
            score,
            trend,
            factors,
            stalled_since,
            became_stalled,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::MomentumEngine;
    use crate::clock::MS_PER_DAY;
    use crate::config::MomentumConfig;
    use crate::db::open_db_in_memory;
    use crate::model::activity::{ActivityKind, NewActivityEvent, Origin};
    use crate::model::project::{MomentumTrend, Project, ProjectStatus};
    use crate::repo::activity_repo::{ActivityRepository, SqliteActivityRepository};
    use crate::repo::momentum_repo::SqliteMomentumRepository;
    use crate::repo::project_repo::{ProjectRepository, SqliteProjectRepository};

    #[test]
    fn project_without_activity_stalls_at_creation_plus_threshold() {
        let mut conn = open_db_in_memory().unwrap();
        let project = Project::new("Quiet", 0);
        SqliteProjectRepository::new(&conn).create_project(&project).unwrap();
        let engine = MomentumEngine::new(MomentumConfig::default());

        let early = engine.recompute(&mut conn, None, 13 * MS_PER_DAY).unwrap();
        assert_eq!(early.project(project.uuid).unwrap().stalled_since, None);

        let late = engine.recompute(&mut conn, None, 15 * MS_PER_DAY).unwrap();
        let entry = late.project(project.uuid).unwrap();
        assert_eq!(entry.stalled_since, Some(14 * MS_PER_DAY));
        assert!(entry.became_stalled);
        assert_eq!(entry.score, 0.0);
    }

    #[test]
    fn completed_projects_are_not_scored() {
        let mut conn = open_db_in_memory().unwrap();
        let mut project = Project::new("Done", 0);
        project.status = ProjectStatus::Completed;
        SqliteProjectRepository::new(&conn).create_project(&project).unwrap();
        let engine = MomentumEngine::new(MomentumConfig::default());

        let report = engine.recompute(&mut conn, Some(project.uuid), 30 * MS_PER_DAY).unwrap();
        assert!(report.projects.is_empty());
        let stored = SqliteProjectRepository::new(&conn)
            .get_project(project.uuid)
            .unwrap()
            .unwrap();
        assert_eq!(stored.stalled_since, None);
    }

    #[test]
    fn snapshots_past_retention_are_pruned_keeping_one_anchor() {
        let mut conn = open_db_in_memory().unwrap();
        let project = Project::new("Long haul", 0);
        SqliteProjectRepository::new(&conn).create_project(&project).unwrap();
        let config = MomentumConfig::default();
        let retention_days = i64::from(config.snapshot_retention_days);
        let engine = MomentumEngine::new(config);

        for day in [0, 1, 2] {
            engine
                .recompute(&mut conn, Some(project.uuid), day * MS_PER_DAY)
                .unwrap();
        }
        let snapshots = SqliteMomentumRepository::new(&conn);
        assert_eq!(snapshots.count_snapshots(project.uuid).unwrap(), 3);

        let later = (retention_days + 10) * MS_PER_DAY;
        engine.recompute(&mut conn, Some(project.uuid), later).unwrap();

        let snapshots = SqliteMomentumRepository::new(&conn);
        assert_eq!(snapshots.count_snapshots(project.uuid).unwrap(), 2);
        let anchor = snapshots
            .snapshot_at_or_before(project.uuid, later - MS_PER_DAY)
            .unwrap()
            .unwrap();
        assert_eq!(anchor.computed_at, 2 * MS_PER_DAY);
    }

    #[test]
    fn trend_compares_against_lookback_snapshot() {
        let mut conn = open_db_in_memory().unwrap();
        let project = Project::new("Busy", 0);
        SqliteProjectRepository::new(&conn).create_project(&project).unwrap();
        let engine = MomentumEngine::new(MomentumConfig::default());

        engine.recompute(&mut conn, Some(project.uuid), MS_PER_DAY).unwrap();
        SqliteActivityRepository::new(&conn)
            .append(&NewActivityEvent::project(
                project.uuid,
                ActivityKind::Touched,
                Origin::Store,
                None,
                8 * MS_PER_DAY,
            ))
            .unwrap();
        let report = engine
            .recompute(&mut conn, Some(project.uuid), 8 * MS_PER_DAY)
            .unwrap();
        assert_eq!(report.project(project.uuid).unwrap().trend, MomentumTrend::Improving);
        assert_eq!(
            SqliteMomentumRepository::new(&conn)
                .count_snapshots(project.uuid)
                .unwrap(),
            2
        );
    }
}

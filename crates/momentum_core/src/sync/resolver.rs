//! Deterministic conflict policy.
//!
//! # Responsibility
//! - Turn every detected field change into a decision: keep, take the
//!   document value, or take the store value.
//! - Emit an audit entry for every discarded value.
//!
//! # Invariants
//! - Equal values never produce an audit entry.
//! - For a conflict the side with the most recent activity event since the
//!   baseline wins; equal timestamps go to the store; with no events at all
//!   the store wins.
//! - Resolution never fails for policy reasons; only store reads can fail.

use crate::model::activity::Origin;
use crate::model::project::ProjectId;
use crate::model::sync::{AuditEntry, ResolutionRule};
use crate::repo::activity_repo::ActivityRepository;
use crate::repo::RepoResult;
use crate::sync::detector::{ChangeClass, FieldChange, FieldValue};
use log::info;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    /// Both sides already agree.
    Keep,
    TakeDocument,
    TakeStore,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub change: FieldChange,
    pub decision: Decision,
    pub rule: Option<ResolutionRule>,
    pub audit: Option<AuditEntry>,
}

impl Resolution {
    /// Value both sides hold after the decision.
    pub fn winning_value(&self) -> &FieldValue {
        match (self.decision, self.change.document.as_ref()) {
            (Decision::TakeDocument, Some(value)) => value,
            _ => &self.change.store,
        }
    }
}

/// Resolves field changes of one project against the activity log.
pub struct ConflictResolver<'a, A: ActivityRepository> {
    events: &'a A,
    project_uuid: ProjectId,
    /// Only events newer than the baseline count as "that side's change".
    after_event_id: i64,
    decided_at: i64,
}

impl<'a, A: ActivityRepository> ConflictResolver<'a, A> {
    pub fn new(events: &'a A, project_uuid: ProjectId, after_event_id: i64, decided_at: i64) -> Self {
        Self {
            events,
            project_uuid,
            after_event_id,
            decided_at,
        }
    }

    pub fn resolve(&self, change: FieldChange) -> RepoResult<Resolution> {
        let decided = |decision, rule, audit| Resolution {
            change: change.clone(),
            decision,
            rule,
            audit,
        };

        let Some(document) = change.document.as_ref() else {
            return Ok(decided(Decision::TakeStore, None, None));
        };
        if *document == change.store {
            return Ok(decided(Decision::Keep, None, None));
        }

        match change.class {
            ChangeClass::Unchanged => return Ok(decided(Decision::Keep, None, None)),
            ChangeClass::DocChanged => return Ok(decided(Decision::TakeDocument, None, None)),
            ChangeClass::StoreChanged => return Ok(decided(Decision::TakeStore, None, None)),
            ChangeClass::Conflict => {}
        }

        let store_event = self
            .events
            .latest_for_entity(change.entity_uuid, Origin::Store, self.after_event_id)?;
        let document_event = self
            .events
            .latest_for_entity(change.entity_uuid, Origin::Document, self.after_event_id)?;

        let (winner, rule) = match (document_event, store_event) {
            (Some(doc), Some(store)) if doc.occurred_at > store.occurred_at => {
                (Origin::Document, ResolutionRule::MostRecentEvent)
            }
            (Some(doc), Some(store)) if doc.occurred_at < store.occurred_at => {
                (Origin::Store, ResolutionRule::MostRecentEvent)
            }
            (Some(_), Some(_)) => (Origin::Store, ResolutionRule::TieStoreWins),
            (Some(_), None) => (Origin::Document, ResolutionRule::MostRecentEvent),
            (None, Some(_)) => (Origin::Store, ResolutionRule::MostRecentEvent),
            (None, None) => (Origin::Store, ResolutionRule::StoreFallback),
        };

        let (decision, winning, discarded, discarded_source) = match winner {
            Origin::Document => (
                Decision::TakeDocument,
                document,
                &change.store,
                Origin::Store,
            ),
            Origin::Store => (
                Decision::TakeStore,
                &change.store,
                document,
                Origin::Document,
            ),
        };

        let audit = AuditEntry {
            project_uuid: self.project_uuid,
            entity_type: change.entity_type,
            entity_uuid: change.entity_uuid,
            field: change.field,
            discarded_value: discarded.render(),
            discarded_source,
            winning_value: winning.render(),
            winning_source: winner,
            rule,
            decided_at: self.decided_at,
        };
        info!(
            "event=conflict_resolved module=sync status=ok project_uuid={} entity_uuid={} field={} winner={} rule={}",
            self.project_uuid,
            change.entity_uuid,
            change.field.as_str(),
            winner.as_str(),
            rule.as_str()
        );

        Ok(decided(decision, Some(rule), Some(audit)))
    }
}

#[cfg(test)]
mod tests {
    use super::{ConflictResolver, Decision};
    use crate::db::open_db_in_memory;
    use crate::model::activity::{ActivityKind, EntityType, NewActivityEvent, Origin};
    use crate::model::project::Project;
    use crate::model::sync::{ResolutionRule, SyncField};
    use crate::model::task::Task;
    use crate::repo::activity_repo::{ActivityRepository, SqliteActivityRepository};
    use crate::repo::project_repo::{ProjectRepository, SqliteProjectRepository};
    use crate::repo::task_repo::{SqliteTaskRepository, TaskRepository};
    use crate::sync::detector::{ChangeClass, FieldChange, FieldValue};

    fn conflict(task: &Task, document: bool, store: bool) -> FieldChange {
        FieldChange {
            field: SyncField::TaskCompletion,
            entity_type: EntityType::Task,
            entity_uuid: task.uuid,
            marker_id: Some(task.marker_id),
            class: ChangeClass::Conflict,
            baseline: None,
            document: Some(FieldValue::Completion(document)),
            store: FieldValue::Completion(store),
        }
    }

    fn event(task: &Task, origin: Origin, at: i64) -> NewActivityEvent {
        NewActivityEvent::task(task.uuid, task.project_uuid, ActivityKind::Touched, origin, None, at)
    }

    #[test]
    fn most_recent_event_wins_and_ties_go_to_store() {
        let conn = open_db_in_memory().unwrap();
        let project = Project::new("Shed", 0);
        SqliteProjectRepository::new(&conn).create_project(&project).unwrap();
        let task = Task::new(Some(project.uuid), "Paint", 0);
        SqliteTaskRepository::new(&conn).create_task(&task).unwrap();
        let events = SqliteActivityRepository::new(&conn);
        let resolver = ConflictResolver::new(&events, project.uuid, 0, 500);

        events.append(&event(&task, Origin::Store, 100)).unwrap();
        events.append(&event(&task, Origin::Document, 200)).unwrap();
        let resolution = resolver.resolve(conflict(&task, true, false)).unwrap();
        assert_eq!(resolution.decision, Decision::TakeDocument);
        let audit = resolution.audit.unwrap();
        assert_eq!(audit.discarded_value, "pending");
        assert_eq!(audit.discarded_source, Origin::Store);
        assert_eq!(audit.rule, ResolutionRule::MostRecentEvent);

        events.append(&event(&task, Origin::Store, 200)).unwrap();
        let tie = resolver.resolve(conflict(&task, true, false)).unwrap();
        assert_eq!(tie.decision, Decision::TakeStore);
        assert_eq!(tie.rule, Some(ResolutionRule::TieStoreWins));
    }

    #[test]
    fn events_at_or_before_baseline_do_not_count() {
        let conn = open_db_in_memory().unwrap();
        let project = Project::new("Shed", 0);
        SqliteProjectRepository::new(&conn).create_project(&project).unwrap();
        let task = Task::new(Some(project.uuid), "Paint", 0);
        SqliteTaskRepository::new(&conn).create_task(&task).unwrap();
        let events = SqliteActivityRepository::new(&conn);
        let old = events.append(&event(&task, Origin::Document, 900)).unwrap();

        let resolver = ConflictResolver::new(&events, project.uuid, old, 1_000);
        let resolution = resolver.resolve(conflict(&task, true, false)).unwrap();
        assert_eq!(resolution.decision, Decision::TakeStore);
        assert_eq!(resolution.rule, Some(ResolutionRule::StoreFallback));
        assert_eq!(resolution.winning_value(), &FieldValue::Completion(false));
        assert!(resolution.audit.is_some());
    }

    #[test]
    fn equal_values_are_kept_without_audit() {
        let conn = open_db_in_memory().unwrap();
        let events = SqliteActivityRepository::new(&conn);
        let task = Task::new(None, "Paint", 0);
        let resolver = ConflictResolver::new(&events, uuid::Uuid::new_v4(), 0, 1);

        let resolution = resolver.resolve(conflict(&task, true, true)).unwrap();
        assert_eq!(resolution.decision, Decision::Keep);
        assert!(resolution.audit.is_none());
    }
}

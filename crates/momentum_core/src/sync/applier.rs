//! Per-project apply with a crash-safe baseline journal.
//!
//! # Responsibility
//! - Re-read one linked project inside a transaction, classify and resolve
//!   it, then write store rows, document bytes and the new baseline.
//!
//! # Invariants
//! - One transaction per project. Store rows, activity events, audit rows,
//!   the document record and the *pending* baseline commit together.
//! - The document is written before the commit; a failed write drops the
//!   transaction, so the store never moves without the document.
//! - Promotion of pending → baseline runs after the commit. Until it does,
//!   the pending baseline already describes the committed state, so an
//!   interrupted apply re-classifies as unchanged.
//! - Store changes that came from the document append `origin=document`
//!   events; store-wins rewrites of the document append none.
//! - A baseline keeps every task marker its predecessor held, so a task line
//!   the reader deleted is never re-appended.

use crate::model::activity::{ActivityKind, NewActivityEvent, Origin};
use crate::model::project::{DocumentRef, Project, ProjectId};
use crate::model::sync::{AuditEntry, Baseline, DocumentRecord, ResolutionRule, SyncField, SyncState};
use crate::model::task::{MarkerId, Task, TaskStatus};
use crate::repo::activity_repo::{ActivityRepository, SqliteActivityRepository};
use crate::repo::project_repo::{ProjectRepository, SqliteProjectRepository};
use crate::repo::sync_repo::SqliteSyncRepository;
use crate::repo::task_repo::{SqliteTaskRepository, TaskRepository};
use crate::sync::codec::{self, CodecError, DecodedDocument};
use crate::sync::detector::{
    classify_project, detect, ChangeClass, DetectorInput, FieldValue, ProjectDelta,
};
use crate::sync::fingerprint::{digest, fingerprint_of};
use crate::sync::resolver::{ConflictResolver, Decision, Resolution};
use crate::sync::scan::ScannedDocument;
use crate::sync::source::DocumentSource;
use crate::sync::{SyncError, SyncResult};
use log::{debug, info, warn};
use rusqlite::Connection;
use std::collections::{BTreeSet, HashMap};
use uuid::Uuid;

/// Whether an apply writes anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyMode {
    /// Classify and resolve only.
    Preview,
    /// Write both sides. With `promote = false` the journal is left pending,
    /// exactly as an interruption right after the commit would leave it.
    Commit { promote: bool },
}

/// One linked (project, document) pair to process.
pub struct ProjectWork<'a> {
    pub project_uuid: ProjectId,
    pub document_path: &'a str,
    pub scanned: &'a ScannedDocument,
    /// `None` on first link.
    pub state: Option<&'a SyncState>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyOutcome {
    pub class: ChangeClass,
    pub store_writes: usize,
    pub document_written: bool,
    pub audit: Vec<AuditEntry>,
    pub warnings: Vec<String>,
    /// Pending baseline left by an earlier interrupted apply was promoted.
    pub repaired: bool,
}

impl ApplyOutcome {
    fn unchanged(repaired: bool) -> Self {
        Self {
            class: ChangeClass::Unchanged,
            store_writes: 0,
            document_written: false,
            audit: Vec::new(),
            warnings: Vec::new(),
            repaired,
        }
    }
}

/// Store-side edits decided for one project.
#[derive(Debug, Default)]
struct StorePlan {
    project: Option<Project>,
    project_events: Vec<(ActivityKind, Option<String>)>,
    task_updates: Vec<Task>,
    task_creations: Vec<Task>,
}

impl StorePlan {
    fn writes(&self) -> usize {
        usize::from(self.project.is_some()) + self.task_updates.len() + self.task_creations.len()
    }
}

pub struct SyncApplier<'a> {
    source: &'a dyn DocumentSource,
    cycle_id: Uuid,
    now_ms: i64,
}

impl<'a> SyncApplier<'a> {
    pub fn new(source: &'a dyn DocumentSource, cycle_id: Uuid, now_ms: i64) -> Self {
        Self {
            source,
            cycle_id,
            now_ms,
        }
    }

    /// Processes one project as a single unit.
    ///
    /// # Errors
    /// - `MalformedDocument` when the document cannot be decoded.
    /// - `DocumentUnavailable` when the document write fails; nothing from
    ///   this project is committed.
    /// - `StoreUnavailable` for any store failure.
    pub fn apply_project(
        &self,
        conn: &mut Connection,
        work: &ProjectWork<'_>,
        mode: ApplyMode,
    ) -> SyncResult<ApplyOutcome> {
        let tx = conn.transaction()?;

        let projects = SqliteProjectRepository::new(&tx);
        let tasks_repo = SqliteTaskRepository::new(&tx);
        let events = SqliteActivityRepository::new(&tx);
        let sync_repo = SqliteSyncRepository::new(&tx);

        let project = projects
            .get_project(work.project_uuid)?
            .ok_or(SyncError::ProjectNotFound {
                project_uuid: work.project_uuid,
            })?;
        let tasks = tasks_repo.list_project_tasks(work.project_uuid)?;
        let baseline = work.state.map(SyncState::effective);
        let document_digest = work.scanned.fingerprint.digest.as_str();

        if classify_project(baseline, document_digest, project.version) == ChangeClass::Unchanged {
            let repaired = match (mode, work.state) {
                (ApplyMode::Commit { .. }, Some(state)) if state.pending.is_some() => {
                    let promoted = sync_repo.promote_pending(work.project_uuid)?;
                    tx.commit()?;
                    promoted
                }
                _ => false,
            };
            if repaired {
                info!(
                    "event=baseline_repair module=sync status=ok project_uuid={}",
                    work.project_uuid
                );
            }
            return Ok(ApplyOutcome::unchanged(repaired));
        }

        let document = work
            .scanned
            .decode()
            .map_err(|source| malformed(work.document_path, source))?;

        let foreign_markers = foreign_markers(&tasks_repo, &document, &tasks, work.project_uuid)?;
        let delta = detect(&DetectorInput {
            project: &project,
            tasks: &tasks,
            store_version: project.version,
            baseline,
            document_digest,
            document: &document,
            foreign_markers: &foreign_markers,
        });
        if delta.class == ChangeClass::Unchanged {
            return Ok(ApplyOutcome::unchanged(false));
        }

        let resolver = ConflictResolver::new(
            &events,
            work.project_uuid,
            baseline.map(|b| b.event_id).unwrap_or(0),
            self.now_ms,
        );
        let resolutions = delta
            .fields
            .iter()
            .cloned()
            .map(|change| resolver.resolve(change))
            .collect::<Result<Vec<Resolution>, _>>()?;

        let mut warnings = Vec::new();
        for resolution in &resolutions {
            if resolution.rule != Some(ResolutionRule::StoreFallback) {
                continue;
            }
            let unresolvable = SyncError::ConflictUnresolvable {
                project_uuid: work.project_uuid,
                reason: format!(
                    "no activity since the baseline on either side for {}",
                    resolution.change.field.as_str()
                ),
            };
            warn!(
                "event=conflict_unresolvable module=sync status=warn project_uuid={} error_kind={:?} fallback=store",
                work.project_uuid,
                unresolvable.kind()
            );
            warnings.push(format!("{unresolvable}; store value kept"));
        }
        for marker in &delta.foreign_markers {
            warnings.push(format!(
                "task marker {marker} belongs to another project; line ignored"
            ));
        }
        let plan = self.plan_store(&project, &tasks, &resolutions, &delta, &mut warnings);
        let target_text = self.plan_document(&document, &resolutions, &delta);
        let document_changed = target_text.as_bytes() != work.scanned.bytes.as_slice();
        let audit: Vec<AuditEntry> = resolutions
            .iter()
            .filter_map(|resolution| resolution.audit.clone())
            .collect();

        let store_writes = plan.writes();
        let promote = match mode {
            ApplyMode::Preview => {
                debug!(
                    "event=project_apply module=sync status=preview project_uuid={} class={} store_writes={} document_write={}",
                    work.project_uuid,
                    delta.class.as_str(),
                    store_writes,
                    document_changed
                );
                return Ok(ApplyOutcome {
                    class: delta.class,
                    store_writes,
                    document_written: document_changed,
                    audit,
                    warnings,
                    repaired: false,
                });
            }
            ApplyMode::Commit { promote } => promote,
        };

        self.write_store(&projects, &tasks_repo, &events, &plan, work.project_uuid)?;
        for entry in &audit {
            sync_repo.insert_audit(self.cycle_id, entry)?;
        }

        let final_document = codec::decode(target_text.as_bytes())
            .map_err(|source| malformed(work.document_path, source))?;
        let final_digest = digest(target_text.as_bytes());
        let mut snapshot = final_document.snapshot();
        // Markers of removed lines stay in the baseline; see the invariant.
        if let Some(previous) = baseline {
            for (marker, completed) in &previous.snapshot.tasks {
                snapshot.tasks.entry(*marker).or_insert(*completed);
            }
        }
        let pending = Baseline {
            digest: final_digest.clone(),
            version: projects.version(work.project_uuid)?,
            snapshot,
            event_id: events.latest_event_id()?,
        };
        sync_repo.stage_pending(work.project_uuid, work.document_path, &pending, self.now_ms)?;
        projects.set_document_ref(
            work.project_uuid,
            Some(&DocumentRef {
                path: work.document_path.to_string(),
                digest: final_digest.clone(),
            }),
        )?;
        sync_repo.upsert_document_record(&DocumentRecord {
            path: work.document_path.to_string(),
            project_uuid: Some(work.project_uuid),
            digest: final_digest,
            marker_ids: final_document.marker_ids(),
            synced_at: self.now_ms,
        })?;

        if document_changed {
            self.source
                .write(work.document_path, target_text.as_bytes())
                .map_err(|source| SyncError::DocumentUnavailable {
                    path: work.document_path.to_string(),
                    source,
                })?;
            if let Ok(meta) = self.source.metadata(work.document_path) {
                let fingerprint =
                    fingerprint_of(work.document_path, target_text.as_bytes(), meta, self.now_ms);
                sync_repo.upsert_fingerprint(&fingerprint)?;
            }
        }

        tx.commit()?;

        if promote {
            SqliteSyncRepository::new(conn).promote_pending(work.project_uuid)?;
        }

        info!(
            "event=project_apply module=sync status=ok project_uuid={} class={} store_writes={} document_written={} audit_entries={} promoted={}",
            work.project_uuid,
            delta.class.as_str(),
            store_writes,
            document_changed,
            audit.len(),
            promote
        );

        Ok(ApplyOutcome {
            class: delta.class,
            store_writes,
            document_written: document_changed,
            audit,
            warnings,
            repaired: false,
        })
    }

    fn plan_store(
        &self,
        project: &Project,
        tasks: &[Task],
        resolutions: &[Resolution],
        delta: &ProjectDelta,
        warnings: &mut Vec<String>,
    ) -> StorePlan {
        let mut plan = StorePlan::default();
        let mut updated = project.clone();
        let by_uuid: HashMap<Uuid, &Task> = tasks.iter().map(|task| (task.uuid, task)).collect();

        for resolution in resolutions {
            if resolution.decision != Decision::TakeDocument {
                continue;
            }
            let Some(value) = resolution.change.document.as_ref() else {
                continue;
            };
            if *value == resolution.change.store {
                continue;
            }
            match value {
                FieldValue::Title(title) => {
                    updated.title = title.clone();
                    plan.project_events
                        .push((ActivityKind::Touched, Some(SyncField::Title.as_str().to_string())));
                }
                FieldValue::Status(status) => {
                    updated.status = *status;
                    plan.project_events
                        .push((ActivityKind::StatusChanged, Some(status.as_str().to_string())));
                }
                FieldValue::Tags(tags) => {
                    updated.tags = tags.clone();
                    plan.project_events
                        .push((ActivityKind::Touched, Some(SyncField::Tags.as_str().to_string())));
                }
                FieldValue::Completion(completed) => {
                    let Some(task) = by_uuid.get(&resolution.change.entity_uuid) else {
                        continue;
                    };
                    let mut task = (*task).clone();
                    let status = if *completed {
                        TaskStatus::Completed
                    } else {
                        TaskStatus::Pending
                    };
                    task.set_status(status, self.now_ms);
                    plan.task_updates.push(task);
                }
            }
        }
        if !plan.project_events.is_empty() {
            updated.updated_at = self.now_ms;
            plan.project = Some(updated);
        }

        for entry in &delta.new_document_tasks {
            if entry.title.trim().is_empty() {
                warnings.push(format!(
                    "task line {} has no title; not created",
                    entry.marker_id
                ));
                continue;
            }
            let mut task =
                Task::with_marker(Some(project.uuid), entry.marker_id, entry.title.clone(), self.now_ms);
            if entry.completed {
                task.set_status(TaskStatus::Completed, self.now_ms);
            }
            plan.task_creations.push(task);
        }

        plan
    }

    fn plan_document(
        &self,
        document: &DecodedDocument,
        resolutions: &[Resolution],
        delta: &ProjectDelta,
    ) -> String {
        let mut target = document.snapshot();
        for resolution in resolutions {
            match resolution.winning_value() {
                FieldValue::Title(title) => target.title = Some(title.clone()),
                FieldValue::Status(status) => target.status = Some(*status),
                FieldValue::Tags(tags) => target.tags = tags.clone(),
                FieldValue::Completion(completed) => {
                    if let Some(marker) = resolution.change.marker_id {
                        target.tasks.insert(marker, *completed);
                    }
                }
            }
        }
        codec::encode(document, &target, &delta.appended_tasks)
    }

    fn write_store(
        &self,
        projects: &SqliteProjectRepository<'_>,
        tasks: &SqliteTaskRepository<'_>,
        events: &SqliteActivityRepository<'_>,
        plan: &StorePlan,
        project_uuid: ProjectId,
    ) -> SyncResult<()> {
        if let Some(project) = &plan.project {
            projects.update_project(project)?;
            for (kind, value) in &plan.project_events {
                events.append(&NewActivityEvent::project(
                    project_uuid,
                    *kind,
                    Origin::Document,
                    value.clone(),
                    self.now_ms,
                ))?;
            }
        }

        for task in &plan.task_updates {
            tasks.update_task(task)?;
            let (kind, value) = if task.is_completed() {
                (ActivityKind::Completed, None)
            } else {
                (ActivityKind::StatusChanged, Some(task.status.as_str().to_string()))
            };
            events.append(&NewActivityEvent::task(
                task.uuid,
                Some(project_uuid),
                kind,
                Origin::Document,
                value,
                self.now_ms,
            ))?;
        }

        for task in &plan.task_creations {
            tasks.create_task(task)?;
            events.append(&NewActivityEvent::task(
                task.uuid,
                Some(project_uuid),
                ActivityKind::Created,
                Origin::Document,
                None,
                self.now_ms,
            ))?;
            if task.is_completed() {
                events.append(&NewActivityEvent::task(
                    task.uuid,
                    Some(project_uuid),
                    ActivityKind::Completed,
                    Origin::Document,
                    None,
                    self.now_ms,
                ))?;
            }
        }
        Ok(())
    }
}

fn malformed(path: &str, source: CodecError) -> SyncError {
    SyncError::MalformedDocument {
        path: path.to_string(),
        source,
    }
}

/// Document markers whose task belongs to another project or the inbox.
fn foreign_markers(
    tasks_repo: &SqliteTaskRepository<'_>,
    document: &DecodedDocument,
    tasks: &[Task],
    project_uuid: ProjectId,
) -> SyncResult<BTreeSet<MarkerId>> {
    let own: BTreeSet<MarkerId> = tasks.iter().map(|task| task.marker_id).collect();
    let mut foreign = BTreeSet::new();
    for marker in document.marker_ids() {
        if own.contains(&marker) {
            continue;
        }
        if let Some(task) = tasks_repo.get_task_by_marker(marker)? {
            if task.project_uuid != Some(project_uuid) {
                foreign.insert(marker);
            }
        }
    }
    Ok(foreign)
}

use momentum_core::db::open_db_in_memory;
use momentum_core::model::activity::{ActivityKind, NewActivityEvent, Origin};
use momentum_core::model::sync::{ResolutionRule, SyncField};
use momentum_core::repo::activity_repo::{ActivityRepository, SqliteActivityRepository};
use momentum_core::repo::project_repo::{ProjectRepository, SqliteProjectRepository};
use momentum_core::repo::sync_repo::SqliteSyncRepository;
use momentum_core::repo::task_repo::{SqliteTaskRepository, TaskRepository};
use momentum_core::sync::detector::ChangeClass;
use momentum_core::sync::fingerprint::digest;
use momentum_core::sync::report::ProjectOutcome;
use momentum_core::{
    EngineConfig, ManualClock, MemoryDocumentSource, Project, ProjectId, ProjectService,
    ReconcileOptions, SharedConnection, SyncEngine, SyncError, SyncErrorKind, Task, TaskStatus,
};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

const START_MS: i64 = 1_700_000_000_000;
const MINUTE_MS: i64 = 60_000;

struct Fixture {
    store: SharedConnection,
    source: Arc<MemoryDocumentSource>,
    clock: ManualClock,
    engine: SyncEngine,
    service: ProjectService,
}

fn fixture() -> Fixture {
    let store: SharedConnection = Arc::new(Mutex::new(open_db_in_memory().unwrap()));
    let source = Arc::new(MemoryDocumentSource::new());
    let clock = ManualClock::new(START_MS);
    let engine = SyncEngine::new(
        Arc::clone(&store),
        source.clone(),
        EngineConfig::default(),
        Arc::new(clock.clone()),
    );
    let service = ProjectService::new(Arc::clone(&store), Arc::new(clock.clone()));
    Fixture {
        store,
        source,
        clock,
        engine,
        service,
    }
}

impl Fixture {
    /// Project "Shed" with one pending task "Paint", exported to `shed.md`.
    fn exported_shed(&self) -> (ProjectId, Task) {
        let project = self.service.create_project("Shed", None, &["home"]).unwrap();
        let task = self.service.create_task(Some(project.uuid), "Paint").unwrap();
        self.engine
            .export_project_document(project.uuid, "shed.md")
            .unwrap();
        self.clock.advance_ms(MINUTE_MS);
        (project.uuid, task)
    }

    fn edit(&self, path: &str, from: &str, to: &str) {
        let text = self.source.text(path).unwrap();
        assert!(text.contains(from), "`{from}` missing from {path}:\n{text}");
        self.source.put(path, text.replace(from, to));
    }

    fn event_count(&self, project_uuid: ProjectId) -> usize {
        let conn = self.store.lock().unwrap();
        SqliteActivityRepository::new(&conn)
            .list_project_events_since(project_uuid, i64::MIN)
            .unwrap()
            .len()
    }

    fn task(&self, task_uuid: Uuid) -> Task {
        let conn = self.store.lock().unwrap();
        SqliteTaskRepository::new(&conn)
            .get_task(task_uuid)
            .unwrap()
            .unwrap()
    }
}

fn task_line(task: &Task, completed: bool) -> String {
    let mark = if completed { "x" } else { " " };
    format!("- [{mark}] {} <!-- task:{} -->", task.title, task.marker_id)
}

#[test]
fn export_writes_a_managed_document_and_links_it() {
    let f = fixture();
    let (project_uuid, task) = f.exported_shed();

    let text = f.source.text("shed.md").unwrap();
    assert!(text.starts_with(&format!("---\nid: {project_uuid}\ntitle: Shed\nstatus: active\ntags: [home]\n---\n")));
    assert!(text.contains(&task_line(&task, false)));

    let managed = f.engine.list_managed_documents().unwrap();
    assert_eq!(managed.len(), 1);
    assert_eq!(managed[0].path, "shed.md");
    assert_eq!(managed[0].project_uuid, project_uuid);
    assert_eq!(managed[0].digest, digest(text.as_bytes()));
    assert_eq!(managed[0].changed, Some(false));

    let project = f.service.get_project(project_uuid).unwrap();
    assert_eq!(project.document.unwrap().path, "shed.md");
}

#[test]
fn export_refuses_taken_paths_and_linked_projects() {
    let f = fixture();
    let (project_uuid, _) = f.exported_shed();
    let other = f.service.create_project("Garden", None, &[]).unwrap();

    let err = f.engine.export_project_document(other.uuid, "shed.md").unwrap_err();
    assert_eq!(err.kind(), SyncErrorKind::DocumentUnavailable);
    assert!(f.service.get_project(other.uuid).unwrap().document.is_none());

    let err = f.engine.export_project_document(project_uuid, "again.md").unwrap_err();
    assert!(matches!(err, SyncError::DocumentUnavailable { .. }));
    assert!(f.source.text("again.md").is_none());

    let err = f.engine.export_project_document(Uuid::new_v4(), "nobody.md").unwrap_err();
    assert_eq!(err.kind(), SyncErrorKind::ProjectNotFound);
    assert!(f.source.text("nobody.md").is_none());
}

#[test]
fn untouched_documents_reconcile_to_a_no_op() {
    let f = fixture();
    let (project_uuid, _) = f.exported_shed();
    let writes = f.source.write_count();
    let events = f.event_count(project_uuid);

    for _ in 0..2 {
        let report = f.engine.reconcile();
        assert!(report.aborted.is_none());
        assert_eq!(report.counts.unchanged, 1);
        assert!(report.audit.is_empty());
        assert_eq!(report.project(project_uuid).unwrap().outcome, ProjectOutcome::Unchanged);
    }
    assert_eq!(f.source.write_count(), writes);
    assert_eq!(f.event_count(project_uuid), events);
}

#[test]
fn first_link_without_provenance_keeps_the_store_value() {
    let f = fixture();
    let project = Project::new("Shed", START_MS);
    let task = Task::new(Some(project.uuid), "Paint", START_MS);
    {
        let conn = f.store.lock().unwrap();
        SqliteProjectRepository::new(&conn).create_project(&project).unwrap();
        SqliteTaskRepository::new(&conn).create_task(&task).unwrap();
    }
    f.source.put(
        "shed.md",
        format!(
            "---\nid: {}\ntitle: Shed\nstatus: active\n---\n\n{}\n",
            project.uuid,
            task_line(&task, true)
        ),
    );
    f.clock.advance_ms(MINUTE_MS);

    let report = f.engine.reconcile();

    assert_eq!(report.counts.conflicts_resolved, 1);
    assert_eq!(report.audit.len(), 1);
    let audit = &report.audit[0];
    assert_eq!(audit.field, SyncField::TaskCompletion);
    assert_eq!(audit.rule, ResolutionRule::StoreFallback);
    assert_eq!(audit.winning_source, Origin::Store);
    assert_eq!(audit.discarded_source, Origin::Document);

    assert_eq!(f.task(task.uuid).status, TaskStatus::Pending);
    assert!(f.source.text("shed.md").unwrap().contains(&task_line(&task, false)));
    assert_eq!(f.event_count(project.uuid), 0);
    assert!(report.warnings.iter().any(|warning| {
        warning.project_uuid == Some(project.uuid) && warning.message.contains("unresolvable")
    }));

    let conn = f.store.lock().unwrap();
    let persisted = SqliteSyncRepository::new(&conn).list_audit(project.uuid).unwrap();
    assert_eq!(persisted.len(), 1);
}

#[test]
fn both_sides_reaching_the_same_value_converge_without_audit() {
    let f = fixture();
    let (project_uuid, task) = f.exported_shed();

    f.clock.advance_ms(10 * MINUTE_MS);
    f.service.complete_task(task.uuid).unwrap();
    f.clock.advance_ms(5 * MINUTE_MS);
    f.edit("shed.md", &task_line(&task, false), &task_line(&task, true));
    let events = f.event_count(project_uuid);
    let writes = f.source.write_count();

    let report = f.engine.reconcile();

    let project_report = report.project(project_uuid).unwrap();
    assert_eq!(project_report.classification, Some(ChangeClass::Conflict));
    assert!(report.audit.is_empty());
    assert_eq!(f.event_count(project_uuid), events);
    assert_eq!(f.source.write_count(), writes);
    assert_eq!(f.task(task.uuid).status, TaskStatus::Completed);

    let again = f.engine.reconcile();
    assert_eq!(again.counts.unchanged, 1);
}

#[test]
fn document_edits_flow_into_the_store_as_document_events() {
    let f = fixture();
    let (project_uuid, task) = f.exported_shed();
    let new_marker = Uuid::new_v4();

    f.edit("shed.md", &task_line(&task, false), &task_line(&task, true));
    let text = f.source.text("shed.md").unwrap();
    f.source.put(
        "shed.md",
        format!("{text}- [ ] Oil hinges <!-- task:{new_marker} -->\n"),
    );

    let report = f.engine.reconcile();
    assert_eq!(report.counts.doc_changed, 1);
    assert!(matches!(
        report.project(project_uuid).unwrap().outcome,
        ProjectOutcome::Applied {
            document_written: false,
            ..
        }
    ));

    assert_eq!(f.task(task.uuid).status, TaskStatus::Completed);
    let tasks = f.service.list_project_tasks(project_uuid).unwrap();
    let created = tasks.iter().find(|t| t.marker_id == new_marker).unwrap();
    assert_eq!(created.title, "Oil hinges");
    assert_eq!(created.status, TaskStatus::Pending);

    let conn = f.store.lock().unwrap();
    let events = SqliteActivityRepository::new(&conn)
        .list_project_events_since(project_uuid, i64::MIN)
        .unwrap();
    let document_events: Vec<_> = events
        .iter()
        .filter(|event| event.origin == Origin::Document)
        .collect();
    assert!(document_events
        .iter()
        .any(|event| event.kind == ActivityKind::Completed && event.entity_uuid == task.uuid));
    assert!(document_events
        .iter()
        .any(|event| event.kind == ActivityKind::Created && event.entity_uuid == created.uuid));
}

#[test]
fn store_side_tasks_and_renames_are_written_into_the_document() {
    let f = fixture();
    let (project_uuid, _) = f.exported_shed();
    let sweep = f.service.create_task(Some(project_uuid), "Sweep").unwrap();
    f.service.rename_project(project_uuid, "Workshop").unwrap();

    let report = f.engine.reconcile();
    assert_eq!(report.counts.store_changed, 1);
    assert!(report.audit.is_empty());

    let text = f.source.text("shed.md").unwrap();
    assert!(text.contains("title: Workshop\n"));
    assert!(text.contains(&task_line(&sweep, false)));

    let again = f.engine.reconcile();
    assert_eq!(again.counts.unchanged, 1);
}

#[test]
fn removed_task_line_stays_removed_across_cycles() {
    let f = fixture();
    let (project_uuid, task) = f.exported_shed();
    let marker = task.marker_id.to_string();
    f.edit("shed.md", &format!("{}\n", task_line(&task, false)), "");
    assert_eq!(f.engine.list_managed_documents().unwrap()[0].changed, Some(true));

    let first = f.engine.reconcile();
    assert_eq!(first.counts.doc_changed, 1);
    assert!(!f.source.text("shed.md").unwrap().contains(&marker));

    f.clock.advance_ms(MINUTE_MS);
    f.service.rename_project(project_uuid, "Workshop").unwrap();
    let second = f.engine.reconcile();
    assert_eq!(second.counts.store_changed, 1);
    let text = f.source.text("shed.md").unwrap();
    assert!(text.contains("title: Workshop\n"));
    assert!(!text.contains(&marker), "removed line came back:\n{text}");

    let third = f.engine.reconcile();
    assert_eq!(third.counts.unchanged, 1);
    assert!(!f.source.text("shed.md").unwrap().contains(&marker));
    assert_eq!(f.task(task.uuid).status, TaskStatus::Pending);
}

#[test]
fn store_failure_aborts_the_cycle_and_keeps_baselines() {
    let f = fixture();
    let (shed, task) = f.exported_shed();
    let yard = f.service.create_project("Yard", None, &[]).unwrap();
    f.engine.export_project_document(yard.uuid, "yard.md").unwrap();
    f.service.rename_project(yard.uuid, "Orchard").unwrap();
    f.edit("shed.md", &task_line(&task, false), &task_line(&task, true));

    let states_before = {
        let conn = f.store.lock().unwrap();
        conn.execute_batch(
            "CREATE TEMP TRIGGER refuse_task_updates BEFORE UPDATE ON tasks
             BEGIN SELECT RAISE(ABORT, 'store offline'); END;",
        )
        .unwrap();
        SqliteSyncRepository::new(&conn).list_states().unwrap()
    };
    let shed_text = f.source.text("shed.md").unwrap();
    let yard_text = f.source.text("yard.md").unwrap();
    let events = f.event_count(shed);

    let report = f.engine.reconcile();

    assert!(report.aborted.is_some());
    assert!(report.project(shed).is_none());
    assert!(report.project(yard.uuid).is_none());
    assert_eq!(f.task(task.uuid).status, TaskStatus::Pending);
    assert_eq!(f.event_count(shed), events);
    assert_eq!(f.source.text("shed.md").unwrap(), shed_text);
    assert_eq!(f.source.text("yard.md").unwrap(), yard_text);
    {
        let conn = f.store.lock().unwrap();
        assert_eq!(SqliteSyncRepository::new(&conn).list_states().unwrap(), states_before);
        conn.execute_batch("DROP TRIGGER refuse_task_updates;").unwrap();
    }

    let retry = f.engine.reconcile();
    assert!(retry.aborted.is_none());
    assert_eq!(f.task(task.uuid).status, TaskStatus::Completed);
    assert!(f.source.text("yard.md").unwrap().contains("title: Orchard\n"));
}

#[test]
fn most_recent_event_decides_a_real_conflict() {
    let f = fixture();
    let (project_uuid, _) = f.exported_shed();

    f.service.rename_project(project_uuid, "Workshop").unwrap();
    f.clock.advance_ms(MINUTE_MS);
    f.edit("shed.md", "title: Shed", "title: Studio");
    {
        let conn = f.store.lock().unwrap();
        SqliteActivityRepository::new(&conn)
            .append(&NewActivityEvent::project(
                project_uuid,
                ActivityKind::Touched,
                Origin::Document,
                Some("title".to_string()),
                START_MS + 2 * MINUTE_MS,
            ))
            .unwrap();
    }

    let report = f.engine.reconcile();

    assert_eq!(report.counts.conflicts_resolved, 1);
    assert_eq!(report.audit.len(), 1);
    let audit = &report.audit[0];
    assert_eq!(audit.field, SyncField::Title);
    assert_eq!(audit.rule, ResolutionRule::MostRecentEvent);
    assert_eq!(audit.winning_value, "Studio");
    assert_eq!(audit.discarded_value, "Workshop");
    assert_eq!(audit.discarded_source, Origin::Store);
    assert_eq!(f.service.get_project(project_uuid).unwrap().title, "Studio");
}

#[test]
fn older_document_event_loses_to_the_store() {
    let f = fixture();
    let (project_uuid, _) = f.exported_shed();

    f.edit("shed.md", "title: Shed", "title: Studio");
    {
        let conn = f.store.lock().unwrap();
        SqliteActivityRepository::new(&conn)
            .append(&NewActivityEvent::project(
                project_uuid,
                ActivityKind::Touched,
                Origin::Document,
                Some("title".to_string()),
                START_MS + MINUTE_MS,
            ))
            .unwrap();
    }
    f.clock.advance_ms(MINUTE_MS);
    f.service.rename_project(project_uuid, "Workshop").unwrap();

    let report = f.engine.reconcile();

    assert_eq!(report.audit.len(), 1);
    assert_eq!(report.audit[0].winning_source, Origin::Store);
    assert_eq!(report.audit[0].discarded_value, "Studio");
    assert_eq!(f.service.get_project(project_uuid).unwrap().title, "Workshop");
    assert!(f.source.text("shed.md").unwrap().contains("title: Workshop\n"));
}

#[test]
fn interrupted_promotion_is_repaired_without_reapplying() {
    let f = fixture();
    let (project_uuid, task) = f.exported_shed();
    f.edit("shed.md", &task_line(&task, false), &task_line(&task, true));

    let report = f.engine.reconcile_with(ReconcileOptions {
        promote: false,
        recompute_momentum: false,
    });
    assert_eq!(report.counts.doc_changed, 1);
    {
        let conn = f.store.lock().unwrap();
        let state = SqliteSyncRepository::new(&conn).get_state(project_uuid).unwrap().unwrap();
        assert!(state.pending.is_some());
    }
    let events = f.event_count(project_uuid);

    let scan = f.engine.scan();
    assert_eq!(scan.counts.unchanged, 1);
    assert_eq!(scan.project(project_uuid).unwrap().outcome, ProjectOutcome::Unchanged);

    let repair = f.engine.reconcile();
    assert_eq!(repair.counts.unchanged, 1);
    assert_eq!(f.event_count(project_uuid), events);

    let conn = f.store.lock().unwrap();
    let state = SqliteSyncRepository::new(&conn).get_state(project_uuid).unwrap().unwrap();
    assert!(state.pending.is_none());
    let text = f.source.text("shed.md").unwrap();
    assert_eq!(state.baseline.digest, digest(text.as_bytes()));
}

#[test]
fn scan_previews_without_writing() {
    let f = fixture();
    let (project_uuid, task) = f.exported_shed();
    f.edit("shed.md", &task_line(&task, false), &task_line(&task, true));
    let writes = f.source.write_count();

    let report = f.engine.scan();
    assert_eq!(report.counts.doc_changed, 1);
    assert_eq!(
        report.project(project_uuid).unwrap().outcome,
        ProjectOutcome::Planned {
            store_writes: 1,
            document_write: false,
        }
    );
    assert_eq!(f.task(task.uuid).status, TaskStatus::Pending);
    assert_eq!(f.source.write_count(), writes);
}

#[test]
fn failed_document_write_rolls_the_project_back() {
    let f = fixture();
    let (project_uuid, task) = f.exported_shed();
    f.edit("shed.md", &task_line(&task, false), &task_line(&task, true));
    f.service.rename_project(project_uuid, "Workshop").unwrap();
    let events = f.event_count(project_uuid);
    let baseline_digest = {
        let conn = f.store.lock().unwrap();
        let state = SqliteSyncRepository::new(&conn).get_state(project_uuid).unwrap().unwrap();
        state.baseline.digest
    };
    f.source.lock("shed.md");

    let report = f.engine.reconcile();
    assert_eq!(report.counts.errors, 1);
    assert!(report.aborted.is_none());
    assert!(matches!(
        report.project(project_uuid).unwrap().outcome,
        ProjectOutcome::Failed {
            kind: SyncErrorKind::DocumentUnavailable,
            ..
        }
    ));
    assert_eq!(f.task(task.uuid).status, TaskStatus::Pending);
    assert_eq!(f.event_count(project_uuid), events);
    {
        let conn = f.store.lock().unwrap();
        let state = SqliteSyncRepository::new(&conn).get_state(project_uuid).unwrap().unwrap();
        assert_eq!(state.baseline.digest, baseline_digest);
        assert!(state.pending.is_none());
    }

    f.source.unlock("shed.md");
    let retry = f.engine.reconcile();
    assert_eq!(retry.counts.errors, 0);
    assert_eq!(f.task(task.uuid).status, TaskStatus::Completed);
    let text = f.source.text("shed.md").unwrap();
    assert!(text.contains("title: Workshop\n"));
    assert!(text.contains(&task_line(&task, true)));
}

#[test]
fn malformed_document_fails_only_its_project() {
    let f = fixture();
    let (shed, _) = f.exported_shed();
    let garden = f.service.create_project("Garden", None, &[]).unwrap();
    f.engine.export_project_document(garden.uuid, "garden.md").unwrap();
    f.service.rename_project(garden.uuid, "Orchard").unwrap();
    f.edit("shed.md", "status: active", "status: someday");

    let report = f.engine.reconcile();

    assert!(report.aborted.is_none());
    assert_eq!(report.counts.errors, 1);
    assert!(matches!(
        report.project(shed).unwrap().outcome,
        ProjectOutcome::Failed {
            kind: SyncErrorKind::MalformedDocument,
            ..
        }
    ));
    assert!(matches!(
        report.project(garden.uuid).unwrap().outcome,
        ProjectOutcome::Applied { .. }
    ));
    assert!(f.source.text("garden.md").unwrap().contains("title: Orchard\n"));

    f.edit("shed.md", "status: someday", "status: on-hold");
    let retry = f.engine.reconcile();
    assert_eq!(retry.counts.errors, 0);
    assert_eq!(
        f.service.get_project(shed).unwrap().status,
        momentum_core::ProjectStatus::OnHold
    );
}

#[test]
fn held_project_lock_skips_the_project() {
    let f = fixture();
    let (project_uuid, task) = f.exported_shed();
    f.edit("shed.md", &task_line(&task, false), &task_line(&task, true));

    let guard = f.engine.locks().try_acquire(project_uuid).unwrap();
    let report = f.engine.reconcile();
    assert_eq!(report.counts.skipped, 1);
    assert_eq!(report.counts.errors, 0);
    assert!(matches!(
        report.project(project_uuid).unwrap().outcome,
        ProjectOutcome::Skipped { .. }
    ));
    assert_eq!(f.task(task.uuid).status, TaskStatus::Pending);

    drop(guard);
    let report = f.engine.reconcile();
    assert_eq!(report.counts.doc_changed, 1);
    assert_eq!(f.task(task.uuid).status, TaskStatus::Completed);
}

#[test]
fn cancelled_cycle_applies_nothing() {
    let f = fixture();
    let (project_uuid, task) = f.exported_shed();
    f.edit("shed.md", &task_line(&task, false), &task_line(&task, true));

    let token = f.engine.cancellation_token();
    token.cancel();
    let report = f.engine.reconcile();
    assert!(report.cancelled);
    assert_eq!(report.counts.skipped, 1);
    assert_eq!(f.task(task.uuid).status, TaskStatus::Pending);

    token.reset();
    let report = f.engine.reconcile();
    assert!(!report.cancelled);
    assert!(report.project(project_uuid).is_some());
    assert_eq!(f.task(task.uuid).status, TaskStatus::Completed);
}

#[test]
fn unmanaged_and_unknown_documents_are_reported_not_linked() {
    let f = fixture();
    f.source.put("inbox.md", "# Ideas\n\n- [ ] Build a bench\n");
    let stranger = Uuid::new_v4();
    f.source.put(
        "stranger.md",
        format!("---\nid: {stranger}\ntitle: Nobody\n---\n"),
    );

    let report = f.engine.reconcile();

    assert!(report.projects.is_empty());
    assert_eq!(report.discovered.len(), 1);
    assert_eq!(report.discovered[0].path, "inbox.md");
    assert_eq!(report.discovered[0].task_markers, 0);
    assert!(report
        .warnings
        .iter()
        .any(|w| w.path.as_deref() == Some("stranger.md") && w.project_uuid == Some(stranger)));
    assert!(f.engine.list_managed_documents().unwrap().is_empty());
}

#[test]
fn cycle_report_serializes_for_callers() {
    let f = fixture();
    let (project_uuid, task) = f.exported_shed();
    f.edit("shed.md", &task_line(&task, false), &task_line(&task, true));

    let report = f.engine.reconcile();
    let json = serde_json::to_value(&report).unwrap();

    assert_eq!(json["mode"], "reconcile");
    assert_eq!(json["counts"]["doc_changed"], 1);
    let project = &json["projects"][0];
    assert_eq!(project["project_uuid"], project_uuid.to_string());
    assert_eq!(project["outcome"], "applied");
    assert_eq!(project["classification"], "doc_changed");
}

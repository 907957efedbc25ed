//! Cycle orchestration: the `scan` / `reconcile` / `recompute_momentum`
//! trigger surface.
//!
//! # Responsibility
//! - Enumerate documents, fan the fingerprint/decode phase out over the
//!   scanner pool, pair documents with projects and drive one apply per
//!   linked project.
//! - Collect everything into a returned [`CycleReport`].
//!
//! # Invariants
//! - `scan` never writes: applies run in preview mode and fingerprints are
//!   not refreshed.
//! - Cancellation is checked between projects, never inside an apply.
//! - A project is applied only while its [`ProjectLocks`] guard is held, and
//!   only if its sync state under that guard still equals the state the scan
//!   was paired with.
//! - `StoreUnavailable` stops the cycle; projects already committed stay
//!   committed, later projects keep their previous baselines.

use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::db::{self, SharedConnection};
use crate::model::project::{DocumentRef, ProjectId};
use crate::model::sync::{Baseline, DocumentRecord, SyncState};
use crate::model::task::TaskStatus;
use crate::momentum::{MomentumEngine, MomentumReport};
use crate::repo::activity_repo::{ActivityRepository, SqliteActivityRepository};
use crate::repo::project_repo::{ProjectRepository, SqliteProjectRepository};
use crate::repo::sync_repo::SqliteSyncRepository;
use crate::repo::task_repo::{SqliteTaskRepository, TaskRepository};
use crate::sync::applier::{ApplyMode, ApplyOutcome, ProjectWork, SyncApplier};
use crate::sync::codec;
use crate::sync::detector::ChangeClass;
use crate::sync::fingerprint::{digest, fingerprint_of, FingerprintStore};
use crate::sync::lock::ProjectLocks;
use crate::sync::report::{CycleMode, CycleReport, DiscoveredDocument, ProjectOutcome, ProjectReport};
use crate::sync::scan::{DocumentScanner, ScanJob, ScanOutcome, ScannedDocument};
use crate::sync::source::{DocumentSource, SourceError};
use crate::sync::{CancellationToken, SyncError, SyncResult};
use log::{error, info, warn};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, MutexGuard};
use std::time::Instant;

/// Knobs for one reconcile call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileOptions {
    /// Promote pending baselines right after each commit. Turning this off
    /// leaves every applied project exactly as an interruption between
    /// commit and promotion would.
    pub promote: bool,
    /// Recompute momentum for projects whose store side changed.
    pub recompute_momentum: bool,
}

impl Default for ReconcileOptions {
    fn default() -> Self {
        Self {
            promote: true,
            recompute_momentum: true,
        }
    }
}

/// Path and agreed digest of one linked document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagedDocument {
    pub path: String,
    pub digest: String,
    pub project_uuid: ProjectId,
    /// Whether the document differs from `digest`; `None` when unreadable.
    pub changed: Option<bool>,
}

/// One linked project paired with its scanned document.
struct LinkedWork {
    project_uuid: ProjectId,
    path: String,
    /// Sync state as read before the scan.
    state: Option<SyncState>,
}

pub struct SyncEngine {
    store: SharedConnection,
    source: Arc<dyn DocumentSource>,
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    locks: Arc<ProjectLocks>,
    momentum: MomentumEngine,
    cancel: CancellationToken,
}

impl SyncEngine {
    pub fn new(
        store: SharedConnection,
        source: Arc<dyn DocumentSource>,
        config: EngineConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let locks = Arc::new(ProjectLocks::new(config.locks.lock_dir.clone()));
        Self::with_locks(store, source, config, clock, locks)
    }

    /// Builds an engine sharing `locks` with other engines over the same
    /// store.
    pub fn with_locks(
        store: SharedConnection,
        source: Arc<dyn DocumentSource>,
        config: EngineConfig,
        clock: Arc<dyn Clock>,
        locks: Arc<ProjectLocks>,
    ) -> Self {
        let momentum = MomentumEngine::new(config.momentum.clone());
        Self {
            store,
            source,
            config,
            clock,
            locks,
            momentum,
            cancel: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn locks(&self) -> &Arc<ProjectLocks> {
        &self.locks
    }

    /// Token observed between projects and between documents.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Read-only classification of every linked project.
    pub fn scan(&self) -> CycleReport {
        self.run_cycle(CycleMode::Scan, ReconcileOptions::default())
    }

    pub fn reconcile(&self) -> CycleReport {
        self.reconcile_with(ReconcileOptions::default())
    }

    pub fn reconcile_with(&self, options: ReconcileOptions) -> CycleReport {
        self.run_cycle(CycleMode::Reconcile, options)
    }

    /// Recomputes momentum for one project, or all tracked projects.
    ///
    /// # Errors
    /// - `ProjectNotFound` when `project` names no stored project.
    /// - `StoreUnavailable` for any store failure.
    pub fn recompute_momentum(&self, project: Option<ProjectId>) -> SyncResult<MomentumReport> {
        let now_ms = self.clock.now_ms();
        let mut conn = self.lock_store();
        self.momentum
            .recompute(&mut conn, project, now_ms)
            .map_err(|err| match project {
                Some(project_uuid) => SyncError::from_project_lookup(project_uuid, err),
                None => SyncError::from(err),
            })
    }

    /// Linked documents with the digest both sides last agreed on and
    /// whether each has changed since. Nothing is written.
    pub fn list_managed_documents(&self) -> SyncResult<Vec<ManagedDocument>> {
        let conn = self.lock_store();
        let states = SqliteSyncRepository::new(&conn).list_states()?;
        let fingerprints = FingerprintStore::new(&conn);

        let mut documents = Vec::with_capacity(states.len());
        for state in &states {
            let agreed = state.effective().digest.clone();
            let changed = match fingerprints.has_changed(
                self.source.as_ref(),
                &state.document_path,
                &agreed,
            ) {
                Ok(changed) => Some(changed),
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => {
                    warn!(
                        "event=document_unavailable module=sync status=warn project_uuid={} error={}",
                        state.project_uuid, err
                    );
                    None
                }
            };
            documents.push(ManagedDocument {
                path: state.document_path.clone(),
                digest: agreed,
                project_uuid: state.project_uuid,
                changed,
            });
        }
        Ok(documents)
    }

    /// Writes a fresh document for a store-created project at `path` and
    /// links the two.
    ///
    /// # Errors
    /// - `DocumentUnavailable` with `AlreadyExists` when `path` is taken or
    ///   the project is already linked.
    /// - `ProjectNotFound` when the project does not exist.
    pub fn export_project_document(&self, project_uuid: ProjectId, path: &str) -> SyncResult<DocumentRecord> {
        let _guard = self.locks.try_acquire(project_uuid)?;
        let now_ms = self.clock.now_ms();
        let mut conn = self.lock_store();
        let tx = conn.transaction()?;

        let projects = SqliteProjectRepository::new(&tx);
        let sync_repo = SqliteSyncRepository::new(&tx);
        let project = projects
            .get_project(project_uuid)?
            .ok_or(SyncError::ProjectNotFound { project_uuid })?;
        if let Some(state) = sync_repo.get_state(project_uuid)? {
            return Err(SyncError::DocumentUnavailable {
                path: state.document_path,
                source: SourceError::AlreadyExists,
            });
        }
        let tasks: Vec<_> = SqliteTaskRepository::new(&tx)
            .list_project_tasks(project_uuid)?
            .into_iter()
            .filter(|task| task.status != TaskStatus::Cancelled)
            .collect();

        let text = codec::render_new(&project, &tasks);
        let document = codec::decode(text.as_bytes()).map_err(|source| SyncError::MalformedDocument {
            path: path.to_string(),
            source,
        })?;
        let document_digest = digest(text.as_bytes());
        let baseline = Baseline {
            digest: document_digest.clone(),
            version: projects.version(project_uuid)?,
            snapshot: document.snapshot(),
            event_id: SqliteActivityRepository::new(&tx).latest_event_id()?,
        };
        let record = DocumentRecord {
            path: path.to_string(),
            project_uuid: Some(project_uuid),
            digest: document_digest.clone(),
            marker_ids: document.marker_ids(),
            synced_at: now_ms,
        };
        sync_repo.stage_pending(project_uuid, path, &baseline, now_ms)?;
        projects.set_document_ref(
            project_uuid,
            Some(&DocumentRef {
                path: path.to_string(),
                digest: document_digest,
            }),
        )?;
        sync_repo.upsert_document_record(&record)?;

        self.source
            .create_new(path, text.as_bytes())
            .map_err(|source| SyncError::DocumentUnavailable {
                path: path.to_string(),
                source,
            })?;
        if let Ok(meta) = self.source.metadata(path) {
            sync_repo.upsert_fingerprint(&fingerprint_of(path, text.as_bytes(), meta, now_ms))?;
        }
        tx.commit()?;
        SqliteSyncRepository::new(&conn).promote_pending(project_uuid)?;

        info!(
            "event=document_export module=sync status=ok project_uuid={} tasks={}",
            project_uuid,
            tasks.len()
        );
        Ok(record)
    }

    fn lock_store(&self) -> MutexGuard<'_, Connection> {
        db::lock_store(&self.store)
    }

    fn run_cycle(&self, mode: CycleMode, options: ReconcileOptions) -> CycleReport {
        let started = Instant::now();
        let now_ms = self.clock.now_ms();
        let mut report = CycleReport::new(mode, now_ms);
        info!(
            "event=cycle module=sync status=start cycle_id={} mode={}",
            report.cycle_id,
            mode.as_str()
        );

        if let Err(err) = self.run_phases(mode, options, now_ms, &mut report) {
            error!(
                "event=cycle module=sync status=abort cycle_id={} mode={} error_kind={:?}",
                report.cycle_id,
                mode.as_str(),
                err.kind()
            );
            report.aborted = Some(err.to_string());
        }
        report.cancelled = report.cancelled || self.cancel.is_cancelled();
        report.finished_at = self.clock.now_ms();

        let counts = report.counts;
        info!(
            "event=cycle module=sync status=ok cycle_id={} mode={} unchanged={} doc_changed={} store_changed={} conflicts_resolved={} errors={} skipped={} audit_entries={} cancelled={} duration_ms={}",
            report.cycle_id,
            mode.as_str(),
            counts.unchanged,
            counts.doc_changed,
            counts.store_changed,
            counts.conflicts_resolved,
            counts.errors,
            counts.skipped,
            report.audit.len(),
            report.cancelled,
            started.elapsed().as_millis()
        );
        report
    }

    /// Returns `Err` only for cycle-fatal failures.
    fn run_phases(
        &self,
        mode: CycleMode,
        options: ReconcileOptions,
        now_ms: i64,
        report: &mut CycleReport,
    ) -> SyncResult<()> {
        let states: Vec<SyncState> = {
            let conn = self.lock_store();
            SqliteSyncRepository::new(&conn).list_states()?
        };
        let by_path: HashMap<&str, &SyncState> = states
            .iter()
            .map(|state| (state.document_path.as_str(), state))
            .collect();

        let mut paths = match self.source.list_paths() {
            Ok(paths) => paths,
            Err(err) => {
                warn!(
                    "event=document_unavailable module=sync status=warn reason=enumeration_failed error={}",
                    err
                );
                report.warn(None, None, format!("document tree unavailable: {err}"));
                Vec::new()
            }
        };
        for state in &states {
            if !paths.iter().any(|path| path == &state.document_path) {
                paths.push(state.document_path.clone());
            }
        }
        paths.sort();
        paths.dedup();

        let jobs = paths
            .iter()
            .map(|path| ScanJob {
                path: path.clone(),
                known_digest: by_path
                    .get(path.as_str())
                    .map(|state| state.effective().digest.clone()),
            })
            .collect();
        let scanner = DocumentScanner::new(Arc::clone(&self.source), &self.config.scan);
        let outcomes = scanner.scan(jobs, now_ms, &self.cancel);

        if mode == CycleMode::Reconcile {
            let conn = self.lock_store();
            let fingerprints = FingerprintStore::new(&conn);
            for outcome in outcomes.values() {
                if let ScanOutcome::Read(scanned) = outcome {
                    fingerprints.record(&scanned.fingerprint)?;
                }
            }
        }

        let work = self.pair_documents(&outcomes, &by_path, report)?;

        let apply_mode = match mode {
            CycleMode::Scan => ApplyMode::Preview,
            CycleMode::Reconcile => ApplyMode::Commit {
                promote: options.promote,
            },
        };
        let applier = SyncApplier::new(self.source.as_ref(), report.cycle_id, now_ms);
        let mut touched_store = Vec::new();

        for item in &work {
            if self.cancel.is_cancelled() {
                report.cancelled = true;
                report.record_skip(item.project_uuid, &item.path, "cycle cancelled");
                continue;
            }
            let scanned = match outcomes.get(&item.path) {
                Some(ScanOutcome::Read(scanned)) => scanned,
                Some(ScanOutcome::Failed(source)) => {
                    let err = SyncError::DocumentUnavailable {
                        path: item.path.clone(),
                        source: source.clone(),
                    };
                    self.skip_project(report, item, &err);
                    continue;
                }
                Some(ScanOutcome::Cancelled) | None => {
                    report.cancelled = true;
                    report.record_skip(item.project_uuid, &item.path, "cycle cancelled");
                    continue;
                }
            };

            match self.apply_one(&applier, item, scanned, apply_mode) {
                Ok(outcome) => {
                    if mode == CycleMode::Reconcile && outcome.store_writes > 0 {
                        touched_store.push(item.project_uuid);
                    }
                    record_outcome(report, item, mode, outcome);
                }
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => self.skip_project(report, item, &err),
            }
        }

        if mode == CycleMode::Reconcile && options.recompute_momentum {
            let mut conn = self.lock_store();
            for project_uuid in touched_store {
                self.momentum.recompute(&mut conn, Some(project_uuid), now_ms)?;
            }
        }
        Ok(())
    }

    fn apply_one(
        &self,
        applier: &SyncApplier<'_>,
        item: &LinkedWork,
        scanned: &ScannedDocument,
        mode: ApplyMode,
    ) -> SyncResult<ApplyOutcome> {
        let _guard = self.locks.try_acquire(item.project_uuid)?;
        let mut conn = self.lock_store();
        let current = SqliteSyncRepository::new(&conn).get_state(item.project_uuid)?;
        if current != item.state {
            info!(
                "event=project_skip module=sync status=skip reason=baseline_moved project_uuid={}",
                item.project_uuid
            );
            return Err(SyncError::ConcurrentAccessDenied {
                project_uuid: item.project_uuid,
            });
        }
        applier.apply_project(
            &mut conn,
            &ProjectWork {
                project_uuid: item.project_uuid,
                document_path: &item.path,
                scanned,
                state: item.state.as_ref(),
            },
            mode,
        )
    }

    /// Splits scanned documents into linked work, discoveries and warnings.
    fn pair_documents(
        &self,
        outcomes: &BTreeMap<String, ScanOutcome>,
        by_path: &HashMap<&str, &SyncState>,
        report: &mut CycleReport,
    ) -> SyncResult<Vec<LinkedWork>> {
        let linked_projects: HashMap<ProjectId, &str> = by_path
            .values()
            .map(|state| (state.project_uuid, state.document_path.as_str()))
            .collect();
        let mut claimed: HashMap<ProjectId, String> = HashMap::new();
        let mut work = Vec::new();

        for (path, outcome) in outcomes {
            if let Some(state) = by_path.get(path.as_str()) {
                work.push(LinkedWork {
                    project_uuid: state.project_uuid,
                    path: path.clone(),
                    state: Some((*state).clone()),
                });
                continue;
            }

            let scanned = match outcome {
                ScanOutcome::Read(scanned) => scanned,
                ScanOutcome::Failed(err) => {
                    warn!(
                        "event=document_unavailable module=sync status=warn linked=false error={}",
                        err
                    );
                    report.warn(Some(path.as_str()), None, format!("document unreadable: {err}"));
                    continue;
                }
                ScanOutcome::Cancelled => continue,
            };
            let document = match scanned.decode() {
                Ok(document) => document,
                Err(err) => {
                    warn!(
                        "event=document_malformed module=sync status=warn linked=false error={}",
                        err
                    );
                    report.warn(Some(path.as_str()), None, format!("malformed document: {err}"));
                    continue;
                }
            };

            let Some(project_uuid) = document.linked_id() else {
                report.discovered.push(DiscoveredDocument {
                    path: path.clone(),
                    digest: scanned.fingerprint.digest.clone(),
                    task_markers: document.tasks().len(),
                });
                continue;
            };

            if let Some(linked_path) = linked_projects.get(&project_uuid) {
                report.warn(
                    Some(path.as_str()),
                    Some(project_uuid),
                    format!("project is already linked to {linked_path}"),
                );
                continue;
            }
            if let Some(first) = claimed.get(&project_uuid) {
                report.warn(
                    Some(path.as_str()),
                    Some(project_uuid),
                    format!("project is also claimed by {first}; link skipped"),
                );
                continue;
            }
            let exists = {
                let conn = self.lock_store();
                SqliteProjectRepository::new(&conn)
                    .get_project(project_uuid)?
                    .is_some()
            };
            if !exists {
                report.warn(Some(path.as_str()), Some(project_uuid), "document names an unknown project");
                continue;
            }

            claimed.insert(project_uuid, path.clone());
            work.push(LinkedWork {
                project_uuid,
                path: path.clone(),
                state: None,
            });
        }

        Ok(work)
    }

    fn skip_project(
        &self,
        report: &mut CycleReport,
        item: &LinkedWork,
        err: &SyncError,
    ) {
        let event = match err {
            SyncError::MalformedDocument { .. } => "document_malformed",
            SyncError::DocumentUnavailable { .. } => "document_unavailable",
            _ => "project_skip",
        };
        warn!(
            "event={} module=sync status=skip project_uuid={} error_kind={:?}",
            event,
            item.project_uuid,
            err.kind()
        );
        report.record_failure(item.project_uuid, &item.path, None, err);
    }
}

fn record_outcome(report: &mut CycleReport, item: &LinkedWork, mode: CycleMode, outcome: ApplyOutcome) {
    report.record_class(outcome.class);
    for message in &outcome.warnings {
        report.warn(Some(item.path.as_str()), Some(item.project_uuid), message.clone());
    }
    let project_outcome = match (outcome.class, mode) {
        (ChangeClass::Unchanged, _) => ProjectOutcome::Unchanged,
        (_, CycleMode::Scan) => ProjectOutcome::Planned {
            store_writes: outcome.store_writes,
            document_write: outcome.document_written,
        },
        (_, CycleMode::Reconcile) => ProjectOutcome::Applied {
            store_writes: outcome.store_writes,
            document_written: outcome.document_written,
        },
    };
    report.audit.extend(outcome.audit);
    report.projects.push(ProjectReport {
        project_uuid: item.project_uuid,
        document_path: item.path.clone(),
        classification: Some(outcome.class),
        outcome: project_outcome,
    });
}

#[cfg(test)]
mod tests {
    use super::{LinkedWork, SyncEngine};
    use crate::clock::{Clock, ManualClock};
    use crate::config::EngineConfig;
    use crate::db::open_db_in_memory;
    use crate::repo::sync_repo::SqliteSyncRepository;
    use crate::service::ProjectService;
    use crate::sync::applier::{ApplyMode, SyncApplier};
    use crate::sync::scan::{DocumentScanner, ScanJob, ScanOutcome};
    use crate::sync::source::MemoryDocumentSource;
    use crate::sync::{CancellationToken, SyncError};
    use std::sync::{Arc, Mutex};
    use uuid::Uuid;

    #[test]
    fn apply_skips_a_project_whose_baseline_moved_after_the_scan() {
        let store = Arc::new(Mutex::new(open_db_in_memory().unwrap()));
        let source = Arc::new(MemoryDocumentSource::new());
        let clock = ManualClock::new(1_000);
        let engine = SyncEngine::new(
            Arc::clone(&store),
            source.clone(),
            EngineConfig::default(),
            Arc::new(clock.clone()),
        );
        let service = ProjectService::new(Arc::clone(&store), Arc::new(clock.clone()));
        let project = service.create_project("Shed", None, &[]).unwrap();
        engine.export_project_document(project.uuid, "shed.md").unwrap();

        let seen = {
            let conn = store.lock().unwrap();
            SqliteSyncRepository::new(&conn).get_state(project.uuid).unwrap()
        };
        let outcomes = DocumentScanner::new(source.clone(), &engine.config().scan).scan(
            vec![ScanJob {
                path: "shed.md".to_string(),
                known_digest: None,
            }],
            1_000,
            &CancellationToken::new(),
        );
        let Some(ScanOutcome::Read(scanned)) = outcomes.get("shed.md") else {
            panic!("shed.md was not read");
        };

        // Another cycle commits a new baseline between the scan and the apply.
        clock.advance_ms(60_000);
        service.rename_project(project.uuid, "Workshop").unwrap();
        assert_eq!(engine.reconcile().counts.store_changed, 1);
        let text = source.text("shed.md").unwrap();

        let applier = SyncApplier::new(source.as_ref(), Uuid::new_v4(), clock.now_ms());
        let err = engine
            .apply_one(
                &applier,
                &LinkedWork {
                    project_uuid: project.uuid,
                    path: "shed.md".to_string(),
                    state: seen,
                },
                scanned,
                ApplyMode::Commit { promote: true },
            )
            .unwrap_err();

        assert!(matches!(err, SyncError::ConcurrentAccessDenied { .. }));
        assert_eq!(service.get_project(project.uuid).unwrap().title, "Workshop");
        assert_eq!(source.text("shed.md").unwrap(), text);
    }
}

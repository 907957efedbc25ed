//! Change classification against the sync baseline.
//!
//! # Responsibility
//! - Classify a linked project as unchanged, document-changed,
//!   store-changed or conflicting from digest and store version.
//! - Classify each synced field (title, status, tags, task completion) the
//!   same way using values instead of digests.
//! - Find task lines the store does not know and store tasks the document
//!   has never shown.
//!
//! # Invariants
//! - Pure: no IO, no store access.
//! - A field with identical document and store values is never a change,
//!   unless both sides moved away from the baseline together; that case is a
//!   conflict the resolver settles as unchanged.
//! - Without a baseline every disagreeing field is a conflict.

use crate::model::activity::EntityType;
use crate::model::project::{normalize_tags, Project, ProjectStatus};
use crate::model::sync::{completion_value, Baseline, SyncField};
use crate::model::task::{MarkerId, Task, TaskStatus};
use crate::sync::codec::{DecodedDocument, NewTaskLine, TaskEntry};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeClass {
    Unchanged,
    DocChanged,
    StoreChanged,
    Conflict,
}

impl ChangeClass {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unchanged => "unchanged",
            Self::DocChanged => "doc_changed",
            Self::StoreChanged => "store_changed",
            Self::Conflict => "conflict",
        }
    }
}

/// Comparable value of one synced field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    Title(String),
    Status(ProjectStatus),
    Tags(Vec<String>),
    Completion(bool),
}

impl FieldValue {
    /// Text form used in audit entries and event values.
    pub fn render(&self) -> String {
        match self {
            Self::Title(title) => title.clone(),
            Self::Status(status) => status.as_str().to_string(),
            Self::Tags(tags) => format!("[{}]", tags.join(", ")),
            Self::Completion(done) => completion_value(*done).to_string(),
        }
    }
}

/// One field whose document and store values need a decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldChange {
    pub field: SyncField,
    pub entity_type: EntityType,
    pub entity_uuid: Uuid,
    pub marker_id: Option<MarkerId>,
    pub class: ChangeClass,
    pub baseline: Option<FieldValue>,
    /// `None` when the document does not carry the field.
    pub document: Option<FieldValue>,
    pub store: FieldValue,
}

/// Everything the detector found for one linked project.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectDelta {
    pub class: ChangeClass,
    pub fields: Vec<FieldChange>,
    /// Task lines whose marker the store has never seen.
    pub new_document_tasks: Vec<TaskEntry>,
    /// Markers owned by tasks of other projects.
    pub foreign_markers: Vec<MarkerId>,
    /// Store tasks absent from both the document and the baseline.
    pub appended_tasks: Vec<NewTaskLine>,
}

impl ProjectDelta {
    pub fn unchanged() -> Self {
        Self {
            class: ChangeClass::Unchanged,
            fields: Vec::new(),
            new_document_tasks: Vec::new(),
            foreign_markers: Vec::new(),
            appended_tasks: Vec::new(),
        }
    }
}

/// Project-level classification from digest and store version.
pub fn classify_project(
    baseline: Option<&Baseline>,
    document_digest: &str,
    store_version: i64,
) -> ChangeClass {
    let Some(baseline) = baseline else {
        return ChangeClass::Conflict;
    };
    match (
        baseline.digest != document_digest,
        baseline.version != store_version,
    ) {
        (false, false) => ChangeClass::Unchanged,
        (true, false) => ChangeClass::DocChanged,
        (false, true) => ChangeClass::StoreChanged,
        (true, true) => ChangeClass::Conflict,
    }
}

/// Per-field classification of (baseline, document, store).
pub fn classify_field(
    baseline: Option<&FieldValue>,
    document: Option<&FieldValue>,
    store: &FieldValue,
) -> ChangeClass {
    let Some(document) = document else {
        return ChangeClass::StoreChanged;
    };
    if document == store {
        return match baseline {
            Some(base) if base != document => ChangeClass::Conflict,
            _ => ChangeClass::Unchanged,
        };
    }
    let Some(baseline) = baseline else {
        return ChangeClass::Conflict;
    };
    match (document != baseline, store != baseline) {
        (true, false) => ChangeClass::DocChanged,
        (false, true) => ChangeClass::StoreChanged,
        _ => ChangeClass::Conflict,
    }
}

/// Inputs for [`detect`].
pub struct DetectorInput<'a> {
    pub project: &'a Project,
    pub tasks: &'a [Task],
    pub store_version: i64,
    pub baseline: Option<&'a Baseline>,
    pub document_digest: &'a str,
    pub document: &'a DecodedDocument,
    /// Document markers that belong to tasks of other projects.
    pub foreign_markers: &'a BTreeSet<MarkerId>,
}

/// Classifies one linked project and its fields.
pub fn detect(input: &DetectorInput<'_>) -> ProjectDelta {
    let class = classify_project(input.baseline, input.document_digest, input.store_version);
    if class == ChangeClass::Unchanged {
        return ProjectDelta::unchanged();
    }

    let project = input.project;
    let doc_snapshot = input.document.snapshot();
    let base_snapshot = input.baseline.map(|baseline| &baseline.snapshot);
    let mut fields = Vec::new();

    let mut push = |field: SyncField,
                    entity_type: EntityType,
                    entity_uuid: Uuid,
                    marker_id: Option<MarkerId>,
                    baseline: Option<FieldValue>,
                    document: Option<FieldValue>,
                    store: FieldValue| {
        let class = classify_field(baseline.as_ref(), document.as_ref(), &store);
        if class != ChangeClass::Unchanged {
            fields.push(FieldChange {
                field,
                entity_type,
                entity_uuid,
                marker_id,
                class,
                baseline,
                document,
                store,
            });
        }
    };

    push(
        SyncField::Title,
        EntityType::Project,
        project.uuid,
        None,
        base_snapshot.and_then(|snap| snap.title.clone().map(FieldValue::Title)),
        doc_snapshot.title.clone().map(FieldValue::Title),
        FieldValue::Title(project.title.clone()),
    );
    push(
        SyncField::Status,
        EntityType::Project,
        project.uuid,
        None,
        base_snapshot.and_then(|snap| snap.status.map(FieldValue::Status)),
        doc_snapshot.status.map(FieldValue::Status),
        FieldValue::Status(project.status),
    );
    let doc_tags = input
        .document
        .header()
        .filter(|header| header.declares_tags())
        .map(|_| FieldValue::Tags(normalize_tags(&doc_snapshot.tags)));
    push(
        SyncField::Tags,
        EntityType::Project,
        project.uuid,
        None,
        base_snapshot.map(|snap| FieldValue::Tags(normalize_tags(&snap.tags))),
        doc_tags,
        FieldValue::Tags(normalize_tags(&project.tags)),
    );

    let by_marker: HashMap<MarkerId, &Task> = input
        .tasks
        .iter()
        .map(|task| (task.marker_id, task))
        .collect();
    let mut new_document_tasks = Vec::new();
    let mut foreign_markers = Vec::new();

    for entry in input.document.tasks() {
        match by_marker.get(&entry.marker_id) {
            Some(task) => push(
                SyncField::TaskCompletion,
                EntityType::Task,
                task.uuid,
                Some(entry.marker_id),
                base_snapshot
                    .and_then(|snap| snap.tasks.get(&entry.marker_id))
                    .map(|done| FieldValue::Completion(*done)),
                Some(FieldValue::Completion(entry.completed)),
                FieldValue::Completion(task.is_completed()),
            ),
            None if input.foreign_markers.contains(&entry.marker_id) => {
                foreign_markers.push(entry.marker_id);
            }
            None => new_document_tasks.push(entry.clone()),
        }
    }

    let in_document = input.document.marker_ids();
    let appended_tasks = input
        .tasks
        .iter()
        .filter(|task| task.status != TaskStatus::Cancelled)
        .filter(|task| !in_document.contains(&task.marker_id))
        .filter(|task| {
            !base_snapshot
                .map(|snap| snap.tasks.contains_key(&task.marker_id))
                .unwrap_or(false)
        })
        .map(|task| NewTaskLine {
            marker_id: task.marker_id,
            title: task.title.clone(),
            completed: task.is_completed(),
        })
        .collect();

    ProjectDelta {
        class,
        fields,
        new_document_tasks,
        foreign_markers,
        appended_tasks,
    }
}

#[cfg(test)]
mod tests {
    use super::{classify_field, classify_project, detect, ChangeClass, DetectorInput, FieldValue};
    use crate::model::project::Project;
    use crate::model::sync::{Baseline, SyncField, SyncSnapshot};
    use crate::model::task::{Task, TaskStatus};
    use crate::sync::codec::decode;
    use std::collections::BTreeSet;

    fn done(value: bool) -> FieldValue {
        FieldValue::Completion(value)
    }

    #[test]
    fn project_classification_follows_digest_and_version() {
        let baseline = Baseline {
            digest: "sha256:aa".to_string(),
            version: 3,
            snapshot: SyncSnapshot::default(),
            event_id: 0,
        };
        assert_eq!(classify_project(Some(&baseline), "sha256:aa", 3), ChangeClass::Unchanged);
        assert_eq!(classify_project(Some(&baseline), "sha256:bb", 3), ChangeClass::DocChanged);
        assert_eq!(classify_project(Some(&baseline), "sha256:aa", 4), ChangeClass::StoreChanged);
        assert_eq!(classify_project(Some(&baseline), "sha256:bb", 4), ChangeClass::Conflict);
        assert_eq!(classify_project(None, "sha256:aa", 3), ChangeClass::Conflict);
    }

    #[test]
    fn field_classification_table() {
        let b = Some(done(false));
        assert_eq!(classify_field(b.as_ref(), Some(&done(false)), &done(false)), ChangeClass::Unchanged);
        assert_eq!(classify_field(b.as_ref(), Some(&done(true)), &done(false)), ChangeClass::DocChanged);
        assert_eq!(classify_field(b.as_ref(), Some(&done(false)), &done(true)), ChangeClass::StoreChanged);
        assert_eq!(classify_field(b.as_ref(), Some(&done(true)), &done(true)), ChangeClass::Conflict);
        assert_eq!(classify_field(None, Some(&done(true)), &done(false)), ChangeClass::Conflict);
        assert_eq!(classify_field(None, Some(&done(true)), &done(true)), ChangeClass::Unchanged);
        assert_eq!(classify_field(b.as_ref(), None, &done(true)), ChangeClass::StoreChanged);
    }

    #[test]
    fn detect_splits_known_new_foreign_and_appended_tasks() {
        let project = Project::new("Shed", 0);
        let known = Task::new(Some(project.uuid), "Buy timber", 0);
        let mut store_only = Task::new(Some(project.uuid), "Paint", 0);
        store_only.set_status(TaskStatus::Completed, 1);
        let removed_by_reader = Task::new(Some(project.uuid), "Old line", 0);
        let foreign = uuid::Uuid::new_v4();
        let unknown = uuid::Uuid::new_v4();

        let text = format!(
            "---\nid: {}\ntitle: Shed\nstatus: active\n---\n- [x] Buy timber <!-- task:{} -->\n- [ ] Theirs <!-- task:{foreign} -->\n- [ ] Fresh <!-- task:{unknown} -->\n",
            project.uuid, known.marker_id
        );
        let document = decode(text.as_bytes()).unwrap();

        let mut base_snapshot = SyncSnapshot {
            title: Some("Shed".to_string()),
            status: Some(project.status),
            ..SyncSnapshot::default()
        };
        base_snapshot.tasks.insert(known.marker_id, false);
        base_snapshot.tasks.insert(removed_by_reader.marker_id, false);
        let baseline = Baseline {
            digest: "sha256:old".to_string(),
            version: 1,
            snapshot: base_snapshot,
            event_id: 0,
        };
        let foreign_markers = BTreeSet::from([foreign]);
        let tasks = vec![known.clone(), store_only.clone(), removed_by_reader];

        let delta = detect(&DetectorInput {
            project: &project,
            tasks: &tasks,
            store_version: 1,
            baseline: Some(&baseline),
            document_digest: "sha256:new",
            document: &document,
            foreign_markers: &foreign_markers,
        });

        assert_eq!(delta.class, ChangeClass::DocChanged);
        // The header has no tags line, so tags are filled from the store.
        assert!(delta
            .fields
            .iter()
            .any(|field| field.field == SyncField::Tags && field.class == ChangeClass::StoreChanged));
        let completion = delta
            .fields
            .iter()
            .find(|field| field.field == SyncField::TaskCompletion)
            .unwrap();
        assert_eq!(completion.class, ChangeClass::DocChanged);
        assert_eq!(completion.entity_uuid, known.uuid);
        assert_eq!(delta.foreign_markers, vec![foreign]);
        assert_eq!(delta.new_document_tasks.len(), 1);
        assert_eq!(delta.new_document_tasks[0].marker_id, unknown);
        assert_eq!(delta.appended_tasks.len(), 1);
        assert_eq!(delta.appended_tasks[0].marker_id, store_only.marker_id);
        assert!(delta.appended_tasks[0].completed);
    }
}

//! Project domain model.
//!
//! # Responsibility
//! - Define the project record shared by CRUD callers, sync and momentum.
//! - Split fields by owner: sync writes title/status/tags/document, momentum
//!   writes score/trend/stalled, the activity log writes `last_activity_at`.
//!
//! # Invariants
//! - `uuid` is stable and never reused.
//! - `momentum_score` is always within `[0, 1]`.
//! - `stalled_since` is cleared only by a new activity event.

use crate::model::ValidationError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

/// Stable identifier for projects.
pub type ProjectId = Uuid;

/// Stable identifier for areas.
pub type AreaId = Uuid;

/// Project lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    Active,
    OnHold,
    Completed,
    Archived,
}

impl ProjectStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::OnHold => "on_hold",
            Self::Completed => "completed",
            Self::Archived => "archived",
        }
    }

    /// Parses the snake_case storage/header form. Accepts `on-hold` as an alias
    /// because people type it that way in documents.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "active" => Some(Self::Active),
            "on_hold" | "on-hold" => Some(Self::OnHold),
            "completed" => Some(Self::Completed),
            "archived" => Some(Self::Archived),
            _ => None,
        }
    }

    /// Whether momentum scoring and stalled classification apply.
    pub fn is_tracked(self) -> bool {
        matches!(self, Self::Active | Self::OnHold)
    }
}

/// Direction of the momentum score over the trend lookback window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MomentumTrend {
    Improving,
    Stable,
    Declining,
}

impl MomentumTrend {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Improving => "improving",
            Self::Stable => "stable",
            Self::Declining => "declining",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "improving" => Some(Self::Improving),
            "stable" => Some(Self::Stable),
            "declining" => Some(Self::Declining),
            _ => None,
        }
    }
}

/// External document reference recorded at the last successful sync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentRef {
    pub path: String,
    pub digest: String,
}

/// Grouping for projects. Store-only; never written to documents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Area {
    pub uuid: AreaId,
    pub name: String,
    pub created_at: i64,
}

/// Canonical project record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub uuid: ProjectId,
    pub area_uuid: Option<AreaId>,
    pub title: String,
    pub status: ProjectStatus,
    /// Normalized lowercase, deduplicated, sorted.
    pub tags: Vec<String>,
    /// Monotonic store version, bumped by schema triggers.
    pub version: i64,
    pub momentum_score: f64,
    pub momentum_trend: MomentumTrend,
    pub momentum_computed_at: Option<i64>,
    pub last_activity_at: Option<i64>,
    pub stalled_since: Option<i64>,
    pub document: Option<DocumentRef>,
    pub reviewed_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Project {
    /// Creates an active project with a generated stable ID.
    pub fn new(title: impl Into<String>, now_ms: i64) -> Self {
        Self::with_id(Uuid::new_v4(), title, now_ms)
    }

    /// Creates a project with a caller-provided stable ID.
    pub fn with_id(uuid: ProjectId, title: impl Into<String>, now_ms: i64) -> Self {
        Self {
            uuid,
            area_uuid: None,
            title: title.into(),
            status: ProjectStatus::Active,
            tags: Vec::new(),
            version: 1,
            momentum_score: 0.0,
            momentum_trend: MomentumTrend::Stable,
            momentum_computed_at: None,
            last_activity_at: None,
            stalled_since: None,
            document: None,
            reviewed_at: None,
            created_at: now_ms,
            updated_at: now_ms,
        }
    }

    pub fn is_stalled(&self) -> bool {
        self.stalled_since.is_some()
    }

    /// Validates fields before persistence.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.title.trim().is_empty() {
            return Err(ValidationError::EmptyTitle);
        }
        if !self.momentum_score.is_finite() || !(0.0..=1.0).contains(&self.momentum_score) {
            return Err(ValidationError::ScoreOutOfRange(
                self.momentum_score.to_string(),
            ));
        }
        for tag in &self.tags {
            if normalize_tag(tag).as_deref() != Some(tag.as_str()) {
                return Err(ValidationError::InvalidTag(tag.clone()));
            }
        }
        Ok(())
    }
}

/// Normalizes one tag value: trimmed, lowercase, non-empty.
pub fn normalize_tag(tag: &str) -> Option<String> {
    let trimmed = tag.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_lowercase())
    }
}

/// Normalizes, deduplicates and sorts tag values.
pub fn normalize_tags<S: AsRef<str>>(tags: &[S]) -> Vec<String> {
    let mut unique = BTreeSet::new();
    for tag in tags {
        if let Some(value) = normalize_tag(tag.as_ref()) {
            unique.insert(value);
        }
    }
    unique.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::{normalize_tags, Project, ProjectStatus};
    use crate::model::ValidationError;

    #[test]
    fn status_parse_accepts_header_aliases() {
        assert_eq!(ProjectStatus::parse(" On-Hold "), Some(ProjectStatus::OnHold));
        assert_eq!(ProjectStatus::parse("archived"), Some(ProjectStatus::Archived));
        assert_eq!(ProjectStatus::parse("someday"), None);
    }

    #[test]
    fn validate_rejects_blank_title_and_unnormalized_tags() {
        let mut project = Project::new("  ", 0);
        assert_eq!(project.validate(), Err(ValidationError::EmptyTitle));

        project.title = "Garden".to_string();
        project.tags = vec!["Outdoor".to_string()];
        assert!(matches!(
            project.validate(),
            Err(ValidationError::InvalidTag(_))
        ));
    }

    #[test]
    fn normalize_tags_dedupes_and_sorts() {
        let tags = normalize_tags(&["b", " A ", "a", ""]);
        assert_eq!(tags, vec!["a".to_string(), "b".to_string()]);
    }
}

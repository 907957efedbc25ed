//! Document codec: metadata header + task markers ⇄ structured state.
//!
//! # Responsibility
//! - Decode a document into its header fields and marked task lines while
//!   keeping every other byte as opaque prose.
//! - Encode a desired state back by patching only the header values and
//!   checkboxes that differ, plus appending lines for new tasks.
//!
//! # Invariants
//! - `encode(decode(x), decode(x).snapshot())` returns `x` byte-for-byte.
//! - A header that is present but is not a YAML mapping is an error, never
//!   a guess. Values are read by `serde_yaml`; only the byte spans used for
//!   patching are located by hand.
//! - A document without a linked `id` is unmanaged and must never be encoded
//!   by the sync applier.
//!
//! # Format
//! ```text
//! ---
//! id: 6f1c2d7e-...-...
//! title: Rebuild the shed
//! status: active
//! tags: [home, outdoor]
//! ---
//! Free prose, left untouched.
//! - [ ] Buy timber <!-- task:0b9e...-... -->
//! - [x] Clear the site <!-- task:41d2...-... -->
//! ```

use crate::model::project::{normalize_tags, Project, ProjectId, ProjectStatus};
use crate::model::sync::SyncSnapshot;
use crate::model::task::{MarkerId, Task};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_yaml::Value as YamlValue;
use std::collections::{BTreeMap, BTreeSet};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::ops::Range;
use uuid::Uuid;

static TASK_LINE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?m)^[ \t]*[-*+][ \t]+\[([ xX])\][ \t]+(.*?)[ \t]*<!--[ \t]*task:([^\s>]*)[ \t]*-->[ \t]*\r?$",
    )
    .expect("valid task line regex")
});

const FENCE: &str = "---";

/// Why a document could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    InvalidUtf8,
    UnterminatedHeader,
    InvalidHeader { line: usize, message: String },
    InvalidHeaderValue { key: String },
    DuplicateHeaderKey { key: String },
    InvalidLinkedId { value: String },
    InvalidStatus { value: String },
    InvalidMarker { line: usize, value: String },
    DuplicateMarker { marker: MarkerId },
}

impl Display for CodecError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidUtf8 => write!(f, "document is not valid UTF-8"),
            Self::UnterminatedHeader => write!(f, "metadata header has no closing `---`"),
            Self::InvalidHeader { line, message } => {
                write!(f, "header is not valid YAML near line {line}: {message}")
            }
            Self::InvalidHeaderValue { key } => {
                write!(f, "header value for `{key}` must be a scalar")
            }
            Self::DuplicateHeaderKey { key } => write!(f, "header key `{key}` appears twice"),
            Self::InvalidLinkedId { value } => {
                write!(f, "header id `{value}` is not a valid identifier")
            }
            Self::InvalidStatus { value } => write!(f, "header status `{value}` is unknown"),
            Self::InvalidMarker { line, value } => {
                write!(f, "task marker `{value}` on line {line} is not a valid identifier")
            }
            Self::DuplicateMarker { marker } => write!(f, "task marker {marker} appears twice"),
        }
    }
}

impl Error for CodecError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum HeaderKey {
    Id,
    Title,
    Status,
    Tags,
}

impl HeaderKey {
    fn parse(key: &str) -> Option<Self> {
        match key.to_ascii_lowercase().as_str() {
            "id" => Some(Self::Id),
            "title" => Some(Self::Title),
            "status" => Some(Self::Status),
            "tags" => Some(Self::Tags),
            _ => None,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Id => "id",
            Self::Title => "title",
            Self::Status => "status",
            Self::Tags => "tags",
        }
    }
}

/// Byte range of one header value plus whether a separating space is
/// needed when the value is currently empty.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ValueSpan {
    range: Range<usize>,
    needs_space: bool,
}

/// Parsed metadata header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentHeader {
    pub linked_id: Option<ProjectId>,
    pub title: Option<String>,
    pub status: Option<ProjectStatus>,
    pub tags: Vec<String>,
    spans: BTreeMap<HeaderKey, ValueSpan>,
    /// Offset of the closing fence line; new keys are inserted here.
    closing_fence: usize,
}

impl DocumentHeader {
    /// Whether the header carries a `tags:` line at all.
    pub fn declares_tags(&self) -> bool {
        self.spans.contains_key(&HeaderKey::Tags)
    }
}

/// One marked task line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskEntry {
    pub marker_id: MarkerId,
    pub completed: bool,
    pub title: String,
    /// Offset of the checkbox character between `[` and `]`.
    checkbox: usize,
}

/// Decoded document. Holds the original text so encode can patch it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedDocument {
    text: String,
    header: Option<DocumentHeader>,
    tasks: Vec<TaskEntry>,
    line_ending: &'static str,
}

/// Task line to append when the store knows a task the document lacks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTaskLine {
    pub marker_id: MarkerId,
    pub title: String,
    pub completed: bool,
}

impl DecodedDocument {
    pub fn header(&self) -> Option<&DocumentHeader> {
        self.header.as_ref()
    }

    pub fn tasks(&self) -> &[TaskEntry] {
        &self.tasks
    }

    pub fn task(&self, marker_id: MarkerId) -> Option<&TaskEntry> {
        self.tasks.iter().find(|task| task.marker_id == marker_id)
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// Linked project identifier, if the document is managed.
    pub fn linked_id(&self) -> Option<ProjectId> {
        self.header.as_ref().and_then(|header| header.linked_id)
    }

    pub fn is_managed(&self) -> bool {
        self.linked_id().is_some()
    }

    pub fn marker_ids(&self) -> BTreeSet<MarkerId> {
        self.tasks.iter().map(|task| task.marker_id).collect()
    }

    /// Logical state carried by this document.
    pub fn snapshot(&self) -> SyncSnapshot {
        let (title, status, tags) = match &self.header {
            Some(header) => (header.title.clone(), header.status, header.tags.clone()),
            None => (None, None, Vec::new()),
        };
        SyncSnapshot {
            title,
            status,
            tags,
            tasks: self
                .tasks
                .iter()
                .map(|task| (task.marker_id, task.completed))
                .collect(),
        }
    }
}

/// Decodes document bytes.
///
/// # Errors
/// - `InvalidUtf8` for non-text content.
/// - Header errors when a header is present but cannot be parsed.
/// - Marker errors when a task marker is not a valid identifier or repeats.
pub fn decode(bytes: &[u8]) -> Result<DecodedDocument, CodecError> {
    let text = std::str::from_utf8(bytes)
        .map_err(|_| CodecError::InvalidUtf8)?
        .to_string();
    let line_ending = if text.contains("\r\n") { "\r\n" } else { "\n" };

    let (header, body_start) = parse_header(&text)?;
    let tasks = parse_tasks(&text, body_start)?;

    Ok(DecodedDocument {
        text,
        header,
        tasks,
        line_ending,
    })
}

/// Encodes `target` onto a previously decoded document.
///
/// Only header values whose logical value differs, checkboxes whose
/// completion differs, and `appended` task lines produce edits. Fields that
/// `target` leaves as `None` are not touched. Markers in `target.tasks` that
/// the document does not contain are ignored; use `appended` for those.
pub fn encode(document: &DecodedDocument, target: &SyncSnapshot, appended: &[NewTaskLine]) -> String {
    let mut edits: Vec<(Range<usize>, String)> = Vec::new();
    let le = document.line_ending;

    if let Some(header) = &document.header {
        let mut missing: Vec<String> = Vec::new();
        let mut patch = |key: HeaderKey, rendered: Option<String>, differs: bool| {
            let Some(rendered) = rendered else {
                return;
            };
            if !differs {
                return;
            }
            match header.spans.get(&key) {
                Some(span) => {
                    let value = if span.needs_space {
                        format!(" {rendered}")
                    } else {
                        rendered
                    };
                    edits.push((span.range.clone(), value));
                }
                None => missing.push(format!("{}: {rendered}{le}", key.as_str())),
            }
        };

        patch(
            HeaderKey::Title,
            target.title.as_deref().map(yaml_scalar),
            target.title.is_some() && target.title != header.title,
        );
        patch(
            HeaderKey::Status,
            target.status.map(|status| status.as_str().to_string()),
            target.status.is_some() && target.status != header.status,
        );
        let target_tags = normalize_tags(&target.tags);
        patch(
            HeaderKey::Tags,
            Some(render_tags(&target_tags)),
            target_tags != header.tags,
        );

        for line in missing {
            edits.push((header.closing_fence..header.closing_fence, line));
        }
    }

    for task in &document.tasks {
        if let Some(&completed) = target.tasks.get(&task.marker_id) {
            if completed != task.completed {
                let mark = if completed { "x" } else { " " };
                edits.push((task.checkbox..task.checkbox + 1, mark.to_string()));
            }
        }
    }

    if !appended.is_empty() {
        let end = document.text.len();
        let mut tail = String::new();
        if !document.text.is_empty() && !document.text.ends_with('\n') {
            tail.push_str(le);
        }
        for line in appended {
            tail.push_str(&render_task_line(line));
            tail.push_str(le);
        }
        edits.push((end..end, tail));
    }

    apply_edits(&document.text, edits)
}

/// Renders a fresh document for a store-created project.
pub fn render_new(project: &Project, tasks: &[Task]) -> String {
    let mut out = String::new();
    out.push_str(FENCE);
    out.push('\n');
    out.push_str(&format!("id: {}\n", project.uuid));
    out.push_str(&format!("title: {}\n", yaml_scalar(&project.title)));
    out.push_str(&format!("status: {}\n", project.status.as_str()));
    out.push_str(&format!("tags: {}\n", render_tags(&project.tags)));
    out.push_str(FENCE);
    out.push('\n');
    out.push('\n');
    out.push_str(&format!("# {}\n", clean_line(&project.title)));
    if !tasks.is_empty() {
        out.push('\n');
    }
    for task in tasks {
        out.push_str(&render_task_line(&NewTaskLine {
            marker_id: task.marker_id,
            title: task.title.clone(),
            completed: task.is_completed(),
        }));
        out.push('\n');
    }
    out
}

fn parse_header(text: &str) -> Result<(Option<DocumentHeader>, usize), CodecError> {
    let mut lines = LineCursor::new(text);
    let Some(first) = lines.next() else {
        return Ok((None, 0));
    };
    if first.content.trim_end() != FENCE {
        return Ok((None, 0));
    }

    let yaml_start = first.end_with_terminator;
    let mut spans: BTreeMap<HeaderKey, ValueSpan> = BTreeMap::new();
    // Key whose value may continue on indented or `- item` lines.
    let mut open: Option<HeaderKey> = None;

    for line in lines {
        if line.content.trim_end() == FENCE {
            let values = HeaderValues::parse(&text[yaml_start..line.start])?;
            let header = DocumentHeader {
                linked_id: values.linked_id,
                title: values.title,
                status: values.status,
                tags: values.tags,
                spans,
                closing_fence: line.start,
            };
            return Ok((Some(header), line.end_with_terminator));
        }

        let trimmed = line.content.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        if line.content.starts_with([' ', '\t', '-']) {
            if let Some(span) = open.and_then(|key| spans.get_mut(&key)) {
                span.range.end = line.start + line.content.trim_end().len();
            }
            continue;
        }

        open = None;
        let Some(colon) = line.content.find(':') else {
            continue;
        };
        let Some(key) = HeaderKey::parse(line.content[..colon].trim()) else {
            continue;
        };
        if spans.contains_key(&key) {
            return Err(CodecError::DuplicateHeaderKey {
                key: key.as_str().to_string(),
            });
        }

        let after_colon = &line.content[colon + 1..];
        let leading = after_colon.len() - after_colon.trim_start().len();
        let value = inline_value(after_colon.trim_start());
        let value_start = line.start + colon + 1 + leading;
        spans.insert(
            key,
            ValueSpan {
                range: value_start..value_start + value.len(),
                needs_space: value.is_empty() && leading == 0,
            },
        );
        open = Some(key);
    }

    Err(CodecError::UnterminatedHeader)
}

/// Value text of one header line without its trailing comment.
fn inline_value(value: &str) -> &str {
    let bytes = value.as_bytes();
    let end = match bytes.first() {
        Some(&(quote @ (b'"' | b'\''))) => {
            let mut index = 1;
            let mut close = bytes.len();
            while index < bytes.len() {
                let byte = bytes[index];
                if quote == b'"' && byte == b'\\' {
                    index += 2;
                    continue;
                }
                if byte == quote {
                    if quote == b'\'' && bytes.get(index + 1) == Some(&b'\'') {
                        index += 2;
                        continue;
                    }
                    close = index + 1;
                    break;
                }
                index += 1;
            }
            close
        }
        _ => value
            .find(" #")
            .or_else(|| value.find("\t#"))
            .unwrap_or(bytes.len()),
    };
    value[..end].trim_end()
}

/// Header fields as YAML reads them.
#[derive(Debug, Default)]
struct HeaderValues {
    linked_id: Option<ProjectId>,
    title: Option<String>,
    status: Option<ProjectStatus>,
    tags: Vec<String>,
}

impl HeaderValues {
    fn parse(yaml: &str) -> Result<Self, CodecError> {
        let document: YamlValue =
            serde_yaml::from_str(yaml).map_err(|err| CodecError::InvalidHeader {
                // Header content starts on line 2 of the document.
                line: err.location().map_or(2, |location| location.line() + 1),
                message: err.to_string(),
            })?;
        let mapping = match document {
            YamlValue::Null => return Ok(Self::default()),
            YamlValue::Mapping(mapping) => mapping,
            _ => {
                return Err(CodecError::InvalidHeader {
                    line: 2,
                    message: "header is not a key/value mapping".to_string(),
                })
            }
        };

        let mut values = Self::default();
        for (key, value) in &mapping {
            let Some(key) = key.as_str().and_then(HeaderKey::parse) else {
                continue;
            };
            match key {
                HeaderKey::Id => {
                    if let Some(raw) = scalar_text(key, value)? {
                        let id = Uuid::parse_str(&raw)
                            .map_err(|_| CodecError::InvalidLinkedId { value: raw })?;
                        values.linked_id = Some(id);
                    }
                }
                HeaderKey::Title => values.title = scalar_text(key, value)?,
                HeaderKey::Status => {
                    if let Some(raw) = scalar_text(key, value)? {
                        let status = ProjectStatus::parse(&raw)
                            .ok_or(CodecError::InvalidStatus { value: raw })?;
                        values.status = Some(status);
                    }
                }
                HeaderKey::Tags => values.tags = tag_list(value)?,
            }
        }
        Ok(values)
    }
}

/// Trimmed text of a scalar; `None` for null or blank values.
fn scalar_text(key: HeaderKey, value: &YamlValue) -> Result<Option<String>, CodecError> {
    let text = match value {
        YamlValue::Null => return Ok(None),
        YamlValue::String(text) => text.trim().to_string(),
        YamlValue::Number(number) => number.to_string(),
        YamlValue::Bool(flag) => flag.to_string(),
        _ => {
            return Err(CodecError::InvalidHeaderValue {
                key: key.as_str().to_string(),
            })
        }
    };
    Ok(Some(text).filter(|text| !text.is_empty()))
}

/// Accepts a sequence, a comma-separated string or a single scalar.
fn tag_list(value: &YamlValue) -> Result<Vec<String>, CodecError> {
    let parts: Vec<String> = match value {
        YamlValue::Sequence(items) => {
            let mut parts = Vec::with_capacity(items.len());
            for item in items {
                parts.extend(scalar_text(HeaderKey::Tags, item)?);
            }
            parts
        }
        YamlValue::String(text) => text.split(',').map(str::to_string).collect(),
        other => scalar_text(HeaderKey::Tags, other)?.into_iter().collect(),
    };
    Ok(normalize_tags(&parts))
}

fn parse_tasks(text: &str, body_start: usize) -> Result<Vec<TaskEntry>, CodecError> {
    let body = &text[body_start..];
    let mut tasks = Vec::new();
    let mut seen = BTreeSet::new();

    for caps in TASK_LINE_RE.captures_iter(body) {
        let (Some(check), Some(title), Some(marker)) = (caps.get(1), caps.get(2), caps.get(3))
        else {
            continue;
        };
        let line = text[..body_start + check.start()].matches('\n').count() + 1;
        let marker_id = Uuid::parse_str(marker.as_str()).map_err(|_| CodecError::InvalidMarker {
            line,
            value: marker.as_str().to_string(),
        })?;
        if !seen.insert(marker_id) {
            return Err(CodecError::DuplicateMarker { marker: marker_id });
        }
        tasks.push(TaskEntry {
            marker_id,
            completed: check.as_str() != " ",
            title: title.as_str().trim().to_string(),
            checkbox: body_start + check.start(),
        });
    }

    Ok(tasks)
}

fn clean_line(value: &str) -> String {
    value.replace(['\r', '\n'], " ").trim().to_string()
}

/// Single-line YAML scalar, quoted only where a plain scalar would read back
/// differently.
fn yaml_scalar(value: &str) -> String {
    let line = clean_line(value);
    match serde_yaml::to_string(&line) {
        Ok(rendered) => rendered.trim_end().to_string(),
        Err(_) => single_quoted(&line),
    }
}

fn single_quoted(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn render_tags(tags: &[String]) -> String {
    let items: Vec<String> = tags
        .iter()
        .map(|tag| {
            let scalar = yaml_scalar(tag);
            let quoted = scalar.starts_with(['\'', '"']);
            if !quoted && tag.contains([',', '[', ']', '{', '}']) {
                single_quoted(tag)
            } else {
                scalar
            }
        })
        .collect();
    format!("[{}]", items.join(", "))
}

fn render_task_line(line: &NewTaskLine) -> String {
    let mark = if line.completed { "x" } else { " " };
    format!(
        "- [{mark}] {} <!-- task:{} -->",
        clean_line(&line.title).replace("<!--", "<!-"),
        line.marker_id
    )
}

fn apply_edits(text: &str, mut edits: Vec<(Range<usize>, String)>) -> String {
    if edits.is_empty() {
        return text.to_string();
    }
    // Stable sort keeps insertion order for edits at the same offset.
    edits.sort_by_key(|(range, _)| range.start);
    let mut out = String::with_capacity(text.len() + 64);
    let mut cursor = 0;
    for (range, replacement) in edits {
        if range.start < cursor {
            continue;
        }
        out.push_str(&text[cursor..range.start]);
        out.push_str(&replacement);
        cursor = range.end;
    }
    out.push_str(&text[cursor..]);
    out
}

struct Line<'a> {
    content: &'a str,
    start: usize,
    end_with_terminator: usize,
}

/// Iterates lines with byte offsets; `content` excludes `\n` and `\r`.
struct LineCursor<'a> {
    text: &'a str,
    offset: usize,
}

impl<'a> LineCursor<'a> {
    fn new(text: &'a str) -> Self {
        Self { text, offset: 0 }
    }
}

impl<'a> Iterator for LineCursor<'a> {
    type Item = Line<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset >= self.text.len() {
            return None;
        }
        let start = self.offset;
        let rest = &self.text[start..];
        let (raw, end_with_terminator) = match rest.find('\n') {
            Some(index) => (&rest[..index], start + index + 1),
            None => (rest, self.text.len()),
        };
        self.offset = end_with_terminator;
        Some(Line {
            content: raw.strip_suffix('\r').unwrap_or(raw),
            start,
            end_with_terminator,
        })
    }
}

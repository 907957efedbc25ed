//! Document tree enumeration and IO.
//!
//! # Responsibility
//! - Abstract the document tree behind [`DocumentSource`] so the engine never
//!   walks directories itself.
//! - Provide a filesystem implementation and an in-memory fixture with
//!   failure injection.
//!
//! # Invariants
//! - Paths are relative, `/`-separated and stable across calls.
//! - `write` replaces content atomically; a reader never sees a torn file.
//! - `create_new` never overwrites an existing document.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, UNIX_EPOCH};
use walkdir::WalkDir;

/// Document IO failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
    NotFound,
    Locked,
    AlreadyExists,
    TooLarge { size_bytes: u64, limit: u64 },
    TimedOut { after_ms: u64 },
    Io(String),
}

impl Display for SourceError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound => write!(f, "document not found"),
            Self::Locked => write!(f, "document is locked"),
            Self::AlreadyExists => write!(f, "document already exists"),
            Self::TooLarge { size_bytes, limit } => {
                write!(f, "document is {size_bytes} bytes, limit is {limit}")
            }
            Self::TimedOut { after_ms } => write!(f, "read timed out after {after_ms}ms"),
            Self::Io(message) => write!(f, "io error: {message}"),
        }
    }
}

impl Error for SourceError {}

impl From<std::io::Error> for SourceError {
    fn from(value: std::io::Error) -> Self {
        match value.kind() {
            ErrorKind::NotFound => Self::NotFound,
            ErrorKind::AlreadyExists => Self::AlreadyExists,
            ErrorKind::PermissionDenied | ErrorKind::WouldBlock => Self::Locked,
            _ => Self::Io(value.to_string()),
        }
    }
}

/// Cheap per-document metadata used as a change hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DocumentMeta {
    pub size_bytes: u64,
    pub modified_ms: Option<i64>,
}

/// Enumerator and IO boundary for the document tree.
pub trait DocumentSource: Send + Sync {
    /// Candidate document paths, sorted.
    fn list_paths(&self) -> Result<Vec<String>, SourceError>;
    fn metadata(&self, path: &str) -> Result<DocumentMeta, SourceError>;
    fn read(&self, path: &str) -> Result<Vec<u8>, SourceError>;
    /// Replaces an existing document.
    fn write(&self, path: &str, bytes: &[u8]) -> Result<(), SourceError>;
    /// Creates a document, failing with `AlreadyExists` if the path is taken.
    fn create_new(&self, path: &str, bytes: &[u8]) -> Result<(), SourceError>;
}

/// Directory tree of text documents filtered by extension.
#[derive(Debug, Clone)]
pub struct FsDocumentSource {
    root: PathBuf,
    extensions: Vec<String>,
}

impl FsDocumentSource {
    pub fn new(root: impl Into<PathBuf>, extensions: &[String]) -> Self {
        Self {
            root: root.into(),
            extensions: extensions
                .iter()
                .map(|ext| ext.trim_start_matches('.').to_ascii_lowercase())
                .collect(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, SourceError> {
        let relative = Path::new(path);
        if relative.is_absolute()
            || relative
                .components()
                .any(|part| matches!(part, std::path::Component::ParentDir))
        {
            return Err(SourceError::Io(format!("path `{path}` escapes the document root")));
        }
        Ok(self.root.join(relative))
    }

    fn accepts(&self, path: &Path) -> bool {
        let Some(ext) = path.extension().and_then(|ext| ext.to_str()) else {
            return false;
        };
        let ext = ext.to_ascii_lowercase();
        self.extensions.iter().any(|allowed| *allowed == ext)
    }
}

impl DocumentSource for FsDocumentSource {
    fn list_paths(&self) -> Result<Vec<String>, SourceError> {
        if !self.root.is_dir() {
            return Err(SourceError::NotFound);
        }
        let mut paths = Vec::new();
        for entry in WalkDir::new(&self.root).follow_links(false) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    log::warn!(
                        "event=document_list module=sync status=warn reason=walk_error depth={}",
                        err.depth()
                    );
                    continue;
                }
            };
            if !entry.file_type().is_file() || !self.accepts(entry.path()) {
                continue;
            }
            let Ok(relative) = entry.path().strip_prefix(&self.root) else {
                continue;
            };
            let parts: Vec<String> = relative
                .components()
                .map(|part| part.as_os_str().to_string_lossy().into_owned())
                .collect();
            paths.push(parts.join("/"));
        }
        paths.sort();
        Ok(paths)
    }

    fn metadata(&self, path: &str) -> Result<DocumentMeta, SourceError> {
        let meta = fs::metadata(self.resolve(path)?)?;
        let modified_ms = meta
            .modified()
            .ok()
            .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
            .and_then(|elapsed| i64::try_from(elapsed.as_millis()).ok());
        Ok(DocumentMeta {
            size_bytes: meta.len(),
            modified_ms,
        })
    }

    fn read(&self, path: &str) -> Result<Vec<u8>, SourceError> {
        Ok(fs::read(self.resolve(path)?)?)
    }

    fn write(&self, path: &str, bytes: &[u8]) -> Result<(), SourceError> {
        let target = self.resolve(path)?;
        if !target.is_file() {
            return Err(SourceError::NotFound);
        }
        atomic_write(&target, bytes)
    }

    fn create_new(&self, path: &str, bytes: &[u8]) -> Result<(), SourceError> {
        let target = self.resolve(path)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&target)?;
        file.write_all(bytes)?;
        file.sync_data()?;
        Ok(())
    }
}

/// Writes through a sibling temp file and renames it over the target, so the
/// rename stays on one filesystem.
fn atomic_write(target: &Path, bytes: &[u8]) -> Result<(), SourceError> {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let seq = COUNTER.fetch_add(1, Ordering::Relaxed);
    let parent = target.parent().unwrap_or(Path::new("."));
    let file_name = target
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp_path = parent.join(format!(".{file_name}.{}-{seq}.tmp", std::process::id()));

    let mut file = fs::File::create(&tmp_path)?;
    file.write_all(bytes)?;
    file.sync_data()?;
    drop(file);
    fs::rename(&tmp_path, target).map_err(|err| {
        let _ = fs::remove_file(&tmp_path);
        SourceError::from(err)
    })
}

#[derive(Debug, Clone)]
struct MemoryEntry {
    bytes: Vec<u8>,
    modified_ms: i64,
}

#[derive(Debug, Default)]
struct MemoryFaults {
    locked: BTreeSet<String>,
    unreadable: BTreeSet<String>,
    read_delays: HashMap<String, Duration>,
}

/// In-memory document tree for tests and previews.
///
/// Failure injection: `lock` makes writes fail with `Locked`, `make_unreadable`
/// makes reads fail, `delay_reads` stalls reads to exercise scan timeouts.
#[derive(Debug, Default)]
pub struct MemoryDocumentSource {
    entries: Mutex<BTreeMap<String, MemoryEntry>>,
    faults: Mutex<MemoryFaults>,
    tick: AtomicU64,
    writes: AtomicUsize,
}

impl MemoryDocumentSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces a document as an outside editor would.
    pub fn put(&self, path: &str, text: impl Into<String>) {
        let modified_ms = self.next_tick();
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(
                path.to_string(),
                MemoryEntry {
                    bytes: text.into().into_bytes(),
                    modified_ms,
                },
            );
        }
    }

    pub fn remove(&self, path: &str) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.remove(path);
        }
    }

    /// Current text of a document, if present and UTF-8.
    pub fn text(&self, path: &str) -> Option<String> {
        let entries = self.entries.lock().ok()?;
        let entry = entries.get(path)?;
        String::from_utf8(entry.bytes.clone()).ok()
    }

    pub fn lock(&self, path: &str) {
        if let Ok(mut faults) = self.faults.lock() {
            faults.locked.insert(path.to_string());
        }
    }

    pub fn unlock(&self, path: &str) {
        if let Ok(mut faults) = self.faults.lock() {
            faults.locked.remove(path);
        }
    }

    pub fn make_unreadable(&self, path: &str) {
        if let Ok(mut faults) = self.faults.lock() {
            faults.unreadable.insert(path.to_string());
        }
    }

    pub fn delay_reads(&self, path: &str, delay: Duration) {
        if let Ok(mut faults) = self.faults.lock() {
            faults.read_delays.insert(path.to_string(), delay);
        }
    }

    /// Number of successful `write`/`create_new` calls so far.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn next_tick(&self) -> i64 {
        i64::try_from(self.tick.fetch_add(1, Ordering::SeqCst) + 1).unwrap_or(i64::MAX)
    }

    fn check_locked(&self, path: &str) -> Result<(), SourceError> {
        let faults = self
            .faults
            .lock()
            .map_err(|_| SourceError::Io("fault table poisoned".to_string()))?;
        if faults.locked.contains(path) {
            return Err(SourceError::Locked);
        }
        Ok(())
    }

    fn store(&self, path: &str, bytes: &[u8], must_exist: bool) -> Result<(), SourceError> {
        self.check_locked(path)?;
        let modified_ms = self.next_tick();
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| SourceError::Io("document table poisoned".to_string()))?;
        match (entries.contains_key(path), must_exist) {
            (false, true) => return Err(SourceError::NotFound),
            (true, false) => return Err(SourceError::AlreadyExists),
            _ => {}
        }
        entries.insert(
            path.to_string(),
            MemoryEntry {
                bytes: bytes.to_vec(),
                modified_ms,
            },
        );
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl DocumentSource for MemoryDocumentSource {
    fn list_paths(&self) -> Result<Vec<String>, SourceError> {
        let entries = self
            .entries
            .lock()
            .map_err(|_| SourceError::Io("document table poisoned".to_string()))?;
        Ok(entries.keys().cloned().collect())
    }

    fn metadata(&self, path: &str) -> Result<DocumentMeta, SourceError> {
        let entries = self
            .entries
            .lock()
            .map_err(|_| SourceError::Io("document table poisoned".to_string()))?;
        let entry = entries.get(path).ok_or(SourceError::NotFound)?;
        Ok(DocumentMeta {
            size_bytes: entry.bytes.len() as u64,
            modified_ms: Some(entry.modified_ms),
        })
    }

    fn read(&self, path: &str) -> Result<Vec<u8>, SourceError> {
        let delay = {
            let faults = self
                .faults
                .lock()
                .map_err(|_| SourceError::Io("fault table poisoned".to_string()))?;
            if faults.unreadable.contains(path) {
                return Err(SourceError::Locked);
            }
            faults.read_delays.get(path).copied()
        };
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        let entries = self
            .entries
            .lock()
            .map_err(|_| SourceError::Io("document table poisoned".to_string()))?;
        entries
            .get(path)
            .map(|entry| entry.bytes.clone())
            .ok_or(SourceError::NotFound)
    }

    fn write(&self, path: &str, bytes: &[u8]) -> Result<(), SourceError> {
        self.store(path, bytes, true)
    }

    fn create_new(&self, path: &str, bytes: &[u8]) -> Result<(), SourceError> {
        self.store(path, bytes, false)
    }
}

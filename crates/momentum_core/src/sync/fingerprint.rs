//! Content digests and the fingerprint cache.
//!
//! # Responsibility
//! - Compute the authoritative SHA-256 digest of document bytes.
//! - Cache digest + size + modification time per path so the managed
//!   document listing can answer "changed?" without reading unchanged
//!   documents.
//!
//! # Invariants
//! - Identical bytes always yield the same digest string.
//! - The metadata hint is only consulted by [`FingerprintStore::has_changed`];
//!   reconcile cycles always digest the bytes they decide on.

use crate::model::sync::Fingerprint;
use crate::repo::sync_repo::SqliteSyncRepository;
use crate::repo::RepoResult;
use crate::sync::source::{DocumentMeta, DocumentSource};
use crate::sync::{SyncError, SyncResult};
use rusqlite::Connection;
use sha2::{Digest, Sha256};
use std::fmt::Write;

pub const DIGEST_PREFIX: &str = "sha256:";

/// Returns `sha256:<hex>` for `bytes`.
pub fn digest(bytes: &[u8]) -> String {
    let hash = Sha256::digest(bytes);
    let mut out = String::with_capacity(DIGEST_PREFIX.len() + 64);
    out.push_str(DIGEST_PREFIX);
    for byte in hash {
        let _ = write!(&mut out, "{byte:02x}");
    }
    out
}

/// Builds a fingerprint from freshly read bytes.
pub fn fingerprint_of(path: &str, bytes: &[u8], meta: DocumentMeta, observed_at: i64) -> Fingerprint {
    Fingerprint {
        path: path.to_string(),
        digest: digest(bytes),
        size_bytes: meta.size_bytes,
        modified_ms: meta.modified_ms,
        observed_at,
    }
}

/// Fingerprint cache backed by `document_fingerprints`.
pub struct FingerprintStore<'conn> {
    repo: SqliteSyncRepository<'conn>,
}

impl<'conn> FingerprintStore<'conn> {
    pub fn new(conn: &'conn Connection) -> Self {
        Self {
            repo: SqliteSyncRepository::new(conn),
        }
    }

    pub fn get(&self, path: &str) -> RepoResult<Option<Fingerprint>> {
        self.repo.get_fingerprint(path)
    }

    /// Stores `fingerprint` unless the cached row already says the same.
    ///
    /// Returns whether a row was written.
    pub fn record(&self, fingerprint: &Fingerprint) -> RepoResult<bool> {
        if let Some(cached) = self.repo.get_fingerprint(&fingerprint.path)? {
            if cached.digest == fingerprint.digest
                && cached.size_bytes == fingerprint.size_bytes
                && cached.modified_ms == fingerprint.modified_ms
            {
                return Ok(false);
            }
        }
        self.repo.upsert_fingerprint(fingerprint)?;
        Ok(true)
    }

    /// Whether the document at `path` differs from `last_known_digest`.
    ///
    /// When size and modification time match the cached fingerprint, the
    /// cached digest answers without reading the document. Otherwise the
    /// bytes are read and digested. Nothing is written.
    pub fn has_changed(
        &self,
        source: &dyn DocumentSource,
        path: &str,
        last_known_digest: &str,
    ) -> SyncResult<bool> {
        let unavailable = |source_err| SyncError::DocumentUnavailable {
            path: path.to_string(),
            source: source_err,
        };
        let meta = source.metadata(path).map_err(unavailable)?;

        if let Some(cached) = self.get(path)? {
            if meta.modified_ms.is_some()
                && cached.size_bytes == meta.size_bytes
                && cached.modified_ms == meta.modified_ms
            {
                return Ok(cached.digest != last_known_digest);
            }
        }

        let bytes = source.read(path).map_err(unavailable)?;
        Ok(digest(&bytes) != last_known_digest)
    }
}

#[cfg(test)]
mod tests {
    use super::{digest, fingerprint_of, FingerprintStore};
    use crate::db::open_db_in_memory;
    use crate::sync::source::{DocumentSource, MemoryDocumentSource};

    #[test]
    fn digest_is_stable_and_sensitive_to_single_bytes() {
        assert_eq!(digest(b"hello"), digest(b"hello"));
        assert_ne!(digest(b"hello"), digest(b"hellp"));
        assert!(digest(b"").starts_with("sha256:"));
        assert_eq!(digest(b"").len(), "sha256:".len() + 64);
    }

    #[test]
    fn has_changed_uses_cache_hint_then_falls_back_to_digest() {
        let conn = open_db_in_memory().unwrap();
        let store = FingerprintStore::new(&conn);
        let source = MemoryDocumentSource::new();
        source.put("a.md", "one");

        let known = digest(b"one");
        assert!(!store.has_changed(&source, "a.md", &known).unwrap());

        let meta = source.metadata("a.md").unwrap();
        let fingerprint = fingerprint_of("a.md", b"one", meta, 10);
        assert!(store.record(&fingerprint).unwrap());
        assert!(!store.record(&fingerprint).unwrap());
        assert!(!store.has_changed(&source, "a.md", &known).unwrap());

        source.put("a.md", "two");
        assert!(store.has_changed(&source, "a.md", &known).unwrap());
    }

    #[test]
    fn has_changed_reports_missing_document() {
        let conn = open_db_in_memory().unwrap();
        let store = FingerprintStore::new(&conn);
        let source = MemoryDocumentSource::new();
        let err = store.has_changed(&source, "gone.md", "sha256:00").unwrap_err();
        assert!(matches!(
            err,
            crate::sync::SyncError::DocumentUnavailable { .. }
        ));
    }
}

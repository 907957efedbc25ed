//! Per-project apply locks.
//!
//! # Invariants
//! - Acquisition never blocks: a held lock yields `ConcurrentAccessDenied`.
//! - With a lock directory configured, the in-process claim is backed by an
//!   exclusive advisory lock on `<lock_dir>/<project_uuid>.lock`, so two
//!   processes never apply the same project at once.
//! - Dropping the guard releases both.

use crate::model::project::ProjectId;
use crate::sync::{SyncError, SyncResult};
use fs2::FileExt;
use log::{debug, warn};
use std::collections::HashSet;
use std::fs::{self, File};
use std::path::PathBuf;
use std::sync::Mutex;

#[derive(Debug, Default)]
pub struct ProjectLocks {
    held: Mutex<HashSet<ProjectId>>,
    lock_dir: Option<PathBuf>,
}

impl ProjectLocks {
    pub fn new(lock_dir: Option<PathBuf>) -> Self {
        Self {
            held: Mutex::new(HashSet::new()),
            lock_dir,
        }
    }

    /// Claims `project_uuid` for the caller or reports it as busy.
    pub fn try_acquire(&self, project_uuid: ProjectId) -> SyncResult<ProjectLockGuard<'_>> {
        let denied = || SyncError::ConcurrentAccessDenied { project_uuid };
        {
            let mut held = self.held.lock().map_err(|_| denied())?;
            if !held.insert(project_uuid) {
                debug!(
                    "event=project_lock module=sync status=skip project_uuid={} holder=process",
                    project_uuid
                );
                return Err(denied());
            }
        }

        let file = match self.lock_file(project_uuid) {
            Ok(file) => file,
            Err(err) => {
                self.release(project_uuid);
                return Err(err);
            }
        };

        Ok(ProjectLockGuard {
            locks: self,
            project_uuid,
            file,
        })
    }

    pub fn is_held(&self, project_uuid: ProjectId) -> bool {
        self.held
            .lock()
            .map(|held| held.contains(&project_uuid))
            .unwrap_or(true)
    }

    fn lock_file(&self, project_uuid: ProjectId) -> SyncResult<Option<File>> {
        let Some(dir) = &self.lock_dir else {
            return Ok(None);
        };
        let denied = SyncError::ConcurrentAccessDenied { project_uuid };
        if let Err(err) = fs::create_dir_all(dir) {
            warn!(
                "event=project_lock module=sync status=warn reason=lock_dir_unavailable error={}",
                err
            );
            return Err(denied);
        }
        let path = dir.join(format!("{project_uuid}.lock"));
        let file = match File::create(&path) {
            Ok(file) => file,
            Err(err) => {
                warn!(
                    "event=project_lock module=sync status=warn reason=lock_file_unavailable error={}",
                    err
                );
                return Err(denied);
            }
        };
        if file.try_lock_exclusive().is_err() {
            debug!(
                "event=project_lock module=sync status=skip project_uuid={} holder=other_process",
                project_uuid
            );
            return Err(denied);
        }
        Ok(Some(file))
    }

    fn release(&self, project_uuid: ProjectId) {
        if let Ok(mut held) = self.held.lock() {
            held.remove(&project_uuid);
        }
    }
}

/// Exclusive claim on one project, released on drop.
#[derive(Debug)]
pub struct ProjectLockGuard<'a> {
    locks: &'a ProjectLocks,
    project_uuid: ProjectId,
    file: Option<File>,
}

impl Drop for ProjectLockGuard<'_> {
    fn drop(&mut self) {
        if let Some(file) = &self.file {
            let _ = file.unlock();
        }
        self.locks.release(self.project_uuid);
    }
}

#[cfg(test)]
mod tests {
    use super::ProjectLocks;
    use crate::sync::SyncError;
    use uuid::Uuid;

    #[test]
    fn second_claim_is_denied_until_guard_drops() {
        let locks = ProjectLocks::default();
        let project = Uuid::new_v4();

        let guard = locks.try_acquire(project).unwrap();
        assert!(locks.is_held(project));
        assert!(matches!(
            locks.try_acquire(project),
            Err(SyncError::ConcurrentAccessDenied { .. })
        ));
        assert!(locks.try_acquire(Uuid::new_v4()).is_ok());

        drop(guard);
        assert!(!locks.is_held(project));
        assert!(locks.try_acquire(project).is_ok());
    }

    #[test]
    fn lock_files_exclude_other_lock_sets() {
        let dir = tempfile::tempdir().unwrap();
        let first = ProjectLocks::new(Some(dir.path().to_path_buf()));
        let second = ProjectLocks::new(Some(dir.path().to_path_buf()));
        let project = Uuid::new_v4();

        let guard = first.try_acquire(project).unwrap();
        assert!(matches!(
            second.try_acquire(project),
            Err(SyncError::ConcurrentAccessDenied { .. })
        ));
        assert!(!second.is_held(project));

        drop(guard);
        assert!(second.try_acquire(project).is_ok());
    }
}

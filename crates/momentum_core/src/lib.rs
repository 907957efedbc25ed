//! Reconciliation and momentum engine for a personal project/task tracker.
//! This crate is the single source of truth for store/document consistency
//! and project momentum.

pub mod clock;
pub mod config;
pub mod db;
pub mod logging;
pub mod model;
pub mod momentum;
pub mod repo;
pub mod service;
pub mod sync;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, EngineConfig};
pub use db::{open_db, open_db_in_memory, DbError, SharedConnection};
pub use logging::{default_log_level, init_logging, logging_status, LoggingError};
pub use model::project::{Project, ProjectId, ProjectStatus};
pub use model::task::{Task, TaskId, TaskStatus};
pub use momentum::{MomentumEngine, MomentumReport};
pub use repo::{RepoError, RepoResult};
pub use service::{ProjectService, ProjectServiceError};
pub use sync::engine::{ManagedDocument, ReconcileOptions, SyncEngine};
pub use sync::report::{CycleMode, CycleReport};
pub use sync::scheduler::{SchedulerEvent, SyncScheduler};
pub use sync::source::{DocumentSource, FsDocumentSource, MemoryDocumentSource};
pub use sync::{CancellationToken, SyncError, SyncErrorKind, SyncResult};

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

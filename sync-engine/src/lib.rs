//! Local-first sync for project / chart / round documents.
//!
//! A local mutation goes through the [`Debouncer`], then the
//! [`SyncCoordinator`], which writes through the [`ProjectRoundService`]
//! (rounds first, root last) with retries from the [`SyncController`].
//! Remote snapshots come back through the [`SyncGate`], and every read path
//! runs the [`migration`] upgrade first.

pub mod backup;
pub mod config;
pub mod coordinator;
pub mod debounce;
mod error;
pub mod gate;
pub mod migration;
pub mod model;
pub mod remote;
pub mod retry;
pub mod rounds;

pub use backup::{merge_with_backup, BackupInfo, BackupStorage, GuestBackup, GuestBackupStore, MemoryBackupStorage};
#[cfg(feature = "sqlite")]
pub use backup::SqliteBackupStorage;
pub use config::SyncConfig;
pub use coordinator::{
    ConflictStrategy, ConflictType, Resolution, Side, SnapshotDecision, SyncConflict, SyncCoordinator, SyncOptions,
    SyncOutcome, SyncResult,
};
pub use debounce::{DebounceFailure, DebounceWindow, Debouncer, FlushReport};
pub use error::{Error, Result, ResultExt};
pub use gate::{GateBlock, SyncGate};
pub use migration::{migrate_project_to_multi_chart, migrate_projects, MigrationEngine, MigrationFailure, MigrationReport};
pub use model::{Chart, PatternItem, PatternItemKind, Project, Round, RoundDoc, Stitch, StitchGroup, Timestamp};
pub use remote::{MemoryRemote, ProjectSubscription, RemoteStore};
#[cfg(feature = "sqlite")]
pub use remote::SqliteRemote;
pub use retry::{classify, ErrorClass, NetworkProfile, RetryOutcome, RetryStatus, SyncController};
pub use rounds::{ProjectRoundService, RoundSyncReport};

//! Backup and point-in-time restore
//!
//! Full, incremental and differential backups of the L2 keyspace, written
//! through a [`BackupStorage`] backend and restored by replaying a chain.

pub mod chain;
pub mod format;
pub mod manager;
pub mod scheduler;
pub mod storage;
pub mod types;

pub use chain::{MaterializedBackup, materialize};
pub use manager::{BackupManager, RestoreReport, VerifyReport, prune, verify_backup};
pub use scheduler::{kind_for_run, start_backup_scheduler};
pub use storage::{BackupStorage, LocalStorage, open_storage};
pub use types::{
    BackupConfig, BackupError, BackupKind, BackupManifest, BackupRecord, RestoreTarget,
    StorageKind,
};

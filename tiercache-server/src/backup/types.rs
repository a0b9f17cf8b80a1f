use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Backup errors
#[derive(Debug, Error)]
pub enum BackupError {
    #[error("Backup not found: {0}")]
    NotFound(String),

    #[error("Another backup or restore is in progress")]
    InProgress,

    #[error("Checksum mismatch for {id}: expected {expected:08x}, got {actual:08x}")]
    ChecksumMismatch {
        id: String,
        expected: u32,
        actual: u32,
    },

    #[error("Backup corrupted: {0}")]
    Corrupted(String),

    #[error("Broken backup chain: {0}")]
    BrokenChain(String),

    #[error("Cache unavailable for backup: {0}")]
    Unavailable(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<serde_json::Error> for BackupError {
    fn from(e: serde_json::Error) -> Self {
        BackupError::Serialization(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;

/// Backup strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupKind {
    /// Entire keyspace
    Full,
    /// Changes since the previous backup of any kind
    Incremental,
    /// Changes since the previous full backup
    Differential,
}

impl BackupKind {
    pub fn tag(self) -> u8 {
        match self {
            Self::Full => 0,
            Self::Incremental => 1,
            Self::Differential => 2,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Self::Full),
            1 => Some(Self::Incremental),
            2 => Some(Self::Differential),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Incremental => "incremental",
            Self::Differential => "differential",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "full" => Some(Self::Full),
            "incremental" | "incr" => Some(Self::Incremental),
            "differential" | "diff" => Some(Self::Differential),
            _ => None,
        }
    }
}

/// Metadata stored next to every backup file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupManifest {
    pub id: String,
    pub kind: BackupKind,
    pub created_at: DateTime<Utc>,
    /// Backup this one applies on top of (none for full)
    pub parent_id: Option<String>,
    /// Full backup at the root of the chain (none for full)
    pub base_full_id: Option<String>,
    /// Change sequence covered by this backup
    pub change_seq: u64,
    /// Change tracker epoch `change_seq` belongs to; empty for backups that
    /// predate epochs, which never match
    #[serde(default)]
    pub change_epoch: String,
    /// Storage-specific location of the data file
    pub location: String,
    pub entries: u64,
    pub tombstones: u64,
    pub size_bytes: u64,
    /// CRC32 of the stored (compressed) data file
    pub checksum: u32,
    pub retention_until: DateTime<Utc>,
}

impl BackupManifest {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.retention_until <= now
    }
}

/// One key in a backup file. `None` marks a key deleted since the parent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupRecord {
    pub key: String,
    pub value: Option<Vec<u8>>,
}

impl BackupRecord {
    pub fn value(key: impl Into<String>, value: Vec<u8>) -> Self {
        Self {
            key: key.into(),
            value: Some(value),
        }
    }

    pub fn tombstone(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: None,
        }
    }

    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }
}

/// Point to restore
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum RestoreTarget {
    /// Newest backup
    Latest,
    /// A specific manifest
    Manifest(String),
    /// Newest backup taken at or before this instant
    PointInTime(DateTime<Utc>),
}

/// Backup storage backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    #[default]
    Local,
}

impl StorageKind {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "local" | "filesystem" | "fs" => Some(Self::Local),
            _ => None,
        }
    }
}

/// Backup configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    /// Run the scheduler
    pub enabled: bool,

    /// Seconds between scheduled backups
    pub interval_secs: u64,

    pub retention_days: u32,

    pub storage: StorageKind,

    /// Directory for the local storage backend
    pub directory: PathBuf,

    /// Every Nth scheduled run is full
    pub full_every: u32,

    /// Every Nth scheduled run (that is not full) is differential; 0 disables
    pub differential_every: u32,

    /// zstd level for backup files
    pub zstd_level: i32,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_secs: 3600,
            retention_days: 7,
            storage: StorageKind::Local,
            directory: PathBuf::from("./data/backups"),
            full_every: 24,
            differential_every: 6,
            zstd_level: 3,
        }
    }
}

impl BackupConfig {
    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.retention_days))
    }
}

//! Backup storage backends
//!
//! Each backup is two objects: the compressed data file and a JSON
//! manifest. The manifest is written last, so a backup without one is
//! treated as never having completed.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tracing::{debug, warn};

use super::types::{BackupConfig, BackupError, BackupManifest, Result, StorageKind};

const DATA_EXT: &str = "tcbk";
const MANIFEST_EXT: &str = "json";

#[async_trait]
pub trait BackupStorage: Send + Sync {
    fn name(&self) -> &'static str;

    /// Location recorded in the manifest for backup `id`
    fn location(&self, id: &str) -> String;

    /// Store data then manifest
    async fn put(&self, manifest: &BackupManifest, data: Vec<u8>) -> Result<()>;

    async fn data(&self, id: &str) -> Result<Vec<u8>>;

    async fn manifest(&self, id: &str) -> Result<BackupManifest>;

    /// All complete backups, oldest first
    async fn list(&self) -> Result<Vec<BackupManifest>>;

    async fn delete(&self, id: &str) -> Result<()>;
}

/// Open the backend named in `config`
pub async fn open_storage(config: &BackupConfig) -> Result<Arc<dyn BackupStorage>> {
    match config.storage {
        StorageKind::Local => Ok(Arc::new(LocalStorage::open(&config.directory).await?)),
    }
}

/// Backups as files in one directory
pub struct LocalStorage {
    dir: PathBuf,
}

impl LocalStorage {
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn data_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", id, DATA_EXT))
    }

    fn manifest_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", id, MANIFEST_EXT))
    }

    /// Write via temp file + rename
    async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
        let temp = path.with_extension("tmp");
        fs::write(&temp, bytes).await?;
        fs::rename(&temp, path).await?;
        Ok(())
    }
}

fn validate_id(id: &str) -> Result<()> {
    let valid = !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(BackupError::NotFound(id.to_string()))
    }
}

fn not_found(id: &str, e: std::io::Error) -> BackupError {
    if e.kind() == std::io::ErrorKind::NotFound {
        BackupError::NotFound(id.to_string())
    } else {
        BackupError::Io(e)
    }
}

#[async_trait]
impl BackupStorage for LocalStorage {
    fn name(&self) -> &'static str {
        "local"
    }

    fn location(&self, id: &str) -> String {
        self.data_path(id).display().to_string()
    }

    async fn put(&self, manifest: &BackupManifest, data: Vec<u8>) -> Result<()> {
        validate_id(&manifest.id)?;
        Self::write_atomic(&self.data_path(&manifest.id), &data).await?;
        let json = serde_json::to_vec_pretty(manifest)?;
        Self::write_atomic(&self.manifest_path(&manifest.id), &json).await?;
        debug!("Stored backup {} ({} bytes)", manifest.id, data.len());
        Ok(())
    }

    async fn data(&self, id: &str) -> Result<Vec<u8>> {
        validate_id(id)?;
        fs::read(self.data_path(id))
            .await
            .map_err(|e| not_found(id, e))
    }

    async fn manifest(&self, id: &str) -> Result<BackupManifest> {
        validate_id(id)?;
        let bytes = fs::read(self.manifest_path(id))
            .await
            .map_err(|e| not_found(id, e))?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn list(&self) -> Result<Vec<BackupManifest>> {
        let mut manifests = Vec::new();
        let mut dir = fs::read_dir(&self.dir).await?;
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(MANIFEST_EXT) {
                continue;
            }
            let parsed = match fs::read(&path).await {
                Ok(bytes) => serde_json::from_slice::<BackupManifest>(&bytes)
                    .map_err(|e| e.to_string()),
                Err(e) => Err(e.to_string()),
            };
            match parsed {
                Ok(manifest) => manifests.push(manifest),
                Err(e) => warn!("Skipping unreadable manifest {:?}: {}", path, e),
            }
        }
        manifests.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(manifests)
    }

    async fn delete(&self, id: &str) -> Result<()> {
        validate_id(id)?;
        // Manifest first so a half-deleted backup is never listed
        match fs::remove_file(self.manifest_path(id)).await {
            Ok(()) => {}
            Err(e) => return Err(not_found(id, e)),
        }
        match fs::remove_file(self.data_path(id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

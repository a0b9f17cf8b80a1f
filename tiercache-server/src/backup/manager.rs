use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::chain;
use super::format;
use super::storage::BackupStorage;
use super::types::{
    BackupConfig, BackupError, BackupKind, BackupManifest, BackupRecord, RestoreTarget, Result,
};
use crate::cache::TieredCache;
use crate::metrics;
use crate::monitoring::{AlertLog, AlertSeverity};

/// Outcome of a restore
#[derive(Debug, Clone, Serialize)]
pub struct RestoreReport {
    pub target_id: String,
    /// Layers applied, root full first
    pub chain: Vec<String>,
    pub restored_entries: usize,
    /// Expired or unreadable entries left out
    pub dropped_entries: usize,
    /// Writes accepted during the swap that have not reached L2 yet
    pub replay_pending: bool,
}

/// Result of checking one backup
#[derive(Debug, Clone, Serialize)]
pub struct VerifyReport {
    pub id: String,
    pub kind: BackupKind,
    pub records: usize,
    pub tombstones: usize,
}

/// Creates, restores and prunes backups of a [`TieredCache`].
///
/// Backups and restores are serialized; a second one started while one is
/// running fails with [`BackupError::InProgress`] rather than queueing.
pub struct BackupManager {
    config: BackupConfig,
    cache: Arc<TieredCache>,
    storage: Arc<dyn BackupStorage>,
    alerts: Arc<AlertLog>,
    running: Mutex<()>,
}

impl BackupManager {
    pub fn new(config: BackupConfig, cache: Arc<TieredCache>, storage: Arc<dyn BackupStorage>) -> Self {
        let alerts = cache.alerts();
        Self {
            config,
            cache,
            storage,
            alerts,
            running: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &BackupConfig {
        &self.config
    }

    pub fn storage(&self) -> Arc<dyn BackupStorage> {
        self.storage.clone()
    }

    /// Take a backup. Incremental and differential requests fall back to a
    /// full backup when there is no usable base.
    pub async fn create_backup(&self, requested: BackupKind) -> Result<BackupManifest> {
        let _guard = self.running.try_lock().map_err(|_| BackupError::InProgress)?;
        let started = Instant::now();

        match self.create_locked(requested).await {
            Ok(manifest) => {
                metrics::record_backup(
                    manifest.kind.as_str(),
                    "success",
                    started.elapsed().as_secs_f64(),
                );
                self.alerts.resolve("backup");
                info!(
                    "Backup {} complete: {} {} entries, {} tombstones, {} bytes in {:?}",
                    manifest.id,
                    manifest.kind.as_str(),
                    manifest.entries,
                    manifest.tombstones,
                    manifest.size_bytes,
                    started.elapsed()
                );
                Ok(manifest)
            }
            Err(e) => {
                metrics::record_backup(
                    requested.as_str(),
                    "failure",
                    started.elapsed().as_secs_f64(),
                );
                self.alerts.raise(
                    AlertSeverity::Critical,
                    "backup",
                    format!("{} backup failed: {}", requested.as_str(), e),
                );
                Err(e)
            }
        }
    }

    async fn create_locked(&self, requested: BackupKind) -> Result<BackupManifest> {
        let manifests = self.storage.list().await?;
        let last_full = manifests.iter().rev().find(|m| m.kind == BackupKind::Full);

        let parent = match requested {
            BackupKind::Full => None,
            BackupKind::Incremental => manifests.last(),
            BackupKind::Differential => last_full,
        };

        let (seq, snapshot) = self
            .cache
            .snapshot_for_backup()
            .await
            .map_err(|e| BackupError::Unavailable(e.to_string()))?;

        let tracker = self.cache.changes();
        let mut kind = requested;
        let mut records = None;
        if let (Some(parent), Some(full)) = (parent, last_full) {
            let changes = tracker.changes_since(parent.change_seq);
            if parent.change_epoch != tracker.epoch() {
                info!(
                    "{} was taken under another change tracker epoch; taking a full backup instead",
                    parent.id
                );
            } else if changes.reset {
                info!(
                    "Keyspace was reset since {}; taking a full backup instead",
                    parent.id
                );
            } else {
                let values: HashMap<&str, &Vec<u8>> = snapshot
                    .iter()
                    .map(|e| (e.key.as_str(), &e.value))
                    .collect();
                // The snapshot is authoritative; the change set only selects keys
                let mut delta: Vec<BackupRecord> = changes
                    .upserts
                    .iter()
                    .chain(changes.deletes.iter())
                    .map(|key| match values.get(key.as_str()) {
                        Some(value) => BackupRecord::value(key.clone(), (*value).clone()),
                        None => BackupRecord::tombstone(key.clone()),
                    })
                    .collect();
                delta.sort_by(|a, b| a.key.cmp(&b.key));
                records = Some((delta, parent.id.clone(), full.id.clone()));
            }
        } else if requested != BackupKind::Full {
            info!(
                "No base for {} backup; taking a full backup instead",
                requested.as_str()
            );
        }

        let (records, parent_id, base_full_id) = match records {
            Some((delta, parent_id, base_full_id)) => (delta, Some(parent_id), Some(base_full_id)),
            None => {
                kind = BackupKind::Full;
                let full = snapshot
                    .into_iter()
                    .map(|e| BackupRecord::value(e.key, e.value))
                    .collect();
                (full, None, None)
            }
        };

        let tombstones = records.iter().filter(|r| r.is_tombstone()).count() as u64;
        let entries = records.len() as u64 - tombstones;
        let data = format::encode(kind, &records, self.config.zstd_level)?;

        // Chain order follows created_at, so it must strictly increase
        let created_at = match manifests.last() {
            Some(last) => Utc::now().max(last.created_at + chrono::Duration::microseconds(1)),
            None => Utc::now(),
        };
        let id = format!(
            "{}-{}-{}",
            created_at.format("%Y%m%dT%H%M%S%3fZ"),
            kind.as_str(),
            &uuid::Uuid::new_v4().simple().to_string()[..8]
        );
        let manifest = BackupManifest {
            location: self.storage.location(&id),
            id,
            kind,
            created_at,
            parent_id,
            base_full_id,
            change_seq: seq,
            change_epoch: tracker.epoch().to_string(),
            entries,
            tombstones,
            size_bytes: data.len() as u64,
            checksum: crc32fast::hash(&data),
            retention_until: created_at + self.config.retention(),
        };

        self.storage.put(&manifest, data).await?;

        if kind == BackupKind::Full {
            let compacted = tracker.compact(seq);
            debug!("Compacted {} change records up to seq {}", compacted, seq);
        }
        Ok(manifest)
    }

    /// All backups, oldest first
    pub async fn list(&self) -> Result<Vec<BackupManifest>> {
        self.storage.list().await
    }

    pub async fn manifest(&self, id: &str) -> Result<BackupManifest> {
        self.storage.manifest(id).await
    }

    /// Check a backup's file checksum and embedded checksum
    pub async fn verify(&self, id: &str) -> Result<VerifyReport> {
        let manifest = self.storage.manifest(id).await?;
        verify_backup(self.storage.as_ref(), &manifest).await
    }

    /// Restore the keyspace to `target`.
    ///
    /// Every layer is verified and the full keyspace materialised before the
    /// cache is touched.
    pub async fn restore(&self, target: RestoreTarget) -> Result<RestoreReport> {
        let _guard = self.running.try_lock().map_err(|_| BackupError::InProgress)?;
        let started = Instant::now();

        match self.restore_locked(&target).await {
            Ok(report) => {
                metrics::record_restore("success");
                self.alerts.resolve("restore");
                info!(
                    "Restored {} ({} layers, {} entries, {} dropped) in {:?}",
                    report.target_id,
                    report.chain.len(),
                    report.restored_entries,
                    report.dropped_entries,
                    started.elapsed()
                );
                Ok(report)
            }
            Err(e) => {
                metrics::record_restore("failure");
                self.alerts.raise(
                    AlertSeverity::Critical,
                    "restore",
                    format!("Restore of {:?} failed: {}", target, e),
                );
                Err(e)
            }
        }
    }

    async fn restore_locked(&self, target: &RestoreTarget) -> Result<RestoreReport> {
        let materialized = chain::materialize(self.storage.as_ref(), target).await?;
        let (entries, dropped) = chain::into_entries(materialized.state);
        let restored = entries.len();

        let replayed = self
            .cache
            .restore_entries(entries)
            .await
            .map_err(|e| BackupError::Unavailable(e.to_string()))?;
        if !replayed {
            warn!(
                "Restore of {} applied; journalled writes will replay once L2 recovers",
                materialized.target.id
            );
        }

        Ok(RestoreReport {
            target_id: materialized.target.id,
            chain: materialized.chain,
            restored_entries: restored,
            dropped_entries: dropped,
            replay_pending: !replayed,
        })
    }

    /// Delete backups past retention that nothing retained depends on
    pub async fn prune_expired(&self) -> Result<Vec<String>> {
        let _guard = self.running.try_lock().map_err(|_| BackupError::InProgress)?;
        prune(self.storage.as_ref()).await
    }
}

/// Verify one backup against its manifest
pub async fn verify_backup(
    storage: &dyn BackupStorage,
    manifest: &BackupManifest,
) -> Result<VerifyReport> {
    let data = chain::load_verified(storage, manifest).await?;
    let (kind, records) = format::decode(&data)?;
    let tombstones = records.iter().filter(|r| r.is_tombstone()).count();

    if kind != manifest.kind || (records.len() - tombstones) as u64 != manifest.entries {
        return Err(BackupError::Corrupted(format!(
            "{} does not match its manifest",
            manifest.id
        )));
    }
    Ok(VerifyReport {
        id: manifest.id.clone(),
        kind,
        records: records.len(),
        tombstones,
    })
}

/// Apply the retention plan to `storage`
pub async fn prune(storage: &dyn BackupStorage) -> Result<Vec<String>> {
    let manifests = storage.list().await?;
    let doomed = chain::plan_prune(&manifests, Utc::now());

    let mut deleted = Vec::with_capacity(doomed.len());
    for id in doomed {
        match storage.delete(&id).await {
            Ok(()) => deleted.push(id),
            Err(e) => warn!("Failed to prune backup {}: {}", id, e),
        }
    }
    if !deleted.is_empty() {
        info!("Pruned {} expired backup(s)", deleted.len());
    }
    Ok(deleted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::storage::LocalStorage;
    use crate::cache::{L2Backend, MemoryL2, TieredCacheConfig};
    use crate::compression::CompressionConfig;
    use crate::core::CacheStatus;
    use tempfile::TempDir;

    async fn setup() -> (TempDir, Arc<MemoryL2>, Arc<TieredCache>, BackupManager) {
        let dir = TempDir::new().unwrap();
        let l2 = Arc::new(MemoryL2::new());
        let cache = Arc::new(TieredCache::new(
            TieredCacheConfig::default(),
            l2.clone() as Arc<dyn L2Backend>,
            CompressionConfig::default(),
        ));
        let storage = Arc::new(LocalStorage::open(dir.path()).await.unwrap());
        let manager = BackupManager::new(BackupConfig::default(), cache.clone(), storage);
        (dir, l2, cache, manager)
    }

    #[tokio::test]
    async fn test_incremental_without_base_becomes_full() {
        let (_dir, _l2, cache, manager) = setup().await;
        cache.set("a", b"1".to_vec(), None).await.unwrap();

        let manifest = manager.create_backup(BackupKind::Incremental).await.unwrap();
        assert_eq!(manifest.kind, BackupKind::Full);
        assert_eq!(manifest.entries, 1);
        assert!(manifest.parent_id.is_none());
    }

    #[tokio::test]
    async fn test_incremental_captures_only_changes() {
        let (_dir, _l2, cache, manager) = setup().await;
        cache.set("a", b"1".to_vec(), None).await.unwrap();
        cache.set("b", b"2".to_vec(), None).await.unwrap();
        let full = manager.create_backup(BackupKind::Full).await.unwrap();

        cache.set("c", b"3".to_vec(), None).await.unwrap();
        cache.invalidate("a").await.unwrap();
        let incr = manager.create_backup(BackupKind::Incremental).await.unwrap();

        assert_eq!(incr.kind, BackupKind::Incremental);
        assert_eq!(incr.parent_id.as_deref(), Some(full.id.as_str()));
        assert_eq!(incr.entries, 1);
        assert_eq!(incr.tombstones, 1);

        let report = manager.verify(&incr.id).await.unwrap();
        assert_eq!(report.records, 2);
    }

    #[tokio::test]
    async fn test_clear_forces_full() {
        let (_dir, _l2, cache, manager) = setup().await;
        cache.set("a", b"1".to_vec(), None).await.unwrap();
        manager.create_backup(BackupKind::Full).await.unwrap();

        cache.clear().await.unwrap();
        let next = manager.create_backup(BackupKind::Differential).await.unwrap();
        assert_eq!(next.kind, BackupKind::Full);
    }

    #[tokio::test]
    async fn test_new_tracker_epoch_forces_full() {
        let (dir, l2, cache, manager) = setup().await;
        for i in 0..5 {
            cache.set(&format!("k{}", i), b"v".to_vec(), None).await.unwrap();
        }
        let full = manager.create_backup(BackupKind::Full).await.unwrap();
        assert_eq!(full.change_epoch, cache.changes().epoch());
        drop(manager);

        // Same L2 and backup directory, fresh process state
        let restarted = Arc::new(TieredCache::new(
            TieredCacheConfig::default(),
            l2.clone() as Arc<dyn L2Backend>,
            CompressionConfig::default(),
        ));
        let storage = Arc::new(LocalStorage::open(dir.path()).await.unwrap());
        let manager = BackupManager::new(BackupConfig::default(), restarted.clone(), storage);
        restarted.set("after_restart", b"new".to_vec(), None).await.unwrap();

        let next = manager.create_backup(BackupKind::Incremental).await.unwrap();
        assert_eq!(next.kind, BackupKind::Full);
        assert_eq!(next.entries, 6);

        restarted.invalidate("after_restart").await.unwrap();
        manager.restore(RestoreTarget::Latest).await.unwrap();
        assert_eq!(restarted.get("after_restart").await.unwrap(), Some(b"new".to_vec()));
    }

    #[tokio::test]
    async fn test_restore_latest() {
        let (_dir, _l2, cache, manager) = setup().await;
        cache.set("a", b"1".to_vec(), None).await.unwrap();
        manager.create_backup(BackupKind::Full).await.unwrap();
        cache.set("b", b"2".to_vec(), None).await.unwrap();
        manager.create_backup(BackupKind::Incremental).await.unwrap();

        cache.set("junk", b"x".to_vec(), None).await.unwrap();
        cache.invalidate("a").await.unwrap();

        let report = manager.restore(RestoreTarget::Latest).await.unwrap();
        assert_eq!(report.chain.len(), 2);
        assert_eq!(report.restored_entries, 2);
        assert!(!report.replay_pending);

        assert_eq!(cache.status(), CacheStatus::Healthy);
        assert_eq!(cache.get("a").await.unwrap(), Some(b"1".to_vec()));
        assert_eq!(cache.get("b").await.unwrap(), Some(b"2".to_vec()));
        assert_eq!(cache.get("junk").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_backup_fails_while_degraded() {
        let (_dir, l2, cache, manager) = setup().await;
        l2.set_available(false);
        cache.set("a", b"1".to_vec(), None).await.unwrap();

        let err = manager.create_backup(BackupKind::Full).await.unwrap_err();
        assert!(matches!(err, BackupError::Unavailable(_)));
        assert!(cache.alerts().active().iter().any(|a| a.source == "backup"));
        assert!(manager.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_layer_aborts_restore_before_touching_cache() {
        let (dir, _l2, cache, manager) = setup().await;
        cache.set("a", b"1".to_vec(), None).await.unwrap();
        let full = manager.create_backup(BackupKind::Full).await.unwrap();

        std::fs::write(dir.path().join(format!("{}.tcbk", full.id)), b"garbage").unwrap();
        cache.set("live", b"keep".to_vec(), None).await.unwrap();

        let err = manager.restore(RestoreTarget::Latest).await.unwrap_err();
        assert!(matches!(err, BackupError::ChecksumMismatch { .. }));
        assert_eq!(cache.get("live").await.unwrap(), Some(b"keep".to_vec()));
        assert_eq!(cache.status(), CacheStatus::Healthy);
    }
}

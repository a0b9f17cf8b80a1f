//! Retention pruning

use anyhow::Result;
use chrono::Utc;
use tiercache_server::backup::chain::plan_prune;
use tiercache_server::backup::{self, BackupStorage};
use tracing::info;

/// Delete (or with `dry_run`, list) prunable backups
pub async fn prune(storage: &dyn BackupStorage, dry_run: bool) -> Result<Vec<String>> {
    if dry_run {
        let manifests = storage.list().await?;
        return Ok(plan_prune(&manifests, Utc::now()));
    }
    let deleted = backup::prune(storage).await?;
    info!("Pruned {} backup(s)", deleted.len());
    Ok(deleted)
}

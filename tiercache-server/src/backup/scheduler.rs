use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info};

use super::manager::BackupManager;
use super::types::{BackupConfig, BackupKind};

/// Kind of the `run`-th scheduled backup (0-based). Run 0 is always full.
pub fn kind_for_run(config: &BackupConfig, run: u64) -> BackupKind {
    let full_every = u64::from(config.full_every.max(1));
    let differential_every = u64::from(config.differential_every);

    if run % full_every == 0 {
        BackupKind::Full
    } else if differential_every > 0 && run % differential_every == 0 {
        BackupKind::Differential
    } else {
        BackupKind::Incremental
    }
}

/// Start the background backup task.
///
/// Each tick takes one backup and then prunes expired ones. Failures are
/// alerted by the manager and never stop the loop.
pub fn start_backup_scheduler(manager: Arc<BackupManager>) -> JoinHandle<()> {
    let interval_secs = manager.config().interval_secs.max(1);
    info!("Backup scheduler started (every {}s)", interval_secs);

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // Skip the immediate first tick
        interval.tick().await;

        let mut run: u64 = 0;
        loop {
            interval.tick().await;

            let kind = kind_for_run(manager.config(), run);
            run += 1;
            if let Err(e) = manager.create_backup(kind).await {
                error!("Scheduled {} backup failed: {}", kind.as_str(), e);
            }
            if let Err(e) = manager.prune_expired().await {
                error!("Backup pruning failed: {}", e);
            }
        }
    })
}

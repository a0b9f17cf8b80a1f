//! Checksum verification

use anyhow::{Result, bail};
use std::fmt;
use tiercache_server::backup::{BackupManifest, BackupStorage, verify_backup};
use tracing::warn;

pub struct VerifySummary {
    pub checked: usize,
    pub failures: Vec<(String, String)>,
}

impl VerifySummary {
    pub fn into_result(self) -> Result<()> {
        if self.failures.is_empty() {
            Ok(())
        } else {
            bail!("{} of {} backups failed verification", self.failures.len(), self.checked)
        }
    }
}

impl fmt::Display for VerifySummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (id, error) in &self.failures {
            writeln!(f, "FAIL {}: {}", id, error)?;
        }
        write!(
            f,
            "{} checked, {} ok, {} failed",
            self.checked,
            self.checked - self.failures.len(),
            self.failures.len()
        )
    }
}

/// Verify one backup, or every backup when `id` is `None`
pub async fn verify(storage: &dyn BackupStorage, id: Option<&str>) -> Result<VerifySummary> {
    let manifests: Vec<BackupManifest> = match id {
        Some(id) => vec![storage.manifest(id).await?],
        None => storage.list().await?,
    };

    let mut failures = Vec::new();
    for manifest in &manifests {
        match verify_backup(storage, manifest).await {
            Ok(report) => println!(
                "ok   {} ({} records, {} tombstones)",
                report.id, report.records, report.tombstones
            ),
            Err(e) => {
                warn!("Backup {} failed verification: {}", manifest.id, e);
                failures.push((manifest.id.clone(), e.to_string()));
            }
        }
    }

    Ok(VerifySummary {
        checked: manifests.len(),
        failures,
    })
}

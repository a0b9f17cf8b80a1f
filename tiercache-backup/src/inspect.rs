//! Listing and manifest inspection

use anyhow::{Context, Result};
use std::fmt::Write;
use tiercache_server::backup::chain::build_chain;
use tiercache_server::backup::{BackupManifest, BackupStorage};

fn summary_line(manifest: &BackupManifest) -> String {
    format!(
        "{:<48} {:<12} {}  {:>8} keys {:>6} deleted {:>10} bytes{}",
        manifest.id,
        manifest.kind.as_str(),
        manifest.created_at.format("%Y-%m-%d %H:%M:%S"),
        manifest.entries,
        manifest.tombstones,
        manifest.size_bytes,
        manifest
            .parent_id
            .as_deref()
            .map(|p| format!("  <- {}", p))
            .unwrap_or_default()
    )
}

/// Table (or JSON array) of every backup
pub async fn list(storage: &dyn BackupStorage, json: bool) -> Result<String> {
    let manifests = storage.list().await.context("Failed to list backups")?;
    if json {
        return Ok(serde_json::to_string_pretty(&manifests)? + "\n");
    }
    if manifests.is_empty() {
        return Ok("No backups\n".to_string());
    }

    let mut out = String::new();
    for manifest in &manifests {
        writeln!(out, "{}", summary_line(manifest))?;
    }
    Ok(out)
}

/// Manifest JSON followed by its restore chain
pub async fn inspect(storage: &dyn BackupStorage, id: &str) -> Result<String> {
    let manifest = storage
        .manifest(id)
        .await
        .with_context(|| format!("Backup {} not found", id))?;
    let manifests = storage.list().await?;

    let mut out = serde_json::to_string_pretty(&manifest)?;
    out.push_str("\n\nRestore chain:\n");
    match build_chain(&manifests, id) {
        Ok(chain) => {
            for (depth, layer) in chain.iter().enumerate() {
                writeln!(out, "  {}. {}", depth + 1, summary_line(layer))?;
            }
        }
        Err(e) => writeln!(out, "  unusable: {}", e)?,
    }
    Ok(out)
}

//! Backup chains
//!
//! A full backup roots a chain. A differential's parent is the full backup
//! it was taken against; an incremental's parent is whatever backup came
//! immediately before it. Following `parent_id` from any manifest therefore
//! yields the exact layers needed to rebuild it.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;
use tracing::{debug, warn};

use super::format;
use super::storage::BackupStorage;
use super::types::{BackupError, BackupKind, BackupManifest, BackupRecord, RestoreTarget, Result};
use crate::cache::L2Entry;
use crate::compression::envelope;
use crate::core::now_millis;

/// Pick the manifest a restore target refers to. `manifests` is oldest first.
pub fn resolve_target<'a>(
    manifests: &'a [BackupManifest],
    target: &RestoreTarget,
) -> Result<&'a BackupManifest> {
    match target {
        RestoreTarget::Latest => manifests
            .last()
            .ok_or_else(|| BackupError::NotFound("no backups available".to_string())),
        RestoreTarget::Manifest(id) => manifests
            .iter()
            .find(|m| &m.id == id)
            .ok_or_else(|| BackupError::NotFound(id.clone())),
        RestoreTarget::PointInTime(at) => manifests
            .iter()
            .filter(|m| m.created_at <= *at)
            .max_by_key(|m| m.created_at)
            .ok_or_else(|| BackupError::NotFound(format!("no backup at or before {}", at))),
    }
}

/// Layers from the root full backup to `target_id`, root first
pub fn build_chain(manifests: &[BackupManifest], target_id: &str) -> Result<Vec<BackupManifest>> {
    let by_id: HashMap<&str, &BackupManifest> =
        manifests.iter().map(|m| (m.id.as_str(), m)).collect();

    let mut chain = Vec::new();
    let mut seen = HashSet::new();
    let mut current = *by_id
        .get(target_id)
        .ok_or_else(|| BackupError::NotFound(target_id.to_string()))?;

    loop {
        if !seen.insert(current.id.as_str()) {
            return Err(BackupError::BrokenChain(format!(
                "cycle at {}",
                current.id
            )));
        }
        chain.push(current.clone());
        if current.kind == BackupKind::Full {
            break;
        }
        let parent_id = current.parent_id.as_deref().ok_or_else(|| {
            BackupError::BrokenChain(format!("{} has no parent", current.id))
        })?;
        current = *by_id.get(parent_id).ok_or_else(|| {
            BackupError::BrokenChain(format!(
                "{} depends on missing backup {}",
                current.id, parent_id
            ))
        })?;
    }

    chain.reverse();
    Ok(chain)
}

/// Apply decoded layers in order
pub fn apply_layers<I>(layers: I) -> BTreeMap<String, Vec<u8>>
where
    I: IntoIterator<Item = (BackupKind, Vec<BackupRecord>)>,
{
    let mut state = BTreeMap::new();
    for (kind, records) in layers {
        if kind == BackupKind::Full {
            state.clear();
        }
        for record in records {
            match record.value {
                Some(value) => {
                    state.insert(record.key, value);
                }
                None => {
                    state.remove(&record.key);
                }
            }
        }
    }
    state
}

/// Turn materialized envelopes into L2 entries, dropping expired ones.
///
/// TTLs are recomputed from each envelope's absolute expiry, so time spent
/// in the backup counts against them.
pub fn into_entries(state: BTreeMap<String, Vec<u8>>) -> (Vec<L2Entry>, usize) {
    let now = now_millis();
    let mut entries = Vec::with_capacity(state.len());
    let mut dropped = 0;

    for (key, value) in state {
        let ttl = match envelope::peek_header(&value) {
            Ok(header) => match header.expires_at_ms {
                None => None,
                Some(expires) if expires > now => Some(Duration::from_millis(expires - now)),
                Some(_) => {
                    dropped += 1;
                    continue;
                }
            },
            Err(e) => {
                warn!("Skipping backed-up key '{}' with unreadable envelope: {}", key, e);
                dropped += 1;
                continue;
            }
        };
        entries.push(L2Entry { key, value, ttl });
    }

    if dropped > 0 {
        debug!("Dropped {} expired or unreadable entries from restore", dropped);
    }
    (entries, dropped)
}

/// Fetch a backup's data and check it against the manifest checksum
pub async fn load_verified(storage: &dyn BackupStorage, manifest: &BackupManifest) -> Result<Vec<u8>> {
    let data = storage.data(&manifest.id).await?;
    let actual = crc32fast::hash(&data);
    if actual != manifest.checksum {
        return Err(BackupError::ChecksumMismatch {
            id: manifest.id.clone(),
            expected: manifest.checksum,
            actual,
        });
    }
    Ok(data)
}

/// A restore target resolved down to its final keyspace
#[derive(Debug)]
pub struct MaterializedBackup {
    pub target: BackupManifest,
    pub chain: Vec<String>,
    pub state: BTreeMap<String, Vec<u8>>,
}

/// Resolve, verify every layer, then apply them.
///
/// Nothing is returned unless every layer in the chain verifies.
pub async fn materialize(
    storage: &dyn BackupStorage,
    target: &RestoreTarget,
) -> Result<MaterializedBackup> {
    let manifests = storage.list().await?;
    let target = resolve_target(&manifests, target)?.clone();
    let chain = build_chain(&manifests, &target.id)?;

    let mut layers = Vec::with_capacity(chain.len());
    for manifest in &chain {
        let data = load_verified(storage, manifest).await?;
        let (kind, records) = format::decode(&data)?;
        if kind != manifest.kind {
            return Err(BackupError::Corrupted(format!(
                "{} is {} but its data says {}",
                manifest.id,
                manifest.kind.as_str(),
                kind.as_str()
            )));
        }
        layers.push((kind, records));
    }

    Ok(MaterializedBackup {
        chain: chain.iter().map(|m| m.id.clone()).collect(),
        target,
        state: apply_layers(layers),
    })
}

/// Backups that can be deleted at `now`.
///
/// A backup past retention is kept while any retained backup (or the
/// newest backup) still depends on it.
pub fn plan_prune(manifests: &[BackupManifest], now: DateTime<Utc>) -> Vec<String> {
    let by_id: HashMap<&str, &BackupManifest> =
        manifests.iter().map(|m| (m.id.as_str(), m)).collect();

    let mut keep: HashSet<&str> = HashSet::new();
    let roots = manifests
        .iter()
        .filter(|m| !m.is_expired_at(now))
        .chain(manifests.last());

    for root in roots {
        let mut current = Some(root);
        while let Some(manifest) = current {
            if !keep.insert(manifest.id.as_str()) {
                break;
            }
            current = manifest
                .parent_id
                .as_deref()
                .and_then(|parent| by_id.get(parent).copied());
        }
    }

    manifests
        .iter()
        .filter(|m| !keep.contains(m.id.as_str()))
        .map(|m| m.id.clone())
        .collect()
}

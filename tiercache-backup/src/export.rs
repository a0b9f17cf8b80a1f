//! Keyspace export as JSON lines

use anyhow::{Context, Result};
use serde::Serialize;
use std::fmt;
use std::io::Write;
use tiercache_server::backup::{BackupStorage, RestoreTarget, materialize};
use tiercache_server::compression::{CompressionConfig, Compressor, envelope};
use tiercache_server::core::now_millis;

#[derive(Serialize)]
#[serde(untagged)]
enum ExportedValue {
    Text(String),
    Bytes(Vec<u8>),
}

impl ExportedValue {
    fn new(bytes: Vec<u8>) -> Self {
        match String::from_utf8(bytes) {
            Ok(text) => Self::Text(text),
            Err(e) => Self::Bytes(e.into_bytes()),
        }
    }
}

#[derive(Serialize)]
struct ExportedEntry<'a> {
    key: &'a str,
    value: ExportedValue,
    #[serde(skip_serializing_if = "Option::is_none")]
    expires_at_ms: Option<u64>,
}

#[derive(Debug, Default)]
pub struct ExportStats {
    pub target: String,
    pub layers: usize,
    pub written: usize,
    pub expired: usize,
    pub unreadable: usize,
}

impl fmt::Display for ExportStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Exported {} keys from {} ({} layers); skipped {} expired, {} unreadable",
            self.written, self.target, self.layers, self.expired, self.unreadable
        )
    }
}

/// Write one JSON object per live key. Expired keys are skipped.
pub async fn export<W: Write>(
    storage: &dyn BackupStorage,
    target: &RestoreTarget,
    raw: bool,
    mut out: W,
) -> Result<ExportStats> {
    let backup = materialize(storage, target)
        .await
        .context("Failed to materialize backup")?;
    let compressor = Compressor::new(CompressionConfig::default());
    let now = now_millis();

    let mut stats = ExportStats {
        target: backup.target.id.clone(),
        layers: backup.chain.len(),
        ..Default::default()
    };

    for (key, stored) in backup.state {
        let header = match envelope::peek_header(&stored) {
            Ok(header) => header,
            Err(_) => {
                stats.unreadable += 1;
                continue;
            }
        };
        if header.is_expired_at(now) {
            stats.expired += 1;
            continue;
        }

        let value = if raw {
            stored
        } else {
            match envelope::decode(&compressor, &stored) {
                Ok(decoded) => decoded.value,
                Err(_) => {
                    stats.unreadable += 1;
                    continue;
                }
            }
        };

        let entry = ExportedEntry {
            key: &key,
            value: ExportedValue::new(value),
            expires_at_ms: header.expires_at_ms,
        };
        serde_json::to_writer(&mut out, &entry)?;
        out.write_all(b"\n")?;
        stats.written += 1;
    }

    out.flush()?;
    Ok(stats)
}

use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Current Unix time in milliseconds
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Absolute expiry (Unix ms) for a TTL starting now
pub fn expiry_from_ttl(ttl: Option<Duration>) -> Option<u64> {
    ttl.map(|ttl| now_millis().saturating_add(ttl.as_millis() as u64))
}

/// Remaining TTL for an absolute expiry, `None` when already expired
pub fn remaining_ttl(expires_at_ms: u64) -> Option<Duration> {
    let now = now_millis();
    if expires_at_ms <= now {
        None
    } else {
        Some(Duration::from_millis(expires_at_ms - now))
    }
}

/// Serving mode of the cache orchestrator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum CacheStatus {
    /// Both layers reachable
    Healthy,
    /// L2 unreachable, serving from L1 only
    Degraded { since_ms: u64, reason: String },
    /// A backup restore is swapping the L2 keyspace
    Restoring { since_ms: u64 },
}

impl CacheStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, CacheStatus::Healthy)
    }

    pub fn label(&self) -> &'static str {
        match self {
            CacheStatus::Healthy => "healthy",
            CacheStatus::Degraded { .. } => "degraded",
            CacheStatus::Restoring { .. } => "restoring",
        }
    }
}

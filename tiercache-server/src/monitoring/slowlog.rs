//! Slow Operation Logging
//!
//! Tracks cache operations that exceed a configurable time threshold

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use crate::core::now_millis;

/// Slow log entry
#[derive(Debug, Clone, Serialize)]
pub struct SlowLogEntry {
    pub id: u64,
    pub timestamp_ms: u64,
    pub duration_us: u64,
    pub operation: String,
    pub args: Vec<String>,
}

/// Slow log configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SlowLogConfig {
    pub threshold_us: u64,
    pub max_entries: usize,
}

impl Default for SlowLogConfig {
    fn default() -> Self {
        Self {
            threshold_us: 10_000,
            max_entries: 128,
        }
    }
}

struct SlowLogState {
    entries: Vec<SlowLogEntry>,
    next_id: u64,
}

/// Slow log manager
#[derive(Clone)]
pub struct SlowLogManager {
    state: Arc<RwLock<SlowLogState>>,
    config: SlowLogConfig,
}

impl Default for SlowLogManager {
    fn default() -> Self {
        Self::new()
    }
}

impl SlowLogManager {
    pub fn new() -> Self {
        Self::with_config(SlowLogConfig::default())
    }

    pub fn with_config(config: SlowLogConfig) -> Self {
        Self {
            state: Arc::new(RwLock::new(SlowLogState {
                entries: Vec::new(),
                next_id: 0,
            })),
            config,
        }
    }

    /// Record an operation if it exceeds the threshold
    pub async fn record(&self, operation: String, args: Vec<String>, duration: Duration) {
        let duration_us = duration.as_micros() as u64;
        if duration_us < self.config.threshold_us {
            return;
        }

        let mut state = self.state.write().await;
        let entry = SlowLogEntry {
            id: state.next_id,
            timestamp_ms: now_millis(),
            duration_us,
            operation,
            args,
        };
        state.next_id += 1;
        state.entries.push(entry);

        // Keep only the last N entries
        if state.entries.len() > self.config.max_entries {
            state.entries.remove(0);
        }
    }

    /// Get slow log entries (most recent first)
    pub async fn get(&self, count: Option<usize>) -> Vec<SlowLogEntry> {
        let state = self.state.read().await;
        let take = count.unwrap_or(state.entries.len());
        state.entries.iter().rev().take(take).cloned().collect()
    }

    pub async fn reset(&self) -> usize {
        let mut state = self.state.write().await;
        let count = state.entries.len();
        state.entries.clear();
        count
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.read().await.entries.is_empty()
    }

    pub fn config(&self) -> &SlowLogConfig {
        &self.config
    }
}

/// SlowLog response for API
#[derive(Debug, Serialize)]
pub struct SlowLog {
    pub entries: Vec<SlowLogEntry>,
    pub total: usize,
}

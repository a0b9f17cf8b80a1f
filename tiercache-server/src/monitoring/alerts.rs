//! Alert log
//!
//! Operational problems that need attention (L2 outage, backup failure,
//! failover) are raised here, logged at error/warn level and counted.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use tracing::{error, info, warn};

use crate::core::now_millis;
use crate::metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

impl AlertSeverity {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub id: u64,
    pub severity: AlertSeverity,
    /// Subsystem that raised it (cache, backup, restore, cluster)
    pub source: String,
    pub message: String,
    pub raised_at_ms: u64,
    pub resolved_at_ms: Option<u64>,
}

struct AlertState {
    alerts: VecDeque<Alert>,
    next_id: u64,
}

/// Bounded ring of recent alerts
pub struct AlertLog {
    state: Mutex<AlertState>,
    capacity: usize,
}

impl Default for AlertLog {
    fn default() -> Self {
        Self::new(256)
    }
}

impl AlertLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(AlertState {
                alerts: VecDeque::new(),
                next_id: 0,
            }),
            capacity: capacity.max(1),
        }
    }

    pub fn raise(&self, severity: AlertSeverity, source: &str, message: impl Into<String>) -> u64 {
        let message = message.into();
        match severity {
            AlertSeverity::Critical => error!(source, "ALERT: {}", message),
            AlertSeverity::Warning => warn!(source, "ALERT: {}", message),
            AlertSeverity::Info => info!(source, "ALERT: {}", message),
        }
        metrics::record_alert(severity.as_str());

        let mut state = self.state.lock();
        let id = state.next_id;
        state.next_id += 1;
        state.alerts.push_back(Alert {
            id,
            severity,
            source: source.to_string(),
            message,
            raised_at_ms: now_millis(),
            resolved_at_ms: None,
        });
        while state.alerts.len() > self.capacity {
            state.alerts.pop_front();
        }
        id
    }

    /// Mark every open alert from `source` resolved
    pub fn resolve(&self, source: &str) -> usize {
        let now = now_millis();
        let mut state = self.state.lock();
        let mut resolved = 0;
        for alert in state
            .alerts
            .iter_mut()
            .filter(|a| a.source == source && a.resolved_at_ms.is_none())
        {
            alert.resolved_at_ms = Some(now);
            resolved += 1;
        }
        if resolved > 0 {
            info!(source, "Resolved {} alert(s)", resolved);
        }
        resolved
    }

    /// Most recent first
    pub fn recent(&self, limit: Option<usize>) -> Vec<Alert> {
        let state = self.state.lock();
        let take = limit.unwrap_or(state.alerts.len());
        state.alerts.iter().rev().take(take).cloned().collect()
    }

    pub fn active(&self) -> Vec<Alert> {
        self.state
            .lock()
            .alerts
            .iter()
            .filter(|a| a.resolved_at_ms.is_none())
            .cloned()
            .collect()
    }
}

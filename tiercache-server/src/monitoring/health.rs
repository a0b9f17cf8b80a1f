//! Health report served by `GET /health`

use serde::Serialize;

use crate::cluster::ClusterSnapshot;
use crate::core::CacheStatus;

/// Overall verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthLevel {
    Ok,
    Degraded,
    Critical,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClusterHealth {
    pub epoch: u64,
    pub primary: Option<String>,
    pub healthy_nodes: usize,
    pub total_nodes: usize,
    pub promoting: Option<String>,
}

impl From<&ClusterSnapshot> for ClusterHealth {
    fn from(snapshot: &ClusterSnapshot) -> Self {
        Self {
            epoch: snapshot.epoch,
            primary: snapshot.primary.clone(),
            healthy_nodes: snapshot.nodes.iter().filter(|n| n.healthy).count(),
            total_nodes: snapshot.nodes.len(),
            promoting: snapshot.promoting.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BackupHealth {
    pub scheduled: bool,
    pub backups: usize,
    pub last_backup_id: Option<String>,
    pub last_backup_age_secs: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthLevel,
    pub version: &'static str,
    pub uptime_secs: u64,
    pub cache: CacheStatus,
    pub l2_backend: &'static str,
    pub l1_entries: usize,
    pub hit_rate: f64,
    pub journal_pending: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cluster: Option<ClusterHealth>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup: Option<BackupHealth>,
    pub active_alerts: usize,
    pub critical_alerts: usize,
}

/// Degraded cache or a headless cluster is degraded; open critical alerts
/// or a cluster without any healthy node is critical.
pub fn assess(
    cache: &CacheStatus,
    cluster: Option<&ClusterHealth>,
    critical_alerts: usize,
) -> HealthLevel {
    if critical_alerts > 0 {
        return HealthLevel::Critical;
    }
    if let Some(cluster) = cluster {
        if cluster.total_nodes > 0 && cluster.healthy_nodes == 0 {
            return HealthLevel::Critical;
        }
        if cluster.primary.is_none() {
            return HealthLevel::Degraded;
        }
    }
    if cache.is_healthy() {
        HealthLevel::Ok
    } else {
        HealthLevel::Degraded
    }
}

//! Monitoring
//!
//! - Health report across cache, cluster and backups
//! - Slow operation log
//! - Alert log
//!
//! Prometheus metrics live in [`crate::metrics`].

use chrono::Utc;
use std::sync::Arc;
use std::time::Instant;
use tracing::warn;

use crate::backup::BackupManager;
use crate::cache::TieredCache;
use crate::cluster::FailoverCoordinator;
use crate::metrics;

mod alerts;
mod health;
mod slowlog;

pub use alerts::{Alert, AlertLog, AlertSeverity};
pub use health::{BackupHealth, ClusterHealth, HealthLevel, HealthReport, assess};
pub use slowlog::{SlowLog, SlowLogConfig, SlowLogEntry, SlowLogManager};

/// Collects monitoring data from every subsystem
#[derive(Clone)]
pub struct MonitoringManager {
    cache: Arc<TieredCache>,
    coordinator: Option<Arc<FailoverCoordinator>>,
    backups: Option<Arc<BackupManager>>,
    start_time: Instant,
}

impl MonitoringManager {
    pub fn new(cache: Arc<TieredCache>) -> Self {
        Self {
            cache,
            coordinator: None,
            backups: None,
            start_time: Instant::now(),
        }
    }

    pub fn with_cluster(mut self, coordinator: Arc<FailoverCoordinator>) -> Self {
        self.coordinator = Some(coordinator);
        self
    }

    pub fn with_backups(mut self, backups: Arc<BackupManager>) -> Self {
        self.backups = Some(backups);
        self
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    pub fn slow_log(&self) -> Arc<SlowLogManager> {
        self.cache.slow_log()
    }

    pub fn alerts(&self) -> Arc<AlertLog> {
        self.cache.alerts()
    }

    /// Refresh gauges that are sampled rather than counted
    pub fn refresh_gauges(&self) {
        let l1 = self.cache.l1().stats();
        metrics::update_l1_gauges(l1.entries, l1.total_bytes);
        metrics::set_cache_status(self.cache.status().label());
        if let Some(coordinator) = &self.coordinator {
            metrics::set_cluster_epoch(coordinator.epoch());
        }
    }

    pub async fn health_report(&self) -> HealthReport {
        let stats = self.cache.stats();
        let cluster = self
            .coordinator
            .as_ref()
            .map(|c| ClusterHealth::from(&c.snapshot()));

        let backup = match &self.backups {
            Some(manager) => Some(match manager.list().await {
                Ok(manifests) => {
                    let last = manifests.last();
                    BackupHealth {
                        scheduled: manager.config().enabled,
                        backups: manifests.len(),
                        last_backup_id: last.map(|m| m.id.clone()),
                        last_backup_age_secs: last
                            .map(|m| (Utc::now() - m.created_at).num_seconds()),
                    }
                }
                Err(e) => {
                    warn!("Health report could not list backups: {}", e);
                    BackupHealth {
                        scheduled: manager.config().enabled,
                        backups: 0,
                        last_backup_id: None,
                        last_backup_age_secs: None,
                    }
                }
            }),
            None => None,
        };

        let active = self.cache.alerts().active();
        let critical = active
            .iter()
            .filter(|a| a.severity == AlertSeverity::Critical)
            .count();

        HealthReport {
            status: assess(&stats.status, cluster.as_ref(), critical),
            version: env!("CARGO_PKG_VERSION"),
            uptime_secs: self.uptime_secs(),
            l2_backend: stats.l2_backend,
            l1_entries: stats.l1.entries,
            hit_rate: stats.hit_rate,
            journal_pending: stats.journal_pending,
            cache: stats.status,
            cluster,
            backup,
            active_alerts: active.len(),
            critical_alerts: critical,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{L2Backend, MemoryL2, TieredCacheConfig};
    use crate::compression::CompressionConfig;

    fn cache(l2: Arc<MemoryL2>) -> Arc<TieredCache> {
        Arc::new(TieredCache::new(
            TieredCacheConfig::default(),
            l2 as Arc<dyn L2Backend>,
            CompressionConfig::default(),
        ))
    }

    #[tokio::test]
    async fn test_health_follows_cache_status() {
        let l2 = Arc::new(MemoryL2::new());
        let cache = cache(l2.clone());
        let monitoring = MonitoringManager::new(cache.clone());

        cache.set("k", b"v".to_vec(), None).await.unwrap();
        let report = monitoring.health_report().await;
        assert_eq!(report.status, HealthLevel::Ok);
        assert_eq!(report.l1_entries, 1);
        assert!(report.cluster.is_none());

        l2.set_available(false);
        cache.set("k2", b"v".to_vec(), None).await.unwrap();
        let report = monitoring.health_report().await;
        assert_ne!(report.status, HealthLevel::Ok);
        assert!(!report.cache.is_healthy());
    }
}

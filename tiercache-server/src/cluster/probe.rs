//! Local health probe: pings every node and reports as the local monitor

use async_trait::async_trait;
use redis::{ConnectionInfo, IntoConnectionInfo};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::sentinel::FailoverCoordinator;
use super::types::{ClusterNode, Observation};
use crate::cache::L2Backend;
use crate::core::now_millis;

/// Result of probing one node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeOutcome {
    pub reachable: bool,
    pub replication_offset: Option<u64>,
}

impl ProbeOutcome {
    pub fn unreachable() -> Self {
        Self {
            reachable: false,
            replication_offset: None,
        }
    }
}

#[async_trait]
pub trait NodeProbe: Send + Sync {
    async fn probe(&self, node: &ClusterNode) -> ProbeOutcome;
}

/// Probes Redis nodes with PING and `INFO replication`
pub struct RedisProbe {
    password: Option<String>,
    timeout: Duration,
}

impl RedisProbe {
    pub fn new(password: Option<String>, timeout: Duration) -> Self {
        Self { password, timeout }
    }

    fn connection_info(&self, address: &str) -> redis::RedisResult<ConnectionInfo> {
        let mut info = format!("redis://{}", address).as_str().into_connection_info()?;
        if self.password.is_some() {
            info.redis.password = self.password.clone();
        }
        Ok(info)
    }

    async fn query(&self, address: &str) -> redis::RedisResult<Option<u64>> {
        let client = redis::Client::open(self.connection_info(address)?)?;
        let mut conn = client.get_multiplexed_async_connection().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        let info: String = redis::cmd("INFO")
            .arg("replication")
            .query_async(&mut conn)
            .await?;
        Ok(parse_replication_offset(&info))
    }
}

#[async_trait]
impl NodeProbe for RedisProbe {
    async fn probe(&self, node: &ClusterNode) -> ProbeOutcome {
        match tokio::time::timeout(self.timeout, self.query(&node.address)).await {
            Ok(Ok(offset)) => ProbeOutcome {
                reachable: true,
                replication_offset: offset,
            },
            Ok(Err(e)) => {
                debug!("Probe of {} failed: {}", node.id, e);
                ProbeOutcome::unreachable()
            }
            Err(_) => {
                debug!("Probe of {} timed out after {:?}", node.id, self.timeout);
                ProbeOutcome::unreachable()
            }
        }
    }
}

/// Offset from an `INFO replication` reply (primary or replica side)
pub fn parse_replication_offset(info: &str) -> Option<u64> {
    info.lines()
        .filter_map(|line| line.trim().split_once(':'))
        .find(|(field, _)| *field == "master_repl_offset" || *field == "slave_repl_offset")
        .and_then(|(_, value)| value.trim().parse().ok())
}

/// Probe all nodes every `interval`, report the results and run the
/// coordinator's periodic evaluation.
pub fn start_health_probe(
    coordinator: Arc<FailoverCoordinator>,
    probe: Arc<dyn NodeProbe>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let monitor_id = coordinator.config().local_monitor_id.clone();
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            for node in coordinator.snapshot().nodes {
                let outcome = probe.probe(&node).await;
                let observation = Observation {
                    monitor_id: monitor_id.clone(),
                    node_id: node.id.clone(),
                    reachable: outcome.reachable,
                    observed_at_ms: now_millis(),
                    replication_offset: outcome.replication_offset,
                };
                if let Err(e) = coordinator.report(observation) {
                    warn!("Failed to record probe of {}: {}", node.id, e);
                }
            }
            coordinator.tick(now_millis());
        }
    })
}

/// Re-point the L2 backend whenever a replica is promoted
pub fn follow_promotions(
    coordinator: &FailoverCoordinator,
    l2: Arc<dyn L2Backend>,
) -> JoinHandle<()> {
    let mut events = coordinator.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(super::FailoverEvent::Promoted {
                    node_id, address, ..
                }) => {
                    if let Err(e) = l2.switch_primary(&address).await {
                        warn!("Failed to switch L2 to new primary {}: {}", node_id, e);
                    }
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Failover listener lagged, {} events skipped", skipped);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

//! Failover Integration Tests
//!
//! Probe loop + remote monitors + promotion following on the L2 backend

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tiercache_server::cache::{L2Backend, L2Entry, MemoryL2};
use tiercache_server::cluster::{
    ClusterConfig, ClusterNode, FailoverCoordinator, NodeConfig, NodeProbe, NodeRole, Observation,
    ProbeOutcome, follow_promotions, start_health_probe,
};
use tiercache_server::core::{Result, now_millis};

/// Probe answering from a fixed table
struct ScriptedProbe {
    outcomes: Mutex<HashMap<String, ProbeOutcome>>,
}

impl ScriptedProbe {
    fn new(entries: &[(&str, bool, u64)]) -> Self {
        Self {
            outcomes: Mutex::new(
                entries
                    .iter()
                    .map(|(id, reachable, offset)| {
                        (
                            id.to_string(),
                            ProbeOutcome {
                                reachable: *reachable,
                                replication_offset: reachable.then_some(*offset),
                            },
                        )
                    })
                    .collect(),
            ),
        }
    }
}

#[async_trait]
impl NodeProbe for ScriptedProbe {
    async fn probe(&self, node: &ClusterNode) -> ProbeOutcome {
        self.outcomes
            .lock()
            .get(&node.id)
            .copied()
            .unwrap_or_else(ProbeOutcome::unreachable)
    }
}

/// Memory L2 that remembers where it was pointed
struct RecordingL2 {
    inner: MemoryL2,
    switches: Mutex<Vec<String>>,
}

#[async_trait]
impl L2Backend for RecordingL2 {
    fn name(&self) -> &'static str {
        "recording"
    }
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.inner.get(key).await
    }
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
        self.inner.set(key, value, ttl).await
    }
    async fn delete(&self, key: &str) -> Result<bool> {
        self.inner.delete(key).await
    }
    async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        self.inner.keys(prefix).await
    }
    async fn delete_prefix(&self, prefix: &str) -> Result<u64> {
        self.inner.delete_prefix(prefix).await
    }
    async fn snapshot(&self) -> Result<Vec<L2Entry>> {
        self.inner.snapshot().await
    }
    async fn replace_all(&self, entries: Vec<L2Entry>) -> Result<()> {
        self.inner.replace_all(entries).await
    }
    async fn ping(&self) -> Result<()> {
        self.inner.ping().await
    }
    async fn len(&self) -> Result<u64> {
        self.inner.len().await
    }
    async fn switch_primary(&self, address: &str) -> Result<()> {
        self.switches.lock().push(address.to_string());
        Ok(())
    }
}

fn cluster_config() -> ClusterConfig {
    ClusterConfig {
        enabled: true,
        local_monitor_id: "local".into(),
        monitors: vec!["local".into(), "m2".into(), "m3".into()],
        quorum: 2,
        nodes: ["redis-a", "redis-b", "redis-c"]
            .iter()
            .enumerate()
            .map(|(i, id)| NodeConfig {
                id: id.to_string(),
                address: format!("10.0.0.{}:6379", i + 1),
                priority: i as u32,
            })
            .collect(),
        down_after_ms: 50,
        observation_ttl_ms: 10_000,
        probe_interval_ms: 10,
        auto_promote: true,
        ..Default::default()
    }
}

fn remote(monitor: &str, node: &str, reachable: bool, at: u64) -> Observation {
    Observation {
        monitor_id: monitor.into(),
        node_id: node.into(),
        reachable,
        observed_at_ms: at,
        replication_offset: None,
    }
}

#[tokio::test]
async fn test_local_probe_alone_cannot_promote_but_quorum_does() {
    let coordinator = Arc::new(FailoverCoordinator::new(cluster_config()).unwrap());
    let probe = Arc::new(ScriptedProbe::new(&[
        ("redis-a", false, 0),
        ("redis-b", true, 10),
        ("redis-c", true, 20),
    ]));
    let l2 = Arc::new(RecordingL2 {
        inner: MemoryL2::new(),
        switches: Mutex::new(Vec::new()),
    });

    let prober = start_health_probe(coordinator.clone(), probe, Duration::from_millis(10));
    let follower = follow_promotions(&coordinator, l2.clone() as Arc<dyn L2Backend>);

    // Long past down_after, but only the local monitor objects
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(coordinator.primary().unwrap().id, "redis-a");
    assert_eq!(coordinator.epoch(), 0);
    assert!(l2.switches.lock().is_empty());

    // A second monitor agrees
    let now = now_millis();
    coordinator
        .report(remote("m2", "redis-a", true, now - 1000))
        .unwrap();
    coordinator.report(remote("m2", "redis-a", false, now)).unwrap();

    let mut switched = false;
    for _ in 0..100 {
        if !l2.switches.lock().is_empty() {
            switched = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(switched, "L2 was never re-pointed");

    assert_eq!(coordinator.primary().unwrap().id, "redis-c");
    assert_eq!(coordinator.epoch(), 1);
    assert_eq!(l2.switches.lock().as_slice(), ["10.0.0.3:6379".to_string()]);
    assert_eq!(
        coordinator.node("redis-a").unwrap().role,
        NodeRole::Unreachable
    );

    prober.abort();
    follower.abort();
}

#[tokio::test]
async fn test_recovered_primary_rejoins_as_replica() {
    let coordinator = Arc::new(FailoverCoordinator::new(cluster_config()).unwrap());
    let now = now_millis();
    for monitor in ["local", "m2"] {
        coordinator
            .report(remote(monitor, "redis-a", true, now - 1000))
            .unwrap();
        coordinator
            .report(remote(monitor, "redis-a", false, now))
            .unwrap();
    }
    coordinator.tick(now);
    assert_eq!(coordinator.primary().unwrap().id, "redis-b");

    coordinator
        .report(remote("m3", "redis-a", true, now + 10))
        .unwrap();
    let snapshot = coordinator.snapshot();
    let roles: HashMap<_, _> = snapshot
        .nodes
        .iter()
        .map(|n| (n.id.as_str(), n.role))
        .collect();
    assert_eq!(roles["redis-a"], NodeRole::Replica);
    assert_eq!(roles["redis-b"], NodeRole::Primary);
}

//! Sentinel-style failover coordination
//!
//! Monitors report observations of each node. A monitor holds a node
//! subjectively down when its latest fresh observation is negative and the
//! node has not been seen reachable for `down_after`. The primary is
//! objectively down once `quorum` monitors agree, which is the only trigger
//! for promoting a replica.

use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap, HashSet};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::config::ClusterConfig;
use super::types::{
    ClusterError, ClusterNode, ClusterResult, ClusterSnapshot, FailoverEvent, NodeRole,
    Observation,
};
use crate::core::now_millis;
use crate::metrics;

const EVENT_CAPACITY: usize = 64;

/// How far ahead of local time an observation may be stamped
pub const MAX_CLOCK_SKEW_MS: u64 = 1000;

/// One monitor's running view of one node
#[derive(Debug, Clone)]
struct MonitorView {
    first_report_ms: u64,
    last_report_ms: u64,
    last_ok_ms: Option<u64>,
    last_reachable: bool,
}

impl MonitorView {
    fn is_fresh(&self, now_ms: u64, ttl_ms: u64) -> bool {
        now_ms.saturating_sub(self.last_report_ms) <= ttl_ms
    }

    fn is_down(&self, now_ms: u64, down_after_ms: u64) -> bool {
        if self.last_reachable {
            return false;
        }
        let since = self.last_ok_ms.unwrap_or(self.first_report_ms);
        now_ms.saturating_sub(since) >= down_after_ms
    }
}

#[derive(Debug, Clone)]
struct Promotion {
    failed: String,
    candidate: String,
}

struct SentinelState {
    epoch: u64,
    nodes: BTreeMap<String, ClusterNode>,
    /// monitor id -> node id -> view
    views: HashMap<String, HashMap<String, MonitorView>>,
    promotion: Option<Promotion>,
    /// Nodes already announced as down, to publish each outage once
    announced_down: HashSet<String>,
}

/// Quorum-based failover coordinator
pub struct FailoverCoordinator {
    config: ClusterConfig,
    state: RwLock<SentinelState>,
    events: broadcast::Sender<FailoverEvent>,
}

impl FailoverCoordinator {
    /// Build from a validated configuration
    pub fn new(config: ClusterConfig) -> ClusterResult<Self> {
        config.validate()?;
        let primary = config
            .initial_primary()
            .map(str::to_string)
            .ok_or_else(|| ClusterError::Config("no primary".to_string()))?;

        let nodes = config
            .nodes
            .iter()
            .map(|n| {
                let role = if n.id == primary {
                    NodeRole::Primary
                } else {
                    NodeRole::Replica
                };
                (
                    n.id.clone(),
                    ClusterNode {
                        id: n.id.clone(),
                        address: n.address.clone(),
                        role,
                        healthy: true,
                        last_heartbeat_ms: None,
                        replication_offset: 0,
                        priority: n.priority,
                    },
                )
            })
            .collect();

        info!(
            "Failover coordinator: {} nodes, primary={}, quorum {}/{}",
            config.nodes.len(),
            primary,
            config.quorum,
            config.monitors.len()
        );

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(Self {
            config,
            state: RwLock::new(SentinelState {
                epoch: 0,
                nodes,
                views: HashMap::new(),
                promotion: None,
                announced_down: HashSet::new(),
            }),
            events,
        })
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FailoverEvent> {
        self.events.subscribe()
    }

    fn publish(&self, event: FailoverEvent) {
        metrics::record_failover_event(event.kind());
        // No receivers is fine
        let _ = self.events.send(event);
    }

    /// Record an observation. Stale or out-of-order reports are ignored;
    /// reports stamped more than [`MAX_CLOCK_SKEW_MS`] ahead are rejected,
    /// since they would shadow that monitor's real reports until then.
    pub fn report(&self, observation: Observation) -> ClusterResult<Vec<FailoverEvent>> {
        if !self.config.monitors.contains(&observation.monitor_id) {
            return Err(ClusterError::UnknownMonitor(observation.monitor_id));
        }
        let ahead_ms = observation.observed_at_ms.saturating_sub(now_millis());
        if ahead_ms > MAX_CLOCK_SKEW_MS {
            warn!(
                "Rejecting observation of {} from {} stamped {}ms ahead",
                observation.node_id, observation.monitor_id, ahead_ms
            );
            return Err(ClusterError::FutureObservation {
                monitor_id: observation.monitor_id,
                ahead_ms,
            });
        }

        let mut events = Vec::new();
        {
            let mut state = self.state.write();
            if !state.nodes.contains_key(&observation.node_id) {
                return Err(ClusterError::NodeNotFound(observation.node_id));
            }

            let now = now_millis();
            if now.saturating_sub(observation.observed_at_ms) > self.config.observation_ttl_ms {
                debug!(
                    "Ignoring stale observation of {} from {}",
                    observation.node_id, observation.monitor_id
                );
                return Ok(events);
            }

            let views = state
                .views
                .entry(observation.monitor_id.clone())
                .or_default();
            match views.get_mut(&observation.node_id) {
                Some(view) if view.last_report_ms > observation.observed_at_ms => {
                    return Ok(events);
                }
                Some(view) => {
                    view.last_report_ms = observation.observed_at_ms;
                    view.last_reachable = observation.reachable;
                    if observation.reachable {
                        view.last_ok_ms = Some(observation.observed_at_ms);
                    }
                }
                None => {
                    views.insert(
                        observation.node_id.clone(),
                        MonitorView {
                            first_report_ms: observation.observed_at_ms,
                            last_report_ms: observation.observed_at_ms,
                            last_ok_ms: observation.reachable.then_some(observation.observed_at_ms),
                            last_reachable: observation.reachable,
                        },
                    );
                }
            }

            if observation.reachable {
                let node_id = observation.node_id.clone();
                let Some(node) = state.nodes.get_mut(&node_id) else {
                    return Err(ClusterError::NodeNotFound(node_id));
                };
                node.last_heartbeat_ms = Some(
                    node.last_heartbeat_ms
                        .unwrap_or(0)
                        .max(observation.observed_at_ms),
                );
                if let Some(offset) = observation.replication_offset {
                    node.replication_offset = offset;
                }
                node.healthy = true;
                if node.role == NodeRole::Unreachable {
                    // Never a second primary: a returning node always follows
                    node.role = NodeRole::Replica;
                    info!("Node {} rejoined as replica", node_id);
                    events.push(FailoverEvent::NodeRejoined {
                        node_id: node_id.clone(),
                        role: NodeRole::Replica,
                    });
                }
                state.announced_down.remove(&node_id);
            }
        }

        for event in &events {
            self.publish(event.clone());
        }
        Ok(events)
    }

    /// Monitors currently holding `node_id` subjectively down
    pub fn down_votes(&self, node_id: &str, now_ms: u64) -> usize {
        let state = self.state.read();
        Self::count_down_votes(&state, &self.config, node_id, now_ms)
    }

    fn count_down_votes(
        state: &SentinelState,
        config: &ClusterConfig,
        node_id: &str,
        now_ms: u64,
    ) -> usize {
        config
            .monitors
            .iter()
            .filter_map(|monitor| state.views.get(monitor)?.get(node_id))
            .filter(|view| {
                view.is_fresh(now_ms, config.observation_ttl_ms)
                    && view.is_down(now_ms, config.down_after_ms)
            })
            .count()
    }

    fn objectively_down(&self, state: &SentinelState, node_id: &str, now_ms: u64) -> bool {
        Self::count_down_votes(state, &self.config, node_id, now_ms) >= self.config.quorum
    }

    /// Elect a replica: highest replication offset, then lowest priority,
    /// then lowest id.
    fn elect(&self, state: &SentinelState, now_ms: u64) -> Option<String> {
        state
            .nodes
            .values()
            .filter(|n| n.role == NodeRole::Replica)
            .filter(|n| Self::count_down_votes(state, &self.config, &n.id, now_ms) == 0)
            .max_by(|a, b| {
                a.replication_offset
                    .cmp(&b.replication_offset)
                    .then_with(|| b.priority.cmp(&a.priority))
                    .then_with(|| b.id.cmp(&a.id))
            })
            .map(|n| n.id.clone())
    }

    /// Start promoting a replica if a quorum holds the primary down.
    /// Returns the elected candidate.
    pub fn try_failover(&self, now_ms: u64) -> ClusterResult<String> {
        let mut events = Vec::new();
        let result = {
            let mut state = self.state.write();
            self.start_failover(&mut state, now_ms, &mut events)
        };
        for event in events {
            self.publish(event);
        }
        result
    }

    fn start_failover(
        &self,
        state: &mut SentinelState,
        now_ms: u64,
        events: &mut Vec<FailoverEvent>,
    ) -> ClusterResult<String> {
        if let Some(promotion) = &state.promotion {
            return Err(ClusterError::PromotionInProgress(promotion.candidate.clone()));
        }
        let primary = state
            .nodes
            .values()
            .find(|n| n.role == NodeRole::Primary)
            .map(|n| n.id.clone())
            .ok_or_else(|| ClusterError::Config("cluster has no primary".to_string()))?;

        let votes = Self::count_down_votes(state, &self.config, &primary, now_ms);
        if votes < self.config.quorum {
            return Err(ClusterError::QuorumNotReached {
                node_id: primary,
                required: self.config.quorum,
                agreeing: votes,
            });
        }

        if state.announced_down.insert(primary.clone()) {
            warn!(
                "Primary {} objectively down ({} of {} monitors agree)",
                primary,
                votes,
                self.config.monitors.len()
            );
            events.push(FailoverEvent::PrimaryDown {
                node_id: primary.clone(),
                votes,
                epoch: state.epoch,
            });
        }

        let candidate = self
            .elect(state, now_ms)
            .ok_or_else(|| ClusterError::NoCandidate(primary.clone()))?;

        state.epoch += 1;
        let epoch = state.epoch;
        if let Some(failed) = state.nodes.get_mut(&primary) {
            failed.role = NodeRole::Unreachable;
            failed.healthy = false;
        }
        if let Some(node) = state.nodes.get_mut(&candidate) {
            node.role = NodeRole::Promoting;
        }
        state.promotion = Some(Promotion {
            failed: primary.clone(),
            candidate: candidate.clone(),
        });
        metrics::set_cluster_epoch(epoch);

        info!(
            "Failover epoch {}: promoting {} to replace {}",
            epoch, candidate, primary
        );
        events.push(FailoverEvent::PromotionStarted {
            failed: primary,
            candidate: candidate.clone(),
            epoch,
        });
        Ok(candidate)
    }

    /// Finish the running promotion of `candidate`
    pub fn complete_promotion(&self, candidate: &str) -> ClusterResult<FailoverEvent> {
        let event = {
            let mut state = self.state.write();
            Self::finish_promotion(&mut state, candidate)?
        };
        self.publish(event.clone());
        Ok(event)
    }

    fn finish_promotion(state: &mut SentinelState, candidate: &str) -> ClusterResult<FailoverEvent> {
        match &state.promotion {
            Some(p) if p.candidate == candidate => {}
            Some(p) => return Err(ClusterError::PromotionInProgress(p.candidate.clone())),
            None => return Err(ClusterError::NotPrimary(candidate.to_string())),
        }

        let epoch = state.epoch;
        let node = state
            .nodes
            .get_mut(candidate)
            .ok_or_else(|| ClusterError::NodeNotFound(candidate.to_string()))?;
        node.role = NodeRole::Primary;
        node.healthy = true;
        let address = node.address.clone();

        if let Some(promotion) = state.promotion.take() {
            info!(
                "Node {} promoted to primary (epoch {}, replaced {})",
                candidate, epoch, promotion.failed
            );
        }

        Ok(FailoverEvent::Promoted {
            node_id: candidate.to_string(),
            address,
            epoch,
        })
    }

    /// Periodic evaluation: demote down replicas, start failover when the
    /// primary is objectively down and finish promotions when automatic.
    pub fn tick(&self, now_ms: u64) -> Vec<FailoverEvent> {
        let mut events = Vec::new();
        {
            let mut state = self.state.write();

            let down_replicas: Vec<String> = state
                .nodes
                .values()
                .filter(|n| n.role == NodeRole::Replica)
                .filter(|n| self.objectively_down(&state, &n.id, now_ms))
                .map(|n| n.id.clone())
                .collect();
            for id in down_replicas {
                if let Some(node) = state.nodes.get_mut(&id) {
                    warn!("Replica {} objectively down", id);
                    node.role = NodeRole::Unreachable;
                    node.healthy = false;
                }
            }

            if state.promotion.is_none() {
                match self.start_failover(&mut state, now_ms, &mut events) {
                    Ok(_) => {}
                    Err(ClusterError::QuorumNotReached { agreeing, .. }) if agreeing > 0 => {
                        debug!(
                            "Primary suspected by {} monitor(s), quorum is {}",
                            agreeing, self.config.quorum
                        );
                    }
                    Err(ClusterError::NoCandidate(primary)) => {
                        warn!("Primary {} down but no replica can be promoted", primary);
                        if let Some(node) = state.nodes.get_mut(&primary) {
                            node.healthy = false;
                        }
                    }
                    Err(_) => {}
                }
            }

            if self.config.auto_promote {
                let candidate = state.promotion.as_ref().map(|p| p.candidate.clone());
                if let Some(candidate) = candidate {
                    match Self::finish_promotion(&mut state, &candidate) {
                        Ok(event) => events.push(event),
                        Err(e) => warn!("Promotion of {} failed: {}", candidate, e),
                    }
                }
            }
        }

        for event in &events {
            self.publish(event.clone());
        }
        events
    }

    pub fn update_offset(&self, node_id: &str, offset: u64) -> ClusterResult<()> {
        let mut state = self.state.write();
        let node = state
            .nodes
            .get_mut(node_id)
            .ok_or_else(|| ClusterError::NodeNotFound(node_id.to_string()))?;
        node.replication_offset = offset;
        Ok(())
    }

    pub fn primary(&self) -> Option<ClusterNode> {
        self.state
            .read()
            .nodes
            .values()
            .find(|n| n.role == NodeRole::Primary)
            .cloned()
    }

    pub fn node(&self, node_id: &str) -> Option<ClusterNode> {
        self.state.read().nodes.get(node_id).cloned()
    }

    pub fn epoch(&self) -> u64 {
        self.state.read().epoch
    }

    pub fn snapshot(&self) -> ClusterSnapshot {
        let state = self.state.read();
        ClusterSnapshot {
            epoch: state.epoch,
            primary: state
                .nodes
                .values()
                .find(|n| n.role == NodeRole::Primary)
                .map(|n| n.id.clone()),
            quorum: self.config.quorum,
            monitors: self.config.monitors.clone(),
            nodes: state.nodes.values().cloned().collect(),
            promoting: state.promotion.as_ref().map(|p| p.candidate.clone()),
        }
    }
}

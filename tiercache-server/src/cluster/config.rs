use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

use super::types::{ClusterError, ClusterResult};

/// A Redis server in the primary/replica set
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeConfig {
    pub id: String,
    /// `host:port`
    pub address: String,
    /// Election priority, lower wins
    #[serde(default)]
    pub priority: u32,
}

/// Sentinel-style failover configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Enable failover coordination
    pub enabled: bool,

    /// Monitor id used by this process's own health probe
    pub local_monitor_id: String,

    /// Every monitor allowed to report observations
    pub monitors: Vec<String>,

    /// Monitors that must agree before the primary is declared down
    pub quorum: usize,

    pub nodes: Vec<NodeConfig>,

    /// Initial primary (defaults to the first node)
    pub primary: Option<String>,

    /// Unreachable for longer than this counts as down (milliseconds)
    pub down_after_ms: u64,

    /// Observations older than this are ignored (milliseconds)
    pub observation_ttl_ms: u64,

    pub probe_interval_ms: u64,
    pub probe_timeout_ms: u64,

    /// Password used by the local probe
    pub password: Option<String>,

    /// Complete promotions on the next tick without operator action
    pub auto_promote: bool,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            local_monitor_id: "local".to_string(),
            monitors: vec!["local".to_string()],
            quorum: 1,
            nodes: Vec::new(),
            primary: None,
            down_after_ms: 5000,
            observation_ttl_ms: 15_000,
            probe_interval_ms: 1000,
            probe_timeout_ms: 500,
            password: None,
            auto_promote: true,
        }
    }
}

impl ClusterConfig {
    pub fn down_after(&self) -> Duration {
        Duration::from_millis(self.down_after_ms)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    /// Id of the node that starts as primary
    pub fn initial_primary(&self) -> Option<&str> {
        self.primary
            .as_deref()
            .or_else(|| self.nodes.first().map(|n| n.id.as_str()))
    }

    /// Check the quorum is a strict majority and the topology is usable
    pub fn validate(&self) -> ClusterResult<()> {
        let monitors: HashSet<&str> = self.monitors.iter().map(String::as_str).collect();
        if monitors.len() != self.monitors.len() {
            return Err(ClusterError::Config("duplicate monitor ids".to_string()));
        }
        if !monitors.contains(self.local_monitor_id.as_str()) {
            return Err(ClusterError::Config(format!(
                "local monitor '{}' is not in the monitor list",
                self.local_monitor_id
            )));
        }
        if self.quorum * 2 <= self.monitors.len() || self.quorum > self.monitors.len() {
            return Err(ClusterError::InvalidQuorum {
                quorum: self.quorum,
                monitors: self.monitors.len(),
            });
        }

        if self.nodes.is_empty() {
            return Err(ClusterError::Config("no cluster nodes configured".to_string()));
        }
        let mut seen = HashSet::new();
        for node in &self.nodes {
            if !seen.insert(node.id.as_str()) {
                return Err(ClusterError::Config(format!("duplicate node id '{}'", node.id)));
            }
            if !node.address.contains(':') {
                return Err(ClusterError::Config(format!(
                    "node '{}' address '{}' is not host:port",
                    node.id, node.address
                )));
            }
        }
        match &self.primary {
            Some(primary) if !seen.contains(primary.as_str()) => {
                return Err(ClusterError::NodeNotFound(primary.clone()));
            }
            _ => {}
        }

        if self.down_after_ms == 0 {
            return Err(ClusterError::Config("down_after_ms must be > 0".to_string()));
        }
        if self.observation_ttl_ms < self.down_after_ms {
            return Err(ClusterError::Config(
                "observation_ttl_ms must be >= down_after_ms".to_string(),
            ));
        }
        Ok(())
    }
}

/// Parse `id=host:port[,id=host:port...]`. Nodes get priority by position.
pub fn parse_nodes(list: &str) -> ClusterResult<Vec<NodeConfig>> {
    list.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .enumerate()
        .map(|(index, part)| {
            let (id, address) = part.split_once('=').ok_or_else(|| {
                ClusterError::Config(format!("node '{}' is not id=host:port", part))
            })?;
            Ok(NodeConfig {
                id: id.trim().to_string(),
                address: address.trim().to_string(),
                priority: index as u32,
            })
        })
        .collect()
}

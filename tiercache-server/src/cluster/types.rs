use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Role of a node in the primary/replica topology
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    Primary,
    Replica,
    /// Objectively down, or demoted after a failover
    Unreachable,
    /// Elected replica while the promotion completes
    Promoting,
}

impl NodeRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Replica => "replica",
            Self::Unreachable => "unreachable",
            Self::Promoting => "promoting",
        }
    }
}

/// Cluster node information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterNode {
    pub id: String,
    /// `host:port` of the Redis server
    pub address: String,
    pub role: NodeRole,
    /// Last aggregated health view
    pub healthy: bool,
    /// Last positive observation from any monitor (Unix ms)
    pub last_heartbeat_ms: Option<u64>,
    pub replication_offset: u64,
    /// Lower wins elections
    pub priority: u32,
}

/// One monitor's view of one node at one point in time
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Observation {
    pub monitor_id: String,
    pub node_id: String,
    pub reachable: bool,
    pub observed_at_ms: u64,
    #[serde(default)]
    pub replication_offset: Option<u64>,
}

/// Published on every role transition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum FailoverEvent {
    PrimaryDown {
        node_id: String,
        votes: usize,
        epoch: u64,
    },
    PromotionStarted {
        failed: String,
        candidate: String,
        epoch: u64,
    },
    Promoted {
        node_id: String,
        address: String,
        epoch: u64,
    },
    NodeRejoined {
        node_id: String,
        role: NodeRole,
    },
}

impl FailoverEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::PrimaryDown { .. } => "primary_down",
            Self::PromotionStarted { .. } => "promotion_started",
            Self::Promoted { .. } => "promoted",
            Self::NodeRejoined { .. } => "node_rejoined",
        }
    }
}

/// Point-in-time view of the topology
#[derive(Debug, Clone, Serialize)]
pub struct ClusterSnapshot {
    pub epoch: u64,
    pub primary: Option<String>,
    pub quorum: usize,
    pub monitors: Vec<String>,
    pub nodes: Vec<ClusterNode>,
    pub promoting: Option<String>,
}

/// Cluster errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClusterError {
    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Unknown monitor: {0}")]
    UnknownMonitor(String),

    #[error("Quorum not reached for {node_id}: {agreeing}/{required} monitors agree")]
    QuorumNotReached {
        node_id: String,
        required: usize,
        agreeing: usize,
    },

    #[error("Invalid quorum {quorum} for {monitors} monitors (needs a strict majority)")]
    InvalidQuorum { quorum: usize, monitors: usize },

    #[error("No promotable replica for {0}")]
    NoCandidate(String),

    #[error("Node {0} is not the primary")]
    NotPrimary(String),

    #[error("Promotion already in progress: {0}")]
    PromotionInProgress(String),

    #[error("Observation from {monitor_id} is {ahead_ms}ms in the future")]
    FutureObservation { monitor_id: String, ahead_ms: u64 },

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type ClusterResult<T> = std::result::Result<T, ClusterError>;

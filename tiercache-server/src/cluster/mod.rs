//! Primary/replica failover
//!
//! Sentinel-style coordination over a Redis primary and its replicas:
//! - Monitors report observations (local probe or HTTP)
//! - Quorum of fresh monitors required to declare the primary down
//! - Replica election and epoch-numbered promotion
//! - Promotion events re-point the Redis L2 backend

pub mod config;
pub mod probe;
pub mod sentinel;
pub mod types;

pub use config::{ClusterConfig, NodeConfig, parse_nodes};
pub use probe::{NodeProbe, ProbeOutcome, RedisProbe, follow_promotions, start_health_probe};
pub use sentinel::FailoverCoordinator;
pub use types::{
    ClusterError, ClusterNode, ClusterResult, ClusterSnapshot, FailoverEvent, NodeRole,
    Observation,
};

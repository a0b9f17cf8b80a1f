//! Cache Module
//!
//! - L1: process-local LRU of decoded values
//! - L2: distributed store (Redis or in-process) holding enveloped values
//! - Orchestrator: routing, invalidation, degraded mode and read-through

pub mod changes;
pub mod coalesce;
pub mod l1;
pub mod l2;
pub mod orchestrator;
pub mod retry;

pub use changes::{ChangeKind, ChangeSet, ChangeTracker};
pub use coalesce::{CoalescerStats, RequestCoalescer};
pub use l1::{L1Cache, L1Stats};
pub use l2::{L2Backend, L2Entry, L2Kind, MemoryL2, RedisL2, RedisL2Config};
pub use orchestrator::{TieredCache, TieredCacheConfig, TieredCacheStats};
pub use retry::Backoff;

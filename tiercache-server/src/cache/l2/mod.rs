//! L2 distributed cache backends

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::core::Result;

pub mod memory;
pub mod redis_backend;

pub use memory::MemoryL2;
pub use redis_backend::{RedisL2, RedisL2Config};

/// One key as captured by a snapshot or written by a restore
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct L2Entry {
    pub key: String,
    pub value: Vec<u8>,
    pub ttl: Option<Duration>,
}

/// Which L2 implementation to run
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum L2Kind {
    #[default]
    Redis,
    Memory,
}

impl L2Kind {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "redis" => Some(Self::Redis),
            "memory" | "in-memory" => Some(Self::Memory),
            _ => None,
        }
    }
}

/// Distributed cache layer.
///
/// Single-key operations are atomic. `snapshot` and `replace_all` are
/// atomic over the whole keyspace; other multi-key operations are not.
#[async_trait]
pub trait L2Backend: Send + Sync {
    fn name(&self) -> &'static str;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<bool>;

    /// Keys starting with `prefix`
    async fn keys(&self, prefix: &str) -> Result<Vec<String>>;

    async fn delete_prefix(&self, prefix: &str) -> Result<u64>;

    /// Point-in-time copy of every key owned by this cache. The key set and
    /// every value are read atomically with respect to other writers.
    async fn snapshot(&self) -> Result<Vec<L2Entry>>;

    /// Replace the whole keyspace in one step; a concurrent write either
    /// precedes the swap and is removed, or follows it and survives.
    async fn replace_all(&self, entries: Vec<L2Entry>) -> Result<()>;

    async fn clear(&self) -> Result<()> {
        self.delete_prefix("").await.map(|_| ())
    }

    async fn ping(&self) -> Result<()>;

    async fn len(&self) -> Result<u64>;

    /// Re-point at a newly promoted primary
    async fn switch_primary(&self, _address: &str) -> Result<()> {
        Ok(())
    }
}

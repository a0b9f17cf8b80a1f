use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use super::{L2Backend, L2Entry};
use crate::core::{CacheError, Result};

#[derive(Debug, Clone)]
struct MemoryEntry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl MemoryEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// In-process L2 backend.
///
/// Used for standalone deployments and tests; `set_available(false)`
/// simulates an unreachable distributed store.
#[derive(Clone)]
pub struct MemoryL2 {
    data: Arc<RwLock<HashMap<String, MemoryEntry>>>,
    available: Arc<AtomicBool>,
    operations: Arc<AtomicU64>,
}

impl Default for MemoryL2 {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryL2 {
    pub fn new() -> Self {
        Self {
            data: Arc::new(RwLock::new(HashMap::new())),
            available: Arc::new(AtomicBool::new(true)),
            operations: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Toggle simulated reachability
    pub fn set_available(&self, available: bool) {
        if !available {
            warn!("Memory L2 marked unavailable");
        }
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    /// Operations attempted against this backend
    pub fn operations(&self) -> u64 {
        self.operations.load(Ordering::Relaxed)
    }

    /// Raw stored bytes, bypassing availability
    pub fn raw(&self, key: &str) -> Option<Vec<u8>> {
        self.data.read().get(key).map(|e| e.value.clone())
    }

    /// Write raw bytes, bypassing availability
    pub fn insert_raw(&self, key: &str, value: Vec<u8>) {
        self.data.write().insert(
            key.to_string(),
            MemoryEntry {
                value,
                expires_at: None,
            },
        );
    }

    fn check(&self) -> Result<()> {
        self.operations.fetch_add(1, Ordering::Relaxed);
        if self.is_available() {
            Ok(())
        } else {
            Err(CacheError::Connection(
                "memory L2 unavailable (simulated outage)".to_string(),
            ))
        }
    }
}

#[async_trait]
impl L2Backend for MemoryL2 {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.check()?;
        let now = Instant::now();
        let mut data = self.data.write();
        match data.get(key) {
            Some(entry) if entry.is_expired(now) => {
                data.remove(key);
                Ok(None)
            }
            Some(entry) => Ok(Some(entry.value.clone())),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
        self.check()?;
        debug!("L2 memory SET key={} size={}", key, value.len());
        self.data.write().insert(
            key.to_string(),
            MemoryEntry {
                value,
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.check()?;
        Ok(self.data.write().remove(key).is_some())
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        self.check()?;
        let now = Instant::now();
        let mut keys: Vec<String> = self
            .data
            .read()
            .iter()
            .filter(|(k, e)| k.starts_with(prefix) && !e.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64> {
        self.check()?;
        let mut data = self.data.write();
        let before = data.len();
        data.retain(|k, _| !k.starts_with(prefix));
        Ok((before - data.len()) as u64)
    }

    async fn snapshot(&self) -> Result<Vec<L2Entry>> {
        self.check()?;
        let now = Instant::now();
        let data = self.data.read();
        Ok(data
            .iter()
            .filter(|(_, e)| !e.is_expired(now))
            .map(|(k, e)| L2Entry {
                key: k.clone(),
                value: e.value.clone(),
                ttl: e.expires_at.map(|at| at.saturating_duration_since(now)),
            })
            .collect())
    }

    async fn replace_all(&self, entries: Vec<L2Entry>) -> Result<()> {
        self.check()?;
        let now = Instant::now();
        let fresh: HashMap<String, MemoryEntry> = entries
            .into_iter()
            .map(|e| {
                (
                    e.key,
                    MemoryEntry {
                        value: e.value,
                        expires_at: e.ttl.map(|ttl| now + ttl),
                    },
                )
            })
            .collect();
        *self.data.write() = fresh;
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        self.check()
    }

    async fn len(&self) -> Result<u64> {
        self.check()?;
        let now = Instant::now();
        Ok(self
            .data
            .read()
            .values()
            .filter(|e| !e.is_expired(now))
            .count() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_basic_operations() {
        let l2 = MemoryL2::new();
        l2.set("a", b"1".to_vec(), None).await.unwrap();
        l2.set("b", b"2".to_vec(), None).await.unwrap();

        assert_eq!(l2.get("a").await.unwrap(), Some(b"1".to_vec()));
        assert!(l2.delete("a").await.unwrap());
        assert!(!l2.delete("a").await.unwrap());
        assert_eq!(l2.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_ttl_expiry() {
        let l2 = MemoryL2::new();
        l2.set("short", b"v".to_vec(), Some(Duration::from_millis(20)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(l2.get("short").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_outage_simulation() {
        let l2 = MemoryL2::new();
        l2.set_available(false);
        assert!(matches!(
            l2.get("a").await,
            Err(CacheError::Connection(_))
        ));
        assert!(l2.ping().await.is_err());

        l2.set_available(true);
        assert!(l2.ping().await.is_ok());
    }

    #[tokio::test]
    async fn test_prefix_and_replace_all() {
        let l2 = MemoryL2::new();
        for key in ["user:1", "user:2", "quiz:1"] {
            l2.set(key, key.as_bytes().to_vec(), None).await.unwrap();
        }
        assert_eq!(l2.keys("user:").await.unwrap(), vec!["user:1", "user:2"]);
        assert_eq!(l2.delete_prefix("user:").await.unwrap(), 2);

        l2.replace_all(vec![L2Entry {
            key: "restored".to_string(),
            value: b"x".to_vec(),
            ttl: None,
        }])
        .await
        .unwrap();

        let snapshot = l2.snapshot().await.unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].key, "restored");
    }
}

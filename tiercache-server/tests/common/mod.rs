#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tiercache_server::cache::{L2Backend, L2Entry, MemoryL2, TieredCache, TieredCacheConfig};
use tiercache_server::compression::CompressionConfig;
use tiercache_server::core::Result;
use tokio::sync::Notify;

/// Cache over an in-process L2 whose outage switch the test controls
pub fn memory_cache(config: TieredCacheConfig) -> (Arc<MemoryL2>, Arc<TieredCache>) {
    let l2 = Arc::new(MemoryL2::new());
    let cache = Arc::new(TieredCache::new(
        config,
        l2.clone() as Arc<dyn L2Backend>,
        CompressionConfig::default(),
    ));
    (l2, cache)
}

/// Compressible JSON-ish payload of roughly `size` bytes
pub fn payload(size: usize) -> Vec<u8> {
    let unit = br#"{"lesson":"ownership","score":97,"done":true},"#;
    unit.iter().copied().cycle().take(size).collect()
}

/// [`MemoryL2`] whose next `replace_all` parks until the test releases it
pub struct GatedL2 {
    pub inner: MemoryL2,
    armed: AtomicBool,
    /// Backend goes down right after the gated swap lands
    pub drop_after_swap: AtomicBool,
    entered: Notify,
    release: Notify,
}

impl GatedL2 {
    pub fn new(inner: MemoryL2) -> Self {
        Self {
            inner,
            armed: AtomicBool::new(false),
            drop_after_swap: AtomicBool::new(false),
            entered: Notify::new(),
            release: Notify::new(),
        }
    }

    /// Park the next `replace_all`
    pub fn arm(&self) {
        self.armed.store(true, Ordering::SeqCst);
    }

    /// Wait until a swap is parked
    pub async fn entered(&self) {
        self.entered.notified().await;
    }

    pub fn release(&self) {
        self.release.notify_one();
    }
}

#[async_trait]
impl L2Backend for GatedL2 {
    fn name(&self) -> &'static str {
        "gated"
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
        if self.armed.swap(false, Ordering::SeqCst) {
            self.entered.notify_one();
            self.release.notified().await;
        }
        self.inner.replace_all(entries).await?;
        if self.drop_after_swap.load(Ordering::SeqCst) {
            self.inner.set_available(false);
        }
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        self.inner.ping().await
    }

    async fn len(&self) -> Result<u64> {
        self.inner.len().await
    }
}

/// Cache over a [`GatedL2`]
pub fn gated_cache(config: TieredCacheConfig) -> (Arc<GatedL2>, Arc<TieredCache>) {
    let l2 = Arc::new(GatedL2::new(MemoryL2::new()));
    let cache = Arc::new(TieredCache::new(
        config,
        l2.clone() as Arc<dyn L2Backend>,
        CompressionConfig::default(),
    ));
    (l2, cache)
}

//! L1/L2 orchestration: read path, write-through, invalidation, degraded
//! mode and read-through loading.

use futures_util::future::try_join_all;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::fmt::Display;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::changes::ChangeTracker;
use super::coalesce::{CoalescerStats, RequestCoalescer};
use super::l1::{L1Cache, L1Stats};
use super::l2::{L2Backend, L2Entry};
use super::retry::Backoff;
use crate::compression::{CompressionConfig, CompressionStats, Compressor, envelope};
use crate::core::{CacheError, CacheStatus, Result, expiry_from_ttl, now_millis, remaining_ttl};
use crate::metrics;
use crate::monitoring::{AlertLog, AlertSeverity, SlowLogManager};

/// Orchestrator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TieredCacheConfig {
    /// Applied when `set` gets no TTL; 0 means no expiry
    pub default_ttl_secs: u64,
    pub l1_max_entries: usize,
    /// Upper bound on how long a value stays in L1; 0 means no cap
    pub l1_ttl_secs: u64,
    pub health_check_interval_ms: u64,
    pub backoff: Backoff,
    /// Journal size past which a degraded write escalates to a full clear
    pub max_journal_entries: usize,
}

impl Default for TieredCacheConfig {
    fn default() -> Self {
        Self {
            default_ttl_secs: 3600,
            l1_max_entries: 10_000,
            l1_ttl_secs: 300,
            health_check_interval_ms: 5000,
            backoff: Backoff::default(),
            max_journal_entries: 100_000,
        }
    }
}

/// A mutation waiting to reach L2
#[derive(Debug, Clone)]
enum PendingOp {
    Upsert {
        envelope: Vec<u8>,
        expires_at_ms: Option<u64>,
    },
    Delete,
}

#[derive(Debug, Clone)]
enum PendingChange {
    Key(String, PendingOp),
    Prefix(String),
    Clear,
}

/// Writes accepted while L2 was unusable, latest per key.
///
/// Replay order is clear, then prefix deletes, then keyed ops, which matches
/// the order they were accepted in because a later clear or prefix delete
/// drops the keyed ops it covers.
#[derive(Debug, Default)]
struct Journal {
    clear: bool,
    prefixes: Vec<String>,
    ops: HashMap<String, PendingOp>,
}

impl Journal {
    fn push(&mut self, change: PendingChange) {
        match change {
            PendingChange::Key(key, op) => {
                self.ops.insert(key, op);
            }
            PendingChange::Prefix(prefix) => {
                self.ops.retain(|k, _| !k.starts_with(&prefix));
                self.prefixes.push(prefix);
            }
            PendingChange::Clear => {
                self.ops.clear();
                self.prefixes.clear();
                self.clear = true;
            }
        }
    }

    fn len(&self) -> usize {
        self.ops.len() + self.prefixes.len() + usize::from(self.clear)
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Put back changes that failed to replay. `older` was accepted before
    /// everything already in `self`, so newer clears and prefix deletes win.
    fn merge_older(&mut self, older: Journal) {
        if self.clear {
            return;
        }
        self.clear = older.clear;

        let newer_prefixes = std::mem::take(&mut self.prefixes);
        for (key, op) in older.ops {
            if newer_prefixes.iter().any(|p| key.starts_with(p.as_str())) {
                continue;
            }
            self.ops.entry(key).or_insert(op);
        }
        self.prefixes = older.prefixes;
        self.prefixes.extend(newer_prefixes);
    }
}

struct HealthState {
    status: CacheStatus,
    attempts: u32,
    next_probe_ms: u64,
    journal: Journal,
    journal_overflowed: bool,
}

#[derive(Default)]
struct Counters {
    l1_hits: AtomicU64,
    l2_hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    invalidations: AtomicU64,
    l2_errors: AtomicU64,
    corrupt_entries: AtomicU64,
    degraded_transitions: AtomicU64,
    journal_replayed: AtomicU64,
    loader_calls: AtomicU64,
}

/// Cache statistics snapshot
#[derive(Debug, Clone, Serialize)]
pub struct TieredCacheStats {
    pub status: CacheStatus,
    pub l1_hits: u64,
    pub l2_hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub sets: u64,
    pub invalidations: u64,
    pub l2_errors: u64,
    pub corrupt_entries: u64,
    pub degraded_transitions: u64,
    pub journal_pending: usize,
    pub journal_replayed: u64,
    pub loader_calls: u64,
    pub l1: L1Stats,
    pub compression: CompressionStats,
    pub coalescing: CoalescerStats,
    pub l2_backend: &'static str,
}

/// Writers of one key hold the same stripe
const WRITE_STRIPES: usize = 64;

/// Two-tier cache.
///
/// L1 is kept a coherent subset of L2: writes go to L2 (or the degraded-mode
/// journal) before L1, invalidations remove from both, and L2 reads only
/// populate L1 when no mutation happened in between. Writers of the same key
/// are serialized from the L2 write through the L1 update, so both layers
/// settle on the same last writer.
pub struct TieredCache {
    config: TieredCacheConfig,
    write_locks: Vec<AsyncMutex<()>>,
    l1: L1Cache,
    l2: Arc<dyn L2Backend>,
    compressor: Compressor,
    coalescer: RequestCoalescer,
    changes: ChangeTracker,
    health: Mutex<HealthState>,
    counters: Counters,
    slow_log: Arc<SlowLogManager>,
    alerts: Arc<AlertLog>,
}

impl TieredCache {
    pub fn new(
        config: TieredCacheConfig,
        l2: Arc<dyn L2Backend>,
        compression: CompressionConfig,
    ) -> Self {
        info!(
            "Tiered cache initialized: l1_max_entries={}, default_ttl={}s, l2={}",
            config.l1_max_entries,
            config.default_ttl_secs,
            l2.name()
        );
        metrics::set_cache_status(CacheStatus::Healthy.label());

        Self {
            write_locks: (0..WRITE_STRIPES).map(|_| AsyncMutex::new(())).collect(),
            l1: L1Cache::new(config.l1_max_entries),
            l2,
            compressor: Compressor::new(compression),
            coalescer: RequestCoalescer::new(),
            changes: ChangeTracker::new(),
            health: Mutex::new(HealthState {
                status: CacheStatus::Healthy,
                attempts: 0,
                next_probe_ms: 0,
                journal: Journal::default(),
                journal_overflowed: false,
            }),
            counters: Counters::default(),
            slow_log: Arc::new(SlowLogManager::new()),
            alerts: Arc::new(AlertLog::default()),
            config,
        }
    }

    /// Share a slow log with the monitoring layer
    pub fn with_slow_log(mut self, slow_log: Arc<SlowLogManager>) -> Self {
        self.slow_log = slow_log;
        self
    }

    pub fn with_alerts(mut self, alerts: Arc<AlertLog>) -> Self {
        self.alerts = alerts;
        self
    }

    pub fn config(&self) -> &TieredCacheConfig {
        &self.config
    }

    pub fn l1(&self) -> &L1Cache {
        &self.l1
    }

    pub fn l2(&self) -> Arc<dyn L2Backend> {
        self.l2.clone()
    }

    pub fn compressor(&self) -> &Compressor {
        &self.compressor
    }

    pub fn changes(&self) -> &ChangeTracker {
        &self.changes
    }

    pub fn slow_log(&self) -> Arc<SlowLogManager> {
        self.slow_log.clone()
    }

    pub fn alerts(&self) -> Arc<AlertLog> {
        self.alerts.clone()
    }

    pub fn status(&self) -> CacheStatus {
        self.health.lock().status.clone()
    }

    fn l2_usable(&self) -> bool {
        self.health.lock().status.is_healthy()
    }

    fn write_lock(&self, key: &str) -> &AsyncMutex<()> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.write_locks[hasher.finish() as usize % self.write_locks.len()]
    }

    // ---- read path ----

    /// Read a value, L1 first then L2. `Ok(None)` on a double miss.
    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let started = Instant::now();
        let result = self.get_inner(key).await;
        self.observe("get", key, started, result.is_ok()).await;
        result
    }

    async fn get_inner(&self, key: &str) -> Result<Option<Vec<u8>>> {
        if let Some(value) = self.l1.get(key) {
            self.counters.l1_hits.fetch_add(1, Ordering::Relaxed);
            metrics::record_cache_op("get", "l1_hit");
            return Ok(Some(value));
        }

        if !self.l2_usable() {
            return Ok(self.miss());
        }

        let generation = self.l1.generation();
        let raw = match self.l2.get(key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return Ok(self.miss()),
            Err(e) if e.is_connection() => {
                self.enter_degraded(&e);
                return Ok(self.miss());
            }
            Err(e) => {
                self.counters.l2_errors.fetch_add(1, Ordering::Relaxed);
                return Err(e);
            }
        };

        let decoded = match envelope::decode(&self.compressor, &raw) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!("Dropping corrupt L2 entry {}: {}", key, e);
                self.counters.corrupt_entries.fetch_add(1, Ordering::Relaxed);
                metrics::record_compression_error();
                if self.l2.delete(key).await.is_ok() {
                    self.changes.record_delete(key);
                }
                return Ok(self.miss());
            }
        };

        if decoded.header.is_expired_at(now_millis()) {
            debug!("L2 entry {} past its envelope expiry", key);
            return Ok(self.miss());
        }

        let l1_expiry = self.l1_expiry(decoded.header.expires_at_ms);
        self.l1
            .populate(key.to_string(), decoded.value.clone(), l1_expiry, generation);
        self.counters.l2_hits.fetch_add(1, Ordering::Relaxed);
        metrics::record_cache_op("get", "l2_hit");
        Ok(Some(decoded.value))
    }

    fn miss(&self) -> Option<Vec<u8>> {
        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        metrics::record_cache_op("get", "miss");
        None
    }

    // ---- write path ----

    /// Write through to L2 then L1. `None` applies the default TTL.
    pub async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
        let started = Instant::now();
        let result = self.set_inner(key, value, ttl).await;
        self.observe("set", key, started, result.is_ok()).await;
        result
    }

    async fn set_inner(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
        validate_key(key)?;
        let expires_at_ms = expiry_from_ttl(self.effective_ttl(ttl));
        let envelope = envelope::encode(&self.compressor, &value, now_millis(), expires_at_ms)?;

        let _writer = self.write_lock(key).lock().await;
        let journalled = self.journal_if_unusable(|| {
            PendingChange::Key(
                key.to_string(),
                PendingOp::Upsert {
                    envelope: envelope.clone(),
                    expires_at_ms,
                },
            )
        });

        if !journalled {
            let ttl = expires_at_ms.and_then(remaining_ttl);
            if let Err(e) = self.l2.set(key, envelope.clone(), ttl).await {
                if !e.is_connection() {
                    self.counters.l2_errors.fetch_add(1, Ordering::Relaxed);
                    return Err(e);
                }
                self.degrade_and_journal(
                    &e,
                    PendingChange::Key(
                        key.to_string(),
                        PendingOp::Upsert {
                            envelope,
                            expires_at_ms,
                        },
                    ),
                );
            }
        }

        self.changes.record_upsert(key);
        self.l1
            .put(key.to_string(), value, self.l1_expiry(expires_at_ms));
        self.counters.sets.fetch_add(1, Ordering::Relaxed);
        metrics::record_cache_op("set", "ok");
        Ok(())
    }

    /// Remove a key from both layers. Returns whether either layer had it.
    pub async fn invalidate(&self, key: &str) -> Result<bool> {
        let started = Instant::now();
        let result = self.invalidate_inner(key).await;
        self.observe("invalidate", key, started, result.is_ok()).await;
        result
    }

    async fn invalidate_inner(&self, key: &str) -> Result<bool> {
        let _writer = self.write_lock(key).lock().await;
        let journalled = self.journal_if_unusable(|| {
            PendingChange::Key(key.to_string(), PendingOp::Delete)
        });

        let mut removed = false;
        if !journalled {
            match self.l2.delete(key).await {
                Ok(existed) => removed = existed,
                Err(e) if e.is_connection() => {
                    self.degrade_and_journal(
                        &e,
                        PendingChange::Key(key.to_string(), PendingOp::Delete),
                    );
                }
                Err(e) => {
                    self.counters.l2_errors.fetch_add(1, Ordering::Relaxed);
                    return Err(e);
                }
            }
        }

        self.changes.record_delete(key);
        removed |= self.l1.delete(key);
        self.counters.invalidations.fetch_add(1, Ordering::Relaxed);
        metrics::record_cache_op("invalidate", "ok");
        Ok(removed)
    }

    /// Remove every key starting with `prefix` from both layers
    pub async fn invalidate_prefix(&self, prefix: &str) -> Result<u64> {
        let started = Instant::now();
        let result = self.invalidate_prefix_inner(prefix).await;
        self.observe("invalidate_prefix", prefix, started, result.is_ok())
            .await;
        result
    }

    async fn invalidate_prefix_inner(&self, prefix: &str) -> Result<u64> {
        let journalled =
            self.journal_if_unusable(|| PendingChange::Prefix(prefix.to_string()));

        let mut removed = 0u64;
        let mut tracked = false;
        if !journalled {
            let outcome = match self.l2.keys(prefix).await {
                Ok(keys) => self.l2.delete_prefix(prefix).await.map(|n| (keys, n)),
                Err(e) => Err(e),
            };
            match outcome {
                Ok((keys, n)) => {
                    for key in &keys {
                        self.changes.record_delete(key);
                    }
                    tracked = true;
                    removed = n;
                }
                Err(e) if e.is_connection() => {
                    self.degrade_and_journal(&e, PendingChange::Prefix(prefix.to_string()));
                }
                Err(e) => {
                    self.counters.l2_errors.fetch_add(1, Ordering::Relaxed);
                    return Err(e);
                }
            }
        }

        if !tracked {
            // Affected keys unknown until replay; the next backup must be full
            self.changes.record_reset();
        }

        let l1_removed = self.l1.delete_prefix(prefix) as u64;
        self.counters.invalidations.fetch_add(1, Ordering::Relaxed);
        metrics::record_cache_op("invalidate_prefix", "ok");
        Ok(removed.max(l1_removed))
    }

    /// Empty both layers
    pub async fn clear(&self) -> Result<()> {
        let journalled = self.journal_if_unusable(|| PendingChange::Clear);
        if !journalled {
            match self.l2.clear().await {
                Ok(()) => {}
                Err(e) if e.is_connection() => self.degrade_and_journal(&e, PendingChange::Clear),
                Err(e) => return Err(e),
            }
        }
        self.changes.record_reset();
        self.l1.clear();
        metrics::record_cache_op("clear", "ok");
        info!("Cache cleared");
        Ok(())
    }

    // ---- read-through ----

    /// Read-through: on a double miss call `loader` and store what it
    /// returns. Concurrent misses on the same key share one loader call.
    pub async fn get_or_fetch<F, Fut, E>(
        &self,
        key: &str,
        ttl: Option<Duration>,
        loader: F,
    ) -> Result<Option<Vec<u8>>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<Option<Vec<u8>>, E>>,
        E: Display,
    {
        if let Some(value) = self.get(key).await? {
            return Ok(Some(value));
        }

        let result = self
            .coalescer
            .run(key, || async move {
                // A flight that just finished may already have stored it
                if let Some(value) = self.l1.get(key) {
                    return Ok(Some(value));
                }

                self.counters.loader_calls.fetch_add(1, Ordering::Relaxed);
                match loader().await {
                    Ok(Some(value)) => {
                        if let Err(e) = self.set(key, value.clone(), ttl).await {
                            warn!("Failed to cache fetched value for {}: {}", key, e);
                        }
                        Ok(Some(value))
                    }
                    Ok(None) => Ok(None),
                    Err(e) => Err(e.to_string()),
                }
            })
            .await;

        result.map_err(CacheError::Upstream)
    }

    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get(key).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub async fn set_json<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<()> {
        let bytes = serde_json::to_vec(value)?;
        self.set(key, bytes, ttl).await
    }

    pub async fn get_or_fetch_json<T, F, Fut, E>(
        &self,
        key: &str,
        ttl: Option<Duration>,
        loader: F,
    ) -> Result<Option<T>>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<Option<T>, E>>,
        E: Display,
    {
        let bytes = self
            .get_or_fetch(key, ttl, || async move {
                match loader().await {
                    Ok(Some(value)) => serde_json::to_vec(&value)
                        .map(Some)
                        .map_err(|e| e.to_string()),
                    Ok(None) => Ok(None),
                    Err(e) => Err(e.to_string()),
                }
            })
            .await?;

        match bytes {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    // ---- batch helpers (per-key atomic only) ----

    /// Concurrent gets, results in key order
    pub async fn mget(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>> {
        try_join_all(keys.iter().map(|key| self.get(key))).await
    }

    pub async fn mset(&self, entries: Vec<(String, Vec<u8>)>, ttl: Option<Duration>) -> Result<()> {
        for (key, value) in entries {
            self.set(&key, value, ttl).await?;
        }
        Ok(())
    }

    /// Seed both layers
    pub async fn warm(&self, entries: Vec<(String, Vec<u8>)>, ttl: Option<Duration>) -> Result<usize> {
        let count = entries.len();
        self.mset(entries, ttl).await?;
        info!("Warmed {} entries", count);
        Ok(count)
    }

    /// Load existing L2 entries into L1
    pub async fn warm_from_l2(&self, keys: &[String]) -> Result<usize> {
        let mut loaded = 0;
        for key in keys {
            if self.l1.contains(key) {
                continue;
            }
            if self.get(key).await?.is_some() {
                loaded += 1;
            }
        }
        debug!("Warmed {} of {} keys from L2", loaded, keys.len());
        Ok(loaded)
    }

    // ---- TTL helpers ----

    fn effective_ttl(&self, ttl: Option<Duration>) -> Option<Duration> {
        let ttl = ttl.unwrap_or(Duration::from_secs(self.config.default_ttl_secs));
        (!ttl.is_zero()).then_some(ttl)
    }

    /// L1 expiry: entry expiry bounded by the L1 TTL cap
    fn l1_expiry(&self, entry_expiry: Option<u64>) -> Option<u64> {
        let cap = (self.config.l1_ttl_secs > 0)
            .then(|| now_millis().saturating_add(self.config.l1_ttl_secs * 1000));
        match (entry_expiry, cap) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    // ---- degraded mode ----

    /// Record `change` if L2 is not usable. The check and the insert happen
    /// under one lock so a concurrent recovery cannot miss it.
    fn journal_if_unusable(&self, change: impl FnOnce() -> PendingChange) -> bool {
        let mut health = self.health.lock();
        if health.status.is_healthy() {
            return false;
        }
        Self::push_journal(&mut health, change(), self.config.max_journal_entries);
        true
    }

    fn push_journal(health: &mut HealthState, change: PendingChange, limit: usize) {
        let overflow = matches!(change, PendingChange::Key(..)) && health.journal.len() >= limit;
        if overflow {
            if !health.journal_overflowed {
                warn!("Degraded-mode journal full ({} entries), escalating to clear", limit);
            }
            // Losing individual writes would leave L2 stale, so clear it instead
            health.journal_overflowed = true;
            health.journal.push(PendingChange::Clear);
            return;
        }
        health.journal.push(change);
    }

    fn degrade_and_journal(&self, error: &CacheError, change: PendingChange) {
        let mut health = self.health.lock();
        self.transition_degraded(&mut health, error);
        Self::push_journal(&mut health, change, self.config.max_journal_entries);
    }

    fn enter_degraded(&self, error: &CacheError) {
        let mut health = self.health.lock();
        self.transition_degraded(&mut health, error);
    }

    fn transition_degraded(&self, health: &mut HealthState, error: &CacheError) {
        self.counters.l2_errors.fetch_add(1, Ordering::Relaxed);
        if !health.status.is_healthy() {
            return;
        }
        let reason = error.to_string();
        warn!("L2 unreachable, serving from L1 only: {}", reason);
        health.status = CacheStatus::Degraded {
            since_ms: now_millis(),
            reason: reason.clone(),
        };
        health.attempts = 0;
        health.next_probe_ms = now_millis() + self.config.backoff.delay_for_attempt(0).as_millis() as u64;
        self.counters
            .degraded_transitions
            .fetch_add(1, Ordering::Relaxed);
        metrics::set_cache_status("degraded");
        self.alerts.raise(
            AlertSeverity::Warning,
            "cache",
            format!("L2 unreachable, degraded to L1-only: {}", reason),
        );
    }

    /// Ping L2 from a healthy state, degrading on a connection failure.
    /// Returns whether L2 answered.
    pub async fn probe_l2(&self) -> bool {
        match self.l2.ping().await {
            Ok(()) => true,
            Err(e) if e.is_connection() => {
                self.enter_degraded(&e);
                false
            }
            Err(e) => {
                debug!("L2 ping failed: {}", e);
                false
            }
        }
    }

    /// Probe L2 and, if reachable, replay the journal and return to healthy.
    /// Returns whether the cache is healthy afterwards.
    pub async fn try_recover(&self) -> bool {
        match self.status() {
            CacheStatus::Healthy => return true,
            CacheStatus::Restoring { .. } => return false,
            CacheStatus::Degraded { .. } => {}
        }

        if let Err(e) = self.l2.ping().await {
            let mut health = self.health.lock();
            health.attempts = health.attempts.saturating_add(1);
            let delay = self.config.backoff.delay_for_attempt(health.attempts);
            health.next_probe_ms = now_millis() + delay.as_millis() as u64;
            debug!(
                "L2 still unreachable (attempt {}), next probe in {:?}: {}",
                health.attempts, delay, e
            );
            return false;
        }

        self.drain_journal().await
    }

    /// Replay journalled changes until none are left, then mark healthy
    async fn drain_journal(&self) -> bool {
        loop {
            let batch = {
                let mut health = self.health.lock();
                if health.journal.is_empty() {
                    let previous = std::mem::replace(&mut health.status, CacheStatus::Healthy);
                    health.attempts = 0;
                    health.journal_overflowed = false;
                    metrics::set_cache_status("healthy");
                    if !previous.is_healthy() {
                        info!("L2 reachable again, cache healthy ({} was {})", self.l2.name(), previous.label());
                        self.alerts.resolve("cache");
                    }
                    return true;
                }
                std::mem::take(&mut health.journal)
            };

            if let Err((remaining, e)) = self.replay(batch).await {
                let mut health = self.health.lock();
                health.journal.merge_older(remaining);
                health.attempts = health.attempts.saturating_add(1);
                health.next_probe_ms = now_millis()
                    + self.config.backoff.delay_for_attempt(health.attempts).as_millis() as u64;
                warn!("Journal replay interrupted: {}", e);
                return false;
            }
        }
    }

    async fn replay(&self, mut journal: Journal) -> std::result::Result<(), (Journal, CacheError)> {
        let total = journal.len();

        if journal.clear {
            if let Err(e) = self.l2.clear().await {
                return Err((journal, e));
            }
            journal.clear = false;
        }

        while let Some(prefix) = journal.prefixes.first().cloned() {
            if let Err(e) = self.l2.delete_prefix(&prefix).await {
                return Err((journal, e));
            }
            journal.prefixes.remove(0);
        }

        let keys: Vec<String> = journal.ops.keys().cloned().collect();
        for key in keys {
            let Some(op) = journal.ops.get(&key).cloned() else {
                continue;
            };
            let outcome = match op {
                PendingOp::Upsert {
                    envelope,
                    expires_at_ms,
                } => match expires_at_ms {
                    Some(at) => match remaining_ttl(at) {
                        Some(ttl) => self.l2.set(&key, envelope, Some(ttl)).await,
                        // Expired while waiting; make sure no older value survives
                        None => self.l2.delete(&key).await.map(|_| ()),
                    },
                    None => self.l2.set(&key, envelope, None).await,
                },
                PendingOp::Delete => self.l2.delete(&key).await.map(|_| ()),
            };
            if let Err(e) = outcome {
                return Err((journal, e));
            }
            journal.ops.remove(&key);
        }

        self.counters
            .journal_replayed
            .fetch_add(total as u64, Ordering::Relaxed);
        info!("Replayed {} journalled changes to L2", total);
        Ok(())
    }

    /// Background task: purges expired L1 entries, detects L2 outages and
    /// drives recovery with exponential backoff.
    pub fn start_health_probe(self: &Arc<Self>) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        let interval = Duration::from_millis(cache.config.health_check_interval_ms.max(10));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let purged = cache.l1.purge_expired();
                if purged > 0 {
                    debug!("Purged {} expired L1 entries", purged);
                }

                match cache.status() {
                    CacheStatus::Healthy => {
                        cache.probe_l2().await;
                    }
                    CacheStatus::Degraded { .. } => {
                        let due = cache.health.lock().next_probe_ms <= now_millis();
                        if due {
                            cache.try_recover().await;
                        }
                    }
                    CacheStatus::Restoring { .. } => {}
                }
            }
        })
    }

    // ---- backup and restore hooks ----

    /// Change sequence and a consistent L2 snapshot. The sequence is read
    /// first so the snapshot covers at least everything up to it.
    pub async fn snapshot_for_backup(&self) -> Result<(u64, Vec<L2Entry>)> {
        let status = self.status();
        if !status.is_healthy() {
            return Err(CacheError::Unavailable(format!(
                "cannot snapshot while {}",
                status.label()
            )));
        }
        let seq = self.changes.current_seq();
        let entries = self.l2.snapshot().await?;
        Ok((seq, entries))
    }

    /// Swap the whole L2 keyspace for `entries`.
    ///
    /// While the swap runs the cache serves from L1 only and journals writes;
    /// they are replayed on top of the restored keyspace afterwards. Returns
    /// `false` when that replay could not finish; the cache is then degraded
    /// and the health probe completes it.
    pub async fn restore_entries(&self, entries: Vec<L2Entry>) -> Result<bool> {
        {
            let mut health = self.health.lock();
            if let CacheStatus::Restoring { .. } = health.status {
                return Err(CacheError::Unavailable(
                    "a restore is already running".to_string(),
                ));
            }
            health.status = CacheStatus::Restoring {
                since_ms: now_millis(),
            };
        }
        metrics::set_cache_status("restoring");
        self.l1.clear();

        let count = entries.len();
        if let Err(e) = self.l2.replace_all(entries).await {
            let mut health = self.health.lock();
            health.status = CacheStatus::Degraded {
                since_ms: now_millis(),
                reason: format!("restore failed: {}", e),
            };
            health.next_probe_ms = now_millis();
            metrics::set_cache_status("degraded");
            drop(health);
            self.alerts.raise(
                AlertSeverity::Critical,
                "restore",
                format!("Restore swap failed: {}", e),
            );
            return Err(e);
        }

        self.changes.record_reset();
        info!("Restored {} entries into L2", count);
        if self.drain_journal().await {
            return Ok(true);
        }

        let pending = {
            let mut health = self.health.lock();
            health.status = CacheStatus::Degraded {
                since_ms: now_millis(),
                reason: "restore replay pending".to_string(),
            };
            health.next_probe_ms = now_millis();
            health.journal.len()
        };
        self.counters
            .degraded_transitions
            .fetch_add(1, Ordering::Relaxed);
        metrics::set_cache_status("degraded");
        self.alerts.raise(
            AlertSeverity::Warning,
            "cache",
            format!(
                "Restore applied but {} journalled changes are still pending",
                pending
            ),
        );
        Ok(false)
    }

    // ---- observability ----

    pub fn stats(&self) -> TieredCacheStats {
        let (status, journal_pending) = {
            let health = self.health.lock();
            (health.status.clone(), health.journal.len())
        };
        let l1_hits = self.counters.l1_hits.load(Ordering::Relaxed);
        let l2_hits = self.counters.l2_hits.load(Ordering::Relaxed);
        let misses = self.counters.misses.load(Ordering::Relaxed);
        let total = l1_hits + l2_hits + misses;

        TieredCacheStats {
            status,
            l1_hits,
            l2_hits,
            misses,
            hit_rate: if total == 0 {
                0.0
            } else {
                (l1_hits + l2_hits) as f64 / total as f64
            },
            sets: self.counters.sets.load(Ordering::Relaxed),
            invalidations: self.counters.invalidations.load(Ordering::Relaxed),
            l2_errors: self.counters.l2_errors.load(Ordering::Relaxed),
            corrupt_entries: self.counters.corrupt_entries.load(Ordering::Relaxed),
            degraded_transitions: self.counters.degraded_transitions.load(Ordering::Relaxed),
            journal_pending,
            journal_replayed: self.counters.journal_replayed.load(Ordering::Relaxed),
            loader_calls: self.counters.loader_calls.load(Ordering::Relaxed),
            l1: self.l1.stats(),
            compression: self.compressor.stats(),
            coalescing: self.coalescer.stats(),
            l2_backend: self.l2.name(),
        }
    }

    async fn observe(&self, op: &'static str, key: &str, started: Instant, ok: bool) {
        let elapsed = started.elapsed();
        metrics::observe_cache_latency(op, elapsed.as_secs_f64());
        if !ok {
            metrics::record_cache_op(op, "error");
        }
        self.slow_log
            .record(op.to_string(), vec![key.to_string()], elapsed)
            .await;
    }
}

fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(CacheError::InvalidRequest("key must not be empty".to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::l2::MemoryL2;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicBool;

    fn test_config() -> TieredCacheConfig {
        let mut config = TieredCacheConfig::default();
        config.backoff = Backoff::new(Duration::from_millis(1), Duration::from_millis(5));
        config
    }

    fn cache_with(l2: &MemoryL2) -> TieredCache {
        TieredCache::new(test_config(), Arc::new(l2.clone()), CompressionConfig::default())
    }

    /// [`MemoryL2`] with hooks for racing writers and post-swap outages
    struct HookedL2 {
        inner: MemoryL2,
        /// The next `set` lands, then stalls before returning
        stall_next_set: AtomicBool,
        /// The backend goes down right after a successful `replace_all`
        drop_after_swap: bool,
    }

    impl HookedL2 {
        fn new(inner: &MemoryL2) -> Self {
            Self {
                inner: inner.clone(),
                stall_next_set: AtomicBool::new(false),
                drop_after_swap: false,
            }
        }
    }

    #[async_trait]
    impl L2Backend for HookedL2 {
        fn name(&self) -> &'static str {
            "hooked"
        }

        async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
            self.inner.get(key).await
        }

        async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
            self.inner.set(key, value, ttl).await?;
            if self.stall_next_set.swap(false, Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            Ok(())
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
            self.inner.replace_all(entries).await?;
            if self.drop_after_swap {
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

    #[tokio::test]
    async fn test_read_your_write() {
        let l2 = MemoryL2::new();
        let cache = cache_with(&l2);

        cache.set("user:1", b"alice".to_vec(), None).await.unwrap();
        assert_eq!(cache.get("user:1").await.unwrap(), Some(b"alice".to_vec()));
        assert_eq!(cache.stats().l1_hits, 1);
        // L2 holds the envelope, not the raw value
        assert_ne!(l2.raw("user:1").unwrap(), b"alice".to_vec());
    }

    #[tokio::test]
    async fn test_l2_hit_populates_l1() {
        let l2 = MemoryL2::new();
        let writer = cache_with(&l2);
        let reader = cache_with(&l2);

        writer.set("k", b"v".to_vec(), None).await.unwrap();
        assert_eq!(reader.get("k").await.unwrap(), Some(b"v".to_vec()));
        assert!(reader.l1().contains("k"));
        assert_eq!(reader.stats().l2_hits, 1);
    }

    #[tokio::test]
    async fn test_corrupt_entry_is_a_miss() {
        let l2 = MemoryL2::new();
        let cache = cache_with(&l2);
        l2.insert_raw("bad", b"not an envelope".to_vec());

        assert_eq!(cache.get("bad").await.unwrap(), None);
        assert!(l2.raw("bad").is_none());
        assert_eq!(cache.stats().corrupt_entries, 1);
    }

    #[tokio::test]
    async fn test_invalidate_removes_both_layers() {
        let l2 = MemoryL2::new();
        let cache = cache_with(&l2);
        cache.set("k", b"v".to_vec(), None).await.unwrap();

        assert!(cache.invalidate("k").await.unwrap());
        assert!(!cache.l1().contains("k"));
        assert!(l2.raw("k").is_none());
        assert_eq!(cache.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_degraded_journal_replay() {
        let l2 = MemoryL2::new();
        let cache = cache_with(&l2);
        cache.set("keep", b"1".to_vec(), None).await.unwrap();
        cache.set("drop", b"2".to_vec(), None).await.unwrap();

        l2.set_available(false);
        cache.set("new", b"3".to_vec(), None).await.unwrap();
        cache.invalidate("drop").await.unwrap();
        assert_eq!(cache.status().label(), "degraded");
        assert_eq!(cache.get("new").await.unwrap(), Some(b"3".to_vec()));
        assert!(!cache.try_recover().await);

        l2.set_available(true);
        assert!(cache.try_recover().await);
        assert!(cache.status().is_healthy());
        assert!(l2.raw("new").is_some());
        assert!(l2.raw("drop").is_none());
        assert!(l2.raw("keep").is_some());
    }

    #[tokio::test]
    async fn test_racing_writers_leave_layers_agreeing() {
        let l2 = MemoryL2::new();
        let hooked = HookedL2::new(&l2);
        hooked.stall_next_set.store(true, Ordering::SeqCst);
        let cache = Arc::new(TieredCache::new(
            test_config(),
            Arc::new(hooked),
            CompressionConfig::default(),
        ));

        let first = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.set("k", b"AAAA".to_vec(), None).await })
        };
        // Let the first writer reach L2 and stall there
        tokio::time::sleep(Duration::from_millis(10)).await;
        cache.set("k", b"BBBB".to_vec(), None).await.unwrap();
        first.await.unwrap().unwrap();

        let in_l2 = envelope::decode(cache.compressor(), &l2.raw("k").unwrap())
            .unwrap()
            .value;
        assert_eq!(in_l2, b"BBBB".to_vec());
        assert_eq!(cache.l1().get("k"), Some(in_l2));
    }

    #[tokio::test]
    async fn test_restore_with_unfinished_replay_degrades() {
        let l2 = MemoryL2::new();
        let mut hooked = HookedL2::new(&l2);
        hooked.drop_after_swap = true;
        let cache = TieredCache::new(test_config(), Arc::new(hooked), CompressionConfig::default());

        l2.set_available(false);
        cache.set("late", b"w".to_vec(), None).await.unwrap();
        l2.set_available(true);

        let restored = envelope::encode(cache.compressor(), b"x", now_millis(), None).unwrap();
        let replayed = cache
            .restore_entries(vec![L2Entry {
                key: "restored".to_string(),
                value: restored,
                ttl: None,
            }])
            .await
            .unwrap();

        assert!(!replayed);
        match cache.status() {
            CacheStatus::Degraded { reason, .. } => assert_eq!(reason, "restore replay pending"),
            other => panic!("unexpected status {:?}", other),
        }
        assert_eq!(cache.stats().journal_pending, 1);
        assert!(l2.raw("restored").is_some());
        assert!(l2.raw("late").is_none());

        l2.set_available(true);
        assert!(cache.try_recover().await);
        assert_eq!(cache.status(), CacheStatus::Healthy);
        assert!(l2.raw("late").is_some());
        assert_eq!(cache.get("restored").await.unwrap(), Some(b"x".to_vec()));
    }

    #[tokio::test]
    async fn test_unreachable_l2_at_startup_degrades_then_recovers() {
        let l2 = MemoryL2::new();
        l2.set_available(false);
        let cache = cache_with(&l2);

        assert!(!cache.probe_l2().await);
        assert_eq!(cache.status().label(), "degraded");
        cache.set("early", b"1".to_vec(), None).await.unwrap();
        assert_eq!(cache.get("early").await.unwrap(), Some(b"1".to_vec()));

        l2.set_available(true);
        assert!(cache.try_recover().await);
        assert!(l2.raw("early").is_some());
        assert!(cache.probe_l2().await);
    }

    #[test]
    fn test_journal_prefix_drops_covered_ops() {
        let mut journal = Journal::default();
        journal.push(PendingChange::Key("user:1".into(), PendingOp::Delete));
        journal.push(PendingChange::Key("quiz:1".into(), PendingOp::Delete));
        journal.push(PendingChange::Prefix("user:".into()));
        assert_eq!(journal.ops.len(), 1);
        assert_eq!(journal.prefixes, vec!["user:"]);

        journal.push(PendingChange::Clear);
        assert!(journal.clear);
        assert_eq!(journal.len(), 1);
    }

    #[tokio::test]
    async fn test_default_ttl_and_l1_cap() {
        let l2 = MemoryL2::new();
        let mut config = TieredCacheConfig::default();
        config.default_ttl_secs = 0;
        config.l1_ttl_secs = 0;
        let cache = TieredCache::new(config, Arc::new(l2.clone()), CompressionConfig::default());

        assert_eq!(cache.effective_ttl(None), None);
        assert_eq!(cache.l1_expiry(None), None);
        assert_eq!(
            cache.effective_ttl(Some(Duration::from_secs(5))),
            Some(Duration::from_secs(5))
        );
    }
}

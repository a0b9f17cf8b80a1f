//! Collapses concurrent misses on the same key into one upstream fetch

use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::OnceCell;
use tracing::debug;

/// Shared outcome of one fetch. Errors are carried as strings so every
/// waiter can receive a copy.
pub type FetchResult = std::result::Result<Option<Vec<u8>>, String>;

type Flight = Arc<OnceCell<FetchResult>>;

#[derive(Default)]
pub struct RequestCoalescer {
    inflight: Mutex<HashMap<String, Flight>>,
    leaders: AtomicU64,
    followers: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct CoalescerStats {
    pub fetches: u64,
    pub coalesced: u64,
    pub inflight: usize,
}

impl RequestCoalescer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `fetch` for `key` unless a fetch for the same key is already in
    /// flight, in which case wait for and share its result.
    ///
    /// If the running fetch is cancelled, one of the waiters takes over.
    pub async fn run<F, Fut>(&self, key: &str, fetch: F) -> FetchResult
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = FetchResult>,
    {
        let (flight, joined) = {
            let mut inflight = self.inflight.lock();
            match inflight.get(key) {
                Some(flight) => (flight.clone(), true),
                None => {
                    let flight: Flight = Arc::new(OnceCell::new());
                    inflight.insert(key.to_string(), flight.clone());
                    (flight, false)
                }
            }
        };

        if joined {
            self.followers.fetch_add(1, Ordering::Relaxed);
            crate::metrics::record_coalesced();
            debug!("Coalesced miss on {}", key);
        } else {
            self.leaders.fetch_add(1, Ordering::Relaxed);
        }

        let result = flight.get_or_init(fetch).await.clone();

        let mut inflight = self.inflight.lock();
        if inflight
            .get(key)
            .is_some_and(|current| Arc::ptr_eq(current, &flight))
        {
            inflight.remove(key);
        }
        result
    }

    pub fn stats(&self) -> CoalescerStats {
        CoalescerStats {
            fetches: self.leaders.load(Ordering::Relaxed),
            coalesced: self.followers.load(Ordering::Relaxed),
            inflight: self.inflight.lock().len(),
        }
    }
}

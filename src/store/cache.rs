//! Bounded, TTL-evicting counter store for single-instance deployments.

use async_trait::async_trait;
use moka::future::Cache;
use moka::Expiry;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::trace;

use super::backend::CounterStore;
use crate::ratelimit::{Clock, SystemClock, ThrottleCounter};

/// Default maximum number of tracked keys.
pub const DEFAULT_CACHE_CAPACITY: u64 = 100_000;

#[derive(Debug, Clone, Copy)]
struct CachedCounter {
    counter: ThrottleCounter,
    window: Duration,
}

/// Expires each entry one window after its window opened.
struct WindowExpiry;

impl Expiry<String, CachedCounter> for WindowExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &CachedCounter,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.window)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &CachedCounter,
        _updated_at: Instant,
        duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        // A renewed window gets a full TTL, a bumped one keeps its deadline
        if value.counter.total_requests == 1 {
            Some(value.window)
        } else {
            duration_until_expiry
        }
    }
}

/// Counter store backed by a moka cache.
///
/// Unlike [`super::MemoryCounterStore`] it bounds memory: entries are evicted
/// by TTL once their window ends and by TinyLFU when the cache is full.
/// Increments go through moka's per-key entry API and are atomic per key.
#[derive(Clone)]
pub struct CacheCounterStore {
    cache: Cache<String, CachedCounter>,
    clock: Arc<dyn Clock>,
}

impl CacheCounterStore {
    /// Create a store holding at most `max_entries` keys.
    pub fn new(max_entries: u64) -> Self {
        Self::with_clock(max_entries, Arc::new(SystemClock::new()))
    }

    /// Create a store reading the given clock.
    pub fn with_clock(max_entries: u64, clock: Arc<dyn Clock>) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_entries)
            .expire_after(WindowExpiry)
            .build();

        Self { cache, clock }
    }

    /// Current counter for a key, if its window is still open.
    pub async fn get(&self, key: &str) -> Option<ThrottleCounter> {
        let now = self.clock.now();
        self.cache
            .get(key)
            .await
            .filter(|cached| cached.counter.is_current(cached.window, now))
            .map(|cached| cached.counter)
    }

    /// Approximate number of tracked keys.
    pub fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }

    /// Run pending eviction and expiration work immediately.
    pub async fn run_pending_tasks(&self) {
        self.cache.run_pending_tasks().await;
    }
}

impl Default for CacheCounterStore {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_CAPACITY)
    }
}

impl std::fmt::Debug for CacheCounterStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheCounterStore")
            .field("entry_count", &self.cache.entry_count())
            .field("clock", &self.clock)
            .finish()
    }
}

#[async_trait]
impl CounterStore for CacheCounterStore {
    async fn increment_and_get(&self, key: &str, window: Duration) -> ThrottleCounter {
        let now = self.clock.now();

        let entry = self
            .cache
            .entry(key.to_string())
            .and_upsert_with(|existing| {
                let counter = match existing {
                    Some(entry) => entry.into_value().counter.advance(window, now),
                    None => ThrottleCounter::fresh(now),
                };
                std::future::ready(CachedCounter { counter, window })
            })
            .await;

        let counter = entry.into_value().counter;
        trace!(key = %key, total = counter.total_requests, "Incremented cached throttle counter");
        counter
    }
}

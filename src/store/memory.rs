//! In-process counter store for single-instance deployments.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

use super::backend::CounterStore;
use crate::ratelimit::{Clock, SystemClock, ThrottleCounter};

/// Increments between sweeps of expired entries.
pub const DEFAULT_SWEEP_EVERY: u64 = 1024;

#[derive(Debug, Clone, Copy)]
struct Slot {
    counter: ThrottleCounter,
    window: Duration,
}

/// Counter store backed by a sharded concurrent map.
///
/// The map shard lock is held only for the read-modify-write of a single
/// key, which makes increments atomic per key without serialising unrelated
/// keys. Expired windows are overwritten on the next touch, and every
/// `sweep_every` increments the whole map is swept so keys that are never
/// touched again are dropped too.
#[derive(Debug)]
pub struct MemoryCounterStore {
    slots: DashMap<String, Slot>,
    clock: Arc<dyn Clock>,
    increments: AtomicU64,
    sweep_every: u64,
}

impl MemoryCounterStore {
    /// Create a store that reads the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock::new()))
    }

    /// Create a store that reads the given clock.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            slots: DashMap::new(),
            clock,
            increments: AtomicU64::new(0),
            sweep_every: DEFAULT_SWEEP_EVERY,
        }
    }

    /// Sweep expired entries every `every` increments (at least 1).
    pub fn sweep_every(mut self, every: u64) -> Self {
        self.sweep_every = every.max(1);
        self
    }

    /// Current counter for a key, if its window is still open.
    pub fn get(&self, key: &str) -> Option<ThrottleCounter> {
        let now = self.clock.now();
        self.slots
            .get(key)
            .filter(|slot| slot.counter.is_current(slot.window, now))
            .map(|slot| slot.counter)
    }

    /// Drop every entry whose window has elapsed. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.slots.len();
        self.slots
            .retain(|_, slot| slot.counter.is_current(slot.window, now));
        let removed = before.saturating_sub(self.slots.len());

        if removed > 0 {
            debug!(removed = removed, "Purged expired throttle counters");
        }
        removed
    }

    /// Number of tracked keys, including expired ones not yet purged.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether no key is tracked.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Clear all counters.
    pub fn clear(&self) {
        self.slots.clear();
    }
}

impl Default for MemoryCounterStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn increment_and_get(&self, key: &str, window: Duration) -> ThrottleCounter {
        let now = self.clock.now();

        let counter = self
            .slots
            .entry(key.to_string())
            .and_modify(|slot| {
                slot.counter = slot.counter.advance(window, now);
                slot.window = window;
            })
            .or_insert_with(|| {
                debug!(key = %key, window_secs = window.as_secs(), "Creating throttle counter");
                Slot {
                    counter: ThrottleCounter::fresh(now),
                    window,
                }
            })
            .counter;

        trace!(
            key = %key,
            total = counter.total_requests,
            "Incremented throttle counter"
        );

        // The entry guard is released above; sweeping takes every shard lock
        let seen = self.increments.fetch_add(1, Ordering::Relaxed) + 1;
        if seen % self.sweep_every == 0 {
            self.purge_expired();
        }

        counter
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::ManualClock;
    use chrono::{TimeZone, Utc};

    fn store() -> (MemoryCounterStore, ManualClock) {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap());
        (MemoryCounterStore::with_clock(Arc::new(clock.clone())), clock)
    }

    #[tokio::test]
    async fn test_counts_within_window() {
        let (store, clock) = store();
        let window = Duration::from_secs(60);

        for expected in 1..=5 {
            let counter = store.increment_and_get("k", window).await;
            assert_eq!(counter.total_requests, expected);
            assert_eq!(counter.window_start, clock.now());
        }
    }

    #[tokio::test]
    async fn test_window_resets_after_elapsed() {
        let (store, clock) = store();
        let window = Duration::from_secs(60);

        let first = store.increment_and_get("k", window).await;
        store.increment_and_get("k", window).await;

        clock.advance(Duration::from_secs(60));
        let renewed = store.increment_and_get("k", window).await;

        assert_eq!(renewed.total_requests, 1);
        assert!(renewed.window_start > first.window_start);
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let (store, _clock) = store();
        let window = Duration::from_secs(1);

        store.increment_and_get("a", window).await;
        store.increment_and_get("a", window).await;
        let b = store.increment_and_get("b", window).await;

        assert_eq!(b.total_requests, 1);
        assert_eq!(store.get("a").map(|c| c.total_requests), Some(2));
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let (store, clock) = store();

        store.increment_and_get("short", Duration::from_secs(1)).await;
        store.increment_and_get("long", Duration::from_secs(3600)).await;

        clock.advance(Duration::from_secs(5));
        assert_eq!(store.get("short"), None);
        assert_eq!(store.purge_expired(), 1);
        assert_eq!(store.len(), 1);

        store.clear();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_untouched_keys_are_swept() {
        let (store, clock) = store();
        let window = Duration::from_secs(1);

        for i in 0..10_000 {
            store.increment_and_get(&format!("ip-{}", i), window).await;
            clock.advance(window);
        }

        // Entries older than the last sweep are gone
        assert!(store.len() <= DEFAULT_SWEEP_EVERY as usize);
        assert!(store.len() < 10_000);
    }

    #[tokio::test]
    async fn test_sweep_keeps_open_windows() {
        let (store, clock) = store();
        let store = store.sweep_every(4);

        store.increment_and_get("long", Duration::from_secs(3600)).await;
        for i in 0..3 {
            store.increment_and_get(&format!("short-{}", i), Duration::from_secs(1)).await;
        }
        assert_eq!(store.len(), 4);

        clock.advance(Duration::from_secs(2));
        for i in 0..4 {
            store.increment_and_get(&format!("fresh-{}", i), Duration::from_secs(1)).await;
        }

        // Second sweep dropped the three expired short windows
        assert_eq!(store.len(), 5);
        assert_eq!(store.get("long").map(|c| c.total_requests), Some(1));
        assert_eq!(store.get("short-0"), None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_increments_are_atomic() {
        let (store, _clock) = store();
        let store = Arc::new(store);
        let window = Duration::from_secs(60);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..50 {
                    store.increment_and_get("shared", window).await;
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(store.get("shared").map(|c| c.total_requests), Some(400));
    }
}

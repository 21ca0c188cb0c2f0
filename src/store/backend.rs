//! Counter store trait shared by the local, cached and Redis backends.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::ratelimit::ThrottleCounter;

/// Atomic fixed-window counters keyed by throttle key.
///
/// `increment_and_get` must be atomic for concurrent callers using the same
/// key. The first call for a key opens a window at the current time with a
/// count of 1. Later calls inside the window bump the count and keep the
/// window start. The first call at or after `window_start + window` opens a
/// new window. Stale entries are reclaimed by the backend, never by callers.
///
/// Implementations never fail: a backend that cannot answer in time reports a
/// fresh counter (count 1) so the request is admitted.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Record one request against `key` and return the updated counter.
    async fn increment_and_get(&self, key: &str, window: Duration) -> ThrottleCounter;
}

#[async_trait]
impl<S: CounterStore + ?Sized> CounterStore for Arc<S> {
    async fn increment_and_get(&self, key: &str, window: Duration) -> ThrottleCounter {
        (**self).increment_and_get(key, window).await
    }
}

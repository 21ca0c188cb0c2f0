//! Redis-backed counter store for multi-instance fleets.
//!
//! Each throttle key maps to two Redis keys sharing the window TTL:
//! `<prefix>{<key>}:count` holds the request count and `<prefix>{<key>}:start`
//! holds the window start in epoch milliseconds. The braces are a Redis
//! Cluster hash tag, so both keys live on the same slot. A Lua script performs the
//! read-renew-increment atomically on the server, and the server-side TTL
//! ages out keys that stop receiving traffic.
//!
//! ## Accuracy
//!
//! The window start is written by whichever node opened the window. A node
//! whose clock lags may see a start in the future; that is treated as the
//! current window. Counts are therefore approximate under clock skew.
//!
//! ## Failures
//!
//! Connection errors and timeouts are logged and reported as a fresh
//! counter, which admits the request.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::{Client, Script};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, trace, warn};

use super::backend::CounterStore;
use crate::error::{GatekeeperError, Result};
use crate::ratelimit::{Clock, SystemClock, ThrottleCounter};

/// Lua script: fixed-window increment with lazy renewal.
///
/// KEYS[1]: count key, KEYS[2]: window start key
/// ARGV[1]: caller's current time (ms), ARGV[2]: window length (ms)
///
/// Returns {count, window_start_ms}.
static INCREMENT_SCRIPT: &str = r#"
local count_key = KEYS[1]
local start_key = KEYS[2]
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])

local start = tonumber(redis.call('GET', start_key))
if start == nil or now >= start + window then
    redis.call('SET', start_key, now, 'PX', window)
    redis.call('SET', count_key, 1, 'PX', window)
    return {1, now}
end

local count = redis.call('INCR', count_key)
local ttl = redis.call('PTTL', start_key)
if ttl > 0 then
    redis.call('PEXPIRE', count_key, ttl)
end
return {count, start}
"#;

/// Configuration for the Redis counter store.
#[derive(Debug, Clone)]
pub struct RedisStoreConfig {
    /// Prefix for every Redis key (default: "gatekeeper:")
    pub key_prefix: String,
    /// Upper bound on one increment round trip (default: 250ms)
    pub timeout: Duration,
}

impl Default for RedisStoreConfig {
    fn default() -> Self {
        Self {
            key_prefix: "gatekeeper:".to_string(),
            timeout: Duration::from_millis(250),
        }
    }
}

/// Counter store shared by every instance pointed at the same Redis.
#[derive(Clone)]
pub struct RedisCounterStore {
    connection: ConnectionManager,
    script: Arc<Script>,
    config: RedisStoreConfig,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for RedisCounterStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisCounterStore")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RedisCounterStore {
    /// Connect with default configuration.
    pub async fn connect(url: &str) -> Result<Self> {
        Self::connect_with_config(url, RedisStoreConfig::default(), Arc::new(SystemClock::new())).await
    }

    /// Connect with custom configuration and clock.
    pub async fn connect_with_config(
        url: &str,
        config: RedisStoreConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let client = Client::open(url)?;
        let connection = ConnectionManager::new(client).await?;

        info!(key_prefix = %config.key_prefix, "Connected Redis counter store");

        Ok(Self {
            connection,
            script: Arc::new(Script::new(INCREMENT_SCRIPT)),
            config,
            clock,
        })
    }

    /// The count and window-start Redis keys for a throttle key.
    pub fn redis_keys(&self, key: &str) -> (String, String) {
        redis_keys(&self.config.key_prefix, key)
    }

    async fn try_increment(&self, key: &str, window: Duration, now: DateTime<Utc>) -> Result<ThrottleCounter> {
        let (count_key, start_key) = self.redis_keys(key);
        let window_ms = (window.as_millis() as u64).max(1);
        let now_ms = now.timestamp_millis();

        // The manager is a cheap handle; no lock is held across the round trip
        let mut conn = self.connection.clone();
        let mut invocation = self.script.prepare_invoke();
        invocation
            .key(&count_key)
            .key(&start_key)
            .arg(now_ms)
            .arg(window_ms);

        let (count, start_ms): (u64, i64) =
            with_timeout(self.config.timeout, invocation.invoke_async(&mut conn)).await?;

        Ok(ThrottleCounter {
            window_start: DateTime::from_timestamp_millis(start_ms).unwrap_or(now),
            total_requests: count.max(1),
        })
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn increment_and_get(&self, key: &str, window: Duration) -> ThrottleCounter {
        let now = self.clock.now();
        counter_or_fresh(key, self.try_increment(key, window, now).await, now)
    }
}

/// Bound a Redis round trip by `timeout`.
async fn with_timeout<T, F>(timeout: Duration, operation: F) -> Result<T>
where
    F: Future<Output = redis::RedisResult<T>>,
{
    tokio::time::timeout(timeout, operation)
        .await
        .map_err(|_| GatekeeperError::StoreTimeout(timeout))?
        .map_err(GatekeeperError::from)
}

/// Fail open: any store error becomes a fresh counter, which admits the request.
fn counter_or_fresh(key: &str, result: Result<ThrottleCounter>, now: DateTime<Utc>) -> ThrottleCounter {
    match result {
        Ok(counter) => {
            trace!(key = %key, total = counter.total_requests, "Incremented Redis throttle counter");
            counter
        }
        Err(error) => {
            warn!(
                key = %key,
                error = %error,
                "Redis counter increment failed, admitting request (fail-open)"
            );
            ThrottleCounter::fresh(now)
        }
    }
}

/// Both keys share a hash tag so the script stays on one Redis Cluster slot.
fn redis_keys(prefix: &str, key: &str) -> (String, String) {
    (
        format!("{}{{{}}}:count", prefix, key),
        format!("{}{{{}}}:start", prefix, key),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::ManualClock;
    use chrono::TimeZone;

    #[test]
    fn test_redis_key_layout() {
        let (count, start) = redis_keys("gatekeeper:", "abc123");
        assert_eq!(count, "gatekeeper:{abc123}:count");
        assert_eq!(start, "gatekeeper:{abc123}:start");
    }

    #[tokio::test]
    async fn test_timeout_fails_open_with_fresh_counter() {
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 8, 0, 0).unwrap();
        let timeout = Duration::from_millis(10);

        let result = with_timeout(timeout, std::future::pending::<redis::RedisResult<(u64, i64)>>()).await;
        assert!(matches!(result, Err(GatekeeperError::StoreTimeout(t)) if t == timeout));

        let counter = counter_or_fresh("k", result.map(|_| ThrottleCounter::fresh(now)), now);
        assert_eq!(counter, ThrottleCounter::fresh(now));
        assert_eq!(counter.total_requests, 1);
    }

    #[tokio::test]
    async fn test_redis_error_fails_open_with_fresh_counter() {
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 8, 0, 0).unwrap();
        let refused = redis::RedisError::from((redis::ErrorKind::IoError, "connection refused"));

        let result = with_timeout(Duration::from_secs(1), async { Err::<u64, _>(refused) }).await;
        assert!(matches!(result, Err(GatekeeperError::Store(_))));

        let counter = counter_or_fresh("k", result.map(|_| ThrottleCounter::fresh(now)), now);
        assert_eq!(counter.total_requests, 1);
        assert_eq!(counter.window_start, now);
    }

    #[test]
    fn test_successful_increment_passes_through() {
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 8, 0, 0).unwrap();
        let counter = ThrottleCounter {
            window_start: now - chrono::Duration::seconds(10),
            total_requests: 7,
        };

        assert_eq!(counter_or_fresh("k", Ok(counter), now), counter);
    }

    #[test]
    fn test_increment_script_contents() {
        assert!(INCREMENT_SCRIPT.contains("INCR"));
        assert!(INCREMENT_SCRIPT.contains("'PX'"));
        assert!(INCREMENT_SCRIPT.contains("PEXPIRE"));
    }

    fn redis_url() -> Option<String> {
        std::env::var("REDIS_URL").ok()
    }

    #[tokio::test]
    #[ignore] // Requires Redis at REDIS_URL
    async fn test_redis_fixed_window() {
        let Some(url) = redis_url() else {
            eprintln!("Skipping test: REDIS_URL not set");
            return;
        };

        let clock = ManualClock::new(Utc::now());
        let config = RedisStoreConfig {
            key_prefix: format!("test:{}:", uuid::Uuid::new_v4()),
            ..Default::default()
        };
        let store = RedisCounterStore::connect_with_config(&url, config, Arc::new(clock.clone()))
            .await
            .unwrap();
        let window = Duration::from_secs(60);

        for expected in 1..=3 {
            let counter = store.increment_and_get("k", window).await;
            assert_eq!(counter.total_requests, expected);
        }

        clock.advance(Duration::from_secs(61));
        let renewed = store.increment_and_get("k", window).await;
        assert_eq!(renewed.total_requests, 1);
    }

    #[tokio::test]
    #[ignore] // Requires Redis at REDIS_URL
    async fn test_redis_lagging_clock_keeps_window() {
        let Some(url) = redis_url() else {
            eprintln!("Skipping test: REDIS_URL not set");
            return;
        };

        let clock = ManualClock::new(Utc::now());
        let config = RedisStoreConfig {
            key_prefix: format!("test:{}:", uuid::Uuid::new_v4()),
            ..Default::default()
        };
        let store = RedisCounterStore::connect_with_config(&url, config, Arc::new(clock.clone()))
            .await
            .unwrap();
        let window = Duration::from_secs(60);

        let first = store.increment_and_get("skew", window).await;

        // Another node with a clock 5s behind sees a window start in its future
        clock.set(first.window_start - chrono::Duration::seconds(5));
        let second = store.increment_and_get("skew", window).await;

        assert_eq!(second.total_requests, 2);
        assert_eq!(second.window_start, first.window_start);
    }
}

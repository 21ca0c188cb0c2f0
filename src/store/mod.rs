//! Counter store backends.
//!
//! All backends implement [`CounterStore`] and are picked when the rate
//! limiter is built:
//! - [`MemoryCounterStore`]: concurrent map, single instance
//! - [`CacheCounterStore`]: bounded cache with TTL eviction, single instance
//! - [`RedisCounterStore`]: Redis with server-side TTL, shared by a fleet

mod backend;
mod cache;
mod memory;
mod redis_store;

pub use backend::CounterStore;
pub use cache::{CacheCounterStore, DEFAULT_CACHE_CAPACITY};
pub use memory::MemoryCounterStore;
pub use redis_store::{RedisCounterStore, RedisStoreConfig};

use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::config::{StoreBackend, StoreConfig};
use crate::error::{GatekeeperError, Result};
use crate::ratelimit::Clock;

/// Build the configured counter store.
pub async fn from_config(config: &StoreConfig, clock: Arc<dyn Clock>) -> Result<Arc<dyn CounterStore>> {
    info!(backend = ?config.backend, "Initializing counter store");

    match config.backend {
        StoreBackend::Memory => Ok(Arc::new(MemoryCounterStore::with_clock(clock))),
        StoreBackend::Cache => Ok(Arc::new(CacheCounterStore::with_clock(
            config.cache_capacity,
            clock,
        ))),
        StoreBackend::Redis => {
            let url = config.redis_url.as_deref().ok_or_else(|| {
                GatekeeperError::Config("store.redis_url is required for the redis backend".to_string())
            })?;
            let redis_config = RedisStoreConfig {
                key_prefix: config.key_prefix.clone(),
                timeout: Duration::from_millis(config.timeout_ms),
            };
            let store = RedisCounterStore::connect_with_config(url, redis_config, clock).await?;
            Ok(Arc::new(store))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::SystemClock;

    #[tokio::test]
    async fn test_from_config_local_backends() {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());

        for backend in [StoreBackend::Memory, StoreBackend::Cache] {
            let config = StoreConfig {
                backend,
                ..Default::default()
            };
            let store = from_config(&config, clock.clone()).await.unwrap();
            let counter = store.increment_and_get("k", Duration::from_secs(60)).await;
            assert_eq!(counter.total_requests, 1);
        }
    }

    #[tokio::test]
    async fn test_redis_backend_requires_url() {
        let config = StoreConfig {
            backend: StoreBackend::Redis,
            ..Default::default()
        };
        let result = from_config(&config, Arc::new(SystemClock::new())).await;
        assert!(matches!(result, Err(GatekeeperError::Config(_))));
    }
}

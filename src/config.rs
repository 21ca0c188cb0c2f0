//! Configuration management for Gatekeeper.

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::ratelimit::CountingMode;
use crate::response::QuotaExceededResponse;

/// Prefix for environment overrides, e.g. `GATEKEEPER__STORE__BACKEND=redis`.
pub const ENV_PREFIX: &str = "GATEKEEPER";

/// Main configuration for Gatekeeper.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatekeeperConfig {
    /// Decision engine configuration
    #[serde(default)]
    pub limiter: LimiterConfig,

    /// Counter store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Response sent for throttled requests
    #[serde(default)]
    pub response: QuotaExceededResponse,

    /// Log output configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Decision engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Namespace prefixed to every throttle key
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Startup grace window in seconds
    #[serde(default = "default_grace_period")]
    pub grace_period_secs: u64,

    /// Path to the throttle policy file
    pub policy_path: Option<String>,

    /// Key the active policy is stored under
    #[serde(default = "default_policy_key")]
    pub policy_key: String,

    /// Policy reload interval in seconds, 0 disables reloading
    #[serde(default = "default_reload_interval")]
    pub policy_reload_interval_secs: u64,

    /// Counter increment behaviour once a period is exhausted
    #[serde(default)]
    pub counting_mode: CountingMode,

    /// Read client addresses from X-Forwarded-For / X-Real-IP
    #[serde(default)]
    pub trust_forwarded_headers: bool,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            grace_period_secs: default_grace_period(),
            policy_path: None,
            policy_key: default_policy_key(),
            policy_reload_interval_secs: default_reload_interval(),
            counting_mode: CountingMode::default(),
            trust_forwarded_headers: false,
        }
    }
}

fn default_namespace() -> String {
    crate::ratelimit::DEFAULT_NAMESPACE.to_string()
}

fn default_grace_period() -> u64 {
    crate::ratelimit::DEFAULT_GRACE_PERIOD.as_secs()
}

fn default_policy_key() -> String {
    crate::policy_store::DEFAULT_POLICY_KEY.to_string()
}

fn default_reload_interval() -> u64 {
    60
}

/// Counter store backend selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Concurrent map in this process
    #[default]
    Memory,
    /// Bounded TTL cache in this process
    Cache,
    /// Shared Redis instance
    Redis,
}

/// Counter store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Which backend to use
    #[serde(default)]
    pub backend: StoreBackend,

    /// Redis connection URL (required for the redis backend)
    pub redis_url: Option<String>,

    /// Prefix for Redis keys
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Redis round-trip timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Maximum keys held by the cache backend
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            redis_url: None,
            key_prefix: default_key_prefix(),
            timeout_ms: default_timeout_ms(),
            cache_capacity: default_cache_capacity(),
        }
    }
}

fn default_key_prefix() -> String {
    "gatekeeper:".to_string()
}

fn default_timeout_ms() -> u64 {
    250
}

fn default_cache_capacity() -> u64 {
    crate::store::DEFAULT_CACHE_CAPACITY
}

/// Log output configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by RUST_LOG
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl GatekeeperConfig {
    /// Load configuration from an optional file plus `GATEKEEPER__*` environment overrides.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path));
        }

        let config = builder
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?;

        Ok(config.try_deserialize()?)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::from_str(yaml, config::FileFormat::Yaml))
            .build()?;

        Ok(config.try_deserialize()?)
    }
}

//! Error types for Gatekeeper.

use std::time::Duration;
use thiserror::Error;

/// Main error type for Gatekeeper operations.
#[derive(Error, Debug)]
pub enum GatekeeperError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Throttle policy parsing or validation errors
    #[error("Policy error: {0}")]
    Policy(String),

    /// Counter store errors
    #[error("Counter store error: {0}")]
    Store(#[from] redis::RedisError),

    /// Counter store round trip exceeded its deadline
    #[error("Counter store timed out after {0:?}")]
    StoreTimeout(Duration),

    /// Throttle log sink errors
    #[error("Throttle log error: {0}")]
    Logging(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for GatekeeperError {
    fn from(err: config::ConfigError) -> Self {
        GatekeeperError::Config(err.to_string())
    }
}

/// Result type alias for Gatekeeper operations.
pub type Result<T> = std::result::Result<T, GatekeeperError>;

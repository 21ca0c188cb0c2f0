//! Structured records of throttled requests.
//!
//! The rate limiter hands one [`ThrottleLogEntry`] to the configured
//! [`ThrottleLogger`] per denied request. Loggers must return promptly; any
//! error they report is dropped by the limiter.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::warn;
use uuid::Uuid;

use crate::error::{GatekeeperError, Result};
use crate::ratelimit::RatePeriod;

/// One throttled request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThrottleLogEntry {
    pub request_id: Uuid,
    pub client_ip: Option<String>,
    pub client_key: String,
    pub user_id: Option<String>,
    pub endpoint: String,
    pub throttle_key: String,
    pub period: RatePeriod,
    pub rate_limit: u64,
    pub total_requests: u64,
    pub window_start: DateTime<Utc>,
    pub logged_at: DateTime<Utc>,
}

/// Sink for throttle log entries.
pub trait ThrottleLogger: Send + Sync {
    /// Record a throttled request. Must not block.
    fn log(&self, entry: ThrottleLogEntry) -> Result<()>;
}

/// Emits each entry as a `tracing` event at WARN level.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingThrottleLogger;

impl ThrottleLogger for TracingThrottleLogger {
    fn log(&self, entry: ThrottleLogEntry) -> Result<()> {
        warn!(
            request_id = %entry.request_id,
            client_ip = entry.client_ip.as_deref().unwrap_or("-"),
            client_key = %entry.client_key,
            user_id = entry.user_id.as_deref().unwrap_or("-"),
            endpoint = %entry.endpoint,
            throttle_key = %entry.throttle_key,
            period = %entry.period,
            rate_limit = entry.rate_limit,
            total_requests = entry.total_requests,
            window_start = %entry.window_start,
            "Request throttled"
        );
        Ok(())
    }
}

/// Forwards entries to a bounded channel for a background writer.
///
/// When the channel is full or closed the entry is dropped and an error is
/// returned; the caller is never made to wait.
#[derive(Debug, Clone)]
pub struct ChannelThrottleLogger {
    sender: mpsc::Sender<ThrottleLogEntry>,
}

impl ChannelThrottleLogger {
    /// Create a logger and the receiving end of its channel.
    pub fn bounded(capacity: usize) -> (Self, mpsc::Receiver<ThrottleLogEntry>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender }, receiver)
    }
}

impl ThrottleLogger for ChannelThrottleLogger {
    fn log(&self, entry: ThrottleLogEntry) -> Result<()> {
        self.sender.try_send(entry).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                GatekeeperError::Logging("throttle log channel is full".to_string())
            }
            mpsc::error::TrySendError::Closed(_) => {
                GatekeeperError::Logging("throttle log channel is closed".to_string())
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry() -> ThrottleLogEntry {
        let now = Utc::now();
        ThrottleLogEntry {
            request_id: Uuid::new_v4(),
            client_ip: Some("10.0.0.1".to_string()),
            client_key: "anonymous".to_string(),
            user_id: None,
            endpoint: "/api/values".to_string(),
            throttle_key: "abc".to_string(),
            period: RatePeriod::Minute,
            rate_limit: 3,
            total_requests: 4,
            window_start: now,
            logged_at: now,
        }
    }

    #[test]
    fn test_tracing_logger_never_fails() {
        assert!(TracingThrottleLogger.log(entry()).is_ok());
    }

    #[tokio::test]
    async fn test_channel_logger_delivers() {
        let (logger, mut receiver) = ChannelThrottleLogger::bounded(4);
        let sent = entry();

        logger.log(sent.clone()).unwrap();

        assert_eq!(receiver.recv().await, Some(sent));
    }

    #[test]
    fn test_channel_logger_drops_when_full() {
        let (logger, _receiver) = ChannelThrottleLogger::bounded(1);

        assert!(logger.log(entry()).is_ok());
        assert!(matches!(logger.log(entry()), Err(GatekeeperError::Logging(_))));
    }

    #[test]
    fn test_channel_logger_closed() {
        let (logger, receiver) = ChannelThrottleLogger::bounded(1);
        drop(receiver);

        assert!(logger.log(entry()).is_err());
    }

    #[test]
    fn test_entry_serializes_to_json() {
        let json = serde_json::to_value(entry()).unwrap();
        assert_eq!(json["period"], "minute");
        assert_eq!(json["rate_limit"], 3);
    }
}

//! Rate periods and the fixed-window throttle counter.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Time period a rate limit applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RatePeriod {
    /// Per-second rate limiting
    Second,
    /// Per-minute rate limiting
    Minute,
    /// Per-hour rate limiting
    Hour,
    /// Per-day rate limiting
    Day,
    /// Per-week rate limiting
    Week,
}

impl RatePeriod {
    /// All periods, shortest first.
    pub const ALL: [RatePeriod; 5] = [
        RatePeriod::Second,
        RatePeriod::Minute,
        RatePeriod::Hour,
        RatePeriod::Day,
        RatePeriod::Week,
    ];

    /// Length of this period in whole seconds.
    pub fn as_secs(&self) -> u64 {
        match self {
            RatePeriod::Second => 1,
            RatePeriod::Minute => 60,
            RatePeriod::Hour => 3600,
            RatePeriod::Day => 86400,
            RatePeriod::Week => 604800,
        }
    }

    /// Get the duration of this period.
    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.as_secs())
    }

    /// Lower-case name used in throttle keys and quota messages.
    pub fn name(&self) -> &'static str {
        match self {
            RatePeriod::Second => "second",
            RatePeriod::Minute => "minute",
            RatePeriod::Hour => "hour",
            RatePeriod::Day => "day",
            RatePeriod::Week => "week",
        }
    }
}

impl fmt::Display for RatePeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// State of one fixed window, as held by a counter store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThrottleCounter {
    /// When the current window started (UTC)
    pub window_start: DateTime<Utc>,
    /// Requests seen in the current window, always >= 1
    pub total_requests: u64,
}

impl ThrottleCounter {
    /// A counter for a window that opens at `now`.
    pub fn fresh(now: DateTime<Utc>) -> Self {
        Self {
            window_start: now,
            total_requests: 1,
        }
    }

    /// Whether `now` still falls inside the window of length `window`.
    ///
    /// A window start in the future (clock skew between nodes) counts as
    /// the current window.
    pub fn is_current(&self, window: Duration, now: DateTime<Utc>) -> bool {
        match chrono::Duration::from_std(window) {
            Ok(window) => now < self.window_start + window,
            Err(_) => true,
        }
    }

    /// Record one more request: bump the count inside the window, or open a
    /// new window at `now` once the old one has elapsed.
    pub fn advance(self, window: Duration, now: DateTime<Utc>) -> Self {
        if self.is_current(window, now) {
            Self {
                window_start: self.window_start,
                total_requests: self.total_requests.saturating_add(1),
            }
        } else {
            Self::fresh(now)
        }
    }

    /// Whole seconds elapsed since the window opened, zero if it opened in the future.
    pub fn elapsed_secs(&self, now: DateTime<Utc>) -> u64 {
        (now - self.window_start).num_seconds().max(0) as u64
    }
}

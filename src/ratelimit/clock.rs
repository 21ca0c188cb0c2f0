//! Wall clock abstraction and the startup grace window.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

/// Default length of the startup grace window.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(20);

/// Source of the current UTC time.
///
/// Counter stores and the rate limiter read time only through this trait so
/// tests can drive them with a [`ManualClock`].
pub trait Clock: Send + Sync + Debug {
    /// Current time.
    fn now(&self) -> DateTime<Utc>;
}

/// Clock backed by the system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl SystemClock {
    /// Create a new system clock.
    pub fn new() -> Self {
        Self
    }
}

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
///
/// Clones share the same time, so advancing one advances all of them.
#[derive(Debug, Clone)]
pub struct ManualClock {
    current: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    /// Create a clock frozen at `start`.
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            current: Arc::new(Mutex::new(start)),
        }
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        let by = chrono::Duration::from_std(by).unwrap_or(chrono::Duration::zero());
        *self.current.lock() += by;
    }

    /// Set the clock to a specific time.
    pub fn set(&self, to: DateTime<Utc>) {
        *self.current.lock() = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.current.lock()
    }
}

/// Interval after process start during which every request is admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GraceWindow {
    started_at: DateTime<Utc>,
    duration: Duration,
}

impl GraceWindow {
    /// A grace window opening at `started_at`.
    pub fn new(started_at: DateTime<Utc>, duration: Duration) -> Self {
        Self {
            started_at,
            duration,
        }
    }

    /// A grace window opening at the clock's current time.
    pub fn starting_now(clock: &dyn Clock, duration: Duration) -> Self {
        Self::new(clock.now(), duration)
    }

    /// A grace window that is already closed.
    pub fn disabled(started_at: DateTime<Utc>) -> Self {
        Self::new(started_at, Duration::ZERO)
    }

    /// When the process (or limiter) started.
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Length of the window.
    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Whether `now` falls inside the grace window.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        match chrono::Duration::from_std(self.duration) {
            Ok(duration) => now < self.started_at + duration,
            Err(_) => true,
        }
    }
}

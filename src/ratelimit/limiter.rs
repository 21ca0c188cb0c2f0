//! Core rate limiter implementation.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};
use uuid::Uuid;

use super::clock::{Clock, GraceWindow, SystemClock, DEFAULT_GRACE_PERIOD};
use super::counter::{RatePeriod, ThrottleCounter};
use super::identity::RequestIdentity;
use super::key::{ThrottleKey, DEFAULT_NAMESPACE};
use super::policy::{Dimensions, ThrottlePolicy};
use crate::policy_store::{MemoryPolicyRepository, PolicyRepository, DEFAULT_POLICY_KEY};
use crate::store::{CounterStore, MemoryCounterStore};
use crate::throttle_log::{ThrottleLogEntry, ThrottleLogger};

/// How counters are incremented when one period is already over its limit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CountingMode {
    /// Increment every period with a limit on every request, denied or not.
    #[default]
    All,
    /// Increment in evaluation order and stop at the first exceeded period.
    UntilDenied,
}

/// Why a request was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThrottleDecision {
    /// Throttle key of the exhausted counter
    pub key: String,
    /// The limit that was exceeded
    pub rate_limit: u64,
    /// The period the limit applies to
    pub period: RatePeriod,
    /// Start of the exhausted window
    pub window_start: DateTime<Utc>,
    /// Requests counted in the window, including this one
    pub total_requests: u64,
    /// Seconds the caller should wait, as header text
    pub retry_after: String,
}

/// Result of a rate limit check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// The request may proceed
    Allow,
    /// The request must be rejected
    Deny(ThrottleDecision),
}

impl Admission {
    /// Whether the request may proceed.
    pub fn is_allowed(&self) -> bool {
        matches!(self, Admission::Allow)
    }

    /// The rejection details, if denied.
    pub fn decision(&self) -> Option<&ThrottleDecision> {
        match self {
            Admission::Allow => None,
            Admission::Deny(decision) => Some(decision),
        }
    }
}

/// One period that needs a counter for this request.
#[derive(Debug)]
struct PeriodLimit {
    period: RatePeriod,
    limit: u64,
    key: ThrottleKey,
}

/// Seconds until the window opened at `window_start` ends, never below 1.
pub fn retry_after(window_start: DateTime<Utc>, period: RatePeriod, now: DateTime<Utc>) -> String {
    let elapsed = ThrottleCounter {
        window_start,
        total_requests: 1,
    }
    .elapsed_secs(now);

    period.as_secs().saturating_sub(elapsed).max(1).to_string()
}

/// The admission-control decision engine.
///
/// This struct is thread-safe and can be shared across tasks. The only
/// synchronisation point is the counter store's per-key increment.
pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    policies: Arc<dyn PolicyRepository>,
    policy_key: String,
    clock: Arc<dyn Clock>,
    grace: GraceWindow,
    namespace: String,
    counting: CountingMode,
    logger: Option<Arc<dyn ThrottleLogger>>,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("policy_key", &self.policy_key)
            .field("grace", &self.grace)
            .field("namespace", &self.namespace)
            .field("counting", &self.counting)
            .finish_non_exhaustive()
    }
}

impl RateLimiter {
    /// Start building a rate limiter.
    pub fn builder() -> RateLimiterBuilder {
        RateLimiterBuilder::default()
    }

    /// The policy currently in effect, if any.
    pub fn policy(&self) -> Option<Arc<ThrottlePolicy>> {
        self.policies.load(&self.policy_key)
    }

    /// The startup grace window.
    pub fn grace_window(&self) -> GraceWindow {
        self.grace
    }

    /// Derive the throttle key for an identity and period.
    pub fn throttle_key(
        &self,
        dimensions: Dimensions,
        identity: &RequestIdentity,
        period: RatePeriod,
    ) -> ThrottleKey {
        ThrottleKey::derive(&self.namespace, dimensions, identity, period)
    }

    /// Check the rate limit for a request identity.
    ///
    /// Every period with a positive effective limit has its counter
    /// incremented before the decision is made. Increments are never rolled
    /// back, so counters keep climbing while a client is blocked.
    pub async fn check(&self, identity: &RequestIdentity) -> Admission {
        let now = self.clock.now();

        if self.grace.is_active(now) {
            trace!(endpoint = %identity.endpoint, "Within startup grace window, admitting");
            return Admission::Allow;
        }

        let Some(policy) = self.policy() else {
            return Admission::Allow;
        };

        if !policy.is_enabled() || policy.is_whitelisted(identity) {
            trace!(
                client_ip = identity.client_ip.as_deref().unwrap_or("-"),
                client_key = %identity.client_key,
                endpoint = %identity.endpoint,
                "Throttling not applicable, admitting"
            );
            return Admission::Allow;
        }

        let dimensions = policy.dimensions();
        let limits: Vec<PeriodLimit> = policy
            .rates_with_defaults()
            .into_iter()
            .map(|(period, default)| (period, policy.effective_limit(identity, period, default)))
            .filter(|(_, limit)| *limit > 0)
            .map(|(period, limit)| PeriodLimit {
                period,
                limit,
                key: self.throttle_key(dimensions, identity, period),
            })
            .collect();

        trace!(
            client_ip = identity.client_ip.as_deref().unwrap_or("-"),
            client_key = %identity.client_key,
            endpoint = %identity.endpoint,
            periods = limits.len(),
            "Checking rate limit"
        );

        match self.counting {
            CountingMode::All => {
                let counters = join_all(limits.iter().map(|limit| {
                    self.store
                        .increment_and_get(limit.key.as_str(), limit.period.duration())
                }))
                .await;

                for (limit, counter) in limits.iter().zip(counters) {
                    if let Some(decision) = self.exceeded(limit, counter, now) {
                        return self.deny(identity, decision, now);
                    }
                }
            }
            CountingMode::UntilDenied => {
                for limit in &limits {
                    let counter = self
                        .store
                        .increment_and_get(limit.key.as_str(), limit.period.duration())
                        .await;

                    if let Some(decision) = self.exceeded(limit, counter, now) {
                        return self.deny(identity, decision, now);
                    }
                }
            }
        }

        Admission::Allow
    }

    fn exceeded(
        &self,
        limit: &PeriodLimit,
        counter: ThrottleCounter,
        now: DateTime<Utc>,
    ) -> Option<ThrottleDecision> {
        // A window that already ended was opened by a node with a leading clock
        if !counter.is_current(limit.period.duration(), now) {
            return None;
        }

        if counter.total_requests <= limit.limit {
            return None;
        }

        Some(ThrottleDecision {
            key: limit.key.to_string(),
            rate_limit: limit.limit,
            period: limit.period,
            window_start: counter.window_start,
            total_requests: counter.total_requests,
            retry_after: retry_after(counter.window_start, limit.period, now),
        })
    }

    fn deny(&self, identity: &RequestIdentity, decision: ThrottleDecision, now: DateTime<Utc>) -> Admission {
        debug!(
            key = %decision.key,
            period = %decision.period,
            limit = decision.rate_limit,
            total = decision.total_requests,
            retry_after = %decision.retry_after,
            "Rate limit exceeded"
        );

        if let Some(logger) = &self.logger {
            let entry = ThrottleLogEntry {
                request_id: Uuid::new_v4(),
                client_ip: identity.client_ip.clone(),
                client_key: identity.client_key.clone(),
                user_id: identity.user_id.clone(),
                endpoint: identity.endpoint.clone(),
                throttle_key: decision.key.clone(),
                period: decision.period,
                rate_limit: decision.rate_limit,
                total_requests: decision.total_requests,
                window_start: decision.window_start,
                logged_at: now,
            };

            if let Err(e) = logger.log(entry) {
                debug!(error = %e, "Throttle log entry dropped");
            }
        }

        Admission::Deny(decision)
    }
}

/// Builder for [`RateLimiter`].
#[derive(Default)]
pub struct RateLimiterBuilder {
    store: Option<Arc<dyn CounterStore>>,
    policies: Option<Arc<dyn PolicyRepository>>,
    policy_key: Option<String>,
    clock: Option<Arc<dyn Clock>>,
    grace_period: Option<Duration>,
    started_at: Option<DateTime<Utc>>,
    namespace: Option<String>,
    counting: CountingMode,
    logger: Option<Arc<dyn ThrottleLogger>>,
}

impl RateLimiterBuilder {
    /// Counter store backend. Defaults to a [`MemoryCounterStore`] on the limiter's clock.
    pub fn store(mut self, store: Arc<dyn CounterStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Use a fixed policy held in memory.
    pub fn policy(mut self, policy: ThrottlePolicy) -> Self {
        self.policies = Some(Arc::new(MemoryPolicyRepository::with_policy(policy)));
        self.policy_key = Some(DEFAULT_POLICY_KEY.to_string());
        self
    }

    /// Read the policy from a repository on every check.
    pub fn policy_repository(mut self, repository: Arc<dyn PolicyRepository>, key: impl Into<String>) -> Self {
        self.policies = Some(repository);
        self.policy_key = Some(key.into());
        self
    }

    /// Time source. Defaults to the system clock.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Length of the startup grace window. Defaults to 20 seconds.
    pub fn grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = Some(grace_period);
        self
    }

    /// When the process started. Defaults to the clock's time at build.
    pub fn started_at(mut self, started_at: DateTime<Utc>) -> Self {
        self.started_at = Some(started_at);
        self
    }

    /// Namespace prefixed to every throttle key.
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// How counters are incremented once a period is exhausted.
    pub fn counting_mode(mut self, counting: CountingMode) -> Self {
        self.counting = counting;
        self
    }

    /// Sink for throttled-request records.
    pub fn logger(mut self, logger: Arc<dyn ThrottleLogger>) -> Self {
        self.logger = Some(logger);
        self
    }

    pub fn build(self) -> RateLimiter {
        let clock = self
            .clock
            .unwrap_or_else(|| Arc::new(SystemClock::new()));
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryCounterStore::with_clock(clock.clone())));
        let policies = self
            .policies
            .unwrap_or_else(|| Arc::new(MemoryPolicyRepository::new()));
        let started_at = self.started_at.unwrap_or_else(|| clock.now());
        let grace = GraceWindow::new(started_at, self.grace_period.unwrap_or(DEFAULT_GRACE_PERIOD));

        RateLimiter {
            store,
            policies,
            policy_key: self
                .policy_key
                .unwrap_or_else(|| DEFAULT_POLICY_KEY.to_string()),
            clock,
            grace,
            namespace: self
                .namespace
                .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string()),
            counting: self.counting,
            logger: self.logger,
        }
    }
}

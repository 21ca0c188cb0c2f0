//! Throttle policy model and override-rule resolution.
//!
//! A policy says which dimensions are throttled, what the default limit is
//! for each period, which identities are exempt, and which endpoints,
//! client types and addresses get their own limits. Policies are read-mostly
//! and are replaced as a whole, never mutated in place while in use.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::info;

use super::counter::RatePeriod;
use super::identity::RequestIdentity;
use super::ip;
use crate::error::{GatekeeperError, Result};

/// Per-period request limits. A missing period or a zero limit means unlimited.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RateLimits(BTreeMap<RatePeriod, u64>);

impl RateLimits {
    /// Empty limits: unlimited in every period.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the limit for one period.
    pub fn with(mut self, period: RatePeriod, limit: u64) -> Self {
        self.0.insert(period, limit);
        self
    }

    /// Shorthand for a per-second limit.
    pub fn per_second(limit: u64) -> Self {
        Self::new().with(RatePeriod::Second, limit)
    }

    /// Shorthand for a per-minute limit.
    pub fn per_minute(limit: u64) -> Self {
        Self::new().with(RatePeriod::Minute, limit)
    }

    /// Limit for a period, 0 when none is configured.
    pub fn get(&self, period: RatePeriod) -> u64 {
        self.0.get(&period).copied().unwrap_or(0)
    }

    /// Whether no period carries a positive limit.
    pub fn is_unlimited(&self) -> bool {
        self.0.values().all(|limit| *limit == 0)
    }
}

/// Which identity parts take part in throttling and key derivation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Dimensions {
    pub ip: bool,
    pub client: bool,
    pub user: bool,
    pub endpoint: bool,
}

impl Dimensions {
    /// Whether any dimension is switched on.
    pub fn any(&self) -> bool {
        self.ip || self.client || self.user || self.endpoint
    }
}

/// Complete throttling configuration for a process.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThrottlePolicy {
    /// Throttle per client IP address
    #[serde(default)]
    pub ip_throttling: bool,

    /// Throttle per client-type key
    #[serde(default)]
    pub client_throttling: bool,

    /// Throttle per authenticated user id
    #[serde(default)]
    pub user_throttling: bool,

    /// Throttle per endpoint
    #[serde(default)]
    pub endpoint_throttling: bool,

    /// Evaluate periods longest-first so blocked requests keep stacking on the
    /// long windows
    #[serde(default)]
    pub stack_blocked_requests: bool,

    /// Default limits for every throttled identity
    #[serde(default)]
    pub rates: RateLimits,

    /// Addresses, CIDR blocks or ranges exempt from IP throttling
    #[serde(default)]
    pub ip_whitelist: Vec<String>,

    /// Client-type keys exempt from client throttling
    #[serde(default)]
    pub client_whitelist: Vec<String>,

    /// Endpoint substrings exempt from endpoint throttling
    #[serde(default)]
    pub endpoint_whitelist: Vec<String>,

    /// Limits for addresses, CIDR blocks or ranges
    #[serde(default)]
    pub ip_rules: BTreeMap<String, RateLimits>,

    /// Limits for specific client-type keys
    #[serde(default)]
    pub client_rules: BTreeMap<String, RateLimits>,

    /// Limits for endpoints containing the rule key
    #[serde(default)]
    pub endpoint_rules: BTreeMap<String, RateLimits>,
}

impl ThrottlePolicy {
    /// A policy with the given default rates and no dimension enabled.
    pub fn new(rates: RateLimits) -> Self {
        Self {
            rates,
            ..Default::default()
        }
    }

    /// Load a policy from a YAML (or JSON) file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading throttle policy");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse a policy from YAML. JSON is accepted as well.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| GatekeeperError::Policy(format!("Failed to parse throttle policy: {}", e)))
    }

    /// The enabled dimensions.
    pub fn dimensions(&self) -> Dimensions {
        Dimensions {
            ip: self.ip_throttling,
            client: self.client_throttling,
            user: self.user_throttling,
            endpoint: self.endpoint_throttling,
        }
    }

    /// Whether any throttling dimension is enabled.
    pub fn is_enabled(&self) -> bool {
        self.dimensions().any()
    }

    /// Whether the identity is exempt.
    ///
    /// A match in the whitelist of any enabled dimension exempts the request.
    /// The user dimension has no whitelist. A missing or malformed client IP
    /// never matches the IP whitelist.
    pub fn is_whitelisted(&self, identity: &RequestIdentity) -> bool {
        if self.ip_throttling {
            if let Some(client_ip) = identity.client_ip.as_deref() {
                if ip::list_contains(&self.ip_whitelist, client_ip) {
                    return true;
                }
            }
        }

        if self.client_throttling && self.client_whitelist.iter().any(|k| *k == identity.client_key) {
            return true;
        }

        if self.endpoint_throttling
            && self
                .endpoint_whitelist
                .iter()
                .any(|fragment| contains_ignore_case(&identity.endpoint, fragment))
        {
            return true;
        }

        false
    }

    /// Default rates for all five periods in evaluation order.
    ///
    /// Missing periods are filled with 0 (unlimited). The order is
    /// shortest-first, or longest-first when `stack_blocked_requests` is set.
    pub fn rates_with_defaults(&self) -> Vec<(RatePeriod, u64)> {
        let mut rates: Vec<(RatePeriod, u64)> = RatePeriod::ALL
            .iter()
            .map(|period| (*period, self.rates.get(*period)))
            .collect();

        if self.stack_blocked_requests {
            rates.reverse();
        }

        rates
    }

    /// Effective limit for one period after applying override rules.
    ///
    /// Precedence, lowest to highest: endpoint rules (minimum positive limit
    /// among all substring matches), the client-type rule, then the first IP
    /// rule containing the client address. A rule only takes effect when its
    /// dimension is enabled and its limit for the period is positive.
    pub fn effective_limit(&self, identity: &RequestIdentity, period: RatePeriod, default: u64) -> u64 {
        let mut limit = default;

        if self.endpoint_throttling {
            let endpoint_limit = self
                .endpoint_rules
                .iter()
                .filter(|(fragment, _)| contains_ignore_case(&identity.endpoint, fragment))
                .map(|(_, rates)| rates.get(period))
                .filter(|limit| *limit > 0)
                .min();

            if let Some(endpoint_limit) = endpoint_limit {
                limit = endpoint_limit;
            }
        }

        if self.client_throttling {
            if let Some(rates) = self.client_rules.get(&identity.client_key) {
                let client_limit = rates.get(period);
                if client_limit > 0 {
                    limit = client_limit;
                }
            }
        }

        if self.ip_throttling {
            if let Some(client_ip) = identity.client_ip.as_deref() {
                let ip_rule = self
                    .ip_rules
                    .iter()
                    .find(|(entry, _)| ip::entry_contains(entry, client_ip));

                if let Some((_, rates)) = ip_rule {
                    let ip_limit = rates.get(period);
                    if ip_limit > 0 {
                        limit = ip_limit;
                    }
                }
            }
        }

        limit
    }

    /// Describe entries that can never match.
    ///
    /// Malformed IP entries are tolerated at evaluation time (they simply
    /// never match), so this is advisory only.
    pub fn lint(&self) -> Vec<String> {
        let mut problems = Vec::new();

        for entry in &self.ip_whitelist {
            if ip::IpMatcher::parse(entry).is_none() {
                problems.push(format!("ip_whitelist entry '{}' is not an address, CIDR block or range", entry));
            }
        }

        for entry in self.ip_rules.keys() {
            if ip::IpMatcher::parse(entry).is_none() {
                problems.push(format!("ip_rules key '{}' is not an address, CIDR block or range", entry));
            }
        }

        for (fragment, rates) in &self.endpoint_rules {
            if fragment.chars().any(|c| c.is_uppercase()) {
                problems.push(format!("endpoint_rules key '{}' is matched case-insensitively", fragment));
            }
            if rates.is_unlimited() {
                problems.push(format!("endpoint_rules entry '{}' has no positive limit", fragment));
            }
        }

        if !self.is_enabled() && !self.rates.is_unlimited() {
            problems.push("rates are configured but no throttling dimension is enabled".to_string());
        }

        problems
    }
}

fn contains_ignore_case(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(&needle.to_lowercase())
}

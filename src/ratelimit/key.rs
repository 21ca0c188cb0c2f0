//! Throttle key derivation.

use sha2::{Digest, Sha256};
use std::fmt;

use super::counter::RatePeriod;
use super::identity::RequestIdentity;
use super::policy::Dimensions;

/// Namespace prefixed to every throttle key unless configured otherwise.
pub const DEFAULT_NAMESPACE: &str = "throttle";

const SEPARATOR: &str = "_";

/// Opaque, fixed-length identifier of one counter bucket.
///
/// The key is the hex SHA-256 of the namespace, the identity parts selected
/// by the enabled dimensions, and the period name. The same dimensions,
/// identity and period always produce the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThrottleKey(String);

impl ThrottleKey {
    /// Derive the key for one period.
    pub fn derive(
        namespace: &str,
        dimensions: Dimensions,
        identity: &RequestIdentity,
        period: RatePeriod,
    ) -> Self {
        let plain = Self::plain_text(namespace, dimensions, identity, period);
        let digest = Sha256::digest(plain.as_bytes());
        Self(hex::encode(digest))
    }

    /// The unhashed key material.
    ///
    /// Useful for logging and debugging. A dimension that is enabled but has
    /// no value for this identity contributes an empty segment.
    pub fn plain_text(
        namespace: &str,
        dimensions: Dimensions,
        identity: &RequestIdentity,
        period: RatePeriod,
    ) -> String {
        let mut parts: Vec<&str> = vec![namespace];

        if dimensions.ip {
            parts.push(identity.client_ip.as_deref().unwrap_or_default());
        }
        if dimensions.client {
            parts.push(&identity.client_key);
        }
        if dimensions.user {
            parts.push(identity.user_id.as_deref().unwrap_or_default());
        }
        if dimensions.endpoint {
            parts.push(&identity.endpoint);
        }
        parts.push(period.name());

        parts.join(SEPARATOR)
    }

    /// The key as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ThrottleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ThrottleKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_dimensions() -> Dimensions {
        Dimensions {
            ip: true,
            client: true,
            user: true,
            endpoint: true,
        }
    }

    fn identity() -> RequestIdentity {
        RequestIdentity::new(Some("10.0.0.1"), "/api/values")
            .with_client_key("partner")
            .with_user("u-1", None)
    }

    #[test]
    fn test_plain_text_layout() {
        let plain = ThrottleKey::plain_text(
            DEFAULT_NAMESPACE,
            all_dimensions(),
            &identity(),
            RatePeriod::Minute,
        );
        assert_eq!(plain, "throttle_10.0.0.1_partner_u-1_/api/values_minute");

        let ip_only = Dimensions {
            ip: true,
            ..Default::default()
        };
        let plain = ThrottleKey::plain_text("ns", ip_only, &identity(), RatePeriod::Second);
        assert_eq!(plain, "ns_10.0.0.1_second");
    }

    #[test]
    fn test_missing_values_leave_empty_segments() {
        let identity = RequestIdentity::new(None, "/x");
        let plain = ThrottleKey::plain_text("ns", all_dimensions(), &identity, RatePeriod::Day);
        assert_eq!(plain, "ns__anonymous__/x_day");
    }

    #[test]
    fn test_key_is_deterministic() {
        let a = ThrottleKey::derive(DEFAULT_NAMESPACE, all_dimensions(), &identity(), RatePeriod::Hour);
        let b = ThrottleKey::derive(DEFAULT_NAMESPACE, all_dimensions(), &identity(), RatePeriod::Hour);

        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 64);
        assert!(a.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_key_differs_per_period_and_dimension() {
        let hour = ThrottleKey::derive(DEFAULT_NAMESPACE, all_dimensions(), &identity(), RatePeriod::Hour);
        let day = ThrottleKey::derive(DEFAULT_NAMESPACE, all_dimensions(), &identity(), RatePeriod::Day);
        assert_ne!(hour, day);

        let no_user = Dimensions {
            user: false,
            ..all_dimensions()
        };
        let other = ThrottleKey::derive(DEFAULT_NAMESPACE, no_user, &identity(), RatePeriod::Hour);
        assert_ne!(hour, other);

        let other_ns = ThrottleKey::derive("other", all_dimensions(), &identity(), RatePeriod::Hour);
        assert_ne!(hour, other_ns);
    }
}

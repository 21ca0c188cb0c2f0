//! Substitute response for throttled requests.

use http::header::{CONTENT_TYPE, RETRY_AFTER};
use http::{Response, StatusCode};
use serde::{Deserialize, Serialize};

use crate::ratelimit::ThrottleDecision;

/// Default quota message. `{limit}` and `{period}` are substituted.
pub const DEFAULT_QUOTA_MESSAGE: &str = "API calls quota exceeded! maximum admitted {limit} per {period}.";

/// Builds the response a host returns instead of running a throttled request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaExceededResponse {
    /// Status code, 429 unless configured otherwise
    #[serde(with = "status_code", default = "default_status")]
    pub status: StatusCode,
    /// Body template
    #[serde(default = "default_message")]
    pub message_template: String,
}

impl Default for QuotaExceededResponse {
    fn default() -> Self {
        Self {
            status: default_status(),
            message_template: default_message(),
        }
    }
}

fn default_status() -> StatusCode {
    StatusCode::TOO_MANY_REQUESTS
}

fn default_message() -> String {
    DEFAULT_QUOTA_MESSAGE.to_string()
}

impl QuotaExceededResponse {
    /// A response with a custom status and template.
    pub fn new(status: StatusCode, message_template: impl Into<String>) -> Self {
        Self {
            status,
            message_template: message_template.into(),
        }
    }

    /// The body for a decision.
    pub fn message(&self, decision: &ThrottleDecision) -> String {
        self.message_template
            .replace("{limit}", &decision.rate_limit.to_string())
            .replace("{period}", decision.period.name())
    }

    /// Build the full response for a decision.
    pub fn to_response(&self, decision: &ThrottleDecision) -> Response<String> {
        let mut response = Response::new(self.message(decision));
        *response.status_mut() = self.status;

        let headers = response.headers_mut();
        if let Ok(value) = decision.retry_after.parse::<http::HeaderValue>() {
            headers.insert(RETRY_AFTER, value);
        }
        headers.insert(
            CONTENT_TYPE,
            http::HeaderValue::from_static("text/plain; charset=utf-8"),
        );

        response
    }
}

mod status_code {
    use http::StatusCode;
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(status: &StatusCode, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u16(status.as_u16())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<StatusCode, D::Error> {
        let code = u16::deserialize(deserializer)?;
        StatusCode::from_u16(code).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::RatePeriod;
    use chrono::Utc;

    fn decision() -> ThrottleDecision {
        ThrottleDecision {
            key: "k".to_string(),
            rate_limit: 3,
            period: RatePeriod::Minute,
            window_start: Utc::now(),
            total_requests: 4,
            retry_after: "42".to_string(),
        }
    }

    #[test]
    fn test_default_response() {
        let response = QuotaExceededResponse::default().to_response(&decision());

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[RETRY_AFTER], "42");
        assert_eq!(
            response.body(),
            "API calls quota exceeded! maximum admitted 3 per minute."
        );
    }

    #[test]
    fn test_custom_status_and_template() {
        let quota = QuotaExceededResponse::new(StatusCode::CONFLICT, "slow down: {limit}/{period}");
        let response = quota.to_response(&decision());

        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert_eq!(response.body(), "slow down: 3/minute");
    }

    #[test]
    fn test_deserialize_from_yaml() {
        let quota: QuotaExceededResponse = serde_yaml::from_str("status: 503\n").unwrap();
        assert_eq!(quota.status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(quota.message_template, DEFAULT_QUOTA_MESSAGE);

        assert!(serde_yaml::from_str::<QuotaExceededResponse>("status: 42\n").is_err());
    }
}

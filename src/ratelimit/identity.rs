//! Request identity resolution.
//!
//! The identity is what the rate limiter keys on: client address, endpoint,
//! client-type key and authenticated user. Client-type classification is
//! injected as a function value so hosts can plug in their own scheme.

use http::header::{HeaderMap, AUTHORIZATION};
use http::Request;
use std::cell::OnceCell;
use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use super::ip::parse_addr;

/// Client key used when the classifier sees no credentials.
pub const ANONYMOUS_CLIENT: &str = "anonymous";

/// Client key used by the default classifier for requests carrying credentials.
pub const AUTHENTICATED_CLIENT: &str = "authenticated";

/// Client address as normalised by the host (for example after proxy handling).
///
/// Insert this as a request extension to take precedence over the peer address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientIp(pub IpAddr);

/// A verified identity attached to the request by the host's auth layer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthenticatedUser {
    pub id: String,
    pub name: Option<String>,
}

impl AuthenticatedUser {
    /// A user with an id and no display name.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    /// Attach a display name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// Identity of one request as seen by the rate limiter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestIdentity {
    /// Client address in string form, if it could be determined
    pub client_ip: Option<String>,
    /// Lower-cased request path
    pub endpoint: String,
    /// Client-type key produced by the classifier
    pub client_key: String,
    /// Authenticated user id
    pub user_id: Option<String>,
    /// Authenticated user name
    pub user_name: Option<String>,
}

impl RequestIdentity {
    /// An anonymous identity for the given address and endpoint.
    pub fn new(client_ip: Option<&str>, endpoint: &str) -> Self {
        Self {
            client_ip: client_ip.map(str::to_string),
            endpoint: endpoint.to_lowercase(),
            client_key: ANONYMOUS_CLIENT.to_string(),
            user_id: None,
            user_name: None,
        }
    }

    /// Set the client-type key.
    pub fn with_client_key(mut self, client_key: impl Into<String>) -> Self {
        self.client_key = client_key.into();
        self
    }

    /// Set the authenticated user.
    pub fn with_user(mut self, user_id: impl Into<String>, user_name: Option<String>) -> Self {
        self.user_id = Some(user_id.into());
        self.user_name = user_name;
        self
    }
}

/// Request headers handed to a classifier without copying them up front.
///
/// Single lookups read the underlying map directly. The owned map is only
/// built if the classifier asks for all headers.
pub struct LazyHeaders<'a> {
    raw: &'a HeaderMap,
    materialized: OnceCell<HashMap<String, String>>,
}

impl<'a> LazyHeaders<'a> {
    pub fn new(raw: &'a HeaderMap) -> Self {
        Self {
            raw,
            materialized: OnceCell::new(),
        }
    }

    /// Value of one header, if present and valid UTF-8.
    pub fn get(&self, name: &str) -> Option<&'a str> {
        let raw: &'a HeaderMap = self.raw;
        raw.get(name).and_then(|value| value.to_str().ok())
    }

    /// Whether a header is present.
    pub fn contains(&self, name: &str) -> bool {
        self.raw.contains_key(name)
    }

    /// All headers as lower-case name to value. Built on first call.
    pub fn all(&self) -> &HashMap<String, String> {
        self.materialized.get_or_init(|| {
            self.raw
                .iter()
                .filter_map(|(name, value)| {
                    value
                        .to_str()
                        .ok()
                        .map(|value| (name.as_str().to_string(), value.to_string()))
                })
                .collect()
        })
    }

    /// Whether [`LazyHeaders::all`] has been called.
    pub fn is_materialized(&self) -> bool {
        self.materialized.get().is_some()
    }
}

type ClassifyFn = dyn Fn(Option<&AuthenticatedUser>, &LazyHeaders<'_>) -> String + Send + Sync;

/// Maps a request's credentials and headers to a client-type key.
///
/// Classifiers must be total: a panic inside one is not contained.
#[derive(Clone)]
pub struct ClientClassifier {
    classify: Arc<ClassifyFn>,
}

impl ClientClassifier {
    /// Wrap a classification function.
    pub fn new<F>(classify: F) -> Self
    where
        F: Fn(Option<&AuthenticatedUser>, &LazyHeaders<'_>) -> String + Send + Sync + 'static,
    {
        Self {
            classify: Arc::new(classify),
        }
    }

    /// Classify one request.
    pub fn classify(&self, user: Option<&AuthenticatedUser>, headers: &LazyHeaders<'_>) -> String {
        (self.classify)(user, headers)
    }
}

impl Default for ClientClassifier {
    /// Authenticated user or `Authorization` header present: `"authenticated"`,
    /// otherwise `"anonymous"`.
    fn default() -> Self {
        Self::new(|user, headers| {
            if user.is_some() || headers.contains(AUTHORIZATION.as_str()) {
                AUTHENTICATED_CLIENT.to_string()
            } else {
                ANONYMOUS_CLIENT.to_string()
            }
        })
    }
}

impl fmt::Debug for ClientClassifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientClassifier").finish_non_exhaustive()
    }
}

/// Derives a [`RequestIdentity`] from an HTTP request.
#[derive(Debug, Clone, Default)]
pub struct IdentityResolver {
    classifier: ClientClassifier,
    trust_forwarded_headers: bool,
}

impl IdentityResolver {
    /// A resolver using the given classifier.
    pub fn new(classifier: ClientClassifier) -> Self {
        Self {
            classifier,
            trust_forwarded_headers: false,
        }
    }

    /// Fall back to `X-Forwarded-For` / `X-Real-IP` when the host supplied no address.
    pub fn trust_forwarded_headers(mut self, trust: bool) -> Self {
        self.trust_forwarded_headers = trust;
        self
    }

    /// Resolve the identity of a request.
    pub fn resolve<B>(&self, request: &Request<B>) -> RequestIdentity {
        let user = request.extensions().get::<AuthenticatedUser>();
        let headers = LazyHeaders::new(request.headers());
        let client_key = self.classifier.classify(user, &headers);

        RequestIdentity {
            client_ip: self.client_ip(request),
            endpoint: request.uri().path().to_lowercase(),
            client_key,
            user_id: user.map(|u| u.id.clone()),
            user_name: user.and_then(|u| u.name.clone()),
        }
    }

    fn client_ip<B>(&self, request: &Request<B>) -> Option<String> {
        let extensions = request.extensions();

        if let Some(ClientIp(ip)) = extensions.get::<ClientIp>() {
            return Some(ip.to_canonical().to_string());
        }

        if let Some(addr) = extensions.get::<SocketAddr>() {
            return Some(addr.ip().to_canonical().to_string());
        }

        if !self.trust_forwarded_headers {
            return None;
        }

        let headers = request.headers();
        let forwarded = headers
            .get("x-forwarded-for")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.split(',').find_map(parse_addr));

        forwarded
            .or_else(|| {
                headers
                    .get("x-real-ip")
                    .and_then(|value| value.to_str().ok())
                    .and_then(parse_addr)
            })
            .map(|ip| ip.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn request(uri: &str) -> http::request::Builder {
        Request::builder().uri(uri)
    }

    #[test]
    fn test_resolve_anonymous_request() {
        let mut req = request("http://example.com/API/Values?id=3").body(()).unwrap();
        req.extensions_mut().insert(ClientIp("10.0.0.7".parse().unwrap()));

        let identity = IdentityResolver::default().resolve(&req);

        assert_eq!(identity.client_ip.as_deref(), Some("10.0.0.7"));
        assert_eq!(identity.endpoint, "/api/values");
        assert_eq!(identity.client_key, ANONYMOUS_CLIENT);
        assert_eq!(identity.user_id, None);
        assert_eq!(identity.user_name, None);
    }

    #[test]
    fn test_resolve_authenticated_user() {
        let mut req = request("/orders").body(()).unwrap();
        req.extensions_mut()
            .insert(AuthenticatedUser::new("u-42").with_name("alice"));

        let identity = IdentityResolver::default().resolve(&req);

        assert_eq!(identity.client_key, AUTHENTICATED_CLIENT);
        assert_eq!(identity.user_id.as_deref(), Some("u-42"));
        assert_eq!(identity.user_name.as_deref(), Some("alice"));
    }

    #[test]
    fn test_user_without_name_or_header_is_authenticated() {
        let mut req = request("/orders").body(()).unwrap();
        req.extensions_mut().insert(AuthenticatedUser::new("u-7"));

        let identity = IdentityResolver::default().resolve(&req);

        assert_eq!(identity.client_key, AUTHENTICATED_CLIENT);
        assert_eq!(identity.user_id.as_deref(), Some("u-7"));
        assert_eq!(identity.user_name, None);
    }

    #[test]
    fn test_authorization_header_without_verified_user() {
        let req = request("/orders")
            .header("Authorization", "Bearer abc")
            .body(())
            .unwrap();

        let identity = IdentityResolver::default().resolve(&req);

        // Classified as authenticated, but no verified identity
        assert_eq!(identity.client_key, AUTHENTICATED_CLIENT);
        assert_eq!(identity.user_id, None);
    }

    #[test]
    fn test_peer_address_fallback() {
        let mut req = request("/").body(()).unwrap();
        req.extensions_mut()
            .insert("[::ffff:192.168.1.9]:4040".parse::<SocketAddr>().unwrap());

        let identity = IdentityResolver::default().resolve(&req);
        assert_eq!(identity.client_ip.as_deref(), Some("192.168.1.9"));
    }

    #[test]
    fn test_forwarded_headers_only_when_trusted() {
        let req = request("/")
            .header("X-Forwarded-For", "unknown, 203.0.113.9, 10.0.0.1")
            .body(())
            .unwrap();

        assert_eq!(IdentityResolver::default().resolve(&req).client_ip, None);

        let resolver = IdentityResolver::default().trust_forwarded_headers(true);
        assert_eq!(
            resolver.resolve(&req).client_ip.as_deref(),
            Some("203.0.113.9")
        );

        let req = request("/").header("X-Real-IP", "198.51.100.4").body(()).unwrap();
        assert_eq!(
            resolver.resolve(&req).client_ip.as_deref(),
            Some("198.51.100.4")
        );
    }

    #[test]
    fn test_custom_classifier_runs_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let classifier = ClientClassifier::new(move |_, headers| {
            counter.fetch_add(1, Ordering::SeqCst);
            headers.get("x-api-key").unwrap_or(ANONYMOUS_CLIENT).to_string()
        });

        let req = request("/").header("X-Api-Key", "partner-7").body(()).unwrap();
        let identity = IdentityResolver::new(classifier).resolve(&req);

        assert_eq!(identity.client_key, "partner-7");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_lazy_headers_materialize_on_demand() {
        let mut raw = HeaderMap::new();
        raw.insert("x-tier", "gold".parse().unwrap());

        let headers = LazyHeaders::new(&raw);
        assert_eq!(headers.get("x-tier"), Some("gold"));
        assert!(!headers.is_materialized());

        assert_eq!(headers.all().get("x-tier").map(String::as_str), Some("gold"));
        assert!(headers.is_materialized());
    }
}

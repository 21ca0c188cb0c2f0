//! Rate limiting logic: policy model, identities, keys and the decision engine.

mod clock;
mod counter;
mod identity;
pub mod ip;
mod key;
mod limiter;
mod policy;

pub use clock::{Clock, GraceWindow, ManualClock, SystemClock, DEFAULT_GRACE_PERIOD};
pub use counter::{RatePeriod, ThrottleCounter};
pub use identity::{
    AuthenticatedUser, ClientClassifier, ClientIp, IdentityResolver, LazyHeaders, RequestIdentity,
    ANONYMOUS_CLIENT, AUTHENTICATED_CLIENT,
};
pub use key::{ThrottleKey, DEFAULT_NAMESPACE};
pub use limiter::{retry_after, Admission, CountingMode, RateLimiter, RateLimiterBuilder, ThrottleDecision};
pub use policy::{Dimensions, RateLimits, ThrottlePolicy};

//! Gatekeeper - in-process admission control
//!
//! This crate decides whether an inbound request may proceed or must be
//! rejected because a call-rate budget is exhausted. Requests are throttled
//! along independent dimensions (client IP, client type, user, endpoint),
//! with per-period default limits, override rules and whitelists. Counters
//! live in a pluggable store: a local map, a TTL cache, or Redis for fleets.

pub mod config;
pub mod error;
pub mod policy_store;
pub mod ratelimit;
pub mod response;
pub mod store;
pub mod throttle_log;

//! Harness — the reliability and trust fabric shared by every housekeep
//! service replica.
//!
//! This crate is the runtime seam between service logic and everything that
//! can fail or lie to it:
//! - Sliding-window rate limiting backed by the shared substrate, so limits
//!   hold across replicas (fail-open on substrate outage)
//! - Circuit breakers with a process-local registry, protecting the scoring
//!   path, the storage path, and every external adapter (fail-fast)
//! - Service-to-service trust: static API keys and HMAC-signed requests with
//!   replay defence, plus the fixed per-service permission map
//! - Cooperative shutdown coordination for background workers

pub mod circuit_breaker;
pub mod rate_limiter;
pub mod service_keys;
pub mod shutdown;
pub mod signing;

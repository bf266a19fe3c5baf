//! Tower middleware for the shared HTTP stack.
//!
//! Layer order is fixed across services (outermost first):
//! metrics → rate-limit → request tracing → authentication.

pub mod rate_limit;
pub mod service_auth;

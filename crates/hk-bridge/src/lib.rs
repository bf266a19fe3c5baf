//! HTTP surface shared by the housekeep services.
//!
//! Every service binds the same stack, in the same order: metrics first,
//! then rate limiting, then request tracing, then authentication. On top of
//! it sit the auth endpoints, webhook ingress, and the health/metrics
//! surface. Errors anywhere in the stack map to the one [`api_error::ApiError`]
//! shape, which never tells a caller whether an account exists or which
//! credential field was wrong.

pub mod api_error;
pub mod extract;
pub mod health;
pub mod middleware;
pub mod routes;
pub mod state;

//! Router assembly.

use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

use hk_harness::rate_limiter::platform_limits;
use hk_harness::service_keys::Permission;

use crate::health;
use crate::middleware::rate_limit::RateLimitLayer;
use crate::middleware::service_auth::ServiceAuthLayer;
use crate::state::AppState;

pub mod auth;
pub mod webhooks;

/// Build the shared router over an [`AppState`].
///
/// Layer order (outermost first): metrics → rate-limit → tracing → auth.
/// Service-only admin routes carry their own auth layer with the required
/// permission; user-facing routes authenticate per handler via extractors.
pub fn build_router(state: AppState) -> Router {
    let admin = Router::new()
        .route("/webhooks/intakes/{id}", get(webhooks::get_intake))
        .route("/webhooks/intakes/{id}/retry", post(webhooks::retry_intake))
        .layer(ServiceAuthLayer::new(state.keyring.clone()).require(Permission::PublishEvents));

    let limits = platform_limits(&state.config.rate_limits);

    Router::new()
        .route("/health", get(health::liveness))
        .route("/health/detailed", get(health::detailed))
        .route("/ready", get(health::detailed))
        .route("/metrics", get(health::metrics))
        .route("/auth/login", post(auth::login))
        .route("/auth/refresh", post(auth::refresh))
        .route("/auth/logout", post(auth::logout))
        .route("/auth/mfa/enable", post(auth::mfa_enable))
        .route("/auth/mfa/verify", post(auth::mfa_verify))
        .route("/webhooks/{source}", post(webhooks::receive))
        .merge(admin)
        .layer(TraceLayer::new_for_http())
        .layer(RateLimitLayer::new(state.limiter.clone(), limits))
        .layer(axum::middleware::from_fn(
            hk_telemetry::middleware::track_requests,
        ))
        .with_state(state)
}

//! Application-scope runtime state.
//!
//! One [`AppState`] owns every shared component for the lifetime of the
//! server and hands them to handlers by injection. Tests build it over the
//! in-memory substrate and stores; deployments wire Redis and Postgres in
//! `hk-server`.

use std::sync::Arc;

use hk_auth::credentials::CredentialService;
use hk_auth::sessions::SessionService;
use hk_core::config::Config;
use hk_events::webhook::WebhookIngress;
use hk_harness::circuit_breaker::BreakerRegistry;
use hk_harness::rate_limiter::RateLimiter;
use hk_harness::service_keys::ServiceKeyring;
use hk_substrate::Substrate;

use crate::health::DependencyProbe;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub substrate: Arc<dyn Substrate>,
    pub limiter: Arc<RateLimiter>,
    pub breakers: Arc<BreakerRegistry>,
    pub keyring: Arc<ServiceKeyring>,
    pub credentials: Arc<CredentialService>,
    pub sessions: Arc<SessionService>,
    pub webhooks: Arc<WebhookIngress>,
    /// Readiness probes beyond the substrate (relational store, adapters).
    pub probes: Arc<Vec<Arc<dyn DependencyProbe>>>,
}

impl AppState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<Config>,
        substrate: Arc<dyn Substrate>,
        breakers: Arc<BreakerRegistry>,
        keyring: Arc<ServiceKeyring>,
        credentials: Arc<CredentialService>,
        sessions: Arc<SessionService>,
        webhooks: Arc<WebhookIngress>,
        probes: Vec<Arc<dyn DependencyProbe>>,
    ) -> Self {
        Self {
            limiter: Arc::new(RateLimiter::new(substrate.clone())),
            config,
            substrate,
            breakers,
            keyring,
            credentials,
            sessions,
            webhooks,
            probes: Arc::new(probes),
        }
    }
}

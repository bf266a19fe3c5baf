//! Service entrypoint.
//!
//! Loads configuration from the environment (a `.env` file is honoured),
//! refuses to start misconfigured in production, wires the runtime — the
//! substrate, the credential and session stores, the webhook ingress, the
//! breaker registry — into the shared router, and serves it with graceful
//! shutdown: on SIGTERM the background workers drain before the process
//! exits.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::{info, warn};

use hk_auth::credentials::CredentialService;
use hk_auth::crypto::SecretCipher;
use hk_auth::pg::PgAuthStore;
use hk_auth::sessions::{run_session_sweeper, SessionService};
use hk_auth::store::{AuditSink, CredentialStore, MemoryAuthStore, SessionStore};
use hk_auth::tokens::TokenService;
use hk_bridge::health::DependencyProbe;
use hk_bridge::routes::build_router;
use hk_bridge::state::AppState;
use hk_core::config::Config;
use hk_events::publisher::EventPublisher;
use hk_events::schema::SchemaRegistry;
use hk_events::webhook::{run_retry_worker, MemoryIntakeStore, WebhookIngress};
use hk_harness::circuit_breaker::BreakerRegistry;
use hk_harness::service_keys::ServiceKeyring;
use hk_harness::shutdown::{ShutdownGuard, ShutdownSignal};
use hk_substrate::{MemorySubstrate, RedisSubstrate, Substrate};

/// Worker loops participating in graceful drain.
const BACKGROUND_WORKERS: usize = 3;
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const RETRY_INTERVAL: Duration = Duration::from_secs(15);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // A broken configuration is a startup failure, not a degraded run.
    let config = match Config::from_env() {
        Ok(config) => Arc::new(config),
        Err(e) => {
            eprintln!("configuration rejected: {e}");
            std::process::exit(1);
        }
    };

    let default_level = if config.service.debug { "debug" } else { "info" };
    hk_telemetry::logging::init(config.service.name, config.service.environment, default_level);

    info!(
        service = config.service.name.as_str(),
        environment = config.service.environment.as_str(),
        "starting"
    );

    // --- substrate ---
    let substrate: Arc<dyn Substrate> = match RedisSubstrate::connect(
        &config.substrate.url,
        config.substrate.pool_size,
        config.substrate.op_timeout,
    ) {
        Ok(redis) => Arc::new(redis),
        Err(e) if config.service.debug => {
            warn!(error = %e, "substrate unreachable, using in-memory fallback (debug mode)");
            Arc::new(MemorySubstrate::new())
        }
        Err(e) => {
            eprintln!("substrate connection failed: {e}");
            std::process::exit(1);
        }
    };

    // --- relational store ---
    let (credential_store, session_store, audit_sink, probes) =
        connect_stores(&config).await?;

    // --- auth services ---
    let cipher = SecretCipher::from_secret(&config.security.jwt_secret);
    let credentials = Arc::new(
        CredentialService::new(
            credential_store,
            audit_sink,
            config.auth.clone(),
            cipher,
        )
        .await
        .context("credential service init")?,
    );
    let tokens = Arc::new(TokenService::new(
        &config.security.jwt_secret,
        chrono::Duration::hours(config.auth.session_expire_hours),
        chrono::Duration::days(config.auth.refresh_expire_days),
    ));
    let sessions = Arc::new(SessionService::new(
        session_store,
        tokens,
        config.auth.clone(),
    ));

    // --- event fabric and webhook ingress ---
    let publisher = Arc::new(EventPublisher::new(
        substrate.clone(),
        Arc::new(SchemaRegistry::platform()),
        config.service.name,
    ));
    let ingress = Arc::new(WebhookIngress::new(
        Arc::new(MemoryIntakeStore::new()),
        publisher,
        config.webhooks.require_https,
        config.webhooks.max_payload_bytes,
    ));

    // --- runtime state and router ---
    let breakers = Arc::new(BreakerRegistry::with_platform_defaults());
    let keyring = Arc::new(ServiceKeyring::from_config(&config.security));
    let state = AppState::new(
        config.clone(),
        substrate,
        breakers,
        keyring,
        credentials.clone(),
        sessions.clone(),
        ingress.clone(),
        probes,
    );
    let router = build_router(state);

    // --- background workers ---
    let shutdown = ShutdownSignal::new();
    tokio::spawn(run_session_sweeper(
        sessions,
        SWEEP_INTERVAL,
        shutdown.clone(),
    ));
    tokio::spawn(run_retry_worker(ingress, RETRY_INTERVAL, shutdown.clone()));
    tokio::spawn(run_lock_cleanup(credentials, shutdown.clone()));

    // --- serve ---
    let addr = format!("{}:{}", config.service.host, config.service.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(%addr, "listening");

    let signal = shutdown.clone();
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            wait_for_termination().await;
            signal.trigger();
        })
        .await
        .context("server error")?;

    let mut shutdown = shutdown;
    let drained = shutdown
        .wait_for_drain(BACKGROUND_WORKERS, Duration::from_secs(10))
        .await;
    info!(drained, "shutdown complete");
    Ok(())
}

// ---------------------------------------------------------------------------
// Store wiring
// ---------------------------------------------------------------------------

struct PgProbe(Arc<PgAuthStore>);

#[async_trait::async_trait]
impl DependencyProbe for PgProbe {
    fn name(&self) -> &str {
        "database"
    }

    async fn check(&self) -> Result<(), String> {
        self.0.ping().await.map_err(|e| e.to_string())
    }
}

type Stores = (
    Arc<dyn CredentialStore>,
    Arc<dyn SessionStore>,
    Arc<dyn AuditSink>,
    Vec<Arc<dyn DependencyProbe>>,
);

/// Postgres in every environment; in debug mode a connection failure falls
/// back to the in-memory store so the service stays explorable offline.
async fn connect_stores(config: &Config) -> anyhow::Result<Stores> {
    match PgAuthStore::connect(&config.database).await {
        Ok(store) => {
            store.migrate().await.context("schema migration")?;
            let store = Arc::new(store);
            let probe: Arc<dyn DependencyProbe> = Arc::new(PgProbe(store.clone()));
            Ok((store.clone(), store.clone(), store, vec![probe]))
        }
        Err(e) if config.service.debug => {
            warn!(error = %e, "database unreachable, using in-memory stores (debug mode)");
            let store = Arc::new(MemoryAuthStore::new());
            Ok((store.clone(), store.clone(), store, Vec::new()))
        }
        Err(e) => {
            eprintln!("database connection failed: {e}");
            std::process::exit(1);
        }
    }
}

// ---------------------------------------------------------------------------
// Lock cleanup worker
// ---------------------------------------------------------------------------

async fn run_lock_cleanup(credentials: Arc<CredentialService>, shutdown: ShutdownSignal) {
    let _guard = ShutdownGuard::new(shutdown.clone());
    let mut rx = shutdown.subscribe();

    loop {
        tokio::select! {
            _ = tokio::time::sleep(SWEEP_INTERVAL) => {
                match credentials.cleanup_expired_locks().await {
                    Ok(0) => {}
                    Ok(n) => info!(count = n, "expired credential locks cleared"),
                    Err(e) => warn!(error = %e, "lock cleanup failed"),
                }
            }
            _ = rx.recv() => return,
        }
    }
}

// ---------------------------------------------------------------------------
// Signals
// ---------------------------------------------------------------------------

async fn wait_for_termination() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("ctrl-c received"),
        _ = terminate => info!("SIGTERM received"),
    }
}

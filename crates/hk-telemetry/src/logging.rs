//! Structured logging, wired to the platform's environment model.
//!
//! One entry point for every service: development and test get
//! human-readable lines, staging and production get JSON for the log
//! shipper. The first line announces the service identity so multi-service
//! log streams stay attributable. Loggers receive ids and outcomes only —
//! never credentials, tokens, or payloads.

use tracing_subscriber::{fmt, EnvFilter};

use hk_core::config::Environment;
use hk_core::types::ServiceName;

/// Initialise logging for `service` in `environment`.
///
/// `RUST_LOG` takes precedence over `default_level` (e.g. "info",
/// "hk_auth=debug,warn"). Safe to call repeatedly — later calls (tests,
/// embedded runtimes) are no-ops and stay silent.
pub fn init(service: ServiceName, environment: Environment, default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let installed = match environment {
        Environment::Production | Environment::Staging => fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .with_file(true)
            .with_line_number(true)
            .try_init()
            .is_ok(),
        Environment::Development | Environment::Test => fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_thread_ids(false)
            .with_file(true)
            .with_line_number(true)
            .try_init()
            .is_ok(),
    };

    if installed {
        tracing::info!(
            service = service.as_str(),
            environment = environment.as_str(),
            version = env!("CARGO_PKG_VERSION"),
            format = if environment.is_production() || environment == Environment::Staging {
                "json"
            } else {
                "human"
            },
            "logging initialised"
        );
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

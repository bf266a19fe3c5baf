//! Liveness and readiness surface.
//!
//! `/health` answers as long as the process can. `/health/detailed` (and its
//! `/ready` alias) aggregates the substrate, every registered dependency
//! probe, and the breaker registry into `healthy` / `degraded` / `error`.

use async_trait::async_trait;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::json;

use crate::state::AppState;

// ---------------------------------------------------------------------------
// Probes
// ---------------------------------------------------------------------------

/// A named readiness dependency (relational store, external adapter).
#[async_trait]
pub trait DependencyProbe: Send + Sync {
    fn name(&self) -> &str;

    /// `Ok` when reachable; `Err` carries a short reason.
    async fn check(&self) -> Result<(), String>;
}

// ---------------------------------------------------------------------------
// Report
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OverallStatus {
    Healthy,
    /// A dependency is unhealthy but the service still answers.
    Degraded,
    /// A dependency is unreachable.
    Error,
}

#[derive(Debug, Serialize)]
pub struct DependencyReport {
    pub name: String,
    pub healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct HealthReport {
    pub status: OverallStatus,
    pub service: String,
    pub version: String,
    pub environment: String,
    pub dependencies: Vec<DependencyReport>,
    pub open_breakers: Vec<String>,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// Plain liveness: the process is up.
pub async fn liveness() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

/// Aggregated readiness.
pub async fn detailed(State(state): State<AppState>) -> Response {
    let mut dependencies = Vec::new();
    let mut unreachable = false;

    match state.substrate.ping().await {
        Ok(()) => dependencies.push(DependencyReport {
            name: "substrate".into(),
            healthy: true,
            detail: None,
        }),
        Err(e) => {
            unreachable = true;
            dependencies.push(DependencyReport {
                name: "substrate".into(),
                healthy: false,
                detail: Some(e.to_string()),
            });
        }
    }

    for probe in state.probes.iter() {
        match probe.check().await {
            Ok(()) => dependencies.push(DependencyReport {
                name: probe.name().to_string(),
                healthy: true,
                detail: None,
            }),
            Err(reason) => {
                unreachable = true;
                dependencies.push(DependencyReport {
                    name: probe.name().to_string(),
                    healthy: false,
                    detail: Some(reason),
                });
            }
        }
    }

    let open_breakers = state.breakers.unhealthy().await;

    let status = if unreachable {
        OverallStatus::Error
    } else if !open_breakers.is_empty() {
        OverallStatus::Degraded
    } else {
        OverallStatus::Healthy
    };

    let report = HealthReport {
        status,
        service: state.config.service.name.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        environment: state.config.service.environment.as_str().to_string(),
        dependencies,
        open_breakers,
    };

    let code = match status {
        OverallStatus::Healthy | OverallStatus::Degraded => StatusCode::OK,
        OverallStatus::Error => StatusCode::SERVICE_UNAVAILABLE,
    };
    (code, Json(report)).into_response()
}

/// Prometheus text exposition, with breaker gauges refreshed on scrape.
pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    let collector = hk_telemetry::metrics::global_metrics();
    state.breakers.export_gauges(collector).await;
    collector.set_service_info(
        state.config.service.name.as_str(),
        env!("CARGO_PKG_VERSION"),
        state.config.service.environment.as_str(),
    );
    collector.export_prometheus()
}

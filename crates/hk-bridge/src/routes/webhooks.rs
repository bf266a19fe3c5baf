//! Webhook ingress and admin endpoints.

use std::collections::HashMap;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::Json;
use serde_json::{json, Value};

use crate::api_error::ApiError;
use crate::state::AppState;

fn header_map(headers: &HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}

/// Whether the call arrived over HTTPS, as seen through the proxy chain.
fn is_https(headers: &HeaderMap) -> bool {
    headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .map(|proto| proto.eq_ignore_ascii_case("https"))
        .unwrap_or(false)
}

/// Declared event kind, read from the payload's conventional fields.
fn declared_kind(body: &[u8]) -> String {
    serde_json::from_slice::<Value>(body)
        .ok()
        .and_then(|v| {
            v.get("type")
                .or_else(|| v.get("event_type"))
                .or_else(|| v.get("eventType"))
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or_else(|| "unknown".to_string())
}

/// `POST /webhooks/{source}` — inbound hook intake.
pub async fn receive(
    State(state): State<AppState>,
    Path(source): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let kind = declared_kind(&body);
    let outcome = state
        .webhooks
        .receive(&source, &kind, header_map(&headers), &body, is_https(&headers))
        .await?;

    Ok(Json(json!({
        "status": outcome.status.as_str(),
        "event_id": outcome.intake_id,
        "replayed": outcome.replayed,
        "response": outcome.response,
    })))
}

/// `GET /webhooks/intakes/{id}` — intake details for operators.
pub async fn get_intake(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let intake = state
        .webhooks
        .intake(&id)
        .await?
        .ok_or_else(|| ApiError::NotFound("webhook intake".into()))?;

    Ok(Json(json!({
        "id": intake.id,
        "source": intake.source,
        "declared_kind": intake.declared_kind,
        "status": intake.status.as_str(),
        "attempts": intake.attempts,
        "error": intake.error,
        "created_at": intake.created_at.to_rfc3339(),
        "processed_at": intake.processed_at.map(|t| t.to_rfc3339()),
    })))
}

/// `POST /webhooks/intakes/{id}/retry` — force one more attempt.
pub async fn retry_intake(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let intake = state
        .webhooks
        .retry_one(&id)
        .await?
        .ok_or_else(|| ApiError::NotFound("webhook intake".into()))?;

    Ok(Json(json!({
        "id": intake.id,
        "status": intake.status.as_str(),
        "attempts": intake.attempts,
        "error": intake.error,
    })))
}

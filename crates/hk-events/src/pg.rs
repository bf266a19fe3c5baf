//! Postgres-backed webhook intake storage.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{PgPool, Row};

use crate::webhook::{IntakeStatus, IntakeStore, WebhookError, WebhookIntake};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS webhook_intakes (
    id              TEXT PRIMARY KEY,
    source          TEXT NOT NULL,
    declared_kind   TEXT NOT NULL,
    headers         JSONB NOT NULL DEFAULT '{}',
    body            JSONB NOT NULL,
    body_hash       TEXT NOT NULL,
    idempotency_key TEXT NOT NULL,
    status          TEXT NOT NULL,
    attempts        INTEGER NOT NULL DEFAULT 0,
    error           TEXT,
    response        JSONB,
    next_retry_at   TIMESTAMPTZ,
    created_at      TIMESTAMPTZ NOT NULL,
    processed_at    TIMESTAMPTZ,
    UNIQUE (source, idempotency_key)
);
CREATE INDEX IF NOT EXISTS webhook_retry_idx
    ON webhook_intakes (next_retry_at) WHERE status = 'failed'
"#;

pub struct PgIntakeStore {
    pool: PgPool,
}

impl PgIntakeStore {
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), WebhookError> {
        for statement in SCHEMA.split(';').filter(|s| !s.trim().is_empty()) {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| WebhookError::Store(e.to_string()))?;
        }
        Ok(())
    }
}

fn status_str(status: IntakeStatus) -> &'static str {
    status.as_str()
}

fn status_from(raw: &str) -> IntakeStatus {
    match raw {
        "processing" => IntakeStatus::Processing,
        "completed" => IntakeStatus::Completed,
        "failed" => IntakeStatus::Failed,
        _ => IntakeStatus::Received,
    }
}

fn intake_from_row(row: &sqlx::postgres::PgRow) -> WebhookIntake {
    let headers: Value = row.get("headers");
    let headers: HashMap<String, String> = headers
        .as_object()
        .map(|o| {
            o.iter()
                .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                .collect()
        })
        .unwrap_or_default();

    WebhookIntake {
        id: row.get("id"),
        source: row.get("source"),
        declared_kind: row.get("declared_kind"),
        headers,
        body: row.get("body"),
        body_hash: row.get("body_hash"),
        idempotency_key: row.get("idempotency_key"),
        status: status_from(row.get::<String, _>("status").as_str()),
        attempts: row.get::<i32, _>("attempts") as u32,
        error: row.get("error"),
        response: row.get("response"),
        next_retry_at: row.get("next_retry_at"),
        created_at: row.get("created_at"),
        processed_at: row.get("processed_at"),
    }
}

#[async_trait]
impl IntakeStore for PgIntakeStore {
    async fn insert(&self, intake: WebhookIntake) -> Result<(), WebhookError> {
        let headers = serde_json::to_value(&intake.headers)
            .map_err(|e| WebhookError::Store(e.to_string()))?;
        sqlx::query(
            r#"INSERT INTO webhook_intakes
               (id, source, declared_kind, headers, body, body_hash, idempotency_key,
                status, attempts, error, response, next_retry_at, created_at, processed_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)"#,
        )
        .bind(&intake.id)
        .bind(&intake.source)
        .bind(&intake.declared_kind)
        .bind(headers)
        .bind(&intake.body)
        .bind(&intake.body_hash)
        .bind(&intake.idempotency_key)
        .bind(status_str(intake.status))
        .bind(intake.attempts as i32)
        .bind(&intake.error)
        .bind(&intake.response)
        .bind(intake.next_retry_at)
        .bind(intake.created_at)
        .bind(intake.processed_at)
        .execute(&self.pool)
        .await
        .map_err(|e| WebhookError::Store(e.to_string()))?;
        Ok(())
    }

    async fn fetch(&self, id: &str) -> Result<Option<WebhookIntake>, WebhookError> {
        let row = sqlx::query("SELECT * FROM webhook_intakes WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| WebhookError::Store(e.to_string()))?;
        Ok(row.as_ref().map(intake_from_row))
    }

    async fn find_by_key(
        &self,
        source: &str,
        idempotency_key: &str,
    ) -> Result<Option<WebhookIntake>, WebhookError> {
        let row = sqlx::query(
            "SELECT * FROM webhook_intakes WHERE source = $1 AND idempotency_key = $2",
        )
        .bind(source)
        .bind(idempotency_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| WebhookError::Store(e.to_string()))?;
        Ok(row.as_ref().map(intake_from_row))
    }

    async fn update(&self, intake: &WebhookIntake) -> Result<(), WebhookError> {
        sqlx::query(
            r#"UPDATE webhook_intakes SET
               status = $2, attempts = $3, error = $4, response = $5,
               next_retry_at = $6, processed_at = $7
               WHERE id = $1"#,
        )
        .bind(&intake.id)
        .bind(status_str(intake.status))
        .bind(intake.attempts as i32)
        .bind(&intake.error)
        .bind(&intake.response)
        .bind(intake.next_retry_at)
        .bind(intake.processed_at)
        .execute(&self.pool)
        .await
        .map_err(|e| WebhookError::Store(e.to_string()))?;
        Ok(())
    }

    async fn due_for_retry(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<WebhookIntake>, WebhookError> {
        let rows = sqlx::query(
            r#"SELECT * FROM webhook_intakes
               WHERE status = 'failed' AND next_retry_at IS NOT NULL AND next_retry_at <= $1
               ORDER BY next_retry_at ASC LIMIT $2"#,
        )
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| WebhookError::Store(e.to_string()))?;
        Ok(rows.iter().map(intake_from_row).collect())
    }
}

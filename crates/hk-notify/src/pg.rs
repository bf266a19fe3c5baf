//! Postgres-backed notification log.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};

use hk_core::types::ServiceName;

use crate::pipeline::{LogStatus, NotificationLog, NotificationLogStore, NotifyError};
use crate::template::Channel;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS notification_logs (
    id             TEXT PRIMARY KEY,
    kind           TEXT NOT NULL,
    channel        TEXT NOT NULL,
    recipient      TEXT NOT NULL,
    rendered_title TEXT,
    rendered_body  TEXT NOT NULL,
    status         TEXT NOT NULL,
    attempts       INTEGER NOT NULL DEFAULT 0,
    error          TEXT,
    correlation_id TEXT,
    service_origin TEXT NOT NULL,
    next_retry_at  TIMESTAMPTZ,
    created_at     TIMESTAMPTZ NOT NULL,
    updated_at     TIMESTAMPTZ NOT NULL
);
CREATE INDEX IF NOT EXISTS notification_idem_idx
    ON notification_logs (correlation_id, channel, recipient) WHERE status = 'sent';
CREATE INDEX IF NOT EXISTS notification_retry_idx
    ON notification_logs (next_retry_at) WHERE status = 'retry'
"#;

pub struct PgLogStore {
    pool: PgPool,
}

impl PgLogStore {
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), NotifyError> {
        for statement in SCHEMA.split(';').filter(|s| !s.trim().is_empty()) {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| NotifyError::Store(e.to_string()))?;
        }
        Ok(())
    }
}

fn channel_from(raw: &str) -> Channel {
    match raw {
        "email" => Channel::Email,
        "sms" => Channel::Sms,
        _ => Channel::Messenger,
    }
}

fn status_from(raw: &str) -> LogStatus {
    match raw {
        "sent" => LogStatus::Sent,
        "retry" => LogStatus::Retry,
        "failed" => LogStatus::Failed,
        "skipped" => LogStatus::Skipped,
        _ => LogStatus::Pending,
    }
}

fn log_from_row(row: &sqlx::postgres::PgRow) -> NotificationLog {
    let origin: String = row.get("service_origin");
    NotificationLog {
        id: row.get("id"),
        kind: row.get("kind"),
        channel: channel_from(row.get::<String, _>("channel").as_str()),
        recipient: row.get("recipient"),
        rendered_title: row.get("rendered_title"),
        rendered_body: row.get("rendered_body"),
        status: status_from(row.get::<String, _>("status").as_str()),
        attempts: row.get::<i32, _>("attempts") as u32,
        error: row.get("error"),
        correlation_id: row.get("correlation_id"),
        service_origin: origin
            .parse()
            .unwrap_or(ServiceName::NotificationService),
        next_retry_at: row.get("next_retry_at"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

#[async_trait]
impl NotificationLogStore for PgLogStore {
    async fn insert(&self, log: NotificationLog) -> Result<(), NotifyError> {
        sqlx::query(
            r#"INSERT INTO notification_logs
               (id, kind, channel, recipient, rendered_title, rendered_body, status,
                attempts, error, correlation_id, service_origin, next_retry_at,
                created_at, updated_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)"#,
        )
        .bind(&log.id)
        .bind(&log.kind)
        .bind(log.channel.as_str())
        .bind(&log.recipient)
        .bind(&log.rendered_title)
        .bind(&log.rendered_body)
        .bind(log.status.as_str())
        .bind(log.attempts as i32)
        .bind(&log.error)
        .bind(&log.correlation_id)
        .bind(log.service_origin.as_str())
        .bind(log.next_retry_at)
        .bind(log.created_at)
        .bind(log.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| NotifyError::Store(e.to_string()))?;
        Ok(())
    }

    async fn update(&self, log: &NotificationLog) -> Result<(), NotifyError> {
        sqlx::query(
            r#"UPDATE notification_logs SET
               status = $2, attempts = $3, error = $4, next_retry_at = $5, updated_at = $6
               WHERE id = $1"#,
        )
        .bind(&log.id)
        .bind(log.status.as_str())
        .bind(log.attempts as i32)
        .bind(&log.error)
        .bind(log.next_retry_at)
        .bind(log.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| NotifyError::Store(e.to_string()))?;
        Ok(())
    }

    async fn already_sent(
        &self,
        correlation_id: &str,
        channel: Channel,
        recipient: &str,
    ) -> Result<bool, NotifyError> {
        let row = sqlx::query(
            r#"SELECT EXISTS (
                   SELECT 1 FROM notification_logs
                   WHERE correlation_id = $1 AND channel = $2 AND recipient = $3
                     AND status = 'sent'
               ) AS sent"#,
        )
        .bind(correlation_id)
        .bind(channel.as_str())
        .bind(recipient)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| NotifyError::Store(e.to_string()))?;
        Ok(row.get("sent"))
    }

    async fn due_for_retry(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<NotificationLog>, NotifyError> {
        let rows = sqlx::query(
            r#"SELECT * FROM notification_logs
               WHERE status = 'retry' AND next_retry_at IS NOT NULL AND next_retry_at <= $1
               ORDER BY next_retry_at ASC LIMIT $2"#,
        )
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| NotifyError::Store(e.to_string()))?;
        Ok(rows.iter().map(log_from_row).collect())
    }
}

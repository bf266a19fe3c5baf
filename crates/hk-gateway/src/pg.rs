//! Postgres-backed conversation session storage.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};

use hk_core::types::{ExternalId, UserId};

use crate::session::{
    ConversationSession, GatewaySessionStore, SessionAuth, SessionStoreError,
};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS bot_sessions (
    external_id      TEXT PRIMARY KEY,
    state_key        TEXT NOT NULL,
    state_payload    JSONB NOT NULL DEFAULT '{}',
    access_token     TEXT,
    token_expires_at TIMESTAMPTZ,
    user_id          BIGINT,
    role             TEXT,
    username         TEXT,
    first_name       TEXT,
    last_name        TEXT,
    language         TEXT NOT NULL,
    version          BIGINT NOT NULL,
    last_activity    TIMESTAMPTZ NOT NULL,
    expires_at       TIMESTAMPTZ NOT NULL,
    active           BOOLEAN NOT NULL
);
CREATE INDEX IF NOT EXISTS bot_sessions_expiry_idx ON bot_sessions (expires_at) WHERE active
"#;

pub struct PgGatewayStore {
    pool: PgPool,
}

impl PgGatewayStore {
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), SessionStoreError> {
        for statement in SCHEMA.split(';').filter(|s| !s.trim().is_empty()) {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| SessionStoreError::Unavailable(e.to_string()))?;
        }
        Ok(())
    }
}

fn session_from_row(row: &sqlx::postgres::PgRow) -> ConversationSession {
    ConversationSession {
        external_id: ExternalId(row.get("external_id")),
        state_key: row.get("state_key"),
        state_payload: row
            .get::<serde_json::Value, _>("state_payload")
            .as_object()
            .cloned()
            .unwrap_or_default(),
        auth: SessionAuth {
            access_token: row.get("access_token"),
            token_expires_at: row.get("token_expires_at"),
            user_id: row.get::<Option<i64>, _>("user_id").map(UserId),
            role: row
                .get::<Option<String>, _>("role")
                .and_then(|r| serde_json::from_value(serde_json::Value::String(r)).ok()),
        },
        username: row.get("username"),
        first_name: row.get("first_name"),
        last_name: row.get("last_name"),
        language: row.get("language"),
        version: row.get::<i64, _>("version") as u64,
        last_activity: row.get("last_activity"),
        expires_at: row.get("expires_at"),
        active: row.get("active"),
    }
}

#[async_trait]
impl GatewaySessionStore for PgGatewayStore {
    async fn fetch(
        &self,
        external_id: &ExternalId,
    ) -> Result<Option<ConversationSession>, SessionStoreError> {
        let row = sqlx::query("SELECT * FROM bot_sessions WHERE external_id = $1")
            .bind(external_id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| SessionStoreError::Unavailable(e.to_string()))?;
        Ok(row.as_ref().map(session_from_row))
    }

    async fn upsert(&self, session: &ConversationSession) -> Result<(), SessionStoreError> {
        let payload = serde_json::Value::Object(session.state_payload.clone());
        let role = session
            .auth
            .role
            .and_then(|r| serde_json::to_value(r).ok())
            .and_then(|v| v.as_str().map(str::to_string));

        sqlx::query(
            r#"INSERT INTO bot_sessions
               (external_id, state_key, state_payload, access_token, token_expires_at,
                user_id, role, username, first_name, last_name, language, version,
                last_activity, expires_at, active)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
               ON CONFLICT (external_id) DO UPDATE SET
                 state_key = EXCLUDED.state_key,
                 state_payload = EXCLUDED.state_payload,
                 access_token = EXCLUDED.access_token,
                 token_expires_at = EXCLUDED.token_expires_at,
                 user_id = EXCLUDED.user_id,
                 role = EXCLUDED.role,
                 username = EXCLUDED.username,
                 first_name = EXCLUDED.first_name,
                 last_name = EXCLUDED.last_name,
                 language = EXCLUDED.language,
                 version = EXCLUDED.version,
                 last_activity = EXCLUDED.last_activity,
                 expires_at = EXCLUDED.expires_at,
                 active = EXCLUDED.active"#,
        )
        .bind(session.external_id.as_str())
        .bind(&session.state_key)
        .bind(payload)
        .bind(&session.auth.access_token)
        .bind(session.auth.token_expires_at)
        .bind(session.auth.user_id.map(|u| u.0))
        .bind(role)
        .bind(&session.username)
        .bind(&session.first_name)
        .bind(&session.last_name)
        .bind(&session.language)
        .bind(session.version as i64)
        .bind(session.last_activity)
        .bind(session.expires_at)
        .bind(session.active)
        .execute(&self.pool)
        .await
        .map_err(|e| SessionStoreError::Unavailable(e.to_string()))?;
        Ok(())
    }

    async fn deactivate_expired(&self, now: DateTime<Utc>) -> Result<u64, SessionStoreError> {
        let result =
            sqlx::query("UPDATE bot_sessions SET active = FALSE WHERE active AND expires_at < $1")
                .bind(now)
                .execute(&self.pool)
                .await
                .map_err(|e| SessionStoreError::Unavailable(e.to_string()))?;
        Ok(result.rows_affected())
    }

    async fn active_count(&self) -> Result<u64, SessionStoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM bot_sessions WHERE active")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| SessionStoreError::Unavailable(e.to_string()))?;
        Ok(row.get::<i64, _>("n") as u64)
    }
}

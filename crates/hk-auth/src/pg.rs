//! Postgres-backed credential, session, and audit storage.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use tracing::warn;

use hk_core::config::DatabaseSection;
use hk_core::types::{ExternalId, UserId};

use crate::store::{
    AuditEvent, AuditSink, AuditStatus, CredentialRecord, CredentialStore, Result, SessionRecord,
    SessionStore, StoreError,
};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS user_credentials (
    user_id            BIGINT PRIMARY KEY,
    external_id        TEXT NOT NULL UNIQUE,
    password_hash      TEXT,
    failed_attempts    INTEGER NOT NULL DEFAULT 0,
    locked_until       TIMESTAMPTZ,
    mfa_enabled        BOOLEAN NOT NULL DEFAULT FALSE,
    totp_secret_sealed BYTEA,
    backup_code_hashes TEXT[] NOT NULL DEFAULT '{}',
    force_password_change BOOLEAN NOT NULL DEFAULT FALSE,
    last_login_at      TIMESTAMPTZ,
    password_set_at    TIMESTAMPTZ,
    created_at         TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE TABLE IF NOT EXISTS sessions (
    session_id         TEXT PRIMARY KEY,
    user_id            BIGINT NOT NULL,
    external_id        TEXT NOT NULL,
    access_token       TEXT NOT NULL,
    refresh_token      TEXT NOT NULL,
    created_at         TIMESTAMPTZ NOT NULL,
    expires_at         TIMESTAMPTZ NOT NULL,
    refresh_expires_at TIMESTAMPTZ NOT NULL,
    last_activity      TIMESTAMPTZ NOT NULL,
    device_info        TEXT,
    ip_address         TEXT,
    user_agent         TEXT,
    active             BOOLEAN NOT NULL DEFAULT TRUE
);
CREATE INDEX IF NOT EXISTS sessions_user_active_idx ON sessions (user_id, active);
CREATE INDEX IF NOT EXISTS sessions_expiry_idx ON sessions (expires_at) WHERE active;

CREATE TABLE IF NOT EXISTS auth_log (
    id          BIGSERIAL PRIMARY KEY,
    user_id     BIGINT,
    external_id TEXT,
    event_type  TEXT NOT NULL,
    status      TEXT NOT NULL,
    message     TEXT,
    ip_address  TEXT,
    session_id  TEXT,
    at          TIMESTAMPTZ NOT NULL
);
"#;

// ---------------------------------------------------------------------------
// PgAuthStore
// ---------------------------------------------------------------------------

pub struct PgAuthStore {
    pool: PgPool,
}

impl PgAuthStore {
    /// Connect a pool with pre-ping and the configured caps.
    pub async fn connect(config: &DatabaseSection) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout)
            .test_before_acquire(true)
            .connect(&config.url)
            .await
            .map_err(into_store_error)?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Apply the schema. Idempotent.
    pub async fn migrate(&self) -> Result<()> {
        for statement in SCHEMA.split(';').filter(|s| !s.trim().is_empty()) {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(into_store_error)?;
        }
        Ok(())
    }

    /// Liveness probe for the health surface.
    pub async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(into_store_error)
    }
}

fn into_store_error(e: sqlx::Error) -> StoreError {
    match &e {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            StoreError::Conflict(db.message().to_string())
        }
        _ => StoreError::Unavailable(e.to_string()),
    }
}

fn credential_from_row(row: &sqlx::postgres::PgRow) -> CredentialRecord {
    CredentialRecord {
        user_id: UserId(row.get("user_id")),
        external_id: ExternalId(row.get("external_id")),
        password_hash: row.get("password_hash"),
        failed_attempts: row.get::<i32, _>("failed_attempts") as u32,
        locked_until: row.get("locked_until"),
        mfa_enabled: row.get("mfa_enabled"),
        totp_secret_sealed: row.get("totp_secret_sealed"),
        backup_code_hashes: row.get("backup_code_hashes"),
        force_password_change: row.get("force_password_change"),
        last_login_at: row.get("last_login_at"),
        password_set_at: row.get("password_set_at"),
        created_at: row.get("created_at"),
    }
}

fn session_from_row(row: &sqlx::postgres::PgRow) -> SessionRecord {
    SessionRecord {
        session_id: row.get("session_id"),
        user_id: UserId(row.get("user_id")),
        external_id: ExternalId(row.get("external_id")),
        access_token: row.get("access_token"),
        refresh_token: row.get("refresh_token"),
        created_at: row.get("created_at"),
        expires_at: row.get("expires_at"),
        refresh_expires_at: row.get("refresh_expires_at"),
        last_activity: row.get("last_activity"),
        device_info: row.get("device_info"),
        ip_address: row.get("ip_address"),
        user_agent: row.get("user_agent"),
        active: row.get("active"),
    }
}

#[async_trait]
impl CredentialStore for PgAuthStore {
    async fn insert(&self, record: CredentialRecord) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO user_credentials
               (user_id, external_id, password_hash, failed_attempts, locked_until,
                mfa_enabled, totp_secret_sealed, backup_code_hashes,
                force_password_change, last_login_at, password_set_at, created_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)"#,
        )
        .bind(record.user_id.0)
        .bind(&record.external_id.0)
        .bind(&record.password_hash)
        .bind(record.failed_attempts as i32)
        .bind(record.locked_until)
        .bind(record.mfa_enabled)
        .bind(&record.totp_secret_sealed)
        .bind(&record.backup_code_hashes)
        .bind(record.force_password_change)
        .bind(record.last_login_at)
        .bind(record.password_set_at)
        .bind(record.created_at)
        .execute(&self.pool)
        .await
        .map_err(into_store_error)?;
        Ok(())
    }

    async fn fetch(&self, user_id: UserId) -> Result<Option<CredentialRecord>> {
        let row = sqlx::query("SELECT * FROM user_credentials WHERE user_id = $1")
            .bind(user_id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(into_store_error)?;
        Ok(row.as_ref().map(credential_from_row))
    }

    async fn fetch_by_external(
        &self,
        external_id: &ExternalId,
    ) -> Result<Option<CredentialRecord>> {
        let row = sqlx::query("SELECT * FROM user_credentials WHERE external_id = $1")
            .bind(&external_id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(into_store_error)?;
        Ok(row.as_ref().map(credential_from_row))
    }

    async fn update(&self, record: &CredentialRecord) -> Result<()> {
        sqlx::query(
            r#"UPDATE user_credentials SET
               password_hash = $2, failed_attempts = $3, locked_until = $4,
               mfa_enabled = $5, totp_secret_sealed = $6, backup_code_hashes = $7,
               force_password_change = $8, last_login_at = $9, password_set_at = $10
               WHERE user_id = $1"#,
        )
        .bind(record.user_id.0)
        .bind(&record.password_hash)
        .bind(record.failed_attempts as i32)
        .bind(record.locked_until)
        .bind(record.mfa_enabled)
        .bind(&record.totp_secret_sealed)
        .bind(&record.backup_code_hashes)
        .bind(record.force_password_change)
        .bind(record.last_login_at)
        .bind(record.password_set_at)
        .execute(&self.pool)
        .await
        .map_err(into_store_error)?;
        Ok(())
    }

    async fn clear_expired_locks(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE user_credentials SET locked_until = NULL, failed_attempts = 0
             WHERE locked_until IS NOT NULL AND locked_until <= $1",
        )
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(into_store_error)?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl SessionStore for PgAuthStore {
    async fn insert(&self, record: SessionRecord) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO sessions
               (session_id, user_id, external_id, access_token, refresh_token,
                created_at, expires_at, refresh_expires_at, last_activity,
                device_info, ip_address, user_agent, active)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)"#,
        )
        .bind(&record.session_id)
        .bind(record.user_id.0)
        .bind(&record.external_id.0)
        .bind(&record.access_token)
        .bind(&record.refresh_token)
        .bind(record.created_at)
        .bind(record.expires_at)
        .bind(record.refresh_expires_at)
        .bind(record.last_activity)
        .bind(&record.device_info)
        .bind(&record.ip_address)
        .bind(&record.user_agent)
        .bind(record.active)
        .execute(&self.pool)
        .await
        .map_err(into_store_error)?;
        Ok(())
    }

    async fn fetch(&self, session_id: &str) -> Result<Option<SessionRecord>> {
        let row = sqlx::query("SELECT * FROM sessions WHERE session_id = $1")
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(into_store_error)?;
        Ok(row.as_ref().map(session_from_row))
    }

    async fn update(&self, record: &SessionRecord) -> Result<()> {
        sqlx::query(
            r#"UPDATE sessions SET
               access_token = $2, refresh_token = $3, expires_at = $4,
               refresh_expires_at = $5, last_activity = $6, active = $7
               WHERE session_id = $1"#,
        )
        .bind(&record.session_id)
        .bind(&record.access_token)
        .bind(&record.refresh_token)
        .bind(record.expires_at)
        .bind(record.refresh_expires_at)
        .bind(record.last_activity)
        .bind(record.active)
        .execute(&self.pool)
        .await
        .map_err(into_store_error)?;
        Ok(())
    }

    async fn active_for_user(&self, user_id: UserId) -> Result<Vec<SessionRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM sessions WHERE user_id = $1 AND active ORDER BY last_activity ASC",
        )
        .bind(user_id.0)
        .fetch_all(&self.pool)
        .await
        .map_err(into_store_error)?;
        Ok(rows.iter().map(session_from_row).collect())
    }

    async fn deactivate(&self, session_id: &str) -> Result<bool> {
        let result = sqlx::query("UPDATE sessions SET active = FALSE WHERE session_id = $1 AND active")
            .bind(session_id)
            .execute(&self.pool)
            .await
            .map_err(into_store_error)?;
        Ok(result.rows_affected() > 0)
    }

    async fn deactivate_all(&self, user_id: UserId, except: Option<&str>) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE sessions SET active = FALSE
             WHERE user_id = $1 AND active AND ($2::TEXT IS NULL OR session_id <> $2)",
        )
        .bind(user_id.0)
        .bind(except)
        .execute(&self.pool)
        .await
        .map_err(into_store_error)?;
        Ok(result.rows_affected())
    }

    async fn deactivate_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE sessions SET active = FALSE WHERE active AND expires_at < $1",
        )
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(into_store_error)?;
        Ok(result.rows_affected())
    }

    async fn active_count(&self) -> Result<u64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM sessions WHERE active")
            .fetch_one(&self.pool)
            .await
            .map_err(into_store_error)?;
        Ok(row.get::<i64, _>("n") as u64)
    }
}

#[async_trait]
impl AuditSink for PgAuthStore {
    async fn record(&self, event: AuditEvent) {
        let status = match event.status {
            AuditStatus::Success => "success",
            AuditStatus::Failure => "failure",
        };
        let result = sqlx::query(
            r#"INSERT INTO auth_log
               (user_id, external_id, event_type, status, message, ip_address, session_id, at)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8)"#,
        )
        .bind(event.user_id.map(|u| u.0))
        .bind(event.external_id.as_ref().map(|e| e.0.clone()))
        .bind(&event.event_type)
        .bind(status)
        .bind(&event.message)
        .bind(&event.ip_address)
        .bind(&event.session_id)
        .bind(event.at)
        .execute(&self.pool)
        .await;

        if let Err(e) = result {
            // Auditing must never break the auth path itself.
            warn!(error = %e, event_type = %event.event_type, "audit write failed");
        }
    }
}

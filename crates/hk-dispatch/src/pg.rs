//! Postgres-backed work-order and assignment storage.
//!
//! The assignment swap runs in one transaction: deactivate the previous
//! active record, insert the new one. Concurrent swaps for the same work
//! order serialise on the row locks the UPDATE takes.

use async_trait::async_trait;
use sqlx::{PgPool, Row};

use hk_core::types::{RequestNumber, Urgency, UserId};

use crate::scoring::ScoreFactors;
use crate::store::{
    AssignmentRecord, AssignmentStore, AssignmentType, Result, StoreError, WorkOrderStore,
};
use crate::work_order::{WorkOrder, WorkOrderStatus};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS work_orders (
    number              TEXT PRIMARY KEY,
    applicant_id        BIGINT NOT NULL,
    category            TEXT NOT NULL,
    urgency             SMALLINT NOT NULL,
    description         TEXT NOT NULL,
    address             TEXT NOT NULL,
    latitude            DOUBLE PRECISION,
    longitude           DOUBLE PRECISION,
    status              TEXT NOT NULL,
    executor_id         BIGINT,
    completion_report   TEXT,
    cancellation_reason TEXT,
    rating              SMALLINT,
    comments            JSONB NOT NULL DEFAULT '[]',
    media_refs          TEXT[] NOT NULL DEFAULT '{}',
    created_at          TIMESTAMPTZ NOT NULL,
    updated_at          TIMESTAMPTZ NOT NULL
);
CREATE INDEX IF NOT EXISTS work_orders_status_idx ON work_orders (status);

CREATE TABLE IF NOT EXISTS assignment_records (
    id              TEXT PRIMARY KEY,
    request_number  TEXT NOT NULL,
    executor_id     BIGINT NOT NULL,
    assigned_by     BIGINT,
    reason          TEXT,
    assignment_type TEXT NOT NULL,
    score           DOUBLE PRECISION NOT NULL,
    factors         JSONB NOT NULL,
    alternates      BIGINT[] NOT NULL DEFAULT '{}',
    active          BOOLEAN NOT NULL,
    created_at      TIMESTAMPTZ NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS assignment_one_active_idx
    ON assignment_records (request_number) WHERE active;

CREATE TABLE IF NOT EXISTS request_sequences (
    date_key  TEXT NOT NULL,
    sequence  INTEGER NOT NULL,
    PRIMARY KEY (date_key, sequence)
)
"#;

pub struct PgDispatchStore {
    pool: PgPool,
}

impl PgDispatchStore {
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<()> {
        for statement in SCHEMA.split(';').filter(|s| !s.trim().is_empty()) {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(into_store_error)?;
        }
        Ok(())
    }

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
        sqlx::Error::RowNotFound => StoreError::NotFound,
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            StoreError::Conflict(db.message().to_string())
        }
        _ => StoreError::Unavailable(e.to_string()),
    }
}

fn status_from(raw: &str) -> WorkOrderStatus {
    match raw {
        "assigned" => WorkOrderStatus::Assigned,
        "in_progress" => WorkOrderStatus::InProgress,
        "completed" => WorkOrderStatus::Completed,
        "cancelled" => WorkOrderStatus::Cancelled,
        _ => WorkOrderStatus::New,
    }
}

fn order_from_row(row: &sqlx::postgres::PgRow) -> Result<WorkOrder> {
    let number = RequestNumber::parse(&row.get::<String, _>("number"))
        .map_err(|e| StoreError::Unavailable(e.to_string()))?;
    let latitude: Option<f64> = row.get("latitude");
    let longitude: Option<f64> = row.get("longitude");

    Ok(WorkOrder {
        number,
        applicant_id: UserId(row.get("applicant_id")),
        category: row.get("category"),
        urgency: Urgency::new(row.get::<i16, _>("urgency") as u8).unwrap_or_default(),
        description: row.get("description"),
        address: row.get("address"),
        coordinates: latitude.zip(longitude),
        status: status_from(row.get::<String, _>("status").as_str()),
        executor_id: row.get::<Option<i64>, _>("executor_id").map(UserId),
        completion_report: row.get("completion_report"),
        cancellation_reason: row.get("cancellation_reason"),
        rating: row.get::<Option<i16>, _>("rating").map(|r| r as u8),
        comments: serde_json::from_value(row.get("comments")).unwrap_or_default(),
        media_refs: row.get("media_refs"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

#[async_trait]
impl WorkOrderStore for PgDispatchStore {
    async fn insert(&self, order: WorkOrder) -> Result<()> {
        let comments = serde_json::to_value(&order.comments)
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        sqlx::query(
            r#"INSERT INTO work_orders
               (number, applicant_id, category, urgency, description, address,
                latitude, longitude, status, executor_id, completion_report,
                cancellation_reason, rating, comments, media_refs, created_at, updated_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)"#,
        )
        .bind(order.number.as_str())
        .bind(order.applicant_id.0)
        .bind(&order.category)
        .bind(order.urgency.level() as i16)
        .bind(&order.description)
        .bind(&order.address)
        .bind(order.coordinates.map(|c| c.0))
        .bind(order.coordinates.map(|c| c.1))
        .bind(order.status.as_str())
        .bind(order.executor_id.map(|e| e.0))
        .bind(&order.completion_report)
        .bind(&order.cancellation_reason)
        .bind(order.rating.map(|r| r as i16))
        .bind(comments)
        .bind(&order.media_refs)
        .bind(order.created_at)
        .bind(order.updated_at)
        .execute(&self.pool)
        .await
        .map_err(into_store_error)?;
        Ok(())
    }

    async fn fetch(&self, number: &RequestNumber) -> Result<Option<WorkOrder>> {
        let row = sqlx::query("SELECT * FROM work_orders WHERE number = $1")
            .bind(number.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(into_store_error)?;
        row.as_ref().map(order_from_row).transpose()
    }

    async fn update(&self, order: &WorkOrder) -> Result<()> {
        let comments = serde_json::to_value(&order.comments)
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let result = sqlx::query(
            r#"UPDATE work_orders SET
               status = $2, executor_id = $3, completion_report = $4,
               cancellation_reason = $5, rating = $6, comments = $7,
               media_refs = $8, updated_at = $9
               WHERE number = $1"#,
        )
        .bind(order.number.as_str())
        .bind(order.status.as_str())
        .bind(order.executor_id.map(|e| e.0))
        .bind(&order.completion_report)
        .bind(&order.cancellation_reason)
        .bind(order.rating.map(|r| r as i16))
        .bind(comments)
        .bind(&order.media_refs)
        .bind(order.updated_at)
        .execute(&self.pool)
        .await
        .map_err(into_store_error)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }
}

#[async_trait]
impl AssignmentStore for PgDispatchStore {
    async fn swap_active(&self, record: AssignmentRecord) -> Result<()> {
        let factors = serde_json::to_value(record.factors)
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let alternates: Vec<i64> = record.alternates.iter().map(|a| a.0).collect();

        let mut tx = self.pool.begin().await.map_err(into_store_error)?;

        sqlx::query(
            "UPDATE assignment_records SET active = FALSE WHERE request_number = $1 AND active",
        )
        .bind(record.request_number.as_str())
        .execute(&mut *tx)
        .await
        .map_err(into_store_error)?;

        sqlx::query(
            r#"INSERT INTO assignment_records
               (id, request_number, executor_id, assigned_by, reason, assignment_type,
                score, factors, alternates, active, created_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)"#,
        )
        .bind(&record.id)
        .bind(record.request_number.as_str())
        .bind(record.executor_id.0)
        .bind(record.assigned_by.map(|a| a.0))
        .bind(&record.reason)
        .bind(record.assignment_type.as_str())
        .bind(record.score)
        .bind(factors)
        .bind(&alternates)
        .bind(record.active)
        .bind(record.created_at)
        .execute(&mut *tx)
        .await
        .map_err(into_store_error)?;

        tx.commit().await.map_err(into_store_error)
    }

    async fn active_for(&self, number: &RequestNumber) -> Result<Option<AssignmentRecord>> {
        let row = sqlx::query(
            "SELECT * FROM assignment_records WHERE request_number = $1 AND active",
        )
        .bind(number.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(into_store_error)?;
        row.as_ref().map(record_from_row).transpose()
    }

    async fn history(&self, number: &RequestNumber) -> Result<Vec<AssignmentRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM assignment_records WHERE request_number = $1 ORDER BY created_at DESC",
        )
        .bind(number.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(into_store_error)?;
        rows.iter().map(record_from_row).collect()
    }
}

fn record_from_row(row: &sqlx::postgres::PgRow) -> Result<AssignmentRecord> {
    let number = RequestNumber::parse(&row.get::<String, _>("request_number"))
        .map_err(|e| StoreError::Unavailable(e.to_string()))?;
    let factors: ScoreFactors = serde_json::from_value(row.get("factors"))
        .map_err(|e| StoreError::Unavailable(e.to_string()))?;
    let assignment_type = match row.get::<String, _>("assignment_type").as_str() {
        "manual" => AssignmentType::Manual,
        "bulk" => AssignmentType::Bulk,
        _ => AssignmentType::Auto,
    };

    Ok(AssignmentRecord {
        id: row.get("id"),
        request_number: number,
        executor_id: UserId(row.get("executor_id")),
        assigned_by: row.get::<Option<i64>, _>("assigned_by").map(UserId),
        reason: row.get("reason"),
        assignment_type,
        score: row.get("score"),
        factors,
        alternates: row
            .get::<Vec<i64>, _>("alternates")
            .into_iter()
            .map(UserId)
            .collect(),
        active: row.get("active"),
        created_at: row.get("created_at"),
    })
}

// ---------------------------------------------------------------------------
// Journal over the sequences table
// ---------------------------------------------------------------------------

use crate::request_number::{JournalError, SequenceJournal};

#[async_trait]
impl SequenceJournal for PgDispatchStore {
    async fn record(&self, date_key: &str, sequence: u32) -> std::result::Result<(), JournalError> {
        let result = sqlx::query("INSERT INTO request_sequences (date_key, sequence) VALUES ($1, $2)")
            .bind(date_key)
            .bind(sequence as i32)
            .execute(&self.pool)
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(JournalError::Conflict)
            }
            Err(e) => Err(JournalError::Unavailable(e.to_string())),
        }
    }

    async fn high_water(&self, date_key: &str) -> std::result::Result<u32, JournalError> {
        let row = sqlx::query(
            "SELECT COALESCE(MAX(sequence), 0) AS high FROM request_sequences WHERE date_key = $1",
        )
        .bind(date_key)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| JournalError::Unavailable(e.to_string()))?;
        Ok(row.get::<i32, _>("high") as u32)
    }
}

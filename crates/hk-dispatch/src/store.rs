//! Storage seams for work orders and assignment records.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use hk_core::types::{RequestNumber, UserId};

use crate::scoring::ScoreFactors;
use crate::work_order::WorkOrder;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("not found")]
    NotFound,

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

// ---------------------------------------------------------------------------
// Assignment records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentType {
    Manual,
    Auto,
    Bulk,
}

impl AssignmentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssignmentType::Manual => "manual",
            AssignmentType::Auto => "auto",
            AssignmentType::Bulk => "bulk",
        }
    }
}

/// Immutable audit record of one dispatch decision. At most one record per
/// work order is active; superseding it deactivates the predecessor in the
/// same store transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssignmentRecord {
    pub id: String,
    pub request_number: RequestNumber,
    pub executor_id: UserId,
    pub assigned_by: Option<UserId>,
    pub reason: Option<String>,
    pub assignment_type: AssignmentType,
    pub score: f64,
    pub factors: ScoreFactors,
    /// Runner-up executor ids, best first.
    pub alternates: Vec<UserId>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

#[async_trait]
pub trait WorkOrderStore: Send + Sync {
    /// Insert a fresh work order; its number is the primary key.
    async fn insert(&self, order: WorkOrder) -> Result<()>;

    async fn fetch(&self, number: &RequestNumber) -> Result<Option<WorkOrder>>;

    async fn update(&self, order: &WorkOrder) -> Result<()>;
}

#[async_trait]
pub trait AssignmentStore: Send + Sync {
    /// Atomically deactivate the current active record for the work order
    /// (if any) and insert `record` as the new active one.
    async fn swap_active(&self, record: AssignmentRecord) -> Result<()>;

    async fn active_for(&self, number: &RequestNumber) -> Result<Option<AssignmentRecord>>;

    /// Full decision history, newest first.
    async fn history(&self, number: &RequestNumber) -> Result<Vec<AssignmentRecord>>;
}

// ---------------------------------------------------------------------------
// Memory implementation
// ---------------------------------------------------------------------------

/// In-process dispatch store for tests and development mode.
#[derive(Default)]
pub struct MemoryDispatchStore {
    orders: Mutex<HashMap<String, WorkOrder>>,
    assignments: Mutex<Vec<AssignmentRecord>>,
}

impl MemoryDispatchStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WorkOrderStore for MemoryDispatchStore {
    async fn insert(&self, order: WorkOrder) -> Result<()> {
        let mut orders = self.orders.lock().expect("order lock poisoned");
        let key = order.number.as_str().to_string();
        if orders.contains_key(&key) {
            return Err(StoreError::Conflict(format!("work order {key} exists")));
        }
        orders.insert(key, order);
        Ok(())
    }

    async fn fetch(&self, number: &RequestNumber) -> Result<Option<WorkOrder>> {
        let orders = self.orders.lock().expect("order lock poisoned");
        Ok(orders.get(number.as_str()).cloned())
    }

    async fn update(&self, order: &WorkOrder) -> Result<()> {
        let mut orders = self.orders.lock().expect("order lock poisoned");
        match orders.get_mut(order.number.as_str()) {
            Some(existing) => {
                *existing = order.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound),
        }
    }
}

#[async_trait]
impl AssignmentStore for MemoryDispatchStore {
    async fn swap_active(&self, record: AssignmentRecord) -> Result<()> {
        let mut assignments = self.assignments.lock().expect("assignment lock poisoned");
        for existing in assignments.iter_mut() {
            if existing.request_number == record.request_number {
                existing.active = false;
            }
        }
        assignments.push(record);
        Ok(())
    }

    async fn active_for(&self, number: &RequestNumber) -> Result<Option<AssignmentRecord>> {
        let assignments = self.assignments.lock().expect("assignment lock poisoned");
        Ok(assignments
            .iter()
            .find(|r| &r.request_number == number && r.active)
            .cloned())
    }

    async fn history(&self, number: &RequestNumber) -> Result<Vec<AssignmentRecord>> {
        let assignments = self.assignments.lock().expect("assignment lock poisoned");
        let mut history: Vec<_> = assignments
            .iter()
            .filter(|r| &r.request_number == number)
            .cloned()
            .collect();
        history.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(history)
    }
}

//! The work-order entity and its status state machine.
//!
//! Legal moves:
//! `new → assigned → in_progress → completed | cancelled`, plus
//! `new → cancelled`; re-assignment may take `assigned → new` and
//! `in_progress → assigned`. Anything else is a typed error. Completion
//! requires a report, cancellation a reason, and the executor id changes
//! only through assignment.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::warn;

use hk_core::types::{CorrelationId, RequestNumber, Urgency, UserId};
use hk_events::publisher::EventPublisher;

use crate::store::{StoreError, WorkOrderStore};

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkOrderStatus {
    New,
    Assigned,
    InProgress,
    Completed,
    Cancelled,
}

impl WorkOrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkOrderStatus::New => "new",
            WorkOrderStatus::Assigned => "assigned",
            WorkOrderStatus::InProgress => "in_progress",
            WorkOrderStatus::Completed => "completed",
            WorkOrderStatus::Cancelled => "cancelled",
        }
    }

    /// Whether `from → to` is a legal move. Backward moves are legal only as
    /// part of re-assignment.
    pub fn transition_allowed(from: Self, to: Self, reassignment: bool) -> bool {
        use WorkOrderStatus::*;
        match (from, to) {
            (New, Assigned) => true,
            (New, Cancelled) => true,
            (Assigned, InProgress) => true,
            (InProgress, Completed) => true,
            (InProgress, Cancelled) => true,
            (Assigned, New) => reassignment,
            (InProgress, Assigned) => reassignment,
            // Replacing the executor keeps the status but counts as a move.
            (Assigned, Assigned) => reassignment,
            _ => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum TransitionError {
    #[error("illegal transition {from:?} -> {to:?}")]
    Illegal {
        from: WorkOrderStatus,
        to: WorkOrderStatus,
    },

    #[error("completion requires a non-empty report")]
    MissingCompletionReport,

    #[error("cancellation requires a reason")]
    MissingCancellationReason,
}

// ---------------------------------------------------------------------------
// Entity
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Comment {
    pub author_id: UserId,
    pub text: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkOrder {
    /// Immutable human id; also the primary key.
    pub number: RequestNumber,
    pub applicant_id: UserId,
    pub category: String,
    pub urgency: Urgency,
    pub description: String,
    pub address: String,
    pub coordinates: Option<(f64, f64)>,
    pub status: WorkOrderStatus,
    pub executor_id: Option<UserId>,
    pub completion_report: Option<String>,
    pub cancellation_reason: Option<String>,
    pub rating: Option<u8>,
    pub comments: Vec<Comment>,
    pub media_refs: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkOrder {
    pub fn new(
        number: RequestNumber,
        applicant_id: UserId,
        category: impl Into<String>,
        urgency: Urgency,
        description: impl Into<String>,
        address: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            number,
            applicant_id,
            category: category.into(),
            urgency,
            description: description.into(),
            address: address.into(),
            coordinates: None,
            status: WorkOrderStatus::New,
            executor_id: None,
            completion_report: None,
            cancellation_reason: None,
            rating: None,
            comments: Vec::new(),
            media_refs: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    fn shift(&mut self, to: WorkOrderStatus, reassignment: bool) -> Result<(), TransitionError> {
        if !WorkOrderStatus::transition_allowed(self.status, to, reassignment) {
            return Err(TransitionError::Illegal { from: self.status, to });
        }
        self.status = to;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Set the executor as part of an assignment decision.
    pub fn assign(&mut self, executor_id: UserId) -> Result<(), TransitionError> {
        let reassignment = self.executor_id.is_some();
        self.shift(WorkOrderStatus::Assigned, reassignment)?;
        self.executor_id = Some(executor_id);
        Ok(())
    }

    /// Drop back to the pool as part of re-assignment.
    pub fn unassign(&mut self) -> Result<(), TransitionError> {
        self.shift(WorkOrderStatus::New, true)?;
        self.executor_id = None;
        Ok(())
    }

    pub fn start(&mut self) -> Result<(), TransitionError> {
        self.shift(WorkOrderStatus::InProgress, false)
    }

    pub fn complete(&mut self, report: &str) -> Result<(), TransitionError> {
        if report.trim().is_empty() {
            return Err(TransitionError::MissingCompletionReport);
        }
        self.shift(WorkOrderStatus::Completed, false)?;
        self.completion_report = Some(report.to_string());
        Ok(())
    }

    pub fn cancel(&mut self, reason: &str) -> Result<(), TransitionError> {
        if reason.trim().is_empty() {
            return Err(TransitionError::MissingCancellationReason);
        }
        self.shift(WorkOrderStatus::Cancelled, false)?;
        self.cancellation_reason = Some(reason.to_string());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum WorkOrderError {
    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("work order not found")]
    NotFound,

    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for WorkOrderError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound => WorkOrderError::NotFound,
            other => WorkOrderError::Store(other),
        }
    }
}

/// Persists work orders and announces every lifecycle change on the event
/// fabric. A lost announcement never rolls back a persisted change.
pub struct WorkOrderService {
    store: Arc<dyn WorkOrderStore>,
    events: Arc<EventPublisher>,
}

impl WorkOrderService {
    pub fn new(store: Arc<dyn WorkOrderStore>, events: Arc<EventPublisher>) -> Self {
        Self { store, events }
    }

    pub async fn create(
        &self,
        order: WorkOrder,
        correlation: Option<CorrelationId>,
    ) -> Result<(), WorkOrderError> {
        self.store.insert(order.clone()).await?;
        self.announce(
            "request_created",
            json!({
                "request_number": order.number.as_str(),
                "applicant_id": order.applicant_id.0,
                "category": order.category,
                "urgency": order.urgency.level(),
                "address": order.address,
            }),
            correlation,
        )
        .await;
        Ok(())
    }

    pub async fn fetch(&self, number: &RequestNumber) -> Result<WorkOrder, WorkOrderError> {
        self.store
            .fetch(number)
            .await?
            .ok_or(WorkOrderError::NotFound)
    }

    pub async fn start(
        &self,
        number: &RequestNumber,
        actor: UserId,
        correlation: Option<CorrelationId>,
    ) -> Result<WorkOrder, WorkOrderError> {
        let mut order = self.fetch(number).await?;
        let from = order.status;
        order.start()?;
        self.store.update(&order).await?;
        self.announce_status(&order, from, Some(actor), correlation).await;
        Ok(order)
    }

    pub async fn complete(
        &self,
        number: &RequestNumber,
        actor: UserId,
        report: &str,
        correlation: Option<CorrelationId>,
    ) -> Result<WorkOrder, WorkOrderError> {
        let mut order = self.fetch(number).await?;
        let from = order.status;
        order.complete(report)?;
        self.store.update(&order).await?;

        self.announce_status(&order, from, Some(actor), correlation.clone()).await;
        self.announce(
            "request_completed",
            json!({
                "request_number": order.number.as_str(),
                "executor_id": order.executor_id.map(|e| e.0).unwrap_or_default(),
                "completion_report": report,
            }),
            correlation,
        )
        .await;
        Ok(order)
    }

    pub async fn cancel(
        &self,
        number: &RequestNumber,
        actor: UserId,
        reason: &str,
        correlation: Option<CorrelationId>,
    ) -> Result<WorkOrder, WorkOrderError> {
        let mut order = self.fetch(number).await?;
        let from = order.status;
        order.cancel(reason)?;
        self.store.update(&order).await?;

        self.announce_status(&order, from, Some(actor), correlation.clone()).await;
        self.announce(
            "request_cancelled",
            json!({
                "request_number": order.number.as_str(),
                "reason": reason,
            }),
            correlation,
        )
        .await;
        Ok(order)
    }

    async fn announce_status(
        &self,
        order: &WorkOrder,
        from: WorkOrderStatus,
        actor: Option<UserId>,
        correlation: Option<CorrelationId>,
    ) {
        self.announce(
            "request_status_changed",
            json!({
                "request_number": order.number.as_str(),
                "from_status": from.as_str(),
                "to_status": order.status.as_str(),
                "actor_id": actor.map(|a| a.0),
            }),
            correlation,
        )
        .await;
    }

    async fn announce(
        &self,
        kind: &str,
        payload: serde_json::Value,
        correlation: Option<CorrelationId>,
    ) {
        if let Err(e) = self.events.publish(kind, payload, correlation).await {
            warn!(kind, error = %e, "lifecycle event lost");
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn order() -> WorkOrder {
        WorkOrder::new(
            RequestNumber::parse("250927-001").unwrap(),
            UserId(42),
            "plumbing",
            Urgency::new(3).unwrap(),
            "leaking pipe under the sink",
            "12 Main St, apt 4",
        )
    }

    #[test]
    fn happy_path_to_completed() {
        let mut o = order();
        o.assign(UserId(7)).unwrap();
        o.start().unwrap();
        o.complete("replaced the trap").unwrap();

        assert_eq!(o.status, WorkOrderStatus::Completed);
        assert_eq!(o.executor_id, Some(UserId(7)));
        assert_eq!(o.completion_report.as_deref(), Some("replaced the trap"));
    }

    #[test]
    fn new_can_cancel_but_assigned_cannot() {
        let mut o = order();
        o.cancel("submitted twice").unwrap();
        assert_eq!(o.status, WorkOrderStatus::Cancelled);

        let mut o = order();
        o.assign(UserId(7)).unwrap();
        let err = o.cancel("changed my mind").unwrap_err();
        assert!(matches!(
            err,
            TransitionError::Illegal { from: WorkOrderStatus::Assigned, to: WorkOrderStatus::Cancelled }
        ));
    }

    #[test]
    fn completion_requires_report() {
        let mut o = order();
        o.assign(UserId(7)).unwrap();
        o.start().unwrap();

        assert!(matches!(o.complete("  "), Err(TransitionError::MissingCompletionReport)));
        // Status untouched by the failed attempt.
        assert_eq!(o.status, WorkOrderStatus::InProgress);
    }

    #[test]
    fn cancellation_requires_reason() {
        let mut o = order();
        assert!(matches!(o.cancel(""), Err(TransitionError::MissingCancellationReason)));
        assert_eq!(o.status, WorkOrderStatus::New);
    }

    #[test]
    fn completed_is_terminal() {
        let mut o = order();
        o.assign(UserId(7)).unwrap();
        o.start().unwrap();
        o.complete("done").unwrap();

        assert!(o.start().is_err());
        assert!(o.assign(UserId(8)).is_err());
        assert!(o.cancel("no").is_err());
    }

    #[test]
    fn reassignment_moves_backward() {
        let mut o = order();
        o.assign(UserId(7)).unwrap();
        o.unassign().unwrap();
        assert_eq!(o.status, WorkOrderStatus::New);
        assert_eq!(o.executor_id, None);

        o.assign(UserId(8)).unwrap();
        o.start().unwrap();
        // Pulled back from in-progress to a different executor.
        o.assign(UserId(9)).unwrap();
        assert_eq!(o.status, WorkOrderStatus::Assigned);
        assert_eq!(o.executor_id, Some(UserId(9)));
    }

    #[test]
    fn skipping_assigned_is_illegal() {
        let mut o = order();
        assert!(o.start().is_err());
        let err = o.complete("done").unwrap_err();
        assert!(matches!(err, TransitionError::Illegal { .. }));
    }

    mod service {
        use super::*;
        use crate::store::MemoryDispatchStore;
        use hk_core::types::ServiceName;
        use hk_events::schema::SchemaRegistry;
        use hk_substrate::MemorySubstrate;

        fn service() -> (WorkOrderService, Arc<MemorySubstrate>, Arc<MemoryDispatchStore>) {
            let substrate = Arc::new(MemorySubstrate::new());
            let store = Arc::new(MemoryDispatchStore::new());
            let events = Arc::new(EventPublisher::new(
                substrate.clone(),
                Arc::new(SchemaRegistry::platform()),
                ServiceName::RequestService,
            ));
            (WorkOrderService::new(store.clone(), events), substrate, store)
        }

        #[tokio::test]
        async fn create_persists_and_announces() {
            let (svc, substrate, _) = service();
            svc.create(order(), None).await.unwrap();

            let fetched = svc
                .fetch(&RequestNumber::parse("250927-001").unwrap())
                .await
                .unwrap();
            assert_eq!(fetched.status, WorkOrderStatus::New);
            assert_eq!(substrate.stream_entries("events:request_created").len(), 1);
        }

        #[tokio::test]
        async fn duplicate_number_conflicts() {
            let (svc, _, _) = service();
            svc.create(order(), None).await.unwrap();
            let err = svc.create(order(), None).await.unwrap_err();
            assert!(matches!(err, WorkOrderError::Store(StoreError::Conflict(_))));
        }

        #[tokio::test]
        async fn lifecycle_emits_status_and_terminal_events() {
            let (svc, substrate, store) = service();
            let number = RequestNumber::parse("250927-001").unwrap();
            svc.create(order(), None).await.unwrap();

            // Assignment happens through the engine; emulate its store write.
            let mut o = svc.fetch(&number).await.unwrap();
            o.assign(UserId(7)).unwrap();
            store.update(&o).await.unwrap();

            svc.start(&number, UserId(7), None).await.unwrap();
            svc.complete(&number, UserId(7), "pipe replaced", None).await.unwrap();

            assert_eq!(
                substrate.stream_entries("events:request_status_changed").len(),
                2
            );
            assert_eq!(substrate.stream_entries("events:request_completed").len(), 1);
        }

        #[tokio::test]
        async fn cancel_records_reason_and_event() {
            let (svc, substrate, _) = service();
            let number = RequestNumber::parse("250927-001").unwrap();
            svc.create(order(), None).await.unwrap();

            let cancelled = svc
                .cancel(&number, UserId(42), "submitted twice", None)
                .await
                .unwrap();
            assert_eq!(cancelled.status, WorkOrderStatus::Cancelled);
            assert_eq!(cancelled.cancellation_reason.as_deref(), Some("submitted twice"));
            assert_eq!(substrate.stream_entries("events:request_cancelled").len(), 1);
        }
    }
}

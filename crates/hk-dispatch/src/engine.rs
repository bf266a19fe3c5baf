//! The assignment engine: feasibility, ranking, and the atomic record swap.

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use hk_core::types::{CorrelationId, RequestNumber, UserId};
use hk_events::publisher::EventPublisher;
use hk_harness::circuit_breaker::CircuitBreaker;

use crate::scoring::{rank, score, CandidateScore, ExecutorProfile, ScoreWeights};
use crate::store::{AssignmentRecord, AssignmentStore, AssignmentType, StoreError, WorkOrderStore};
use crate::work_order::TransitionError;

// ---------------------------------------------------------------------------
// Directory seam
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    #[error("user directory unavailable: {0}")]
    Unavailable(String),
}

/// The user service's view of executors. The engine never defaults missing
/// profile data — an unreachable directory blocks assignment outright.
#[async_trait::async_trait]
pub trait UserDirectory: Send + Sync {
    async fn executor_pool(&self) -> Result<Vec<ExecutorProfile>, DirectoryError>;

    async fn executor(&self, id: UserId) -> Result<Option<ExecutorProfile>, DirectoryError>;
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum AssignError {
    /// The user service could not be consulted; no assignment is created.
    #[error("user service unavailable")]
    DirectoryUnavailable,

    #[error("work order not found")]
    OrderNotFound,

    /// Nobody cleared the feasibility gate and the score floor.
    #[error("no suitable executor found")]
    NoSuitableExecutor { best_score: Option<f64> },

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("store failure: {0}")]
    Store(#[from] StoreError),
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub weights: ScoreWeights,
    /// Candidates scoring below this are never chosen.
    pub score_floor: f64,
    /// Runner-ups recorded on the decision.
    pub alternates: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            weights: ScoreWeights::default(),
            score_floor: 0.30,
            alternates: 3,
        }
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct AssignmentEngine {
    directory: Arc<dyn UserDirectory>,
    orders: Arc<dyn WorkOrderStore>,
    assignments: Arc<dyn AssignmentStore>,
    events: Arc<EventPublisher>,
    /// Protects the directory call path.
    breaker: CircuitBreaker,
    config: EngineConfig,
}

impl AssignmentEngine {
    pub fn new(
        directory: Arc<dyn UserDirectory>,
        orders: Arc<dyn WorkOrderStore>,
        assignments: Arc<dyn AssignmentStore>,
        events: Arc<EventPublisher>,
        breaker: CircuitBreaker,
        config: EngineConfig,
    ) -> Self {
        Self {
            directory,
            orders,
            assignments,
            events,
            breaker,
            config,
        }
    }

    /// Decide and persist an assignment for one work order.
    ///
    /// The winning candidate becomes the active [`AssignmentRecord`]; any
    /// previous active record is deactivated in the same store transaction,
    /// and the work order itself moves to `assigned`.
    pub async fn assign(
        &self,
        number: &RequestNumber,
        assigned_by: Option<UserId>,
        assignment_type: AssignmentType,
        reason: Option<String>,
        correlation: Option<CorrelationId>,
    ) -> Result<AssignmentRecord, AssignError> {
        let mut order = self
            .orders
            .fetch(number)
            .await?
            .ok_or(AssignError::OrderNotFound)?;

        let (ranked, profiles) = self.rank_candidates(&order.category).await?;
        let winner = match ranked.first() {
            Some(winner) => winner.clone(),
            None => {
                return Err(AssignError::NoSuitableExecutor { best_score: None });
            }
        };

        // The one being assigned must hold the required specialization (an
        // exact match or the generalist fallback); runner-ups are recorded
        // as-is for the audit trail.
        if !order.category.is_empty() {
            let qualified = profiles
                .iter()
                .find(|p| p.executor_id == winner.executor_id)
                .map(|p| p.has_specialization(&order.category) || p.is_generalist())
                .unwrap_or(false);
            if !qualified {
                return Err(AssignError::NoSuitableExecutor {
                    best_score: Some(winner.total),
                });
            }
        }

        let record = AssignmentRecord {
            id: Uuid::new_v4().to_string(),
            request_number: number.clone(),
            executor_id: winner.executor_id,
            assigned_by,
            reason,
            assignment_type,
            score: winner.total,
            factors: winner.factors,
            alternates: ranked
                .iter()
                .skip(1)
                .take(self.config.alternates)
                .map(|c| c.executor_id)
                .collect(),
            active: true,
            created_at: Utc::now(),
        };

        self.assignments.swap_active(record.clone()).await?;
        order.assign(winner.executor_id)?;
        self.orders.update(&order).await?;

        info!(
            number = %number,
            executor = %winner.executor_id,
            score = winner.total,
            kind = assignment_type.as_str(),
            "work order assigned"
        );

        let payload = json!({
            "request_number": number.as_str(),
            "executor_id": winner.executor_id.0,
            "score": winner.total,
            "assignment_type": assignment_type.as_str(),
        });
        if let Err(e) = self.events.publish("request_assigned", payload, correlation).await {
            warn!(number = %number, error = %e, "assignment event lost");
        }

        Ok(record)
    }

    /// Ranked recommendations without committing anything.
    pub async fn recommendations(
        &self,
        category: &str,
        limit: usize,
    ) -> Result<Vec<CandidateScore>, AssignError> {
        let (mut ranked, _) = self.rank_candidates(category).await?;
        ranked.truncate(limit);
        Ok(ranked)
    }

    /// Load the pool, apply the hard feasibility gate, score, floor, and
    /// tie-break. Returns the ranking plus the profiles that produced it.
    async fn rank_candidates(
        &self,
        category: &str,
    ) -> Result<(Vec<CandidateScore>, Vec<ExecutorProfile>), AssignError> {
        let directory = self.directory.clone();
        let pool = self
            .breaker
            .call(move || async move { directory.executor_pool().await })
            .await
            .map_err(|e| {
                warn!(error = %e, "executor pool unavailable, assignment blocked");
                AssignError::DirectoryUnavailable
            })?;

        let category_required = !category.is_empty();
        let feasible: Vec<ExecutorProfile> = pool
            .into_iter()
            .filter(|p| p.account_active && p.role_active && !p.at_capacity())
            .collect();

        let scored: Vec<CandidateScore> = feasible
            .iter()
            .map(|p| score(p, category_required.then_some(category), &self.config.weights))
            .collect();

        let best = scored
            .iter()
            .map(|c| c.total)
            .fold(None::<f64>, |acc, t| Some(acc.map_or(t, |a| a.max(t))));

        let ranked = rank(scored, self.config.score_floor);
        if ranked.is_empty() {
            // Empty pool, or everyone fell below the floor.
            return Err(AssignError::NoSuitableExecutor { best_score: best });
        }
        Ok((ranked, feasible))
    }
}

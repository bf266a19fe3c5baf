//! Candidate scoring for executor assignment.
//!
//! Each candidate gets four factor scores in [0, 1] combined by fixed
//! weights. The result is transient: it ranks one decision and is persisted
//! only as the breakdown on the winning assignment record.

use serde::{Deserialize, Serialize};

use hk_core::types::UserId;

/// Specialization that makes any category acceptable at a discount.
pub const GENERAL_SPECIALIZATION: &str = "general";

// ---------------------------------------------------------------------------
// Executor profile (consumed from the user service)
// ---------------------------------------------------------------------------

/// The slice of an executor's directory profile the engine needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorProfile {
    pub executor_id: UserId,
    pub specializations: Vec<String>,
    /// Directory efficiency metric, 0–100.
    pub efficiency: f64,
    pub active_work_count: u32,
    pub max_concurrent: u32,
    pub available: bool,
    /// The account itself is active.
    pub account_active: bool,
    /// The executor role is active on the account.
    pub role_active: bool,
}

impl ExecutorProfile {
    pub fn at_capacity(&self) -> bool {
        self.active_work_count >= self.max_concurrent
    }

    pub fn has_specialization(&self, category: &str) -> bool {
        self.specializations.iter().any(|s| s == category)
    }

    pub fn is_generalist(&self) -> bool {
        self.has_specialization(GENERAL_SPECIALIZATION)
    }
}

// ---------------------------------------------------------------------------
// Weights
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ScoreWeights {
    pub specialization: f64,
    pub efficiency: f64,
    pub workload: f64,
    pub availability: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            specialization: 0.40,
            efficiency: 0.30,
            workload: 0.20,
            availability: 0.10,
        }
    }
}

// ---------------------------------------------------------------------------
// Factors and scores
// ---------------------------------------------------------------------------

/// Per-factor breakdown, each in [0, 1].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreFactors {
    pub specialization_match: bool,
    pub specialization: f64,
    pub efficiency: f64,
    pub workload: f64,
    pub availability: f64,
}

/// One ranked candidate.
#[derive(Debug, Clone)]
pub struct CandidateScore {
    pub executor_id: UserId,
    pub total: f64,
    pub factors: ScoreFactors,
}

// ---------------------------------------------------------------------------
// Scoring
// ---------------------------------------------------------------------------

/// Compute the factor breakdown for one candidate against a category.
pub fn factors_for(profile: &ExecutorProfile, category: Option<&str>) -> ScoreFactors {
    let (specialization_match, specialization) = match category {
        Some(category) if profile.has_specialization(category) => (true, 1.0),
        Some(_) if profile.is_generalist() => (false, 0.7),
        Some(_) => (false, 0.5),
        // No category requirement: neutral.
        None => (false, 0.5),
    };

    let efficiency = (profile.efficiency / 100.0).clamp(0.0, 1.0);

    let workload = if profile.at_capacity() {
        0.0
    } else {
        let ratio = f64::from(profile.active_work_count) / f64::from(profile.max_concurrent.max(1));
        (1.0 - ratio).max(0.1)
    };

    let availability = if profile.available { 1.0 } else { 0.0 };

    ScoreFactors {
        specialization_match,
        specialization,
        efficiency,
        workload,
        availability,
    }
}

/// Weighted total, clamped to [0, 1].
pub fn score(profile: &ExecutorProfile, category: Option<&str>, weights: &ScoreWeights) -> CandidateScore {
    let factors = factors_for(profile, category);
    let total = factors.specialization * weights.specialization
        + factors.efficiency * weights.efficiency
        + factors.workload * weights.workload
        + factors.availability * weights.availability;

    CandidateScore {
        executor_id: profile.executor_id,
        total: total.clamp(0.0, 1.0),
        factors,
    }
}

/// Rank candidates best-first, dropping everything below `floor`.
///
/// Ties break by specialization match, then workload score, then executor id
/// ascending — so equal totals always resolve the same way on every replica.
pub fn rank(mut candidates: Vec<CandidateScore>, floor: f64) -> Vec<CandidateScore> {
    candidates.retain(|c| c.total >= floor);
    candidates.sort_by(|a, b| {
        b.total
            .partial_cmp(&a.total)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| b.factors.specialization_match.cmp(&a.factors.specialization_match))
            .then_with(|| {
                b.factors
                    .workload
                    .partial_cmp(&a.factors.workload)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .then_with(|| a.executor_id.cmp(&b.executor_id))
    });
    candidates
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

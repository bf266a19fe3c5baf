use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hk_core::types::{RequestNumber, Urgency, UserId};
use hk_dispatch::engine::{
    AssignError, AssignmentEngine, DirectoryError, EngineConfig, UserDirectory,
};
use hk_dispatch::scoring::ExecutorProfile;
use hk_dispatch::store::{AssignmentStore, AssignmentType, MemoryDispatchStore, WorkOrderStore};
use hk_dispatch::work_order::{WorkOrder, WorkOrderStatus};
use hk_events::publisher::EventPublisher;
use hk_events::schema::SchemaRegistry;
use hk_harness::circuit_breaker::{BreakerConfig, CircuitBreaker};
use hk_substrate::MemorySubstrate;

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

struct StaticDirectory {
    pool: Vec<ExecutorProfile>,
    down: AtomicBool,
}

impl StaticDirectory {
    fn new(pool: Vec<ExecutorProfile>) -> Arc<Self> {
        Arc::new(Self { pool, down: AtomicBool::new(false) })
    }
}

#[async_trait::async_trait]
impl UserDirectory for StaticDirectory {
    async fn executor_pool(&self) -> Result<Vec<ExecutorProfile>, DirectoryError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(DirectoryError::Unavailable("connection refused".into()));
        }
        Ok(self.pool.clone())
    }

    async fn executor(&self, id: UserId) -> Result<Option<ExecutorProfile>, DirectoryError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(DirectoryError::Unavailable("connection refused".into()));
        }
        Ok(self.pool.iter().find(|p| p.executor_id == id).cloned())
    }
}

fn executor(id: i64, specs: &[&str], efficiency: f64, active: u32, cap: u32) -> ExecutorProfile {
    ExecutorProfile {
        executor_id: UserId(id),
        specializations: specs.iter().map(|s| s.to_string()).collect(),
        efficiency,
        active_work_count: active,
        max_concurrent: cap,
        available: true,
        account_active: true,
        role_active: true,
    }
}

struct Fixture {
    engine: AssignmentEngine,
    store: Arc<MemoryDispatchStore>,
    substrate: Arc<MemorySubstrate>,
}

fn fixture(directory: Arc<StaticDirectory>) -> Fixture {
    let store = Arc::new(MemoryDispatchStore::new());
    let substrate = Arc::new(MemorySubstrate::new());
    let events = Arc::new(EventPublisher::new(
        substrate.clone(),
        Arc::new(SchemaRegistry::platform()),
        hk_core::types::ServiceName::DispatchService,
    ));
    let breaker = CircuitBreaker::new(
        "directory_api",
        BreakerConfig {
            failure_threshold: 3,
            open_timeout: Duration::from_millis(100),
            call_timeout: Duration::from_secs(1),
        },
    );
    let engine = AssignmentEngine::new(
        directory,
        store.clone(),
        store.clone(),
        events,
        breaker,
        EngineConfig::default(),
    );
    Fixture { engine, store, substrate }
}

async fn seed_order(store: &MemoryDispatchStore, number: &str, category: &str) -> RequestNumber {
    let number = RequestNumber::parse(number).unwrap();
    let order = WorkOrder::new(
        number.clone(),
        UserId(42),
        category,
        Urgency::new(3).unwrap(),
        "leaking pipe",
        "12 Main St",
    );
    WorkOrderStore::insert(store, order).await.unwrap();
    number
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn specialization_match_dominates() {
    // E1 matches the category, E3 is a strong generalist, E2 mismatches.
    let directory = StaticDirectory::new(vec![
        executor(1, &["plumbing"], 85.0, 2, 5),
        executor(2, &["electrical"], 78.0, 1, 6),
        executor(3, &["general"], 92.0, 0, 4),
    ]);
    let f = fixture(directory);
    let number = seed_order(&f.store, "250927-001", "plumbing").await;

    let record = f
        .engine
        .assign(&number, Some(UserId(100)), AssignmentType::Auto, None, None)
        .await
        .unwrap();

    assert_eq!(record.executor_id, UserId(1));
    assert!(record.factors.specialization_match);
    assert!((record.score - 0.875).abs() < 1e-9);
    assert_eq!(record.alternates, vec![UserId(3), UserId(2)]);

    // The order moved with the decision.
    let order = WorkOrderStore::fetch(f.store.as_ref(), &number).await.unwrap().unwrap();
    assert_eq!(order.status, WorkOrderStatus::Assigned);
    assert_eq!(order.executor_id, Some(UserId(1)));

    // And the decision went out on the fabric.
    let events = f.substrate.stream_entries("events:request_assigned");
    assert_eq!(events.len(), 1);
}

#[tokio::test]
async fn candidates_below_floor_are_never_chosen() {
    // Mismatched specialization, weak everything else: 0.255 total.
    let mut weak = executor(1, &["electrical"], 5.0, 4, 5);
    weak.available = false;
    let directory = StaticDirectory::new(vec![weak]);
    let f = fixture(directory);
    let number = seed_order(&f.store, "250927-002", "plumbing").await;

    let err = f
        .engine
        .assign(&number, None, AssignmentType::Auto, None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, AssignError::NoSuitableExecutor { best_score: Some(_) }));

    // Nothing was persisted.
    assert!(f.store.active_for(&number).await.unwrap().is_none());
}

#[tokio::test]
async fn executors_at_capacity_are_infeasible() {
    let directory = StaticDirectory::new(vec![executor(1, &["plumbing"], 95.0, 5, 5)]);
    let f = fixture(directory);
    let number = seed_order(&f.store, "250927-003", "plumbing").await;

    let err = f
        .engine
        .assign(&number, None, AssignmentType::Auto, None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, AssignError::NoSuitableExecutor { .. }));
}

#[tokio::test]
async fn winner_must_hold_required_specialization() {
    // Highest scorer mismatches the category and is no generalist.
    let directory = StaticDirectory::new(vec![executor(2, &["electrical"], 99.0, 0, 9)]);
    let f = fixture(directory);
    let number = seed_order(&f.store, "250927-004", "plumbing").await;

    let err = f
        .engine
        .assign(&number, None, AssignmentType::Auto, None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, AssignError::NoSuitableExecutor { .. }));
}

#[tokio::test]
async fn directory_outage_blocks_assignment() {
    let directory = StaticDirectory::new(vec![executor(1, &["plumbing"], 85.0, 0, 5)]);
    directory.down.store(true, Ordering::SeqCst);
    let f = fixture(directory);
    let number = seed_order(&f.store, "250927-005", "plumbing").await;

    let err = f
        .engine
        .assign(&number, None, AssignmentType::Auto, None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, AssignError::DirectoryUnavailable));
    assert!(f.store.active_for(&number).await.unwrap().is_none());
}

#[tokio::test]
async fn reassignment_swaps_the_active_record() {
    let directory = StaticDirectory::new(vec![
        executor(1, &["plumbing"], 85.0, 0, 5),
        executor(2, &["plumbing"], 60.0, 0, 5),
    ]);
    let f = fixture(directory);
    let number = seed_order(&f.store, "250927-006", "plumbing").await;

    let first = f
        .engine
        .assign(&number, None, AssignmentType::Auto, None, None)
        .await
        .unwrap();
    let second = f
        .engine
        .assign(
            &number,
            Some(UserId(100)),
            AssignmentType::Manual,
            Some("executor requested swap".into()),
            None,
        )
        .await
        .unwrap();

    // Exactly one active record, and it is the latest decision.
    let active = f.store.active_for(&number).await.unwrap().unwrap();
    assert_eq!(active.id, second.id);

    let history = f.store.history(&number).await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history.iter().filter(|r| r.active).count(), 1);
    assert!(history.iter().any(|r| r.id == first.id && !r.active));
}

#[tokio::test]
async fn recommendations_rank_without_committing() {
    let directory = StaticDirectory::new(vec![
        executor(1, &["plumbing"], 85.0, 2, 5),
        executor(2, &["electrical"], 78.0, 1, 6),
        executor(3, &["general"], 92.0, 0, 4),
    ]);
    let f = fixture(directory);

    let recs = f.engine.recommendations("plumbing", 2).await.unwrap();
    assert_eq!(recs.len(), 2);
    assert_eq!(recs[0].executor_id, UserId(1));
    assert_eq!(recs[1].executor_id, UserId(3));
}

//! Daily request-number allocation.
//!
//! Numbers are `YYMMDD-NNN`: the date in the platform timezone, then a daily
//! sequence starting at 001. The sequence lives in the substrate counter
//! (TTL ~48 h, so a cell survives clock skew across midnight). When the
//! substrate is out, allocation falls back to the journal's own sequence —
//! high-water plus one, with the unique constraint catching races — and the
//! shared counter is pushed forward once the substrate returns.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use chrono_tz::Tz;
use tracing::{info, warn};

use hk_core::types::RequestNumber;
use hk_substrate::Substrate;

/// Counter cells outlive their day to tolerate replica clock skew.
const COUNTER_TTL: Duration = Duration::from_secs(48 * 3600);
/// Highest sequence the format can express.
const MAX_SEQUENCE: u32 = 999;
/// Bounded conflict retries on the journal fallback path.
const MAX_FALLBACK_ATTEMPTS: u32 = 10;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum AllocError {
    /// More than 999 allocations in one day; the caller must reject creation.
    #[error("daily sequence exhausted for {date_key}")]
    Overflow { date_key: String },

    /// Conflict retries ran out without landing a number.
    #[error("allocation abandoned after {attempts} attempts")]
    Exhausted { attempts: u32 },

    /// Neither the substrate nor the journal could allocate.
    #[error("allocator unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, thiserror::Error)]
pub enum JournalError {
    /// The (date, sequence) pair is already taken.
    #[error("sequence already recorded")]
    Conflict,

    #[error("journal unavailable: {0}")]
    Unavailable(String),
}

// ---------------------------------------------------------------------------
// SequenceJournal
// ---------------------------------------------------------------------------

/// Store-side record of every allocated number.
///
/// The journal is the source of truth for "never reused": each allocation is
/// recorded under a unique `(date, sequence)` constraint, and the recovery
/// path allocates directly from it when the shared counter is unreachable.
#[async_trait]
pub trait SequenceJournal: Send + Sync {
    async fn record(&self, date_key: &str, sequence: u32) -> Result<(), JournalError>;

    /// Highest sequence recorded for the date; 0 when none.
    async fn high_water(&self, date_key: &str) -> Result<u32, JournalError>;
}

/// In-process journal for tests and development mode.
#[derive(Default)]
pub struct MemoryJournal {
    taken: std::sync::Mutex<std::collections::HashMap<String, std::collections::BTreeSet<u32>>>,
}

impl MemoryJournal {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SequenceJournal for MemoryJournal {
    async fn record(&self, date_key: &str, sequence: u32) -> Result<(), JournalError> {
        let mut taken = self.taken.lock().expect("journal lock poisoned");
        if taken.entry(date_key.to_string()).or_default().insert(sequence) {
            Ok(())
        } else {
            Err(JournalError::Conflict)
        }
    }

    async fn high_water(&self, date_key: &str) -> Result<u32, JournalError> {
        let taken = self.taken.lock().expect("journal lock poisoned");
        Ok(taken
            .get(date_key)
            .and_then(|set| set.iter().next_back().copied())
            .unwrap_or(0))
    }
}

// ---------------------------------------------------------------------------
// Allocator
// ---------------------------------------------------------------------------

pub struct RequestNumberAllocator {
    substrate: Arc<dyn Substrate>,
    journal: Arc<dyn SequenceJournal>,
    timezone: Tz,
    /// Set while the fallback path has been used; the next substrate success
    /// re-syncs the shared counter past the journal's high-water mark.
    needs_resync: AtomicBool,
}

impl RequestNumberAllocator {
    pub fn new(
        substrate: Arc<dyn Substrate>,
        journal: Arc<dyn SequenceJournal>,
        timezone: Tz,
    ) -> Self {
        Self {
            substrate,
            journal,
            timezone,
            needs_resync: AtomicBool::new(false),
        }
    }

    fn counter_key(date_key: &str) -> String {
        format!("request_number:{date_key}")
    }

    /// Today's `YYMMDD` in the platform timezone. The sequence restarts at
    /// local midnight because the key changes with this value.
    pub fn current_date_key(&self) -> String {
        Utc::now()
            .with_timezone(&self.timezone)
            .format("%y%m%d")
            .to_string()
    }

    /// Allocate the next number for today.
    pub async fn allocate(&self) -> Result<RequestNumber, AllocError> {
        let date_key = self.current_date_key();
        self.allocate_for(&date_key).await
    }

    /// Allocate the next number for an explicit date key.
    pub async fn allocate_for(&self, date_key: &str) -> Result<RequestNumber, AllocError> {
        for attempt in 0..MAX_FALLBACK_ATTEMPTS {
            let sequence = match self
                .substrate
                .counter_incr(&Self::counter_key(date_key), COUNTER_TTL)
                .await
            {
                Ok(value) => {
                    let value = self.maybe_resync(date_key, value).await?;
                    u32::try_from(value).map_err(|_| AllocError::Overflow {
                        date_key: date_key.to_string(),
                    })?
                }
                Err(e) if e.is_unavailable() => {
                    warn!(error = %e, "substrate counter down, using journal fallback");
                    self.needs_resync.store(true, Ordering::SeqCst);
                    self.journal_next(date_key).await?
                }
                Err(e) => return Err(AllocError::Unavailable(e.to_string())),
            };

            if sequence > MAX_SEQUENCE {
                return Err(AllocError::Overflow {
                    date_key: date_key.to_string(),
                });
            }

            match self.journal.record(date_key, sequence).await {
                Ok(()) => {
                    return RequestNumber::compose(date_key, sequence).map_err(|e| {
                        AllocError::Unavailable(format!("allocated malformed number: {e}"))
                    });
                }
                // Lost a race (can only happen around re-sync); take another number.
                Err(JournalError::Conflict) => {
                    warn!(date_key, sequence, attempt, "sequence collision, retrying");
                    continue;
                }
                Err(JournalError::Unavailable(why)) => return Err(AllocError::Unavailable(why)),
            }
        }

        Err(AllocError::Exhausted {
            attempts: MAX_FALLBACK_ATTEMPTS,
        })
    }

    /// After a fallback period, push the shared counter past everything the
    /// journal handed out, so the sequence stays gapless going forward.
    async fn maybe_resync(&self, date_key: &str, current: i64) -> Result<i64, AllocError> {
        if !self.needs_resync.swap(false, Ordering::SeqCst) {
            return Ok(current);
        }

        let high_water = self
            .journal
            .high_water(date_key)
            .await
            .map_err(|e| AllocError::Unavailable(e.to_string()))?;

        if current > high_water as i64 {
            return Ok(current);
        }

        info!(date_key, high_water, "re-syncing request counter past journal");
        let key = Self::counter_key(date_key);
        let pushed = async {
            self.substrate
                .set_with_ttl(&key, &high_water.to_string(), COUNTER_TTL)
                .await?;
            self.substrate.counter_incr(&key, COUNTER_TTL).await
        }
        .await;

        match pushed {
            Ok(value) => Ok(value),
            Err(e) => {
                // Counter still stale; keep the flag so the next success retries.
                self.needs_resync.store(true, Ordering::SeqCst);
                Err(AllocError::Unavailable(e.to_string()))
            }
        }
    }

    async fn journal_next(&self, date_key: &str) -> Result<u32, AllocError> {
        let high_water = self
            .journal
            .high_water(date_key)
            .await
            .map_err(|e| AllocError::Unavailable(e.to_string()))?;
        Ok(high_water + 1)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use hk_substrate::MemorySubstrate;

    fn allocator() -> (RequestNumberAllocator, Arc<MemorySubstrate>) {
        let substrate = Arc::new(MemorySubstrate::new());
        let allocator = RequestNumberAllocator::new(
            substrate.clone(),
            Arc::new(MemoryJournal::new()),
            chrono_tz::Asia::Tashkent,
        );
        (allocator, substrate)
    }

    #[tokio::test]
    async fn sequence_starts_at_one_and_increments() {
        let (allocator, _) = allocator();
        assert_eq!(allocator.allocate_for("250927").await.unwrap().as_str(), "250927-001");
        assert_eq!(allocator.allocate_for("250927").await.unwrap().as_str(), "250927-002");
        assert_eq!(allocator.allocate_for("250927").await.unwrap().as_str(), "250927-003");
    }

    #[tokio::test]
    async fn day_boundary_restarts_sequence() {
        let (allocator, _) = allocator();
        allocator.allocate_for("250927").await.unwrap();
        allocator.allocate_for("250927").await.unwrap();

        let next_day = allocator.allocate_for("250928").await.unwrap();
        assert_eq!(next_day.as_str(), "250928-001");
    }

    #[tokio::test]
    async fn concurrent_allocations_are_distinct_and_gapless() {
        let substrate = Arc::new(MemorySubstrate::new());
        let allocator = Arc::new(RequestNumberAllocator::new(
            substrate,
            Arc::new(MemoryJournal::new()),
            chrono_tz::Asia::Tashkent,
        ));

        let mut handles = Vec::new();
        for _ in 0..200 {
            let allocator = allocator.clone();
            handles.push(tokio::spawn(async move {
                allocator.allocate_for("250927").await.unwrap()
            }));
        }

        let mut numbers = Vec::new();
        for handle in handles {
            numbers.push(handle.await.unwrap());
        }

        let mut sequences: Vec<u32> = numbers.iter().map(|n| n.sequence()).collect();
        sequences.sort_unstable();
        let expected: Vec<u32> = (1..=200).collect();
        assert_eq!(sequences, expected);
        assert!(numbers.iter().all(|n| n.date_key() == "250927"));
    }

    #[tokio::test]
    async fn overflow_is_a_typed_error() {
        let (allocator, substrate) = allocator();
        // Exhaust the day by pushing the counter to the ceiling.
        substrate
            .set_with_ttl("request_number:250927", "999", COUNTER_TTL)
            .await
            .unwrap();

        let err = allocator.allocate_for("250927").await.unwrap_err();
        assert!(matches!(err, AllocError::Overflow { .. }));
    }

    #[tokio::test]
    async fn fallback_allocates_from_journal_during_outage() {
        let (allocator, substrate) = allocator();
        allocator.allocate_for("250927").await.unwrap();
        allocator.allocate_for("250927").await.unwrap();

        substrate.set_unavailable(true);
        let fallback = allocator.allocate_for("250927").await.unwrap();
        assert_eq!(fallback.as_str(), "250927-003");
        let fallback = allocator.allocate_for("250927").await.unwrap();
        assert_eq!(fallback.as_str(), "250927-004");
    }

    #[tokio::test]
    async fn counter_resyncs_after_outage() {
        let (allocator, substrate) = allocator();
        allocator.allocate_for("250927").await.unwrap();

        substrate.set_unavailable(true);
        allocator.allocate_for("250927").await.unwrap(); // 002 via journal
        allocator.allocate_for("250927").await.unwrap(); // 003 via journal

        substrate.set_unavailable(false);
        // The stale shared counter (1) must not re-issue 002.
        let next = allocator.allocate_for("250927").await.unwrap();
        assert_eq!(next.as_str(), "250927-004");
    }

    #[tokio::test]
    async fn numbers_match_the_wire_pattern() {
        let (allocator, _) = allocator();
        let number = allocator.allocate().await.unwrap();
        // RequestNumber::compose already validates; double-check the shape.
        assert_eq!(number.as_str().len(), 10);
        assert_eq!(number.as_str().as_bytes()[6], b'-');
    }
}

//! Short-TTL cache over the user directory.
//!
//! Executor profiles are owned by the user service; the engine consumes them
//! through this cache. Staleness tolerance is the TTL (30 s by default):
//! within it an assignment may see a slightly outdated workload count, which
//! the concurrency cap on the executor side absorbs.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use lru::LruCache;
use tokio::sync::Mutex;
use tracing::debug;

use hk_core::types::UserId;

use crate::engine::{DirectoryError, UserDirectory};
use crate::scoring::ExecutorProfile;

const DEFAULT_TTL: Duration = Duration::from_secs(30);
const BY_ID_CAPACITY: usize = 256;

pub struct CachedDirectory {
    inner: Arc<dyn UserDirectory>,
    ttl: Duration,
    pool: Mutex<Option<(Instant, Vec<ExecutorProfile>)>>,
    by_id: Mutex<LruCache<i64, (Instant, ExecutorProfile)>>,
}

impl CachedDirectory {
    pub fn new(inner: Arc<dyn UserDirectory>) -> Self {
        Self::with_ttl(inner, DEFAULT_TTL)
    }

    pub fn with_ttl(inner: Arc<dyn UserDirectory>, ttl: Duration) -> Self {
        Self {
            inner,
            ttl,
            pool: Mutex::new(None),
            by_id: Mutex::new(LruCache::new(
                NonZeroUsize::new(BY_ID_CAPACITY).expect("capacity is non-zero"),
            )),
        }
    }

    /// Drop everything cached (admin hook after bulk profile edits).
    pub async fn invalidate(&self) {
        self.pool.lock().await.take();
        self.by_id.lock().await.clear();
    }
}

#[async_trait::async_trait]
impl UserDirectory for CachedDirectory {
    async fn executor_pool(&self) -> Result<Vec<ExecutorProfile>, DirectoryError> {
        {
            let cached = self.pool.lock().await;
            if let Some((at, pool)) = cached.as_ref() {
                if at.elapsed() < self.ttl {
                    return Ok(pool.clone());
                }
            }
        }

        let fresh = self.inner.executor_pool().await?;
        debug!(count = fresh.len(), "executor pool refreshed");
        *self.pool.lock().await = Some((Instant::now(), fresh.clone()));
        Ok(fresh)
    }

    async fn executor(&self, id: UserId) -> Result<Option<ExecutorProfile>, DirectoryError> {
        {
            let mut cached = self.by_id.lock().await;
            if let Some((at, profile)) = cached.get(&id.0) {
                if at.elapsed() < self.ttl {
                    return Ok(Some(profile.clone()));
                }
            }
        }

        let fresh = self.inner.executor(id).await?;
        if let Some(profile) = &fresh {
            self.by_id
                .lock()
                .await
                .put(id.0, (Instant::now(), profile.clone()));
        }
        Ok(fresh)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingDirectory {
        calls: AtomicU32,
    }

    #[async_trait::async_trait]
    impl UserDirectory for CountingDirectory {
        async fn executor_pool(&self) -> Result<Vec<ExecutorProfile>, DirectoryError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec![ExecutorProfile {
                executor_id: UserId(1),
                specializations: vec!["plumbing".into()],
                efficiency: 80.0,
                active_work_count: 0,
                max_concurrent: 5,
                available: true,
                account_active: true,
                role_active: true,
            }])
        }

        async fn executor(&self, id: UserId) -> Result<Option<ExecutorProfile>, DirectoryError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Some(ExecutorProfile {
                executor_id: id,
                specializations: vec![],
                efficiency: 50.0,
                active_work_count: 0,
                max_concurrent: 1,
                available: true,
                account_active: true,
                role_active: true,
            }))
        }
    }

    #[tokio::test]
    async fn pool_is_served_from_cache_within_ttl() {
        let inner = Arc::new(CountingDirectory { calls: AtomicU32::new(0) });
        let cached = CachedDirectory::with_ttl(inner.clone(), Duration::from_secs(60));

        cached.executor_pool().await.unwrap();
        cached.executor_pool().await.unwrap();
        cached.executor_pool().await.unwrap();

        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn expired_pool_refreshes() {
        let inner = Arc::new(CountingDirectory { calls: AtomicU32::new(0) });
        let cached = CachedDirectory::with_ttl(inner.clone(), Duration::from_millis(10));

        cached.executor_pool().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        cached.executor_pool().await.unwrap();

        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn invalidate_clears_cache() {
        let inner = Arc::new(CountingDirectory { calls: AtomicU32::new(0) });
        let cached = CachedDirectory::with_ttl(inner.clone(), Duration::from_secs(60));

        cached.executor_pool().await.unwrap();
        cached.invalidate().await;
        cached.executor_pool().await.unwrap();

        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn by_id_lookups_cache_independently() {
        let inner = Arc::new(CountingDirectory { calls: AtomicU32::new(0) });
        let cached = CachedDirectory::with_ttl(inner.clone(), Duration::from_secs(60));

        cached.executor(UserId(7)).await.unwrap();
        cached.executor(UserId(7)).await.unwrap();
        cached.executor(UserId(8)).await.unwrap();

        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
    }
}

use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::{Connection, Pool, Runtime};
use futures_util::StreamExt;
use redis::streams::StreamMaxlen;
use redis::AsyncCommands;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::{scripts, Result, Subscription, Substrate, SubstrateError, WindowProbe};

// ---------------------------------------------------------------------------
// RedisSubstrate
// ---------------------------------------------------------------------------

/// Pooled Redis-backed substrate.
///
/// Every call runs under `op_timeout`; pool exhaustion, connection loss, and
/// deadline misses all surface as unavailability rather than panics, so the
/// policy decision (fail open or fail closed) stays with the caller.
pub struct RedisSubstrate {
    pool: Pool,
    /// Separate plain client for pub/sub, which cannot run on pooled
    /// multiplexed connections.
    client: redis::Client,
    op_timeout: Duration,
    window_script: redis::Script,
    counter_script: redis::Script,
}

impl RedisSubstrate {
    /// Connect a pool of `pool_size` connections to `url`.
    pub fn connect(url: &str, pool_size: usize, op_timeout: Duration) -> Result<Self> {
        let config = deadpool_redis::Config::from_url(url);
        let pool = config
            .builder()
            .map_err(|e| SubstrateError::Unavailable(e.to_string()))?
            .max_size(pool_size)
            .runtime(Runtime::Tokio1)
            .build()
            .map_err(|e| SubstrateError::Unavailable(e.to_string()))?;

        let client =
            redis::Client::open(url).map_err(|e| SubstrateError::Unavailable(e.to_string()))?;

        Ok(Self {
            pool,
            client,
            op_timeout,
            window_script: redis::Script::new(scripts::SLIDING_WINDOW),
            counter_script: redis::Script::new(scripts::COUNTER_INCR),
        })
    }

    async fn conn(&self) -> Result<Connection> {
        self.pool
            .get()
            .await
            .map_err(|e| SubstrateError::Unavailable(e.to_string()))
    }

    /// Run `fut` under the configured deadline.
    async fn bounded<T>(
        &self,
        fut: impl std::future::Future<Output = redis::RedisResult<T>>,
    ) -> Result<T> {
        match tokio::time::timeout(self.op_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) if e.is_io_error() || e.is_connection_refusal() || e.is_timeout() => {
                Err(SubstrateError::Unavailable(e.to_string()))
            }
            Ok(Err(e)) => Err(SubstrateError::Protocol(e.to_string())),
            Err(_) => Err(SubstrateError::Timeout(self.op_timeout)),
        }
    }
}

#[async_trait]
impl Substrate for RedisSubstrate {
    async fn ping(&self) -> Result<()> {
        let mut conn = self.conn().await?;
        self.bounded(async move {
            redis::cmd("PING").query_async::<()>(&mut conn).await
        })
        .await
    }

    async fn sliding_window_probe(
        &self,
        key: &str,
        now_ms: u64,
        window_ms: u64,
        cap: u32,
        ttl: Duration,
    ) -> Result<WindowProbe> {
        let mut conn = self.conn().await?;
        let script = &self.window_script;
        let (allowed, remaining, reset_after_ms): (i64, i64, i64) = self
            .bounded(async move {
                script
                    .key(key)
                    .arg(now_ms)
                    .arg(window_ms)
                    .arg(cap)
                    .arg(ttl.as_secs().max(1))
                    .invoke_async(&mut conn)
                    .await
            })
            .await?;

        Ok(WindowProbe {
            allowed: allowed == 1,
            remaining: remaining.max(0) as u32,
            reset_after_ms: reset_after_ms.max(0) as u64,
        })
    }

    async fn window_usage(&self, key: &str, now_ms: u64, window_ms: u64) -> Result<u64> {
        let mut conn = self.conn().await?;
        let floor = now_ms.saturating_sub(window_ms);
        self.bounded(async move {
            conn.zcount(key, floor as f64, now_ms as f64).await
        })
        .await
    }

    async fn counter_incr(&self, key: &str, ttl: Duration) -> Result<i64> {
        let mut conn = self.conn().await?;
        let script = &self.counter_script;
        self.bounded(async move {
            script
                .key(key)
                .arg(ttl.as_secs().max(1))
                .invoke_async(&mut conn)
                .await
        })
        .await
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn().await?;
        self.bounded(async move { conn.get(key).await }).await
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.conn().await?;
        self.bounded(async move {
            conn.set_ex(key, value, ttl.as_secs().max(1)).await
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn().await?;
        let removed: i64 = self.bounded(async move { conn.del(key).await }).await?;
        Ok(removed > 0)
    }

    async fn stream_append(
        &self,
        stream: &str,
        fields: &[(&str, &str)],
        maxlen: usize,
    ) -> Result<String> {
        let mut conn = self.conn().await?;
        self.bounded(async move {
            conn.xadd_maxlen(stream, StreamMaxlen::Approx(maxlen), "*", fields)
                .await
        })
        .await
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<u64> {
        let mut conn = self.conn().await?;
        self.bounded(async move { conn.publish(channel, payload).await })
            .await
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription> {
        let mut pubsub = tokio::time::timeout(self.op_timeout, self.client.get_async_pubsub())
            .await
            .map_err(|_| SubstrateError::Timeout(self.op_timeout))?
            .map_err(|e| SubstrateError::Unavailable(e.to_string()))?;

        pubsub
            .subscribe(channel)
            .await
            .map_err(|e| SubstrateError::Unavailable(e.to_string()))?;

        let (tx, rx) = mpsc::channel(256);
        let channel_name = channel.to_string();
        tokio::spawn(async move {
            let mut messages = pubsub.on_message();
            while let Some(msg) = messages.next().await {
                let payload: String = match msg.get_payload() {
                    Ok(p) => p,
                    Err(e) => {
                        warn!(channel = %channel_name, error = %e, "undecodable pub/sub payload");
                        continue;
                    }
                };
                if tx.send(payload).await.is_err() {
                    debug!(channel = %channel_name, "subscriber dropped, ending feed");
                    break;
                }
            }
        });

        Ok(Subscription::new(rx))
    }
}

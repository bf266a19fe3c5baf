use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::{Result, Subscription, Substrate, SubstrateError, WindowProbe};

// ---------------------------------------------------------------------------
// MemorySubstrate
// ---------------------------------------------------------------------------

/// Fully in-process substrate used by tests and development mode.
///
/// Implements the same semantics as the Redis substrate — atomic window
/// probes, TTL-on-create counters, capped streams, fan-out channels — with
/// plain locked maps. `set_unavailable(true)` makes every call fail with
/// [`SubstrateError::Unavailable`] so suites can exercise fail-open and
/// fallback paths.
#[derive(Default)]
pub struct MemorySubstrate {
    state: Mutex<State>,
    unavailable: AtomicBool,
    stream_seq: AtomicU64,
}

#[derive(Default)]
struct State {
    windows: HashMap<String, Vec<u64>>,
    counters: HashMap<String, i64>,
    strings: HashMap<String, String>,
    streams: HashMap<String, Vec<(String, Vec<(String, String)>)>>,
    channels: HashMap<String, Vec<mpsc::Sender<String>>>,
    expiries: HashMap<String, Instant>,
}

impl State {
    fn purge_expired(&mut self, key: &str) {
        if let Some(deadline) = self.expiries.get(key) {
            if Instant::now() >= *deadline {
                self.expiries.remove(key);
                self.windows.remove(key);
                self.counters.remove(key);
                self.strings.remove(key);
            }
        }
    }
}

impl MemorySubstrate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate a substrate outage. While set, every call errors.
    pub fn set_unavailable(&self, down: bool) {
        self.unavailable.store(down, Ordering::SeqCst);
    }

    fn check_up(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(SubstrateError::Unavailable("memory substrate marked down".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Substrate for MemorySubstrate {
    async fn ping(&self) -> Result<()> {
        self.check_up()
    }

    async fn sliding_window_probe(
        &self,
        key: &str,
        now_ms: u64,
        window_ms: u64,
        cap: u32,
        ttl: Duration,
    ) -> Result<WindowProbe> {
        self.check_up()?;
        let mut state = self.state.lock().expect("substrate lock poisoned");
        state.purge_expired(key);

        let window = state.windows.entry(key.to_string()).or_default();
        let floor = now_ms.saturating_sub(window_ms);
        window.retain(|ts| *ts > floor);

        let probe = if (window.len() as u32) < cap {
            window.push(now_ms);
            WindowProbe {
                allowed: true,
                remaining: cap - window.len() as u32,
                reset_after_ms: window_ms,
            }
        } else {
            let oldest = window.iter().copied().min().unwrap_or(now_ms);
            WindowProbe {
                allowed: false,
                remaining: 0,
                reset_after_ms: window_ms.saturating_sub(now_ms - oldest),
            }
        };

        state
            .expiries
            .insert(key.to_string(), Instant::now() + ttl);
        Ok(probe)
    }

    async fn window_usage(&self, key: &str, now_ms: u64, window_ms: u64) -> Result<u64> {
        self.check_up()?;
        let mut state = self.state.lock().expect("substrate lock poisoned");
        state.purge_expired(key);
        let floor = now_ms.saturating_sub(window_ms);
        Ok(state
            .windows
            .get(key)
            .map(|w| w.iter().filter(|ts| **ts > floor).count() as u64)
            .unwrap_or(0))
    }

    async fn counter_incr(&self, key: &str, ttl: Duration) -> Result<i64> {
        self.check_up()?;
        let mut state = self.state.lock().expect("substrate lock poisoned");
        state.purge_expired(key);

        let counter = state.counters.entry(key.to_string()).or_insert(0);
        *counter += 1;
        let value = *counter;
        if value == 1 {
            state.expiries.insert(key.to_string(), Instant::now() + ttl);
        }
        Ok(value)
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.check_up()?;
        let mut state = self.state.lock().expect("substrate lock poisoned");
        state.purge_expired(key);
        Ok(state.strings.get(key).cloned())
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        self.check_up()?;
        let mut state = self.state.lock().expect("substrate lock poisoned");
        state.strings.insert(key.to_string(), value.to_string());
        state.expiries.insert(key.to_string(), Instant::now() + ttl);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.check_up()?;
        let mut state = self.state.lock().expect("substrate lock poisoned");
        state.expiries.remove(key);
        let removed = state.windows.remove(key).is_some()
            | state.counters.remove(key).is_some()
            | state.strings.remove(key).is_some();
        Ok(removed)
    }

    async fn stream_append(
        &self,
        stream: &str,
        fields: &[(&str, &str)],
        maxlen: usize,
    ) -> Result<String> {
        self.check_up()?;
        let seq = self.stream_seq.fetch_add(1, Ordering::SeqCst);
        let id = format!("{}-{}", seq, 0);

        let mut state = self.state.lock().expect("substrate lock poisoned");
        let entries = state.streams.entry(stream.to_string()).or_default();
        entries.push((
            id.clone(),
            fields
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        ));
        if entries.len() > maxlen {
            let excess = entries.len() - maxlen;
            entries.drain(..excess);
        }
        Ok(id)
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<u64> {
        self.check_up()?;
        let mut state = self.state.lock().expect("substrate lock poisoned");
        let subscribers = state.channels.entry(channel.to_string()).or_default();
        subscribers.retain(|tx| tx.try_send(payload.to_string()).is_ok());
        Ok(subscribers.len() as u64)
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription> {
        self.check_up()?;
        let (tx, rx) = mpsc::channel(256);
        let mut state = self.state.lock().expect("substrate lock poisoned");
        state.channels.entry(channel.to_string()).or_default().push(tx);
        Ok(Subscription::new(rx))
    }
}

impl MemorySubstrate {
    /// Entries currently buffered on a stream (test helper).
    pub fn stream_entries(&self, stream: &str) -> Vec<(String, Vec<(String, String)>)> {
        let state = self.state.lock().expect("substrate lock poisoned");
        state.streams.get(stream).cloned().unwrap_or_default()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

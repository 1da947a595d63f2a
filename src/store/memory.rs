use async_trait::async_trait;
use std::{
    collections::HashMap,
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant},
};
use tokio::sync::Mutex;

use super::SharedKv;
use crate::error::Result;

/// In-process [`SharedKv`] with the same compare-and-set and expiry
/// semantics as the Redis backend.
///
/// Several limiter instances handed the same `Arc<MemoryKv>` behave like
/// separate processes sharing one Redis. Meant for tests and single-process
/// simulation: every operation takes one global lock.
///
/// Expired entries read as absent immediately and are physically removed by
/// a periodic sweep of the whole map.
#[derive(Default)]
pub struct MemoryKv {
    entries: Mutex<HashMap<String, (String, Instant)>>,
    writes: AtomicU64,
}

/// Successful writes between sweeps of expired entries
const SWEEP_INTERVAL: u64 = 1024;

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live (unexpired) keys
    pub async fn len(&self) -> usize {
        let now = Instant::now();
        let entries = self.entries.lock().await;
        entries.values().filter(|(_, expires_at)| *expires_at > now).count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl SharedKv for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let now = Instant::now();
        let entries = self.entries.lock().await;
        Ok(entries
            .get(key)
            .filter(|(_, expires_at)| *expires_at > now)
            .map(|(value, _)| value.clone()))
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
        ttl: Duration,
    ) -> Result<bool> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;

        let current = entries
            .get(key)
            .filter(|(_, expires_at)| *expires_at > now)
            .map(|(value, _)| value.as_str());
        if current != expected {
            return Ok(false);
        }

        entries.insert(key.to_string(), (value.to_string(), now + ttl));
        if self.writes.fetch_add(1, Ordering::Relaxed) % SWEEP_INTERVAL == SWEEP_INTERVAL - 1 {
            entries.retain(|_, (_, expires_at)| *expires_at > now);
        }
        Ok(true)
    }

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}

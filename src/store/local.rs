use async_trait::async_trait;
use moka::{future::Cache, ops::compute::Op, Expiry};
use std::time::{Duration, Instant};

use super::{StateStore, Transition, TransitionFn};
use crate::error::Result;

/// Stored state plus the idle expiry it was written with
#[derive(Debug, Clone)]
struct Record<S> {
    state: S,
    ttl: Duration,
}

/// Expires each record after the ttl carried by its latest write
struct RecordExpiry;

impl<S> Expiry<String, Record<S>> for RecordExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &Record<S>,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &Record<S>,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

/// In-process state store.
///
/// Cycles on the same key are serialised by moka's key-level compute lock;
/// unrelated keys proceed independently. Abandoned keys are reclaimed by
/// per-record expiry, and `max_keys` bounds memory under key churn.
pub struct LocalStore<S> {
    cache: Cache<String, Record<S>>,
}

impl<S> LocalStore<S>
where
    S: Clone + Send + Sync + 'static,
{
    pub fn new(max_keys: u64) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_keys)
            .expire_after(RecordExpiry)
            .build();

        Self { cache }
    }
}

#[async_trait]
impl<S> StateStore<S> for LocalStore<S>
where
    S: Clone + Send + Sync + 'static,
{
    async fn update(&self, key: &str, transition: &TransitionFn<'_, S>) -> Result<bool> {
        let mut admitted = false;

        self.cache
            .entry_by_ref(key)
            .and_compute_with(|entry| {
                let current = entry.map(|e| e.into_value().state);
                let Transition {
                    next,
                    ttl,
                    admitted: verdict,
                } = transition(current);
                admitted = verdict;
                std::future::ready(Op::Put(Record { state: next, ttl }))
            })
            .await;

        Ok(admitted)
    }

    async fn load(&self, key: &str) -> Result<Option<S>> {
        Ok(self.cache.get(key).await.map(|record| record.state))
    }
}

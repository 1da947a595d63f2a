//! Admission algorithms.
//!
//! Each limiter owns a state schema and a pure transition
//! `(previous state, now) -> (next state, ttl, verdict)`. All mutation goes
//! through [`StateStore::update`], so the same code is correct in process and
//! against a store shared by many processes. Refill, leak and eviction are
//! computed lazily from elapsed time; nothing runs in the background.

use async_trait::async_trait;
use std::{sync::Arc, time::Duration};

use crate::{
    clock::Clock,
    config::AlgorithmKind,
    error::Result,
    store::{StateStore, Transition},
};

mod fixed_window;
mod leaky_bucket;
mod sliding_window;
mod token_bucket;

pub use fixed_window::{FixedWindowLimiter, FixedWindowState};
pub use leaky_bucket::{LeakyBucketLimiter, LeakyBucketState};
pub use sliding_window::{SlidingWindowLimiter, SlidingWindowState};
pub use token_bucket::{TokenBucketLimiter, TokenBucketState};

/// Tolerance for float comparisons on bucket levels and token counts
pub(crate) const EPSILON: f64 = 1e-9;

/// A configured admission algorithm
#[async_trait]
pub trait Limiter: Send + Sync {
    /// Name the limiter was registered under
    fn name(&self) -> &str;

    fn kind(&self) -> AlgorithmKind;

    /// Decide whether one request for `key` is admitted, recording it if so
    async fn try_acquire(&self, key: &str) -> Result<bool>;

    async fn health_check(&self) -> Result<()>;
}

/// What every limiter holds besides its parameters: where its state lives,
/// how its keys are spelled, and what time it is.
pub(crate) struct StateBinding<S> {
    name: String,
    key_base: String,
    store: Arc<dyn StateStore<S>>,
    clock: Arc<dyn Clock>,
}

impl<S> StateBinding<S>
where
    S: Send + 'static,
{
    pub(crate) fn new(
        kind: AlgorithmKind,
        name: String,
        store: Arc<dyn StateStore<S>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let key_base = format!("{}{}:", kind.namespace(), name);
        Self {
            name,
            key_base,
            store,
            clock,
        }
    }

    pub(crate) fn set_key_prefix(&mut self, kind: AlgorithmKind, prefix: &str) {
        self.key_base = format!("{}{}{}:", prefix, kind.namespace(), self.name);
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    /// Store key of one limiter key: `{prefix}{namespace}{limiter}:{key}`
    pub(crate) fn store_key(&self, key: &str) -> String {
        format!("{}{}", self.key_base, key)
    }

    /// Run one atomic cycle, reading the clock inside the transition so a
    /// retried cycle sees fresh time.
    pub(crate) async fn apply<F>(&self, key: &str, step: F) -> Result<bool>
    where
        F: Fn(Option<S>, u64) -> Transition<S> + Send + Sync,
    {
        let store_key = self.store_key(key);
        let clock = &self.clock;
        self.store
            .update(&store_key, &|state| step(state, clock.now_millis()))
            .await
    }

    pub(crate) async fn load(&self, key: &str) -> Result<Option<S>> {
        self.store.load(&self.store_key(key)).await
    }

    pub(crate) async fn health_check(&self) -> Result<()> {
        self.store.health_check().await
    }
}

/// Time for a bucket of `capacity` to fully drain or refill at `per_second`
pub(crate) fn replenish_horizon(capacity: u64, per_second: f64) -> Duration {
    let millis = (capacity as f64 / per_second * 1000.0).ceil().max(1.0);
    Duration::from_millis(millis as u64)
}

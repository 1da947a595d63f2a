use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::{sync::Arc, time::Duration};
use tracing::trace;

use super::{replenish_horizon, Limiter, StateBinding, EPSILON};
use crate::{
    clock::{elapsed_millis, Clock},
    config::{AlgorithmKind, LeakyBucketConfig},
    error::Result,
    store::{StateStore, Transition},
};

/// Fill level of one key's bucket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeakyBucketState {
    pub level: f64,
    pub last_leak_ms: u64,
}

/// Leaky bucket limiter.
///
/// The bucket drains continuously at `rate` per second. A request is admitted
/// while the level, after draining, is below `capacity`, and adds one unit.
/// The level is kept in `[0, capacity]`: an admission with less than one
/// unit of headroom tops the bucket off at exactly `capacity`.
pub struct LeakyBucketLimiter {
    config: LeakyBucketConfig,
    binding: StateBinding<LeakyBucketState>,
    ttl: Duration,
}

impl LeakyBucketLimiter {
    pub fn new(
        name: impl Into<String>,
        config: LeakyBucketConfig,
        store: Arc<dyn StateStore<LeakyBucketState>>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        // An idle bucket is empty after this long, so expiry loses nothing
        let ttl = replenish_horizon(config.capacity, config.rate);
        Ok(Self {
            config,
            binding: StateBinding::new(AlgorithmKind::LeakyBucket, name.into(), store, clock),
            ttl,
        })
    }

    pub fn with_key_prefix(mut self, prefix: &str) -> Self {
        self.binding.set_key_prefix(AlgorithmKind::LeakyBucket, prefix);
        self
    }

    pub fn transition(
        &self,
        state: Option<LeakyBucketState>,
        now: u64,
    ) -> Transition<LeakyBucketState> {
        let capacity = self.config.capacity as f64;
        // New buckets start empty with no retroactive leak
        let current = state.unwrap_or(LeakyBucketState {
            level: 0.0,
            last_leak_ms: now,
        });

        let leaked = elapsed_millis(now, current.last_leak_ms) as f64 * self.config.rate / 1000.0;
        let mut level = (current.level - leaked).clamp(0.0, capacity);

        let admitted = level < capacity - EPSILON;
        if admitted {
            level = (level + 1.0).min(capacity);
        }

        Transition {
            next: LeakyBucketState {
                level,
                last_leak_ms: current.last_leak_ms.max(now),
            },
            ttl: self.ttl,
            admitted,
        }
    }

    /// Stored state for `key`
    pub async fn state(&self, key: &str) -> Result<Option<LeakyBucketState>> {
        self.binding.load(key).await
    }
}

#[async_trait]
impl Limiter for LeakyBucketLimiter {
    fn name(&self) -> &str {
        self.binding.name()
    }

    fn kind(&self) -> AlgorithmKind {
        AlgorithmKind::LeakyBucket
    }

    async fn try_acquire(&self, key: &str) -> Result<bool> {
        let admitted = self
            .binding
            .apply(key, |state, now| self.transition(state, now))
            .await?;
        trace!(limiter = %self.name(), key = %key, admitted, "Leaky bucket decision");
        Ok(admitted)
    }

    async fn health_check(&self) -> Result<()> {
        self.binding.health_check().await
    }
}

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::{sync::Arc, time::Duration};
use tracing::trace;

use super::{replenish_horizon, Limiter, StateBinding, EPSILON};
use crate::{
    clock::{elapsed_millis, Clock},
    config::{AlgorithmKind, InitialFill, TokenBucketConfig},
    error::Result,
    store::{StateStore, Transition},
};

/// Tokens available to one key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenBucketState {
    pub tokens: f64,
    pub last_refill_ms: u64,
}

/// Token bucket limiter.
///
/// Tokens accrue at `token_rate` per second up to `capacity`; each admitted
/// request spends one whole token. Fractional accrual is carried between
/// calls as an `f64` and never truncated, so slow trickles add up. A token
/// counts as whole within [`EPSILON`] of 1, and the result is clamped to
/// `[0, capacity]`.
///
/// Records expire once the bucket would have refilled completely. With
/// [`InitialFill::Empty`] a missing record means an empty bucket, so those
/// records are kept for `idle_ttl_ms` instead.
pub struct TokenBucketLimiter {
    config: TokenBucketConfig,
    binding: StateBinding<TokenBucketState>,
    ttl: Duration,
}

impl TokenBucketLimiter {
    pub fn new(
        name: impl Into<String>,
        config: TokenBucketConfig,
        store: Arc<dyn StateStore<TokenBucketState>>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        let horizon = replenish_horizon(config.capacity, config.token_rate);
        let ttl = match config.initial_fill {
            // A full-start bucket idle past the horizon is full either way
            InitialFill::Full => horizon,
            // An expired empty-start bucket comes back empty, not refilled
            InitialFill::Empty => horizon.max(Duration::from_millis(config.idle_ttl_ms)),
        };
        Ok(Self {
            config,
            binding: StateBinding::new(AlgorithmKind::TokenBucket, name.into(), store, clock),
            ttl,
        })
    }

    pub fn with_key_prefix(mut self, prefix: &str) -> Self {
        self.binding.set_key_prefix(AlgorithmKind::TokenBucket, prefix);
        self
    }

    fn initial_tokens(&self) -> f64 {
        match self.config.initial_fill {
            InitialFill::Full => self.config.capacity as f64,
            InitialFill::Empty => 0.0,
        }
    }

    pub fn transition(
        &self,
        state: Option<TokenBucketState>,
        now: u64,
    ) -> Transition<TokenBucketState> {
        let capacity = self.config.capacity as f64;
        let current = state.unwrap_or_else(|| TokenBucketState {
            tokens: self.initial_tokens(),
            last_refill_ms: now,
        });

        let accrued =
            elapsed_millis(now, current.last_refill_ms) as f64 * self.config.token_rate / 1000.0;
        let mut tokens = (current.tokens + accrued).clamp(0.0, capacity);

        let admitted = tokens + EPSILON >= 1.0;
        if admitted {
            tokens = (tokens - 1.0).max(0.0);
        }

        Transition {
            next: TokenBucketState {
                tokens,
                last_refill_ms: current.last_refill_ms.max(now),
            },
            ttl: self.ttl,
            admitted,
        }
    }

    /// Stored state for `key`
    pub async fn state(&self, key: &str) -> Result<Option<TokenBucketState>> {
        self.binding.load(key).await
    }
}

#[async_trait]
impl Limiter for TokenBucketLimiter {
    fn name(&self) -> &str {
        self.binding.name()
    }

    fn kind(&self) -> AlgorithmKind {
        AlgorithmKind::TokenBucket
    }

    async fn try_acquire(&self, key: &str) -> Result<bool> {
        let admitted = self
            .binding
            .apply(key, |state, now| self.transition(state, now))
            .await?;
        trace!(limiter = %self.name(), key = %key, admitted, "Token bucket decision");
        Ok(admitted)
    }

    async fn health_check(&self) -> Result<()> {
        self.binding.health_check().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{clock::ManualClock, store::LocalStore};

    fn limiter(initial_fill: InitialFill, clock: &ManualClock) -> TokenBucketLimiter {
        TokenBucketLimiter::new(
            "test",
            TokenBucketConfig {
                capacity: 10,
                token_rate: 5.0,
                initial_fill,
                ..Default::default()
            },
            Arc::new(LocalStore::<TokenBucketState>::new(1000)),
            Arc::new(clock.clone()),
        )
        .unwrap()
    }

    #[test]
    fn test_initial_fill_policy() {
        let clock = ManualClock::new(0);

        let full = limiter(InitialFill::Full, &clock).transition(None, 1_000);
        assert!(full.admitted);
        assert_eq!(full.next.tokens, 9.0);

        let empty = limiter(InitialFill::Empty, &clock).transition(None, 1_000);
        assert!(!empty.admitted);
        assert_eq!(empty.next.tokens, 0.0);
    }

    #[test]
    fn test_empty_start_records_outlive_refill_horizon() {
        let clock = ManualClock::new(0);

        let full = limiter(InitialFill::Full, &clock).transition(None, 0);
        assert_eq!(full.ttl, Duration::from_secs(2));

        let empty = limiter(InitialFill::Empty, &clock).transition(None, 0);
        assert_eq!(empty.ttl, Duration::from_secs(3_600));

        // A short idle expiry still covers a full refill
        let short = TokenBucketLimiter::new(
            "short",
            TokenBucketConfig {
                capacity: 10,
                token_rate: 5.0,
                initial_fill: InitialFill::Empty,
                idle_ttl_ms: 10,
            },
            Arc::new(LocalStore::<TokenBucketState>::new(1000)),
            Arc::new(clock.clone()),
        )
        .unwrap();
        assert_eq!(short.transition(None, 0).ttl, Duration::from_secs(2));
    }

    #[test]
    fn test_fractional_accrual_is_preserved() {
        let clock = ManualClock::new(0);
        let limiter = limiter(InitialFill::Empty, &clock);

        // 100ms at 5/s is half a token: not enough alone, enough twice
        let state = TokenBucketState { tokens: 0.0, last_refill_ms: 0 };
        let half = limiter.transition(Some(state), 100);
        assert!(!half.admitted);
        assert_eq!(half.next.tokens, 0.5);

        let whole = limiter.transition(Some(half.next), 200);
        assert!(whole.admitted);
        assert_eq!(whole.next.tokens, 0.0);
    }

    #[test]
    fn test_refill_caps_at_capacity() {
        let clock = ManualClock::new(0);
        let limiter = limiter(InitialFill::Empty, &clock);

        let state = TokenBucketState { tokens: 3.0, last_refill_ms: 0 };
        let next = limiter.transition(Some(state), 3_600_000);
        assert!(next.admitted);
        assert_eq!(next.next.tokens, 9.0);
    }

    #[test]
    fn test_backwards_clock_accrues_nothing() {
        let clock = ManualClock::new(0);
        let limiter = limiter(InitialFill::Empty, &clock);

        let state = TokenBucketState { tokens: 0.4, last_refill_ms: 5_000 };
        let next = limiter.transition(Some(state), 1_000);
        assert!(!next.admitted);
        assert_eq!(next.next, TokenBucketState { tokens: 0.4, last_refill_ms: 5_000 });
    }

    #[tokio::test]
    async fn test_empty_bucket_refills_at_rate() {
        let clock = ManualClock::new(1_000_000);
        let limiter = limiter(InitialFill::Empty, &clock);

        assert!(!limiter.try_acquire("user").await.unwrap());
        clock.advance_millis(1_000);

        for _ in 0..5 {
            assert!(limiter.try_acquire("user").await.unwrap());
        }
        assert!(!limiter.try_acquire("user").await.unwrap());
    }
}

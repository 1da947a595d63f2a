use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::{sync::Arc, time::Duration};
use tracing::trace;

use super::{Limiter, StateBinding};
use crate::{
    clock::{elapsed_millis, Clock},
    config::{AlgorithmKind, FixedWindowConfig},
    error::Result,
    store::{StateStore, Transition},
};

/// Requests counted in the current window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixedWindowState {
    pub count: u64,
    pub window_start: u64,
}

/// Fixed window counter.
///
/// Up to `per_window_limit` requests are admitted per key in each window of
/// `window_size_ms`. A window opens with the first request after the previous
/// one closed; its end is fixed at that moment and later requests never push
/// it out. Up to twice the limit can pass around a window edge.
pub struct FixedWindowLimiter {
    config: FixedWindowConfig,
    binding: StateBinding<FixedWindowState>,
}

impl FixedWindowLimiter {
    pub fn new(
        name: impl Into<String>,
        config: FixedWindowConfig,
        store: Arc<dyn StateStore<FixedWindowState>>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            binding: StateBinding::new(AlgorithmKind::FixedWindow, name.into(), store, clock),
        })
    }

    pub fn with_key_prefix(mut self, prefix: &str) -> Self {
        self.binding.set_key_prefix(AlgorithmKind::FixedWindow, prefix);
        self
    }

    /// Count the request in the window containing `now`, opening a new window
    /// when the stored one has closed. Rejected requests are counted too.
    pub fn transition(
        &self,
        state: Option<FixedWindowState>,
        now: u64,
    ) -> Transition<FixedWindowState> {
        let window = self.config.window_size_ms;

        let next = match state {
            Some(current) if elapsed_millis(now, current.window_start) < window => {
                FixedWindowState {
                    count: current.count.saturating_add(1),
                    window_start: current.window_start,
                }
            }
            _ => FixedWindowState {
                count: 1,
                window_start: now,
            },
        };

        let window_end = next.window_start.saturating_add(window);
        let ttl = Duration::from_millis(window_end.saturating_sub(now).max(1));

        Transition {
            admitted: next.count <= self.config.per_window_limit,
            next,
            ttl,
        }
    }

    /// Stored state for `key`
    pub async fn state(&self, key: &str) -> Result<Option<FixedWindowState>> {
        self.binding.load(key).await
    }
}

#[async_trait]
impl Limiter for FixedWindowLimiter {
    fn name(&self) -> &str {
        self.binding.name()
    }

    fn kind(&self) -> AlgorithmKind {
        AlgorithmKind::FixedWindow
    }

    async fn try_acquire(&self, key: &str) -> Result<bool> {
        let admitted = self
            .binding
            .apply(key, |state, now| self.transition(state, now))
            .await?;
        trace!(limiter = %self.name(), key = %key, admitted, "Fixed window decision");
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

    fn limiter(limit: u64, clock: &ManualClock) -> FixedWindowLimiter {
        FixedWindowLimiter::new(
            "test",
            FixedWindowConfig {
                window_size_ms: 1000,
                per_window_limit: limit,
            },
            Arc::new(LocalStore::<FixedWindowState>::new(1000)),
            Arc::new(clock.clone()),
        )
        .unwrap()
    }

    #[test]
    fn test_transition_opens_window_once() {
        let clock = ManualClock::new(10_000);
        let limiter = limiter(2, &clock);

        let first = limiter.transition(None, 10_000);
        assert!(first.admitted);
        assert_eq!(first.next, FixedWindowState { count: 1, window_start: 10_000 });
        assert_eq!(first.ttl, Duration::from_millis(1000));

        // Later requests keep the original boundary
        let second = limiter.transition(Some(first.next), 10_400);
        assert!(second.admitted);
        assert_eq!(second.next.window_start, 10_000);
        assert_eq!(second.ttl, Duration::from_millis(600));

        let third = limiter.transition(Some(second.next), 10_999);
        assert!(!third.admitted);
        assert_eq!(third.next.count, 3);
        assert_eq!(third.ttl, Duration::from_millis(1));
    }

    #[test]
    fn test_transition_resets_expired_window() {
        let clock = ManualClock::new(0);
        let limiter = limiter(2, &clock);

        let stale = FixedWindowState { count: 7, window_start: 1_000 };
        let next = limiter.transition(Some(stale), 2_000);
        assert!(next.admitted);
        assert_eq!(next.next, FixedWindowState { count: 1, window_start: 2_000 });
    }

    #[test]
    fn test_backwards_clock_stays_in_window() {
        let clock = ManualClock::new(0);
        let limiter = limiter(2, &clock);

        let current = FixedWindowState { count: 2, window_start: 5_000 };
        let next = limiter.transition(Some(current), 4_000);
        assert!(!next.admitted);
        assert_eq!(next.next.window_start, 5_000);
    }

    #[tokio::test]
    async fn test_limit_then_reset() {
        let clock = ManualClock::new(1_000_000);
        let limiter = limiter(2, &clock);

        assert!(limiter.try_acquire("user").await.unwrap());
        assert!(limiter.try_acquire("user").await.unwrap());
        assert!(!limiter.try_acquire("user").await.unwrap());

        clock.advance_millis(1000);
        assert!(limiter.try_acquire("user").await.unwrap());
    }

    #[test]
    fn test_rejects_invalid_config() {
        let result = FixedWindowLimiter::new(
            "test",
            FixedWindowConfig {
                window_size_ms: 1000,
                per_window_limit: 0,
            },
            Arc::new(LocalStore::<FixedWindowState>::new(10)),
            Arc::new(ManualClock::new(0)),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_store_key_layout() {
        let clock = ManualClock::new(0);
        let limiter = limiter(2, &clock).with_key_prefix("edge:");
        assert_eq!(limiter.binding.store_key("user-1"), "edge:rate_limit:fixed:test:user-1");
    }
}

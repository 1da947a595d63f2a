use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::{collections::VecDeque, sync::Arc, time::Duration};
use tracing::trace;

use super::{Limiter, StateBinding};
use crate::{
    clock::Clock,
    config::{AlgorithmKind, SlidingWindowConfig, SlidingWindowVariant},
    error::Result,
    store::{StateStore, Transition},
};

/// Per-key sliding window state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "variant", rename_all = "lowercase")]
pub enum SlidingWindowState {
    /// Ring of sub-bucket counters. `active` is the bucket ending at
    /// `right_border`; the ring covers `(right_border - window, right_border]`.
    Bucketed {
        counts: Vec<u64>,
        total: u64,
        active: usize,
        right_border: u64,
    },
    /// Admitted timestamps in ascending order
    Log { timestamps: VecDeque<u64> },
}

/// Sliding window limiter.
///
/// Admits while fewer than `max_requests` admissions fall in the trailing
/// `window_size_ms`. The bucketed variant bins admissions into `window_num`
/// sub-buckets and may let through up to one bucket's worth of extra age;
/// the log variant is exact.
pub struct SlidingWindowLimiter {
    config: SlidingWindowConfig,
    binding: StateBinding<SlidingWindowState>,
}

impl SlidingWindowLimiter {
    pub fn new(
        name: impl Into<String>,
        config: SlidingWindowConfig,
        store: Arc<dyn StateStore<SlidingWindowState>>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            binding: StateBinding::new(AlgorithmKind::SlidingWindow, name.into(), store, clock),
        })
    }

    pub fn with_key_prefix(mut self, prefix: &str) -> Self {
        self.binding.set_key_prefix(AlgorithmKind::SlidingWindow, prefix);
        self
    }

    pub fn transition(
        &self,
        state: Option<SlidingWindowState>,
        now: u64,
    ) -> Transition<SlidingWindowState> {
        match self.config.variant {
            SlidingWindowVariant::Bucketed => self.bucketed(state, now),
            SlidingWindowVariant::Log => self.log(state, now),
        }
    }

    fn bucketed(
        &self,
        state: Option<SlidingWindowState>,
        now: u64,
    ) -> Transition<SlidingWindowState> {
        let buckets = self.config.window_num as usize;
        let bucket_ms = self.config.bucket_ms();

        let (mut counts, mut total, mut active, mut right_border) = match state {
            Some(SlidingWindowState::Bucketed {
                counts,
                total,
                active,
                right_border,
            }) if counts.len() == buckets && active < buckets => {
                (counts, total, active, right_border)
            }
            _ => (vec![0; buckets], 0, 0, now),
        };

        if now > right_border {
            // One step per sub-bucket boundary crossed; a full lap clears every bucket
            let steps = (now - right_border + bucket_ms - 1) / bucket_ms;
            for i in 1..=steps.min(buckets as u64) {
                let index = (active + i as usize) % buckets;
                total = total.saturating_sub(counts[index]);
                counts[index] = 0;
            }
            active = ((active as u64 + steps) % buckets as u64) as usize;
            right_border = right_border.saturating_add(steps.saturating_mul(bucket_ms));
        }

        let admitted = total < self.config.max_requests;
        if admitted {
            counts[active] += 1;
            total += 1;
        }

        Transition {
            next: SlidingWindowState::Bucketed {
                counts,
                total,
                active,
                right_border,
            },
            // The ring runs up to one bucket ahead of the last write
            ttl: Duration::from_millis(self.config.window_size_ms + bucket_ms),
            admitted,
        }
    }

    fn log(&self, state: Option<SlidingWindowState>, now: u64) -> Transition<SlidingWindowState> {
        let mut timestamps = match state {
            Some(SlidingWindowState::Log { timestamps }) => timestamps,
            _ => VecDeque::new(),
        };

        let boundary = now.saturating_sub(self.config.window_size_ms);
        while timestamps.front().map_or(false, |&t| t < boundary) {
            timestamps.pop_front();
        }

        let admitted = (timestamps.len() as u64) < self.config.max_requests;
        if admitted {
            // Keep the log sorted even if the clock stepped backwards
            let stamp = timestamps.back().map_or(now, |&last| last.max(now));
            timestamps.push_back(stamp);
        }

        Transition {
            next: SlidingWindowState::Log { timestamps },
            // A timestamp exactly one window old still counts
            ttl: Duration::from_millis(self.config.window_size_ms + 1),
            admitted,
        }
    }

    /// Stored state for `key`
    pub async fn state(&self, key: &str) -> Result<Option<SlidingWindowState>> {
        self.binding.load(key).await
    }
}

#[async_trait]
impl Limiter for SlidingWindowLimiter {
    fn name(&self) -> &str {
        self.binding.name()
    }

    fn kind(&self) -> AlgorithmKind {
        AlgorithmKind::SlidingWindow
    }

    async fn try_acquire(&self, key: &str) -> Result<bool> {
        let admitted = self
            .binding
            .apply(key, |state, now| self.transition(state, now))
            .await?;
        trace!(limiter = %self.name(), key = %key, admitted, "Sliding window decision");
        Ok(admitted)
    }

    async fn health_check(&self) -> Result<()> {
        self.binding.health_check().await
    }
}

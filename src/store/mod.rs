//! Key-addressed limiter state with an atomic read-modify-write primitive.
//!
//! Every admission decision is exactly one [`StateStore::update`] cycle:
//! read the current state for a key, compute the next state and the verdict,
//! write the next state. For any single key these cycles are linearizable,
//! so two concurrent callers can never both act on the same stale state.
//!
//! - [`LocalStore`] keeps state in process and serialises cycles with a
//!   key-level lock.
//! - [`SharedStore`] keeps versioned records in a [`SharedKv`] (Redis in
//!   production) and commits with compare-and-set, retrying on conflict.

use async_trait::async_trait;
use std::time::Duration;

use crate::error::Result;

mod local;
mod memory;
mod shared;

pub use local::LocalStore;
pub use memory::MemoryKv;
pub use shared::SharedStore;

/// Outcome of one state transition
#[derive(Debug, Clone, PartialEq)]
pub struct Transition<S> {
    /// State to persist for the key
    pub next: S,
    /// Idle expiry of the written record, measured from the write
    pub ttl: Duration,
    /// Whether the request that triggered the transition is admitted
    pub admitted: bool,
}

/// Pure state transition. Optimistic stores may run it several times per call.
pub type TransitionFn<'a, S> = dyn Fn(Option<S>) -> Transition<S> + Send + Sync + 'a;

/// Storage for one algorithm's per-key state
#[async_trait]
pub trait StateStore<S>: Send + Sync {
    /// Atomically apply `transition` to the state stored under `key` and
    /// return the admission verdict of the transition that was committed.
    async fn update(&self, key: &str, transition: &TransitionFn<'_, S>) -> Result<bool>;

    /// Current state for `key`, if any
    async fn load(&self, key: &str) -> Result<Option<S>>;

    /// Check that the store can serve requests
    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}

/// Minimal externally visible key-value store a [`SharedStore`] builds on
#[async_trait]
pub trait SharedKv: Send + Sync {
    /// Raw value stored under `key`
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Write `value` with expiry `ttl` only if the key still holds
    /// `expected` (`None` meaning absent). Returns whether the write happened.
    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
        ttl: Duration,
    ) -> Result<bool>;

    async fn health_check(&self) -> Result<()>;
}

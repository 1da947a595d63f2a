//! Rust Admission
//!
//! Admission control for request-serving systems: fixed window, sliding
//! window, leaky bucket and token bucket limiters whose per-key state lives
//! either in process or in Redis, shared by every instance of a service.
//! Each decision is a single atomic read-modify-write on the key's state.

pub mod algorithms;
pub mod clock;
pub mod config;
pub mod error;
pub mod limiter;
pub mod metrics;
pub mod redis;
pub mod service;
pub mod store;

// Re-export main types
pub use algorithms::{
    FixedWindowLimiter, LeakyBucketLimiter, Limiter, SlidingWindowLimiter, TokenBucketLimiter,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{AdmissionConfig, AlgorithmConfig, FailurePolicy, LimiterConfig};
pub use error::{AdmissionError, Result};
pub use limiter::{AdmissionController, Decision, StoreBackend};
pub use store::{LocalStore, MemoryKv, SharedKv, SharedStore, StateStore};

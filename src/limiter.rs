use serde::{de::DeserializeOwned, Serialize};
use std::{collections::HashMap, sync::Arc, time::Duration};
use tracing::{debug, info, warn};

use crate::{
    algorithms::{
        FixedWindowLimiter, LeakyBucketLimiter, Limiter, SlidingWindowLimiter, TokenBucketLimiter,
    },
    clock::Clock,
    config::{
        AdmissionConfig, AlgorithmConfig, FailurePolicy, LimiterConfig, StoreBackendKind,
        StoreConfig,
    },
    error::{AdmissionError, Result},
    metrics::Metrics,
    redis::{RedisClient, RedisConfig},
    store::{LocalStore, SharedKv, SharedStore, StateStore},
};

/// Where limiters built from configuration keep their state
#[derive(Clone)]
pub enum StoreBackend {
    /// A fresh in-process store per limiter
    Local { max_keys: u64 },
    /// One external store shared by every limiter and process
    Shared {
        kv: Arc<dyn SharedKv>,
        max_attempts: u32,
    },
}

impl StoreBackend {
    /// Build the backend described by `config`, connecting to Redis if shared
    pub async fn connect(config: &StoreConfig) -> Result<Self> {
        match config.backend {
            StoreBackendKind::Local => Ok(StoreBackend::Local {
                max_keys: config.local_max_keys,
            }),
            StoreBackendKind::Shared => {
                let client = RedisClient::new(RedisConfig::from(config)).await?;
                Ok(StoreBackend::Shared {
                    kv: Arc::new(client),
                    max_attempts: config.max_cas_attempts,
                })
            }
        }
    }

    fn store<S>(&self) -> Arc<dyn StateStore<S>>
    where
        S: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        match self {
            StoreBackend::Local { max_keys } => Arc::new(LocalStore::<S>::new(*max_keys)),
            StoreBackend::Shared { kv, max_attempts } => {
                Arc::new(SharedStore::<S>::new(kv.clone(), *max_attempts))
            }
        }
    }
}

/// Construct the limiter a configuration entry describes
pub fn build_limiter(
    config: &LimiterConfig,
    backend: &StoreBackend,
    key_prefix: &str,
    clock: Arc<dyn Clock>,
) -> Result<Arc<dyn Limiter>> {
    let name = config.name.clone();
    let limiter: Arc<dyn Limiter> = match &config.algorithm {
        AlgorithmConfig::FixedWindow(c) => Arc::new(
            FixedWindowLimiter::new(name, c.clone(), backend.store(), clock)?
                .with_key_prefix(key_prefix),
        ),
        AlgorithmConfig::SlidingWindow(c) => Arc::new(
            SlidingWindowLimiter::new(name, c.clone(), backend.store(), clock)?
                .with_key_prefix(key_prefix),
        ),
        AlgorithmConfig::LeakyBucket(c) => Arc::new(
            LeakyBucketLimiter::new(name, c.clone(), backend.store(), clock)?
                .with_key_prefix(key_prefix),
        ),
        AlgorithmConfig::TokenBucket(c) => Arc::new(
            TokenBucketLimiter::new(name, c.clone(), backend.store(), clock)?
                .with_key_prefix(key_prefix),
        ),
    };
    Ok(limiter)
}

/// Result of [`AdmissionController::decide`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Admitted,
    Rejected,
    /// The store failed; the limiter's failure policy chose the outcome
    Fallback { admitted: bool },
}

impl Decision {
    pub fn is_admitted(self) -> bool {
        match self {
            Decision::Admitted => true,
            Decision::Rejected => false,
            Decision::Fallback { admitted } => admitted,
        }
    }

    pub fn is_fallback(self) -> bool {
        matches!(self, Decision::Fallback { .. })
    }
}

struct Registration {
    limiter: Arc<dyn Limiter>,
    policy: FailurePolicy,
}

/// Binds limiters to names and answers admission requests for them
pub struct AdmissionController {
    limiters: HashMap<String, Registration>,
    metrics: Arc<Metrics>,
}

impl AdmissionController {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        Self {
            limiters: HashMap::new(),
            metrics,
        }
    }

    /// Build every limiter in `config` against `backend`
    pub fn from_config(
        config: &AdmissionConfig,
        backend: &StoreBackend,
        clock: Arc<dyn Clock>,
        metrics: Arc<Metrics>,
    ) -> Result<Self> {
        config.validate()?;

        let mut controller = Self::new(metrics);
        for limiter_config in &config.limiters {
            let limiter = build_limiter(
                limiter_config,
                backend,
                &config.store.key_prefix,
                clock.clone(),
            )?;
            controller.register(limiter, limiter_config.on_store_failure)?;
        }

        info!("Admission controller ready with {} limiters", controller.limiters.len());
        Ok(controller)
    }

    /// Register a limiter under its own name
    pub fn register(&mut self, limiter: Arc<dyn Limiter>, policy: FailurePolicy) -> Result<()> {
        let name = limiter.name().to_string();
        if self.limiters.contains_key(&name) {
            return Err(AdmissionError::InvalidConfiguration(format!(
                "duplicate limiter name: {}",
                name
            )));
        }

        debug!(
            limiter = %name,
            algorithm = limiter.kind().as_str(),
            policy = policy.as_str(),
            "Registering limiter"
        );
        self.limiters.insert(name, Registration { limiter, policy });
        Ok(())
    }

    /// Names of all registered limiters
    pub fn limiter_names(&self) -> Vec<&str> {
        self.limiters.keys().map(String::as_str).collect()
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Limiter>> {
        self.limiters.get(name).map(|r| &r.limiter)
    }

    fn registration(&self, name: &str) -> Result<&Registration> {
        self.limiters
            .get(name)
            .ok_or_else(|| AdmissionError::UnknownLimiter(name.to_string()))
    }

    /// Decide one request. Store failures are returned as errors, never as a
    /// rejection, so callers can tell "limited" from "limiter unavailable".
    pub async fn try_acquire(&self, name: &str, key: &str) -> Result<bool> {
        self.acquire(self.registration(name)?, key, None).await
    }

    /// Like [`try_acquire`](Self::try_acquire) with a caller deadline; running
    /// out of time yields `StoreUnavailable`.
    pub async fn try_acquire_within(
        &self,
        name: &str,
        key: &str,
        deadline: Duration,
    ) -> Result<bool> {
        self.acquire(self.registration(name)?, key, Some(deadline)).await
    }

    /// Decide one request, resolving store failures through the limiter's
    /// failure policy.
    pub async fn decide(&self, name: &str, key: &str) -> Result<Decision> {
        self.decide_within(name, key, None).await
    }

    pub async fn decide_within(
        &self,
        name: &str,
        key: &str,
        deadline: Option<Duration>,
    ) -> Result<Decision> {
        let registration = self.registration(name)?;

        match self.acquire(registration, key, deadline).await {
            Ok(true) => Ok(Decision::Admitted),
            Ok(false) => Ok(Decision::Rejected),
            Err(e) if e.is_store_failure() => {
                let admitted = registration.policy.admits();
                warn!(
                    limiter = %name,
                    policy = registration.policy.as_str(),
                    admitted,
                    "State store failed, applying failure policy: {}",
                    e
                );
                self.metrics.record_fallback(name, registration.policy.as_str());
                Ok(Decision::Fallback { admitted })
            }
            Err(e) => Err(e),
        }
    }

    async fn acquire(
        &self,
        registration: &Registration,
        key: &str,
        deadline: Option<Duration>,
    ) -> Result<bool> {
        let limiter = &registration.limiter;
        let name = limiter.name();
        let _timer = self.metrics.start_decision_timer(name);

        let result = match deadline {
            Some(deadline) => match tokio::time::timeout(deadline, limiter.try_acquire(key)).await {
                Ok(result) => result,
                Err(_) => Err(AdmissionError::StoreUnavailable(format!(
                    "deadline of {}ms exceeded",
                    deadline.as_millis()
                ))),
            },
            None => limiter.try_acquire(key).await,
        };

        match &result {
            Ok(admitted) => {
                self.metrics
                    .record_decision(name, limiter.kind().as_str(), *admitted);
            }
            Err(e) if e.is_store_failure() => {
                warn!(limiter = %name, key = %key, "Admission failed: {}", e);
                self.metrics.record_store_error(name, e.kind());
            }
            Err(_) => {}
        }

        result
    }

    /// Check every limiter's store
    pub async fn health_check(&self) -> Result<()> {
        for registration in self.limiters.values() {
            registration.limiter.health_check().await?;
        }
        Ok(())
    }
}

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::{marker::PhantomData, sync::Arc};
use tracing::{debug, warn};

use super::{SharedKv, StateStore, Transition, TransitionFn};
use crate::error::{AdmissionError, Result};

/// Persisted layout of one state record
#[derive(Debug, Serialize, Deserialize)]
struct Versioned<S> {
    version: u64,
    state: S,
}

/// State store over an externally visible key-value store.
///
/// Optimistic concurrency: read the record, compute, then compare-and-set
/// against the exact bytes that were read. Every write bumps `version`, so a
/// record that returns to an identical-looking state still fails a stale CAS.
/// A lost race re-runs the whole cycle, up to `max_attempts` times.
pub struct SharedStore<S> {
    kv: Arc<dyn SharedKv>,
    max_attempts: u32,
    _state: PhantomData<fn() -> S>,
}

impl<S> SharedStore<S> {
    pub fn new(kv: Arc<dyn SharedKv>, max_attempts: u32) -> Self {
        Self {
            kv,
            max_attempts: max_attempts.max(1),
            _state: PhantomData,
        }
    }
}

fn decode<S: DeserializeOwned>(raw: Option<&str>) -> Result<Option<Versioned<S>>> {
    raw.map(serde_json::from_str).transpose().map_err(AdmissionError::from)
}

#[async_trait]
impl<S> StateStore<S> for SharedStore<S>
where
    S: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn update(&self, key: &str, transition: &TransitionFn<'_, S>) -> Result<bool> {
        for attempt in 1..=self.max_attempts {
            let raw = self.kv.get(key).await?;

            let (version, current) = match decode::<S>(raw.as_deref())? {
                Some(record) => (record.version, Some(record.state)),
                None => (0, None),
            };

            let Transition { next, ttl, admitted } = transition(current);
            let encoded = serde_json::to_string(&Versioned {
                version: version.wrapping_add(1),
                state: next,
            })?;

            if self
                .kv
                .compare_and_set(key, raw.as_deref(), &encoded, ttl)
                .await?
            {
                return Ok(admitted);
            }

            debug!(key = %key, attempt, "Concurrent update detected, retrying");
        }

        warn!(
            key = %key,
            attempts = self.max_attempts,
            "Giving up after repeated concurrent updates"
        );
        Err(AdmissionError::ConcurrentUpdateExhausted {
            key: key.to_string(),
            attempts: self.max_attempts,
        })
    }

    async fn load(&self, key: &str) -> Result<Option<S>> {
        let raw = self.kv.get(key).await?;
        Ok(decode::<S>(raw.as_deref())?.map(|record| record.state))
    }

    async fn health_check(&self) -> Result<()> {
        self.kv.health_check().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryKv;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn counter(limit: u64) -> impl Fn(Option<u64>) -> Transition<u64> + Send + Sync {
        move |current| {
            let count = current.unwrap_or(0);
            Transition {
                next: if count < limit { count + 1 } else { count },
                ttl: Duration::from_secs(60),
                admitted: count < limit,
            }
        }
    }

    /// Loses every CAS, as if another writer always got there first
    struct AlwaysConflicting {
        attempts: AtomicU32,
    }

    #[async_trait]
    impl SharedKv for AlwaysConflicting {
        async fn get(&self, _key: &str) -> Result<Option<String>> {
            Ok(None)
        }

        async fn compare_and_set(
            &self,
            _key: &str,
            _expected: Option<&str>,
            _value: &str,
            _ttl: Duration,
        ) -> Result<bool> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Ok(false)
        }

        async fn health_check(&self) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_records_are_versioned_json() {
        let kv = Arc::new(MemoryKv::new());
        let store = SharedStore::<u64>::new(kv.clone(), 4);

        assert!(store.update("k", &counter(5)).await.unwrap());
        assert!(store.update("k", &counter(5)).await.unwrap());

        let raw = kv.get("k").await.unwrap().unwrap();
        assert_eq!(raw, r#"{"version":2,"state":2}"#);
        assert_eq!(store.load("k").await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn test_retry_budget_exhaustion() {
        let kv = Arc::new(AlwaysConflicting {
            attempts: AtomicU32::new(0),
        });
        let store = SharedStore::<u64>::new(kv.clone(), 3);

        match store.update("k", &counter(5)).await {
            Err(AdmissionError::ConcurrentUpdateExhausted { key, attempts }) => {
                assert_eq!(key, "k");
                assert_eq!(attempts, 3);
            }
            other => panic!("Expected exhausted retries, got {:?}", other),
        }
        assert_eq!(kv.attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_corrupt_record_is_an_error() {
        let kv = Arc::new(MemoryKv::new());
        kv.compare_and_set("k", None, "not json", Duration::from_secs(1))
            .await
            .unwrap();
        let store = SharedStore::<u64>::new(kv, 4);

        assert!(matches!(
            store.update("k", &counter(5)).await,
            Err(AdmissionError::Serialization(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_contending_instances_never_over_admit() {
        let kv = Arc::new(MemoryKv::new());
        // Two store instances over one backend, as two processes would have
        let stores = [
            Arc::new(SharedStore::<u64>::new(kv.clone(), 128)),
            Arc::new(SharedStore::<u64>::new(kv.clone(), 128)),
        ];

        let handles: Vec<_> = (0..48)
            .map(|i| {
                let store = stores[i % 2].clone();
                tokio::spawn(async move { store.update("hot", &counter(20)).await.unwrap() })
            })
            .collect();

        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                admitted += 1;
            }
        }

        assert_eq!(admitted, 20);
        assert_eq!(stores[0].load("hot").await.unwrap(), Some(20));
    }
}

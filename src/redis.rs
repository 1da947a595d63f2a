use async_trait::async_trait;
use redis::{aio::ConnectionManager, AsyncCommands, Script};
use std::{future::Future, sync::Arc, time::Duration};
use tracing::{info, warn};

use crate::{
    config::StoreConfig,
    error::{AdmissionError, Result},
    store::SharedKv,
};

/// Compare-and-set on the server: the GET, the comparison and the SET run as
/// one script, so no other client can interleave.
///
/// KEYS[1] key, ARGV[1] "1" if a value is expected else "0",
/// ARGV[2] expected value, ARGV[3] new value, ARGV[4] ttl in milliseconds.
const COMPARE_AND_SET: &str = r#"
local current = redis.call('GET', KEYS[1])
if ARGV[1] == '1' then
  if current ~= ARGV[2] then
    return 0
  end
elseif current then
  return 0
end
redis.call('SET', KEYS[1], ARGV[3], 'PX', ARGV[4])
return 1
"#;

/// Redis client configuration
#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub url: String,
    pub connection_timeout: Duration,
    pub command_timeout: Duration,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            connection_timeout: Duration::from_secs(5),
            command_timeout: Duration::from_secs(1),
        }
    }
}

impl From<&StoreConfig> for RedisConfig {
    fn from(store: &StoreConfig) -> Self {
        Self {
            url: store.redis_url.clone(),
            connection_timeout: Duration::from_millis(store.connection_timeout_ms),
            command_timeout: Duration::from_millis(store.command_timeout_ms),
        }
    }
}

/// Redis client wrapper providing the shared-store primitives
#[derive(Clone)]
pub struct RedisClient {
    connection: ConnectionManager,
    config: RedisConfig,
    cas_script: Arc<Script>,
}

impl RedisClient {
    /// Create a new Redis client and verify the server answers
    pub async fn new(config: RedisConfig) -> Result<Self> {
        info!("Creating Redis client for URL: {}", config.url);

        let client = redis::Client::open(config.url.clone()).map_err(|e| {
            warn!("Failed to create Redis client: {}", e);
            AdmissionError::Redis(e)
        })?;

        let connection = match tokio::time::timeout(
            config.connection_timeout,
            client.get_connection_manager(),
        )
        .await
        {
            Ok(Ok(conn)) => conn,
            Ok(Err(e)) => {
                warn!("Failed to create connection manager: {}", e);
                return Err(AdmissionError::Redis(e));
            }
            Err(_) => {
                warn!(
                    "Timeout while creating connection manager ({}ms)",
                    config.connection_timeout.as_millis()
                );
                return Err(AdmissionError::StoreUnavailable(
                    "timeout while connecting to Redis".to_string(),
                ));
            }
        };

        let client = Self {
            connection,
            config,
            cas_script: Arc::new(Script::new(COMPARE_AND_SET)),
        };
        client.health_check().await?;

        info!("Redis client initialized successfully");
        Ok(client)
    }

    /// Bound a Redis round trip by the configured command timeout
    async fn with_timeout<T, F>(&self, operation: &str, fut: F) -> Result<T>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        match tokio::time::timeout(self.config.command_timeout, fut).await {
            Ok(result) => result.map_err(|e| {
                warn!("Redis {} failed: {}", operation, e);
                AdmissionError::Redis(e)
            }),
            Err(_) => {
                warn!(
                    "Redis {} timed out after {}ms",
                    operation,
                    self.config.command_timeout.as_millis()
                );
                Err(AdmissionError::StoreUnavailable(format!(
                    "Redis {} timed out after {}ms",
                    operation,
                    self.config.command_timeout.as_millis()
                )))
            }
        }
    }
}

#[async_trait]
impl SharedKv for RedisClient {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.connection.clone();
        self.with_timeout("GET", conn.get::<_, Option<String>>(key))
            .await
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
        ttl: Duration,
    ) -> Result<bool> {
        let mut conn = self.connection.clone();
        let ttl_ms = ttl.as_millis().max(1) as u64;

        let mut invocation = self.cas_script.prepare_invoke();
        invocation
            .key(key)
            .arg(if expected.is_some() { "1" } else { "0" })
            .arg(expected.unwrap_or(""))
            .arg(value)
            .arg(ttl_ms);

        let written: i64 = self
            .with_timeout("compare-and-set", invocation.invoke_async(&mut conn))
            .await?;
        Ok(written == 1)
    }

    async fn health_check(&self) -> Result<()> {
        let mut conn = self.connection.clone();
        self.with_timeout(
            "PING",
            redis::cmd("PING").query_async::<_, ()>(&mut conn),
        )
        .await
    }
}

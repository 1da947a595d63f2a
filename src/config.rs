use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use crate::error::{AdmissionError, Result};

/// Top-level configuration: where state lives and which limiters exist
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionConfig {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default = "default_limiters")]
    pub limiters: Vec<LimiterConfig>,
    #[serde(default)]
    pub server: ServerConfig,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            limiters: default_limiters(),
            server: ServerConfig::default(),
        }
    }
}

impl AdmissionConfig {
    /// Reject empty or duplicate limiter names and invalid algorithm parameters
    pub fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        for limiter in &self.limiters {
            if limiter.name.is_empty() {
                return Err(AdmissionError::InvalidConfiguration(
                    "limiter name must not be empty".to_string(),
                ));
            }
            if !names.insert(limiter.name.as_str()) {
                return Err(AdmissionError::InvalidConfiguration(format!(
                    "duplicate limiter name: {}",
                    limiter.name
                )));
            }
            limiter.algorithm.validate()?;
        }
        self.store.validate()
    }
}

/// The four limiters of the reference deployment, one per algorithm
fn default_limiters() -> Vec<LimiterConfig> {
    vec![
        LimiterConfig::new(
            "fixed",
            AlgorithmConfig::FixedWindow(FixedWindowConfig::default()),
        ),
        LimiterConfig::new(
            "sliding",
            AlgorithmConfig::SlidingWindow(SlidingWindowConfig::default()),
        ),
        LimiterConfig::new(
            "leaky",
            AlgorithmConfig::LeakyBucket(LeakyBucketConfig::default()),
        ),
        LimiterConfig::new(
            "token",
            AlgorithmConfig::TokenBucket(TokenBucketConfig::default()),
        ),
    ]
}

/// Where limiter state is kept
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackendKind {
    /// In-process state, one store per limiter
    #[default]
    Local,
    /// Redis, shared by every process pointing at the same server
    Shared,
}

/// State store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackendKind,
    #[serde(default = "default_redis_url")]
    pub redis_url: String,
    /// Prepended to every store key
    #[serde(default)]
    pub key_prefix: String,
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,
    /// Read-compute-CAS attempts per call before giving up
    #[serde(default = "default_max_cas_attempts")]
    pub max_cas_attempts: u32,
    /// Upper bound on keys held by each local store
    #[serde(default = "default_local_max_keys")]
    pub local_max_keys: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackendKind::default(),
            redis_url: default_redis_url(),
            key_prefix: String::new(),
            command_timeout_ms: default_command_timeout_ms(),
            connection_timeout_ms: default_connection_timeout_ms(),
            max_cas_attempts: default_max_cas_attempts(),
            local_max_keys: default_local_max_keys(),
        }
    }
}

impl StoreConfig {
    fn validate(&self) -> Result<()> {
        if self.max_cas_attempts == 0 {
            return Err(AdmissionError::InvalidConfiguration(
                "max_cas_attempts must be greater than 0".to_string(),
            ));
        }
        if self.command_timeout_ms == 0 {
            return Err(AdmissionError::InvalidConfiguration(
                "command_timeout_ms must be greater than 0".to_string(),
            ));
        }
        if self.local_max_keys == 0 {
            return Err(AdmissionError::InvalidConfiguration(
                "local_max_keys must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_command_timeout_ms() -> u64 {
    1000
}

fn default_connection_timeout_ms() -> u64 {
    5000
}

fn default_max_cas_attempts() -> u32 {
    16
}

fn default_local_max_keys() -> u64 {
    100_000
}

/// HTTP front-end configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_http_addr")]
    pub http_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
        }
    }
}

fn default_http_addr() -> String {
    "0.0.0.0:8080".to_string()
}

/// What a limiter answers when its store cannot complete a cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailurePolicy {
    /// Deny, protecting the downstream resource
    #[default]
    FailClosed,
    /// Admit; must be chosen explicitly
    FailOpen,
}

impl FailurePolicy {
    pub fn admits(self) -> bool {
        matches!(self, FailurePolicy::FailOpen)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FailurePolicy::FailClosed => "fail-closed",
            FailurePolicy::FailOpen => "fail-open",
        }
    }
}

/// A named limiter instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterConfig {
    pub name: String,
    pub algorithm: AlgorithmConfig,
    #[serde(default)]
    pub on_store_failure: FailurePolicy,
}

impl LimiterConfig {
    pub fn new(name: impl Into<String>, algorithm: AlgorithmConfig) -> Self {
        Self {
            name: name.into(),
            algorithm,
            on_store_failure: FailurePolicy::default(),
        }
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.on_store_failure = policy;
        self
    }
}

/// Admission algorithm families
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AlgorithmKind {
    FixedWindow,
    SlidingWindow,
    LeakyBucket,
    TokenBucket,
}

impl AlgorithmKind {
    /// Store namespace, distinct per algorithm so types sharing a store never collide
    pub fn namespace(self) -> &'static str {
        match self {
            AlgorithmKind::FixedWindow => "rate_limit:fixed:",
            AlgorithmKind::SlidingWindow => "rate_limit:sliding:",
            AlgorithmKind::LeakyBucket => "rate_limit:leaky:",
            AlgorithmKind::TokenBucket => "rate_limit:token:",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AlgorithmKind::FixedWindow => "fixed-window",
            AlgorithmKind::SlidingWindow => "sliding-window",
            AlgorithmKind::LeakyBucket => "leaky-bucket",
            AlgorithmKind::TokenBucket => "token-bucket",
        }
    }
}

/// Algorithm selection together with its parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum AlgorithmConfig {
    FixedWindow(FixedWindowConfig),
    SlidingWindow(SlidingWindowConfig),
    LeakyBucket(LeakyBucketConfig),
    TokenBucket(TokenBucketConfig),
}

impl AlgorithmConfig {
    pub fn kind(&self) -> AlgorithmKind {
        match self {
            AlgorithmConfig::FixedWindow(_) => AlgorithmKind::FixedWindow,
            AlgorithmConfig::SlidingWindow(_) => AlgorithmKind::SlidingWindow,
            AlgorithmConfig::LeakyBucket(_) => AlgorithmKind::LeakyBucket,
            AlgorithmConfig::TokenBucket(_) => AlgorithmKind::TokenBucket,
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            AlgorithmConfig::FixedWindow(c) => c.validate(),
            AlgorithmConfig::SlidingWindow(c) => c.validate(),
            AlgorithmConfig::LeakyBucket(c) => c.validate(),
            AlgorithmConfig::TokenBucket(c) => c.validate(),
        }
    }
}

fn require_positive(name: &str, value: u64) -> Result<()> {
    if value == 0 {
        return Err(AdmissionError::InvalidConfiguration(format!(
            "{} must be greater than 0",
            name
        )));
    }
    Ok(())
}

fn require_positive_rate(name: &str, value: f64) -> Result<()> {
    if !value.is_finite() || value <= 0.0 {
        return Err(AdmissionError::InvalidConfiguration(format!(
            "{} must be a finite value greater than 0, got {}",
            name, value
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixedWindowConfig {
    #[serde(default = "default_window_size_ms")]
    pub window_size_ms: u64,
    #[serde(default = "default_per_window_limit")]
    pub per_window_limit: u64,
}

impl Default for FixedWindowConfig {
    fn default() -> Self {
        Self {
            window_size_ms: default_window_size_ms(),
            per_window_limit: default_per_window_limit(),
        }
    }
}

impl FixedWindowConfig {
    pub fn validate(&self) -> Result<()> {
        require_positive("window_size_ms", self.window_size_ms)?;
        require_positive("per_window_limit", self.per_window_limit)
    }
}

/// How the sliding window remembers admitted requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SlidingWindowVariant {
    /// Ring of per-bucket counters, O(1) memory per key
    #[default]
    Bucketed,
    /// Exact timestamp log, memory grows with in-window admissions
    Log,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlidingWindowConfig {
    #[serde(default = "default_window_size_ms")]
    pub window_size_ms: u64,
    #[serde(default = "default_window_num")]
    pub window_num: u32,
    #[serde(default = "default_max_requests")]
    pub max_requests: u64,
    #[serde(default)]
    pub variant: SlidingWindowVariant,
}

impl Default for SlidingWindowConfig {
    fn default() -> Self {
        Self {
            window_size_ms: default_window_size_ms(),
            window_num: default_window_num(),
            max_requests: default_max_requests(),
            variant: SlidingWindowVariant::default(),
        }
    }
}

impl SlidingWindowConfig {
    pub fn validate(&self) -> Result<()> {
        require_positive("window_size_ms", self.window_size_ms)?;
        require_positive("window_num", self.window_num as u64)?;
        require_positive("max_requests", self.max_requests)?;
        if self.variant == SlidingWindowVariant::Bucketed
            && self.window_size_ms < self.window_num as u64
        {
            return Err(AdmissionError::InvalidConfiguration(format!(
                "window_size_ms ({}) must be at least window_num ({})",
                self.window_size_ms, self.window_num
            )));
        }
        Ok(())
    }

    /// Width of one sub-bucket in milliseconds
    pub fn bucket_ms(&self) -> u64 {
        self.window_size_ms / self.window_num as u64
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeakyBucketConfig {
    #[serde(default = "default_capacity")]
    pub capacity: u64,
    /// Drain rate in requests per second
    #[serde(default = "default_rate")]
    pub rate: f64,
}

impl Default for LeakyBucketConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            rate: default_rate(),
        }
    }
}

impl LeakyBucketConfig {
    pub fn validate(&self) -> Result<()> {
        require_positive("capacity", self.capacity)?;
        require_positive_rate("rate", self.rate)
    }
}

/// Token count of a bucket seen for the first time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InitialFill {
    /// Start at capacity: the first request for a key is admitted
    #[default]
    Full,
    /// Start at zero: the first request waits for a refill
    Empty,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenBucketConfig {
    #[serde(default = "default_capacity")]
    pub capacity: u64,
    /// Refill rate in tokens per second
    #[serde(default = "default_rate")]
    pub token_rate: f64,
    #[serde(default)]
    pub initial_fill: InitialFill,
    /// Idle expiry of an `empty`-start bucket. A key idle for longer is
    /// treated as new and starts empty again. Never shorter than the time a
    /// bucket takes to refill completely.
    #[serde(default = "default_idle_ttl_ms")]
    pub idle_ttl_ms: u64,
}

impl Default for TokenBucketConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            token_rate: default_rate(),
            initial_fill: InitialFill::default(),
            idle_ttl_ms: default_idle_ttl_ms(),
        }
    }
}

impl TokenBucketConfig {
    pub fn validate(&self) -> Result<()> {
        require_positive("capacity", self.capacity)?;
        require_positive_rate("token_rate", self.token_rate)?;
        require_positive("idle_ttl_ms", self.idle_ttl_ms)
    }
}

fn default_window_size_ms() -> u64 {
    1000
}

fn default_per_window_limit() -> u64 {
    2
}

fn default_window_num() -> u32 {
    10
}

fn default_max_requests() -> u64 {
    10
}

fn default_capacity() -> u64 {
    10
}

fn default_rate() -> f64 {
    5.0
}

fn default_idle_ttl_ms() -> u64 {
    3_600_000
}

/// Load configuration from YAML string
pub fn load_config_from_yaml(yaml: &str) -> Result<AdmissionConfig> {
    let config: AdmissionConfig = serde_yaml::from_str(yaml)
        .map_err(|e| AdmissionError::Config(format!("Failed to parse YAML: {}", e)))?;
    config.validate()?;
    Ok(config)
}

/// Load configuration from YAML file
pub fn load_config_from_file(path: &str) -> Result<AdmissionConfig> {
    let content = std::fs::read_to_string(path)?;
    load_config_from_yaml(&content)
}

/// Load configuration from an optional file layered under `ADMISSION__*`
/// environment overrides, e.g. `ADMISSION__STORE__BACKEND=shared`.
pub fn load_layered_config(path: Option<&str>) -> Result<AdmissionConfig> {
    let mut builder = config::Config::builder();
    if let Some(path) = path {
        builder = builder.add_source(config::File::with_name(path).required(true));
    }
    let config: AdmissionConfig = builder
        .add_source(
            config::Environment::with_prefix("ADMISSION")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .and_then(|c| c.try_deserialize())
        .map_err(|e| AdmissionError::Config(e.to_string()))?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_config_from_yaml() {
        let yaml = r#"
store:
  backend: shared
  redis_url: redis://cache:6379
  key_prefix: "edge:"
limiters:
  - name: login
    on_store_failure: fail-open
    algorithm:
      type: fixed-window
      window_size_ms: 60000
      per_window_limit: 5
  - name: search
    algorithm:
      type: sliding-window
      variant: log
  - name: upload
    algorithm:
      type: leaky-bucket
      capacity: 20
      rate: 2
  - name: api
    algorithm:
      type: token-bucket
      initial_fill: empty
"#;

        let config = load_config_from_yaml(yaml).unwrap();
        assert_eq!(config.store.backend, StoreBackendKind::Shared);
        assert_eq!(config.store.key_prefix, "edge:");
        assert_eq!(config.store.max_cas_attempts, 16);
        assert_eq!(config.limiters.len(), 4);

        let login = &config.limiters[0];
        assert_eq!(login.on_store_failure, FailurePolicy::FailOpen);
        assert_eq!(
            login.algorithm,
            AlgorithmConfig::FixedWindow(FixedWindowConfig {
                window_size_ms: 60_000,
                per_window_limit: 5,
            })
        );

        match &config.limiters[1].algorithm {
            AlgorithmConfig::SlidingWindow(c) => {
                assert_eq!(c.variant, SlidingWindowVariant::Log);
                assert_eq!(c.window_num, 10);
                assert_eq!(c.max_requests, 10);
            }
            other => panic!("Expected sliding window, got {:?}", other),
        }

        match &config.limiters[2].algorithm {
            AlgorithmConfig::LeakyBucket(c) => {
                assert_eq!(c.capacity, 20);
                assert_eq!(c.rate, 2.0);
            }
            other => panic!("Expected leaky bucket, got {:?}", other),
        }

        assert_eq!(config.limiters[3].on_store_failure, FailurePolicy::FailClosed);
        match &config.limiters[3].algorithm {
            AlgorithmConfig::TokenBucket(c) => {
                assert_eq!(c.initial_fill, InitialFill::Empty);
                assert_eq!(c.idle_ttl_ms, 3_600_000);
            }
            other => panic!("Expected token bucket, got {:?}", other),
        }
    }

    #[test]
    fn test_default_config_has_one_limiter_per_algorithm() {
        let config = AdmissionConfig::default();
        config.validate().unwrap();

        let kinds: Vec<AlgorithmKind> = config
            .limiters
            .iter()
            .map(|l| l.algorithm.kind())
            .collect();
        assert_eq!(
            kinds,
            vec![
                AlgorithmKind::FixedWindow,
                AlgorithmKind::SlidingWindow,
                AlgorithmKind::LeakyBucket,
                AlgorithmKind::TokenBucket,
            ]
        );
    }

    #[test]
    fn test_empty_yaml_uses_defaults() {
        let config = load_config_from_yaml("{}").unwrap();
        assert_eq!(config.store.backend, StoreBackendKind::Local);
        assert_eq!(config.limiters.len(), 4);
        assert_eq!(config.server.http_addr, "0.0.0.0:8080");
    }

    #[test]
    fn test_rejects_non_positive_parameters() {
        let zero_capacity = AlgorithmConfig::LeakyBucket(LeakyBucketConfig {
            capacity: 0,
            rate: 5.0,
        });
        assert!(matches!(
            zero_capacity.validate(),
            Err(AdmissionError::InvalidConfiguration(_))
        ));

        let negative_rate = AlgorithmConfig::TokenBucket(TokenBucketConfig {
            token_rate: -1.0,
            ..Default::default()
        });
        assert!(negative_rate.validate().is_err());

        let zero_idle_ttl = AlgorithmConfig::TokenBucket(TokenBucketConfig {
            initial_fill: InitialFill::Empty,
            idle_ttl_ms: 0,
            ..Default::default()
        });
        assert!(zero_idle_ttl.validate().is_err());

        let nan_rate = AlgorithmConfig::LeakyBucket(LeakyBucketConfig {
            capacity: 10,
            rate: f64::NAN,
        });
        assert!(nan_rate.validate().is_err());

        let zero_window = AlgorithmConfig::FixedWindow(FixedWindowConfig {
            window_size_ms: 0,
            per_window_limit: 2,
        });
        assert!(zero_window.validate().is_err());

        let narrow_buckets = AlgorithmConfig::SlidingWindow(SlidingWindowConfig {
            window_size_ms: 5,
            window_num: 10,
            ..Default::default()
        });
        assert!(narrow_buckets.validate().is_err());
    }

    #[test]
    fn test_rejects_duplicate_names() {
        let yaml = r#"
limiters:
  - name: api
    algorithm: { type: fixed-window }
  - name: api
    algorithm: { type: token-bucket }
"#;
        let result = load_config_from_yaml(yaml);
        match result {
            Err(AdmissionError::InvalidConfiguration(msg)) => assert!(msg.contains("duplicate")),
            other => panic!("Expected invalid configuration, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_algorithm_is_config_error() {
        let yaml = r#"
limiters:
  - name: api
    algorithm: { type: gcra }
"#;
        assert!(matches!(load_config_from_yaml(yaml), Err(AdmissionError::Config(_))));
    }

    #[test]
    fn test_namespaces_are_distinct() {
        let namespaces: HashSet<&str> = [
            AlgorithmKind::FixedWindow,
            AlgorithmKind::SlidingWindow,
            AlgorithmKind::LeakyBucket,
            AlgorithmKind::TokenBucket,
        ]
        .iter()
        .map(|k| k.namespace())
        .collect();
        assert_eq!(namespaces.len(), 4);
    }
}

use thiserror::Error;

/// Result type for admission operations
pub type Result<T> = std::result::Result<T, AdmissionError>;

/// Errors that can occur while making an admission decision
#[derive(Error, Debug)]
pub enum AdmissionError {
    #[error("State store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Concurrent update retries exhausted for key {key} after {attempts} attempts")]
    ConcurrentUpdateExhausted { key: String, attempts: u32 },

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Limiter not found: {0}")]
    UnknownLimiter(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl AdmissionError {
    /// True when the state store could not complete the read-modify-write
    /// cycle. These are the errors a failure policy may turn into a decision.
    pub fn is_store_failure(&self) -> bool {
        matches!(
            self,
            AdmissionError::StoreUnavailable(_)
                | AdmissionError::Redis(_)
                | AdmissionError::ConcurrentUpdateExhausted { .. }
        )
    }

    /// Short label used for metrics
    pub fn kind(&self) -> &'static str {
        match self {
            AdmissionError::StoreUnavailable(_) => "store_unavailable",
            AdmissionError::Redis(_) => "redis",
            AdmissionError::ConcurrentUpdateExhausted { .. } => "cas_exhausted",
            AdmissionError::InvalidConfiguration(_) => "invalid_configuration",
            AdmissionError::UnknownLimiter(_) => "unknown_limiter",
            AdmissionError::Config(_) => "config",
            AdmissionError::Serialization(_) => "serialization",
            AdmissionError::Io(_) => "io",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_failure_classification() {
        assert!(AdmissionError::StoreUnavailable("down".to_string()).is_store_failure());
        assert!(AdmissionError::ConcurrentUpdateExhausted {
            key: "k".to_string(),
            attempts: 3,
        }
        .is_store_failure());
        assert!(!AdmissionError::InvalidConfiguration("capacity".to_string()).is_store_failure());
        assert!(!AdmissionError::UnknownLimiter("nope".to_string()).is_store_failure());
    }

    #[test]
    fn test_error_display() {
        let err = AdmissionError::ConcurrentUpdateExhausted {
            key: "rate_limit:fixed:api:user".to_string(),
            attempts: 16,
        };
        assert_eq!(
            err.to_string(),
            "Concurrent update retries exhausted for key rate_limit:fixed:api:user after 16 attempts"
        );
        assert_eq!(err.kind(), "cas_exhausted");
    }
}

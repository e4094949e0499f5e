use thiserror::Error;

#[derive(Debug, Error)]
#[allow(dead_code)]
pub enum BridgeError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("key-value backend error: {0}")]
    Kv(String),

    #[error("platform API error: {0}")]
    Platform(String),

    #[error("circuit breaker open for dependency: {0}")]
    CircuitBreakerOpen(String),

    #[error("retry attempts exhausted after {attempts} tries: {last_error}")]
    RetryExhausted { attempts: usize, last_error: String },

    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("no bot available to serve this request")]
    NoBotAvailable,

    #[error("support topic not found for conversation")]
    TopicNotFound,

    #[error("authentication error: {0}")]
    Authentication(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Generic(String),
}

impl BridgeError {
    /// Whether a caller should retry the operation that produced this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BridgeError::Platform(_)
                | BridgeError::Kv(_)
                | BridgeError::RateLimited { .. }
                | BridgeError::RetryExhausted { .. }
        )
    }

    /// Suggested wait before retrying, if the error carries one.
    pub fn retry_after(&self) -> Option<std::time::Duration> {
        match self {
            BridgeError::RateLimited { retry_after_secs } => {
                Some(std::time::Duration::from_secs(*retry_after_secs))
            }
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;

//! Error types for the inference client.

use thiserror::Error;

/// Result type alias for inference operations.
pub type Result<T> = std::result::Result<T, InferenceError>;

/// Errors that can occur while calling the classification service.
#[derive(Error, Debug)]
pub enum InferenceError {
    /// Provider not configured (no endpoint or credentials).
    #[error("inference provider not configured")]
    ProviderNotConfigured,

    /// The call did not complete within the configured timeout.
    #[error("inference call timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// The service is reachable but refuses work, or is not reachable at all.
    #[error("inference service unavailable: {0}")]
    Unavailable(String),

    /// API request failed.
    #[error("API request failed: {0}")]
    ApiRequest(String),

    /// Invalid response from provider.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// Rate limit exceeded.
    #[error("rate limit exceeded, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP error.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

impl InferenceError {
    /// Whether a retry has a chance of succeeding.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout { .. } | Self::Unavailable(_) | Self::RateLimited { .. } => true,
            Self::Http(err) => err.is_timeout() || err.is_connect(),
            Self::ProviderNotConfigured
            | Self::ApiRequest(_)
            | Self::InvalidResponse(_)
            | Self::Serialization(_) => false,
        }
    }

    /// Whether this error represents an elapsed timeout.
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Timeout { .. } => true,
            Self::Http(err) => err.is_timeout(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(InferenceError::Timeout { timeout_ms: 10 }.is_retryable());
        assert!(InferenceError::Unavailable("down".to_string()).is_retryable());
        assert!(!InferenceError::ProviderNotConfigured.is_retryable());
        assert!(!InferenceError::InvalidResponse("bad".to_string()).is_retryable());
    }

    #[test]
    fn test_timeout_detection() {
        assert!(InferenceError::Timeout { timeout_ms: 10 }.is_timeout());
        assert!(!InferenceError::Unavailable("down".to_string()).is_timeout());
    }
}

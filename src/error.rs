//! Error types for the market data client

use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by the data access layer
///
/// `Clone` so a single in-flight fetch can hand its outcome to every caller
/// waiting on the same cache key.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ApiError {
    /// Caller supplied an invalid argument, no request was issued
    #[error("Validation error: {0}")]
    Validation(String),

    /// Local rate limiter refused the request
    #[error("Rate limit exceeded, retry in {}ms", .wait.as_millis())]
    RateLimitExceeded { wait: Duration },

    /// No response within the configured timeout
    #[error("Request timeout after {}ms: {endpoint}", .timeout.as_millis())]
    Timeout { endpoint: String, timeout: Duration },

    /// HTTP 404
    #[error("Resource not found: {endpoint}")]
    NotFound { endpoint: String },

    /// HTTP 401
    #[error("API key is invalid or missing: {endpoint}")]
    Unauthorized { endpoint: String },

    /// HTTP 429 from the remote API
    #[error("Remote rate limit exceeded: {endpoint}")]
    RateLimited { endpoint: String },

    /// Any other non-success HTTP status
    #[error("API request failed with HTTP {status}: {endpoint}")]
    RequestFailed { status: u16, endpoint: String },

    /// The request never produced a response
    #[error("Network error on {endpoint}: {message}")]
    Network { endpoint: String, message: String },

    /// Response body was not the JSON we expected
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl ApiError {
    /// Creates a Validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Creates an InvalidResponse error
    pub fn invalid_response(msg: impl Into<String>) -> Self {
        Self::InvalidResponse(msg.into())
    }

    /// Maps a non-success HTTP status to its error variant
    pub fn from_status(status: u16, endpoint: &str) -> Self {
        let endpoint = endpoint.to_string();
        match status {
            401 => Self::Unauthorized { endpoint },
            404 => Self::NotFound { endpoint },
            429 => Self::RateLimited { endpoint },
            _ => Self::RequestFailed { status, endpoint },
        }
    }

    /// Whether a retry could plausibly succeed
    ///
    /// Only timeouts, network failures and 5xx responses qualify.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout { .. } | Self::Network { .. } => true,
            Self::RequestFailed { status, .. } => (500..600).contains(status),
            _ => false,
        }
    }
}

/// Low level failures reported by an `HttpTransport`
#[derive(Debug, Error, Clone, PartialEq)]
pub enum TransportError {
    /// The transport gave up waiting on its own
    #[error("transport timeout")]
    Timeout,

    /// Connection, TLS or protocol failure
    #[error("connection failed: {0}")]
    Connection(String),
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else {
            Self::Connection(err.to_string())
        }
    }
}

/// Invalid client configuration, detected at startup
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    /// A field holds an unusable value
    #[error("Invalid config field `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },

    /// An environment variable could not be parsed
    #[error("Invalid environment variable {var}: {reason}")]
    Env { var: &'static str, reason: String },

    /// The HTTP client could not be constructed
    #[error("Failed to build HTTP client: {0}")]
    HttpClient(String),
}

impl ConfigError {
    /// Creates an Invalid error
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// Failures of the persistent key-value backend
#[derive(Debug, Error)]
pub enum StorageError {
    /// Reading or writing the backing file failed
    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Stored bytes could not be (de)serialized
    #[error("Storage serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(matches!(
            ApiError::from_status(404, "/x"),
            ApiError::NotFound { .. }
        ));
        assert!(matches!(
            ApiError::from_status(401, "/x"),
            ApiError::Unauthorized { .. }
        ));
        assert!(matches!(
            ApiError::from_status(429, "/x"),
            ApiError::RateLimited { .. }
        ));
        assert_eq!(
            ApiError::from_status(503, "/x"),
            ApiError::RequestFailed {
                status: 503,
                endpoint: "/x".to_string()
            }
        );
    }

    #[test]
    fn test_only_transient_errors_retry() {
        assert!(ApiError::from_status(500, "/x").is_transient());
        assert!(ApiError::from_status(502, "/x").is_transient());
        assert!(!ApiError::from_status(400, "/x").is_transient());
        assert!(!ApiError::from_status(404, "/x").is_transient());
        assert!(!ApiError::from_status(401, "/x").is_transient());
        assert!(!ApiError::from_status(429, "/x").is_transient());
        assert!(!ApiError::validation("bad").is_transient());
        assert!(ApiError::Network {
            endpoint: "/x".to_string(),
            message: "reset".to_string()
        }
        .is_transient());
        assert!(ApiError::Timeout {
            endpoint: "/x".to_string(),
            timeout: Duration::from_secs(1)
        }
        .is_transient());
    }
}

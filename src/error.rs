//! Error types for Sliceguard.

use std::time::Duration;
use thiserror::Error;

/// Main error type for Sliceguard operations.
#[derive(Error, Debug)]
pub enum SliceguardError {
    /// Invalid window or limiter configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// A limiter key that cannot be stored
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// The counter backend failed or is unavailable
    #[error("Backend error: {0}")]
    Backend(String),

    /// A backend call did not complete in time
    #[error("Backend {operation} timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },

    /// Redis client errors
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SliceguardError {
    /// Whether this error came from the counter backend rather than from
    /// the caller's input or configuration.
    pub fn is_backend_failure(&self) -> bool {
        matches!(
            self,
            SliceguardError::Backend(_) | SliceguardError::Timeout { .. } | SliceguardError::Redis(_)
        )
    }
}

/// Result type alias for Sliceguard operations.
pub type Result<T> = std::result::Result<T, SliceguardError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_failure_classification() {
        assert!(SliceguardError::Backend("down".into()).is_backend_failure());
        assert!(SliceguardError::Timeout {
            operation: "bulk_get",
            timeout: Duration::from_millis(10),
        }
        .is_backend_failure());
        assert!(!SliceguardError::Config("bad".into()).is_backend_failure());
        assert!(!SliceguardError::InvalidKey(String::new()).is_backend_failure());
    }

    #[test]
    fn test_timeout_message() {
        let err = SliceguardError::Timeout {
            operation: "increment",
            timeout: Duration::from_millis(250),
        };
        assert_eq!(err.to_string(), "Backend increment timed out after 250ms");
    }
}

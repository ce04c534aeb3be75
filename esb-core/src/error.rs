//! Error types for the service bus

use thiserror::Error;

/// Result type for service bus operations
pub type Result<T> = std::result::Result<T, Error>;

/// Service bus errors
#[derive(Error, Debug)]
pub enum Error {
    /// Target not registered, inactive, or its breaker is open
    #[error("Service unavailable: {service_name}")]
    ServiceUnavailable {
        /// Service name
        service_name: String,
    },

    /// Circuit breaker rejected the call without running it
    #[error("Circuit breaker open for service {service_name}, retry in {retry_in_secs}s")]
    CircuitOpen {
        /// Service name
        service_name: String,
        /// Seconds left on the cool-down
        retry_in_secs: u64,
    },

    /// Payload could not be transformed between formats
    #[error("Transformation {source_format} -> {target_format} failed: {reason}")]
    Transformation {
        /// Source format name
        source_format: String,
        /// Target format name
        target_format: String,
        /// Reason
        reason: String,
    },

    /// Downstream endpoint rejected or failed the delivery
    #[error("Delivery to {service_name} failed: {reason}")]
    Delivery {
        /// Service name
        service_name: String,
        /// Reason
        reason: String,
    },

    /// Dead-letter entry retried past the configured maximum
    #[error("Retry exhausted for message {message_id} after {attempts} attempts")]
    RetryExhausted {
        /// Message ID
        message_id: String,
        /// Attempts made
        attempts: u32,
    },

    /// Delivery timed out
    #[error("Delivery to {service_name} timed out after {seconds}s")]
    Timeout {
        /// Service name
        service_name: String,
        /// Timeout duration
        seconds: u64,
    },

    /// Lookup miss
    #[error("Not found: {0}")]
    NotFound(String),

    /// Programming error (empty names, empty ids)
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// HTTP client error
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Build a transformation error for a format pair
    pub fn transformation(
        source: impl std::fmt::Display,
        target: impl std::fmt::Display,
        reason: impl Into<String>,
    ) -> Self {
        Error::Transformation {
            source_format: source.to_string(),
            target_format: target.to_string(),
            reason: reason.into(),
        }
    }

    /// True for the breaker fast-fail path
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Error::CircuitOpen { .. })
    }
}

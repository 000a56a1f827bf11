// ABOUTME: Defines all error types for the toolgate library using thiserror.
// ABOUTME: Each component has its own error enum, unified under ToolgateError.

use serde::{Deserialize, Serialize};

/// Top-level error type for the toolgate library.
#[derive(Debug, thiserror::Error)]
pub enum ToolgateError {
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Errors from priority queue operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("Invalid priority tier: {0}")]
    InvalidPriority(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Request already queued: {0}")]
    DuplicateRequest(String),
}

/// Errors from the shared coordination store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Coordination store unavailable: {0}")]
    Unavailable(String),

    #[error("Invalid key pattern: {0}")]
    InvalidPattern(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[cfg(feature = "redis")]
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

/// Errors from loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Classified failure kinds, used for logging and dispatch outcomes.
///
/// Only these kinds (never payload content) are logged at error severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The executor reported that the upstream tool is rate limiting us.
    TransientUpstreamRateLimit,
    /// Another instance already owns the claim for a request.
    ClaimConflict,
    /// The coordination store could not be reached or answered badly.
    CoordinationStoreUnavailable,
    /// The executor failed for a reason other than rate limiting.
    ExecutorFailure,
    /// A request or setting was rejected at the API boundary.
    ConfigurationError,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::TransientUpstreamRateLimit => write!(f, "transient_upstream_rate_limit"),
            ErrorKind::ClaimConflict => write!(f, "claim_conflict"),
            ErrorKind::CoordinationStoreUnavailable => write!(f, "coordination_store_unavailable"),
            ErrorKind::ExecutorFailure => write!(f, "executor_failure"),
            ErrorKind::ConfigurationError => write!(f, "configuration_error"),
        }
    }
}

impl ToolgateError {
    /// The classified kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ToolgateError::Queue(_) | ToolgateError::Config(_) => ErrorKind::ConfigurationError,
            ToolgateError::Store(_) => ErrorKind::CoordinationStoreUnavailable,
        }
    }
}

pub type Result<T> = std::result::Result<T, ToolgateError>;

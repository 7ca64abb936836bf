//! Error types for the sliding window rate limiter.

use thiserror::Error;

/// Main error type for rate limiter operations.
#[derive(Error, Debug)]
pub enum LimiterError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A rate literal that could not be parsed
    #[error("Invalid rate literal: {0}")]
    InvalidRate(String),

    /// Lookup of a rule that was never registered
    #[error("Unknown rate limit rule: {0}")]
    UnknownRule(String),

    /// The request was rejected by a rate limit rule
    #[error("Rate limit exceeded for rule '{rule}' (key '{key}') until {until}")]
    RateLimited {
        /// Name of the rule that rejected the request
        rule: String,
        /// Logical key that is over budget
        key: String,
        /// Unix time in seconds at which the key is predicted to be unblocked
        until: f64,
    },

    /// Counter store errors
    #[error("Counter store error: {0}")]
    Store(String),

    /// A shared-store provider needs a tokio runtime to detach its store calls
    #[error("No tokio runtime available to run counter store operations")]
    NoRuntime,

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Layered configuration loading errors
    #[error("Configuration load error: {0}")]
    ConfigLoad(#[from] ::config::ConfigError),

    /// YAML parsing errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Redis errors
    #[cfg(feature = "redis")]
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

/// Result type alias for rate limiter operations.
pub type Result<T> = std::result::Result<T, LimiterError>;

//! Error types for llmgate.

use std::time::Duration;

use thiserror::Error;

/// Main error type for llmgate operations.
#[derive(Error, Debug)]
pub enum GateError {
    /// Invalid or inconsistent configuration, including bad provider/endpoint pairs.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A logical model name that is not in the mapping table.
    #[error("Unknown model: '{0}'")]
    UnknownModel(String),

    /// The shared counter store could not be reached or failed an operation.
    #[error("Counter store unavailable: {0}")]
    StoreUnavailable(String),

    /// A decrement would have taken a counter below zero.
    #[error("Counter underflow on key '{0}'")]
    CounterUnderflow(String),

    /// Gave up waiting for admission.
    #[error("Timed out after {waited:?} waiting for admission to {limiter}")]
    AcquireTimeout { limiter: String, waited: Duration },

    /// The caller cancelled while waiting for admission.
    #[error("Acquisition cancelled for {0}")]
    Cancelled(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl GateError {
    /// Construction-time errors that must abort startup.
    pub fn is_config(&self) -> bool {
        matches!(self, GateError::Config(_) | GateError::UnknownModel(_))
    }

    /// Store failures the caller may choose to fail open or closed on.
    pub fn is_transient(&self) -> bool {
        matches!(self, GateError::StoreUnavailable(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, GateError::AcquireTimeout { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, GateError::Cancelled(_))
    }
}

impl From<redis::RedisError> for GateError {
    fn from(err: redis::RedisError) -> Self {
        GateError::StoreUnavailable(err.to_string())
    }
}

impl From<config::ConfigError> for GateError {
    fn from(err: config::ConfigError) -> Self {
        GateError::Config(err.to_string())
    }
}

/// Result type alias for llmgate operations.
pub type Result<T> = std::result::Result<T, GateError>;

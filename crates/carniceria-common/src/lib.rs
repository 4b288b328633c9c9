//! # Carnicería Common
//!
//! Shared error type, logging setup, and retry/timeout helpers used by the
//! offline worker crates.
//!
//! ## Features
//!
//! - Unified error type with backtrace support for internal faults
//! - Logging configuration and setup
//! - Retry and timeout utilities

use std::time::Duration;
use thiserror::Error;

pub mod logging;
pub mod retry;

pub use logging::{init_logging, LogConfig, LogFormat};
pub use retry::{retry_with_backoff, with_timeout, RetryConfig, Retryable};

/// Unified error type for the shared helpers.
#[derive(Error, Debug)]
pub enum CarniceriaError {
    /// Network-related errors.
    #[error("Network error: {0}")]
    Network(String),

    /// Timeout errors.
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// Internal error (unexpected).
    #[error("Internal error: {message}")]
    Internal {
        message: String,
        backtrace: Option<backtrace::Backtrace>,
    },
}

impl CarniceriaError {
    /// Create a network error.
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network(message.into())
    }

    /// Create an internal error with backtrace.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
            backtrace: Some(backtrace::Backtrace::new()),
        }
    }

    /// Get the error category for log fields.
    pub fn category(&self) -> &'static str {
        match self {
            CarniceriaError::Network(_) => "network",
            CarniceriaError::Timeout(_) => "timeout",
            CarniceriaError::Internal { .. } => "internal",
        }
    }
}

impl Retryable for CarniceriaError {
    fn is_retryable(&self) -> bool {
        matches!(self, CarniceriaError::Network(_) | CarniceriaError::Timeout(_))
    }
}

/// Result type alias for shared operations.
pub type Result<T> = std::result::Result<T, CarniceriaError>;

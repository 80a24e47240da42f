//! # Lizard Common
//!
//! Shared plumbing for the Lizard Tap offline cache crates.
//!
//! ## Features
//!
//! - Logging configuration and setup
//! - Timeout wrapper for async operations
//! - Retry policy for operator-driven retries

use std::time::Duration;
use thiserror::Error;

pub mod logging;
pub mod retry;

pub use logging::{init_logging, LogConfig, LogFormat};
pub use retry::{retry, with_timeout, RetryPolicy};

/// Errors produced by the shared utilities.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommonError {
    /// The wrapped operation did not finish in time.
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// A retry policy was configured with zero attempts.
    #[error("Retry policy allows no attempts")]
    NoAttempts,
}

impl CommonError {
    /// Get the error category for log fields.
    pub fn category(&self) -> &'static str {
        match self {
            CommonError::Timeout(_) => "timeout",
            CommonError::NoAttempts => "config",
        }
    }
}

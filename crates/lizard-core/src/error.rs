//! Error types for Lizard Tap

use thiserror::Error;

/// Result type alias for Lizard Tap operations
pub type LizardResult<T> = Result<T, LizardError>;

/// Main error type for Lizard Tap
#[derive(Error, Debug)]
pub enum LizardError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("URL error: {0}")]
    Url(#[from] url::ParseError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl LizardError {
    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}

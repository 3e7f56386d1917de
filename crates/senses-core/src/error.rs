//! Error types for configuration loading

use thiserror::Error;

/// Result type alias for config operations
pub type SensesResult<T> = Result<T, SensesError>;

/// Main error type for configuration handling
#[derive(Error, Debug)]
pub enum SensesError {
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

impl SensesError {
    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}

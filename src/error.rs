//! # Error Types
//!
//! Custom error types for Kraken Proxy using `thiserror`.

use thiserror::Error;

use crate::power::PowerError;

/// Main error type for Kraken Proxy
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    /// Settings document could not be parsed or serialized
    #[error("Settings document error: {0}")]
    Settings(#[from] serde_json::Error),

    /// Request value outside the accepted range
    #[error("Invalid value: {0}")]
    Validation(String),

    /// Power sequencing failures
    #[error(transparent)]
    Power(#[from] PowerError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Kraken Proxy
pub type Result<T> = std::result::Result<T, ProxyError>;

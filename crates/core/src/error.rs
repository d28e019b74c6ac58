//! Core error types

use thiserror::Error;

/// Core error type for trustforge
#[derive(Debug, Error)]
pub enum CoreError {
    /// Configuration rejected after decoding
    #[error("Configuration error: {0}")]
    Config(String),

    /// TOML decoding error
    #[error("Configuration decode error: {0}")]
    Toml(#[from] toml::de::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CoreError>;

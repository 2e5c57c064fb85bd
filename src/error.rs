//! Error types for Tollgate.

use thiserror::Error;

/// Main error type for Tollgate operations.
#[derive(Error, Debug)]
pub enum TollgateError {
    /// A bucket or gate was requested with parameters that cannot work
    /// (zero capacity, non-positive rate, empty window).
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Configuration documents that fail to parse
    #[error("Configuration error: {0}")]
    Config(String),

    /// Layered settings loading errors
    #[error("Settings error: {0}")]
    Settings(#[from] ::config::ConfigError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Tollgate operations.
pub type Result<T> = std::result::Result<T, TollgateError>;

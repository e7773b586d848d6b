//! Error types shared across dataqs crates

use thiserror::Error;

/// Result type alias for shared dataqs operations
pub type Result<T> = std::result::Result<T, DataqsError>;

/// Failures that are not specific to one pipeline stage
#[derive(Error, Debug)]
pub enum DataqsError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid identifier '{name}': {reason}")]
    InvalidIdentifier { name: String, reason: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Logging setup failed: {0}")]
    Logging(String),
}

impl DataqsError {
    pub fn invalid_identifier(name: impl Into<String>, reason: impl Into<String>) -> Self {
        DataqsError::InvalidIdentifier {
            name: name.into(),
            reason: reason.into(),
        }
    }
}

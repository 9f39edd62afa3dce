//! Error types for the command-line driver.

use fusion_tta::TtaError;
use thiserror::Error;

/// Driver errors
#[derive(Debug, Error)]
pub enum BenchError {
    /// Invalid run configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed configuration file
    #[error("Failed to parse configuration: {0}")]
    Toml(#[from] toml::de::Error),

    /// Adaptation failed
    #[error(transparent)]
    Adaptation(#[from] TtaError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),
}

/// Result type for driver operations
pub type Result<T> = std::result::Result<T, BenchError>;

impl From<fusion_merging::MergeError> for BenchError {
    fn from(err: fusion_merging::MergeError) -> Self {
        BenchError::Adaptation(err.into())
    }
}

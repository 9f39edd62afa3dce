//! Error types for test-time adaptation

use fusion_merging::MergeError;
use thiserror::Error;

/// Adaptation errors
#[derive(Debug, Error)]
pub enum TtaError {
    /// Task has no registered classnames/templates
    #[error("Unknown task: {0}")]
    UnknownTask(String),

    /// Backbone or expert could not be resolved or parsed
    #[error("Failed to load model '{name}': {reason}")]
    ModelLoad { name: String, reason: String },

    /// Invalid or inconsistent configuration
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Forward/backward failure during adaptation
    #[error("Compute error: {0}")]
    Compute(String),

    /// A data source produced no batches even on a fresh pass
    #[error("Dataset for task '{0}' is empty")]
    EmptyDataset(String),

    /// Merging error
    #[error("Merge error: {0}")]
    Merge(MergeError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<MergeError> for TtaError {
    fn from(err: MergeError) -> Self {
        match err {
            MergeError::ConfigError(msg) => TtaError::Configuration(msg),
            other => TtaError::Merge(other),
        }
    }
}

impl From<bincode::Error> for TtaError {
    fn from(err: bincode::Error) -> Self {
        TtaError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for TtaError {
    fn from(err: serde_json::Error) -> Self {
        TtaError::Serialization(err.to_string())
    }
}

/// Result type for adaptation operations
pub type Result<T> = std::result::Result<T, TtaError>;

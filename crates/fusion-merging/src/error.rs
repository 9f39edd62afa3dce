//! Error types for model merging

use thiserror::Error;

/// Model merging errors
#[derive(Debug, Error)]
pub enum MergeError {
    /// Tensor or matrix dimensions disagree
    #[error("Shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    /// An expert cannot be merged with the base model
    #[error("Expert does not match the base model: {0}")]
    IncompatibleModels(String),

    /// A tensor the architecture expects is absent
    #[error("Missing tensor {0}")]
    MissingLayer(String),

    #[error("Invalid weights: {0}")]
    InvalidWeights(String),

    /// Unusable merge or gate settings
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// NaN or infinity in coefficients or activations
    #[error("Non-finite value: {0}")]
    Numerical(String),
}

pub type Result<T> = std::result::Result<T, MergeError>;

//! Error types for VIA.

use thiserror::Error;

/// Main error type for model construction, loss computation and training.
#[derive(Error, Debug)]
pub enum ViaError {
    /// Invalid configuration (divisibility, dimensions, prompt tokens).
    #[error("Config error: {0}")]
    Config(String),

    /// Tensor shapes that do not line up at call time.
    #[error("Shape error: {0}")]
    Shape(String),

    /// Parameter store / trainable mask mismatch.
    #[error("Parameter error: {0}")]
    Parameter(String),

    /// Training data errors.
    #[error("Data error: {0}")]
    Data(String),

    /// Checkpoint save/restore errors.
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    /// I/O errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Candle tensor errors.
    #[error("Tensor error: {0}")]
    Candle(#[from] candle_core::Error),

    /// JSON parsing errors.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for VIA operations.
pub type ViaResult<T> = Result<T, ViaError>;

//! Error types for the recognition pipeline

use thiserror::Error;

/// Failure of a single prediction, tagged by the pipeline stage that failed
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PredictionError {
    /// Bad input rejected before any computation
    #[error("{0}")]
    Validation(String),

    /// Image could not be decoded, converted or resized
    #[error("Error preprocessing image: {0}")]
    Preprocessing(String),

    /// Model execution failed (shape mismatch, runtime error, pool closed)
    #[error("Inference error: {0}")]
    Inference(String),

    /// Logits had an unexpected rank or shape
    #[error("Error decoding predictions: {0}")]
    Decoding(String),
}

impl PredictionError {
    /// Whether the failure was caused by the caller's input.
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::Validation(_) | Self::Preprocessing(_))
    }

    /// Short stage name for structured logging
    pub fn stage(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::Preprocessing(_) => "preprocessing",
            Self::Inference(_) => "inference",
            Self::Decoding(_) => "decoding",
        }
    }
}

impl From<ort::Error> for PredictionError {
    fn from(err: ort::Error) -> Self {
        Self::Inference(err.to_string())
    }
}

impl From<image::ImageError> for PredictionError {
    fn from(err: image::ImageError) -> Self {
        Self::Preprocessing(err.to_string())
    }
}

/// Result alias for pipeline operations
pub type PredictionResult<T> = Result<T, PredictionError>;

//! Error types for the diagnostic pipeline.

use thiserror::Error;

/// Result type alias using [`DiagnosticError`].
pub type Result<T> = std::result::Result<T, DiagnosticError>;

/// Errors that abort a diagnostic request or misconfigure the pipeline.
///
/// Saliency failures never appear here: they are absorbed by the saliency
/// generator and surface only as an absent overlay.
#[derive(Error, Debug)]
pub enum DiagnosticError {
    /// No model is loaded; every request fails fast until a reload.
    #[error("Model unavailable: {0}")]
    ModelUnavailable(String),

    /// The uploaded bytes do not decode to an image.
    #[error("Invalid image: {0}")]
    InvalidImage(String),

    /// Invalid tensor shape provided.
    #[error("Invalid shape: expected {expected}, got {got}")]
    InvalidShape {
        /// Expected shape description.
        expected: String,
        /// Actual shape description.
        got: String,
    },

    /// Input values fell outside the model's expected range.
    #[error("Input out of range: value {value} not in [{min}, {max}]")]
    OutOfRange {
        /// Offending value.
        value: f32,
        /// Lower bound.
        min: f32,
        /// Upper bound.
        max: f32,
    },

    /// Configuration could not be loaded or is inconsistent.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Forward pass produced unusable output.
    #[error("Inference error: {0}")]
    Inference(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

/// How a serving layer should classify a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// The caller sent bad input (maps to a 4xx status).
    Client,
    /// The service cannot serve predictions right now (maps to 503).
    Unavailable,
    /// Anything else (maps to 500).
    Internal,
}

impl DiagnosticError {
    /// Classify this error for status mapping at the request boundary.
    #[must_use]
    pub fn failure_class(&self) -> FailureClass {
        match self {
            Self::InvalidImage(_) => FailureClass::Client,
            Self::ModelUnavailable(_) => FailureClass::Unavailable,
            _ => FailureClass::Internal,
        }
    }
}

impl From<figment::Error> for DiagnosticError {
    fn from(err: figment::Error) -> Self {
        Self::Config(err.to_string())
    }
}

impl From<serde_json::Error> for DiagnosticError {
    fn from(err: serde_json::Error) -> Self {
        Self::SerializationError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_class_mapping() {
        assert_eq!(
            DiagnosticError::InvalidImage("bad".into()).failure_class(),
            FailureClass::Client
        );
        assert_eq!(
            DiagnosticError::ModelUnavailable("none".into()).failure_class(),
            FailureClass::Unavailable
        );
        assert_eq!(
            DiagnosticError::Config("x".into()).failure_class(),
            FailureClass::Internal
        );
    }
}

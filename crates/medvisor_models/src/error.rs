//! Error types for model loading.

use std::path::PathBuf;

use medvisor_core::DiagnosticError;
use thiserror::Error;

/// Result type alias using [`ModelError`].
pub type Result<T> = std::result::Result<T, ModelError>;

/// Errors raised while building, loading or saving classifiers.
#[derive(Error, Debug)]
pub enum ModelError {
    /// A required artifact does not exist.
    #[error("Model artifact not found: {0}")]
    NotFound(PathBuf),

    /// Error loading weights.
    #[error("Failed to load weights: {0}")]
    Load(String),

    /// Error saving weights.
    #[error("Failed to save weights: {0}")]
    Save(String),

    /// Architecture name not present in the registry.
    #[error("Architecture '{0}' not found in registry")]
    UnknownArchitecture(String),

    /// Sidecar metadata or architecture config is invalid.
    #[error("Invalid model metadata: {0}")]
    Metadata(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl From<serde_json::Error> for ModelError {
    fn from(err: serde_json::Error) -> Self {
        Self::Metadata(err.to_string())
    }
}

impl From<ModelError> for DiagnosticError {
    fn from(err: ModelError) -> Self {
        DiagnosticError::ModelUnavailable(err.to_string())
    }
}

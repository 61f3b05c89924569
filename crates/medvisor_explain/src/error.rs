//! Saliency errors.
//!
//! None of these reach the caller of [`crate::SaliencyGenerator::compute`];
//! they are logged and the map is reported as absent.

use thiserror::Error;

/// Result type alias using [`SaliencyError`].
pub type Result<T> = std::result::Result<T, SaliencyError>;

/// Reasons a saliency map could not be produced.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SaliencyError {
    /// Neither the primary layer nor any fallback exists on the model.
    #[error("No target layer found (tried {tried:?})")]
    TargetLayerNotFound {
        /// Layer names tried, in order.
        tried: Vec<String>,
    },

    /// Autodiff produced no gradient for the activation.
    #[error("No gradient reached layer '{0}'")]
    MissingGradient(String),

    /// Activation and gradient disagree in shape, or the batch is not 1.
    #[error("Shape mismatch: activation {activation:?}, gradient {gradient:?}")]
    ShapeMismatch {
        /// Activation dims.
        activation: [usize; 4],
        /// Gradient dims.
        gradient: [usize; 4],
    },

    /// NaN or infinity in the map before normalization.
    #[error("Saliency map contains non-finite values")]
    NonFinite,

    /// The forward pass failed or produced no scores.
    #[error("Forward pass failed: {0}")]
    Forward(String),

    /// The computation panicked inside the tensor backend.
    #[error("Saliency computation panicked: {0}")]
    Panicked(String),
}

//! # medvisor_core
//!
//! Core types and configuration for the medvisor diagnostic pipeline.
//!
//! This crate provides:
//! - [`InputSpec`] and [`Normalization`] describing what a classifier expects
//! - [`InputTensor`], the immutable normalized model input
//! - [`ScoreVector`] with deterministic top-K extraction
//! - [`DiagnosticResult`] and [`Severity`], the record handed to the serving layer
//! - [`MedvisorConfig`] layered configuration
//! - Error types and the failure classification used at the request boundary
//!
//! ## Tensor Convention
//!
//! Image tensors follow burn's convolution layout `(N, C, H, W)`:
//! - `N`: Batch size (always 1 for a single request)
//! - `C`: Channels (RGB, 3)
//! - `H`, `W`: Spatial resolution expected by the model

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
mod error;
mod input;
mod result;
mod score;
mod shape;
mod tensor;

pub use config::{
    load_config, HeatmapConfig, InferenceConfig, MedvisorConfig, ModelConfig, PreprocessConfig,
    SaliencyConfig, SeverityConfig, SeverityOverride,
};
pub use error::{DiagnosticError, FailureClass, Result};
pub use input::{InputSpec, Normalization};
pub use result::{
    DiagnosticResult, DifferentialEntry, HeatmapOverlay, SaliencyStatus, Severity, TopPrediction,
};
pub use score::{confidence_percent, ClassScore, ScoreVector};
pub use shape::ImageShape;
pub use tensor::InputTensor;

/// Backend type aliases for convenience
pub mod backend {
    #[cfg(feature = "backend-ndarray")]
    pub use burn_ndarray::NdArray;

    #[cfg(feature = "backend-ndarray")]
    pub use burn_autodiff::Autodiff;

    /// Backend used for plain inference.
    #[cfg(feature = "backend-ndarray")]
    pub type InferenceBackend = NdArray;

    /// Backend used when gradients are required (saliency).
    #[cfg(feature = "backend-ndarray")]
    pub type ExplainBackend = Autodiff<NdArray>;
}

//! # medvisor
//!
//! Image classification with Grad-CAM explanations.
//!
//! A [`DiagnosticEngine`] is built once from a [`MedvisorConfig`] and shared
//! by reference. Each call to [`DiagnosticEngine::predict`] decodes an
//! image, classifies it, computes a saliency map for the top class when
//! capacity allows, blends it into a heatmap overlay and derives a severity
//! tier plus a differential list.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use medvisor::prelude::*;
//!
//! let config = load_config(Some(Path::new("medvisor.toml")))?;
//! let engine = DiagnosticEngine::<ExplainBackend>::from_config(&config, &Default::default());
//!
//! let bytes = std::fs::read("chest.png")?;
//! let result = engine.predict(&bytes, Some("dr.house".into()))?;
//! println!("{} ({:.1}%) {}", result.predicted_class(), result.confidence(), result.severity());
//! if let Some(overlay) = result.overlay() {
//!     overlay.save("chest_gradcam.png")?;
//! }
//! ```
//!
//! ## Feature Flags
//!
//! - `backend-ndarray` (default): CPU backend using ndarray

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]

mod engine;

pub use engine::DiagnosticEngine;

pub use medvisor_analysis as analysis;
pub use medvisor_core as core;
pub use medvisor_explain as explain;
pub use medvisor_models as models;
pub use medvisor_transforms as transforms;

/// Prelude module for convenient imports.
///
/// ```rust,ignore
/// use medvisor::prelude::*;
/// ```
pub mod prelude {
    pub use crate::DiagnosticEngine;

    // Core types
    pub use medvisor_core::{
        load_config, DiagnosticError, DiagnosticResult, DifferentialEntry, FailureClass,
        HeatmapOverlay, InputSpec, MedvisorConfig, Normalization, Result, SaliencyStatus,
        ScoreVector, Severity,
    };

    #[cfg(feature = "backend-ndarray")]
    pub use medvisor_core::backend::{ExplainBackend, InferenceBackend};

    // Models
    pub use medvisor_models::{
        import_mobilenet_v2, save_checkpoint, CheckpointMetadata, ConvNetConfig, ImageClassifier,
        Labels, LoadedModel, MobileNetV2Config, ModelProvider, ModelSource, TargetLayerSpec,
        WeightLayout, PYTORCH_BN_EPSILON,
    };

    // Pipeline stages
    pub use medvisor_analysis::{DiagnosisDeriver, SeverityPolicy};
    pub use medvisor_explain::{HeatmapCompositor, SaliencyGenerator, SaliencyMap};
    pub use medvisor_transforms::Preprocessor;
}

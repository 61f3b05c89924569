//! # medvisor_models
//!
//! Differentiable image classifiers and the model provider.
//!
//! ## Architectures
//! - [`MobileNetV2`] - the ImageNet fallback classifier, Keras layer naming
//! - [`ConvNet`] - plain conv stack for small custom models
//!
//! Every architecture implements [`ImageClassifier`], which exposes named
//! internal layers so the saliency generator can split the forward pass at
//! a target layer. Batch normalization is [`FrozenBatchNorm`], so the
//! autodiff backend evaluates exactly like the inference backend.
//!
//! ## Importing published weights
//! [`import_mobilenet_v2`] reads the torchvision or timm ImageNet
//! MobileNetV2 state dict from a `*.safetensors` file.
//!
//! ## Provider
//! [`ModelProvider`] loads a custom checkpoint or falls back to MobileNetV2
//! and binds a [`TargetLayerSpec`] to the loaded instance.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod checkpoint;
pub mod cnn;
mod error;
pub mod import;
mod labels;
mod layer;
mod norm;
pub mod provider;
pub mod registry;
pub mod traits;

pub use checkpoint::{load_weights, save_checkpoint, save_weights, CheckpointMetadata};
pub use cnn::*;
pub use error::{ModelError, Result};
pub use import::{import_mobilenet_v2, is_safetensors, WeightLayout, PYTORCH_BN_EPSILON};
pub use labels::Labels;
pub use layer::TargetLayerSpec;
pub use norm::FrozenBatchNorm;
pub use provider::{LoadedModel, ModelProvider, ModelSource};
pub use registry::{default_registry, ClassifierPair, ModelRegistry};
pub use traits::{ImageClassifier, StagedNetwork};

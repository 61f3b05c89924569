//! Architecture registry.
//!
//! Maps the `arch` name stored in checkpoint metadata to a constructor that
//! builds the module from its JSON config, optionally loads weights, and
//! returns both the gradient-tracking instance and its inference twin.
//!
//! ```rust,ignore
//! use medvisor_models::registry::default_registry;
//! use serde_json::json;
//!
//! let registry = default_registry::<Autodiff<NdArray>>();
//! let (explain, inference) =
//!     registry.create("convnet", &json!({ "num_classes": 2 }), None, &device)?;
//! ```

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use burn::module::AutodiffModule;
use burn::tensor::backend::AutodiffBackend;
use serde_json::Value;

use crate::checkpoint::load_weights;
use crate::cnn::{ConvNetConfig, MobileNetV2Config, DEFAULT_BN_EPSILON};
use crate::error::{ModelError, Result};
use crate::import::{import_mobilenet_v2, is_safetensors, PYTORCH_BN_EPSILON};
use crate::traits::ImageClassifier;

/// A classifier on the autodiff backend and the same weights on its inner
/// backend.
pub type ClassifierPair<B> = (
    Box<dyn ImageClassifier<B>>,
    Box<dyn ImageClassifier<<B as AutodiffBackend>::InnerBackend>>,
);

/// Type alias for model constructor.
pub type ModelConstructor<B> = Arc<
    dyn Fn(&Value, Option<&Path>, &<B as burn::tensor::backend::Backend>::Device) -> Result<ClassifierPair<B>>
        + Send
        + Sync,
>;

/// Registry for building classifiers by architecture name.
pub struct ModelRegistry<B: AutodiffBackend> {
    models: HashMap<String, ModelConstructor<B>>,
}

impl<B: AutodiffBackend> Default for ModelRegistry<B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: AutodiffBackend> fmt::Debug for ModelRegistry<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelRegistry")
            .field("models", &self.list())
            .finish()
    }
}

impl<B: AutodiffBackend> ModelRegistry<B> {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            models: HashMap::new(),
        }
    }

    /// Register a model constructor.
    pub fn register<F>(&mut self, name: &str, constructor: F)
    where
        F: Fn(&Value, Option<&Path>, &B::Device) -> Result<ClassifierPair<B>>
            + Send
            + Sync
            + 'static,
    {
        self.models.insert(name.to_string(), Arc::new(constructor));
    }

    /// Build a classifier by architecture name.
    ///
    /// # Arguments
    ///
    /// * `name` - Registered architecture name
    /// * `config` - Architecture config as JSON
    /// * `weights` - Weights file to load, or `None` for fresh parameters
    /// * `device` - The device to create the model on
    pub fn create(
        &self,
        name: &str,
        config: &Value,
        weights: Option<&Path>,
        device: &B::Device,
    ) -> Result<ClassifierPair<B>> {
        let constructor = self
            .models
            .get(name)
            .ok_or_else(|| ModelError::UnknownArchitecture(name.to_string()))?;
        constructor(config, weights, device)
    }

    /// List all registered architecture names, sorted.
    pub fn list(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.models.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    /// Check if an architecture is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.models.contains_key(name)
    }
}

/// Load weights if given, then split into the autodiff and inference
/// instances.
fn finish<B, M>(model: M, weights: Option<&Path>, device: &B::Device) -> Result<ClassifierPair<B>>
where
    B: AutodiffBackend,
    M: AutodiffModule<B> + ImageClassifier<B> + 'static,
    M::InnerModule: ImageClassifier<B::InnerBackend> + 'static,
{
    let model = match weights {
        Some(path) => load_weights::<B, M>(model, path, device)?,
        None => model,
    };
    let inference: Box<dyn ImageClassifier<B::InnerBackend>> = Box::new(model.valid());
    let explain: Box<dyn ImageClassifier<B>> = Box::new(model);
    Ok((explain, inference))
}

fn get_usize(config: &Value, key: &str) -> Result<usize> {
    config
        .get(key)
        .and_then(|v| v.as_u64())
        .map(|v| v as usize)
        .ok_or_else(|| ModelError::Metadata(format!("Missing or invalid '{}'", key)))
}

fn get_usize_or(config: &Value, key: &str, default: usize) -> usize {
    config
        .get(key)
        .and_then(|v| v.as_u64())
        .map(|v| v as usize)
        .unwrap_or(default)
}

fn get_f64_or(config: &Value, key: &str, default: f64) -> f64 {
    config
        .get(key)
        .and_then(|v| v.as_f64())
        .unwrap_or(default)
}

fn get_usize_list(config: &Value, key: &str) -> Result<Option<Vec<usize>>> {
    let Some(value) = config.get(key) else {
        return Ok(None);
    };
    let items = value
        .as_array()
        .ok_or_else(|| ModelError::Metadata(format!("'{}' must be an array", key)))?;
    items
        .iter()
        .map(|v| {
            v.as_u64()
                .filter(|&n| n > 0)
                .map(|n| n as usize)
                .ok_or_else(|| ModelError::Metadata(format!("'{}' must hold positive integers", key)))
        })
        .collect::<Result<Vec<_>>>()
        .map(Some)
}

/// Create a registry with all available architectures.
///
/// # Available Architectures
///
/// - `mobilenet_v2` - `num_classes` (default 1000), `width_multiplier`
///   (default 1.0), `bn_epsilon` (default 1e-3, or 1e-5 for `*.safetensors`
///   weights, which are imported from the PyTorch layouts)
/// - `convnet` - `num_classes` (required), `channels` (default
///   `[16, 32, 64]`), `in_channels` (default 3)
pub fn default_registry<B: AutodiffBackend>() -> ModelRegistry<B> {
    let mut registry = ModelRegistry::new();

    registry.register("mobilenet_v2", |config, weights, device| {
        let alpha = get_f64_or(config, "width_multiplier", 1.0) as f32;
        if !(alpha.is_finite() && alpha > 0.0) {
            return Err(ModelError::Metadata(format!(
                "width_multiplier must be positive, got {}",
                alpha
            )));
        }
        let imported = weights.is_some_and(is_safetensors);
        let default_epsilon = if imported {
            PYTORCH_BN_EPSILON
        } else {
            DEFAULT_BN_EPSILON
        };
        let epsilon = get_f64_or(config, "bn_epsilon", default_epsilon);
        if !(epsilon.is_finite() && epsilon > 0.0) {
            return Err(ModelError::Metadata(format!(
                "bn_epsilon must be positive, got {}",
                epsilon
            )));
        }
        let model_config = MobileNetV2Config::new(get_usize_or(config, "num_classes", 1000))
            .with_width_multiplier(alpha)
            .with_bn_epsilon(epsilon);

        match weights {
            Some(path) if imported => {
                finish(import_mobilenet_v2::<B>(&model_config, path, device)?, None, device)
            }
            _ => finish(model_config.init::<B>(device), weights, device),
        }
    });

    registry.register("convnet", |config, weights, device| {
        let mut model_config = ConvNetConfig::new(get_usize(config, "num_classes")?);
        model_config.in_channels = get_usize_or(config, "in_channels", 3);
        if let Some(channels) = get_usize_list(config, "channels")? {
            if channels.is_empty() {
                return Err(ModelError::Metadata("'channels' must not be empty".into()));
            }
            model_config = model_config.with_channels(channels);
        }

        finish(model_config.init::<B>(device), weights, device)
    });

    registry
}

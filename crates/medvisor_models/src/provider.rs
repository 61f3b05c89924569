//! Model Provider.
//!
//! Loads the configured checkpoint, or the ImageNet MobileNetV2 fallback,
//! and binds a [`TargetLayerSpec`] to it.
//!
//! Fallback weights are either a torchvision/timm `*.safetensors` state dict
//! (ImageNet mean/std input) or a burn checkpoint. A sidecar next to the
//! fallback weights, when present, supplies the architecture config, labels
//! and input spec.

use std::fmt;
use std::path::{Path, PathBuf};

use burn::tensor::backend::AutodiffBackend;
use medvisor_core::{InputSpec, ModelConfig};
use serde_json::json;

use crate::checkpoint::{sidecar_path, CheckpointMetadata};
use crate::error::{ModelError, Result};
use crate::import::is_safetensors;
use crate::labels::Labels;
use crate::layer::TargetLayerSpec;
use crate::registry::{default_registry, ClassifierPair, ModelRegistry};
use crate::traits::ImageClassifier;

/// Architecture used when no custom checkpoint is available.
pub const FALLBACK_ARCHITECTURE: &str = "mobilenet_v2";

/// Where a loaded model came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelSource {
    /// A custom checkpoint.
    Custom(PathBuf),
    /// The pretrained fallback classifier.
    Fallback(PathBuf),
    /// Built in-process.
    InMemory,
}

impl fmt::Display for ModelSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Custom(path) => write!(f, "custom checkpoint {}", path.display()),
            Self::Fallback(path) => write!(f, "fallback weights {}", path.display()),
            Self::InMemory => write!(f, "in-memory model"),
        }
    }
}

/// A loaded classifier with everything needed to run and explain it.
pub struct LoadedModel<B: AutodiffBackend> {
    explain: Box<dyn ImageClassifier<B>>,
    inference: Box<dyn ImageClassifier<B::InnerBackend>>,
    labels: Labels,
    input: InputSpec,
    target: TargetLayerSpec,
    source: ModelSource,
    device: B::Device,
}

impl<B: AutodiffBackend> fmt::Debug for LoadedModel<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadedModel")
            .field("architecture", &self.explain.architecture())
            .field("num_classes", &self.explain.num_classes())
            .field("input", &self.input)
            .field("target", &self.target)
            .field("source", &self.source)
            .finish()
    }
}

impl<B: AutodiffBackend> LoadedModel<B> {
    /// Assemble a loaded model from its parts.
    pub fn new(
        pair: ClassifierPair<B>,
        labels: Labels,
        input: InputSpec,
        target: TargetLayerSpec,
        source: ModelSource,
        device: B::Device,
    ) -> Self {
        let (explain, inference) = pair;
        Self {
            explain,
            inference,
            labels,
            input,
            target,
            source,
            device,
        }
    }

    /// The gradient-tracking instance, used for saliency.
    pub fn explain_model(&self) -> &dyn ImageClassifier<B> {
        self.explain.as_ref()
    }

    /// The inference instance, used for classification.
    pub fn inference_model(&self) -> &dyn ImageClassifier<B::InnerBackend> {
        self.inference.as_ref()
    }

    /// Class labels.
    pub fn labels(&self) -> &Labels {
        &self.labels
    }

    /// Input resolution and normalization.
    pub fn input_spec(&self) -> &InputSpec {
        &self.input
    }

    /// Saliency target layer spec bound to this model.
    pub fn target(&self) -> &TargetLayerSpec {
        &self.target
    }

    /// Where the model came from.
    pub fn source(&self) -> &ModelSource {
        &self.source
    }

    /// Device the model lives on.
    pub fn device(&self) -> &B::Device {
        &self.device
    }

    /// Layers that can be targeted.
    pub fn layer_names(&self) -> Vec<String> {
        self.explain.layer_names()
    }

    /// The layer the target spec resolves to on this model, if any.
    pub fn resolved_target(&self) -> Option<&str> {
        self.target.resolve(|name| self.explain.has_layer(name))
    }
}

/// Loads classifiers according to [`ModelConfig`].
#[derive(Debug)]
pub struct ModelProvider<B: AutodiffBackend> {
    registry: ModelRegistry<B>,
}

impl<B: AutodiffBackend> Default for ModelProvider<B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: AutodiffBackend> ModelProvider<B> {
    /// Provider over the default architecture registry.
    pub fn new() -> Self {
        Self::with_registry(default_registry())
    }

    /// Provider over a custom registry.
    pub fn with_registry(registry: ModelRegistry<B>) -> Self {
        Self { registry }
    }

    /// The architecture registry.
    pub fn registry(&self) -> &ModelRegistry<B> {
        &self.registry
    }

    /// Load a model, or `None` when neither the custom checkpoint nor the
    /// fallback can be loaded. The failure is logged.
    pub fn load(&self, config: &ModelConfig, device: &B::Device) -> Option<LoadedModel<B>> {
        match self.try_load(config, device) {
            Ok(model) => Some(model),
            Err(err) => {
                tracing::error!("No model available: {}", err);
                None
            }
        }
    }

    /// Load a model, reporting why it failed.
    pub fn try_load(&self, config: &ModelConfig, device: &B::Device) -> Result<LoadedModel<B>> {
        let model = match config.path.as_deref() {
            Some(path) if path.exists() => self.load_custom(config, path, device)?,
            Some(path) => {
                tracing::warn!(
                    "Model artifact {} not found, using {}",
                    path.display(),
                    FALLBACK_ARCHITECTURE
                );
                self.load_fallback(config, device)?
            }
            None => self.load_fallback(config, device)?,
        };

        tracing::info!(
            "Loaded {} ({} classes) from {}, target layer '{}'",
            model.explain.architecture(),
            model.explain.num_classes(),
            model.source,
            model.target.primary()
        );
        Ok(model)
    }

    fn load_custom(
        &self,
        config: &ModelConfig,
        path: &Path,
        device: &B::Device,
    ) -> Result<LoadedModel<B>> {
        let metadata = CheckpointMetadata::load(sidecar_path(path))?;
        check_input(&metadata.input)?;
        let pair = self.registry.create(
            &metadata.arch,
            &metadata.config_value()?,
            Some(path),
            device,
        )?;

        let labels = if metadata.labels.is_empty() {
            Labels::generic(pair.0.num_classes())
        } else {
            Labels::from_vec(metadata.labels.clone())
        };
        let default_layer = pair.0.default_target_layer();
        let primary = config
            .target_layer
            .clone()
            .or_else(|| metadata.target_layer.clone())
            .unwrap_or_else(|| default_layer.clone());
        let target = bind_target(primary, config, default_layer);

        Ok(LoadedModel::new(
            pair,
            labels,
            metadata.input,
            target,
            ModelSource::Custom(path.to_path_buf()),
            device.clone(),
        ))
    }

    fn load_fallback(&self, config: &ModelConfig, device: &B::Device) -> Result<LoadedModel<B>> {
        let weights = config.fallback_weights.as_path();
        if !weights.exists() {
            return Err(ModelError::NotFound(weights.to_path_buf()));
        }
        let sidecar = sidecar_path(weights);
        let metadata = if sidecar.exists() {
            Some(CheckpointMetadata::load(&sidecar)?)
        } else {
            None
        };
        let (arch_config, input) = match &metadata {
            Some(metadata) => {
                check_input(&metadata.input)?;
                (metadata.config_value()?, metadata.input)
            }
            None if is_safetensors(weights) => (json!({}), InputSpec::imagenet()),
            None => (json!({}), InputSpec::mobilenet()),
        };
        let pair = self
            .registry
            .create(FALLBACK_ARCHITECTURE, &arch_config, Some(weights), device)?;

        let labels = match metadata.as_ref().filter(|m| !m.labels.is_empty()) {
            Some(metadata) => Labels::from_vec(metadata.labels.clone()),
            None => match Labels::from_file(&config.fallback_labels) {
                Ok(labels) => labels,
                Err(err) => {
                    tracing::warn!("Using generic class labels: {}", err);
                    Labels::generic(pair.0.num_classes())
                }
            },
        };
        let default_layer = pair.0.default_target_layer();
        let primary = config
            .target_layer
            .clone()
            .unwrap_or_else(|| default_layer.clone());
        let target = bind_target(primary, config, default_layer);

        Ok(LoadedModel::new(
            pair,
            labels,
            input,
            target,
            ModelSource::Fallback(weights.to_path_buf()),
            device.clone(),
        ))
    }
}

fn check_input(input: &InputSpec) -> Result<()> {
    if input.is_valid() {
        Ok(())
    } else {
        Err(ModelError::Metadata(format!("unusable input spec {:?}", input)))
    }
}

fn bind_target(primary: String, config: &ModelConfig, default_layer: String) -> TargetLayerSpec {
    TargetLayerSpec::new(primary)
        .with_fallbacks(config.fallback_layers.iter().cloned())
        .with_fallbacks([default_layer])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::save_checkpoint;
    use crate::cnn::{ConvNetConfig, MobileNetV2Config};
    use crate::import::{WeightLayout, PYTORCH_BN_EPSILON};
    use burn_autodiff::Autodiff;
    use burn_ndarray::NdArray;
    use medvisor_core::Normalization;

    type TestBackend = Autodiff<NdArray>;

    fn write_convnet(dir: &Path, target_layer: Option<&str>) -> PathBuf {
        let device = Default::default();
        let config = ConvNetConfig::new(2).with_channels(vec![4, 8]);
        let model = config.init::<NdArray>(&device);
        let mut meta = CheckpointMetadata::new("convnet")
            .with_config(&config)
            .unwrap()
            .with_labels(["normal", "pneumonia"])
            .with_input(InputSpec::new(16, 16, Normalization::Unit));
        if let Some(layer) = target_layer {
            meta = meta.with_target_layer(layer);
        }
        let path = dir.join("xray.mpk");
        save_checkpoint::<NdArray, _>(&model, &meta, &path).unwrap();
        path
    }

    #[test]
    fn test_load_custom_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_convnet(dir.path(), None);
        let config = ModelConfig {
            path: Some(path.clone()),
            ..ModelConfig::default()
        };

        let provider = ModelProvider::<TestBackend>::new();
        let model = provider.load(&config, &Default::default()).unwrap();

        assert_eq!(model.source(), &ModelSource::Custom(path));
        assert_eq!(model.labels().get(1), "pneumonia");
        assert_eq!(model.input_spec().height, 16);
        assert_eq!(model.target().primary(), "block2");
        assert_eq!(model.resolved_target(), Some("block2"));
    }

    #[test]
    fn test_target_layer_precedence() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_convnet(dir.path(), Some("block1"));
        let provider = ModelProvider::<TestBackend>::new();
        let device = Default::default();

        let from_sidecar = ModelConfig {
            path: Some(path.clone()),
            ..ModelConfig::default()
        };
        let model = provider.load(&from_sidecar, &device).unwrap();
        assert_eq!(model.target().primary(), "block1");

        let from_config = ModelConfig {
            path: Some(path),
            target_layer: Some("conv5_block3_out".into()),
            fallback_layers: vec!["block1".into()],
            ..ModelConfig::default()
        };
        let model = provider.load(&from_config, &device).unwrap();
        assert_eq!(model.target().primary(), "conv5_block3_out");
        assert_eq!(
            model.target().candidates(),
            vec!["conv5_block3_out", "block1", "block2"]
        );
        assert_eq!(model.resolved_target(), Some("block1"));
    }

    #[test]
    fn test_fallback_model() {
        let dir = tempfile::tempdir().unwrap();
        let weights = dir.path().join("mobilenet.mpk");
        let device = Default::default();
        let model = MobileNetV2Config::imagenet().init::<NdArray>(&device);
        crate::checkpoint::save_weights::<NdArray, _>(&model, &weights).unwrap();

        let config = ModelConfig {
            path: Some(dir.path().join("missing.mpk")),
            fallback_weights: weights.clone(),
            fallback_labels: dir.path().join("missing_labels.txt"),
            ..ModelConfig::default()
        };
        let provider = ModelProvider::<TestBackend>::new();
        let loaded = provider.load(&config, &device).unwrap();

        assert_eq!(loaded.source(), &ModelSource::Fallback(weights));
        assert_eq!(loaded.target().primary(), "Conv_1");
        assert_eq!(loaded.input_spec(), &InputSpec::mobilenet());
        assert_eq!(loaded.labels().get(3), "class_3");
        assert_eq!(loaded.explain_model().num_classes(), 1000);
    }

    #[test]
    fn test_fallback_safetensors_with_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        let weights = dir.path().join("mobilenet_v2.safetensors");
        let device = Default::default();
        let arch = MobileNetV2Config::new(3)
            .with_width_multiplier(0.35)
            .with_bn_epsilon(PYTORCH_BN_EPSILON);
        let model = arch.init::<NdArray>(&device);
        std::fs::write(&weights, model.state_dict(WeightLayout::Torchvision)).unwrap();
        let input = InputSpec::new(32, 32, Normalization::imagenet());
        CheckpointMetadata::new(FALLBACK_ARCHITECTURE)
            .with_config(&arch)
            .unwrap()
            .with_labels(["tabby", "tiger cat", "persian cat"])
            .with_input(input)
            .save(sidecar_path(&weights))
            .unwrap();

        let config = ModelConfig {
            fallback_weights: weights.clone(),
            fallback_labels: dir.path().join("missing_labels.txt"),
            ..ModelConfig::default()
        };
        let provider = ModelProvider::<TestBackend>::new();
        let loaded = provider.load(&config, &device).unwrap();

        assert_eq!(loaded.source(), &ModelSource::Fallback(weights));
        assert_eq!(loaded.input_spec(), &input);
        assert_eq!(loaded.labels().get(1), "tiger cat");
        assert_eq!(loaded.explain_model().num_classes(), 3);
        assert_eq!(loaded.resolved_target(), Some("Conv_1"));
    }

    #[test]
    fn test_fallback_safetensors_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let weights = dir.path().join("mobilenetv2_100.safetensors");
        let device = Default::default();
        let model = MobileNetV2Config::imagenet().init::<NdArray>(&device);
        std::fs::write(&weights, model.state_dict(WeightLayout::Timm)).unwrap();

        let config = ModelConfig {
            fallback_weights: weights,
            fallback_labels: dir.path().join("missing_labels.txt"),
            ..ModelConfig::default()
        };
        let provider = ModelProvider::<TestBackend>::new();
        let loaded = provider.load(&config, &device).unwrap();

        assert_eq!(loaded.input_spec(), &InputSpec::imagenet());
        assert_eq!(loaded.explain_model().num_classes(), 1000);
        assert_eq!(loaded.labels().get(999), "class_999");
    }

    #[test]
    fn test_invalid_input_spec_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_convnet(dir.path(), None);
        let provider = ModelProvider::<TestBackend>::new();
        let device = Default::default();
        let config = ModelConfig {
            path: Some(path.clone()),
            ..ModelConfig::default()
        };

        let zero_std = Normalization::MeanStd {
            mean: [0.5; 3],
            std: [0.0; 3],
        };
        for input in [
            InputSpec::new(16, 16, zero_std),
            InputSpec::new(0, 16, Normalization::Unit),
        ] {
            let mut meta = CheckpointMetadata::load(sidecar_path(&path)).unwrap();
            meta.input = input;
            meta.save(sidecar_path(&path)).unwrap();

            assert!(provider.load(&config, &device).is_none());
            assert!(matches!(
                provider.try_load(&config, &device),
                Err(ModelError::Metadata(_))
            ));
        }
    }

    #[test]
    fn test_no_model_sentinel() {
        let dir = tempfile::tempdir().unwrap();
        let config = ModelConfig {
            fallback_weights: dir.path().join("absent.mpk"),
            ..ModelConfig::default()
        };
        let provider = ModelProvider::<TestBackend>::new();

        assert!(provider.load(&config, &Default::default()).is_none());
        assert!(matches!(
            provider.try_load(&config, &Default::default()),
            Err(ModelError::NotFound(_))
        ));
    }

    #[test]
    fn test_corrupt_checkpoint_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.mpk");
        std::fs::write(&path, b"not a record").unwrap();
        CheckpointMetadata::new("convnet")
            .with_config(&ConvNetConfig::new(2))
            .unwrap()
            .save(sidecar_path(&path))
            .unwrap();

        let config = ModelConfig {
            path: Some(path),
            ..ModelConfig::default()
        };
        let provider = ModelProvider::<TestBackend>::new();
        assert!(provider.load(&config, &Default::default()).is_none());
    }
}

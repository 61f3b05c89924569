//! Checkpoint I/O.
//!
//! A checkpoint is a burn named-MessagePack record (`model.mpk`) plus a JSON
//! sidecar (`model.json`) describing how to rebuild the module the record
//! belongs to:
//!
//! ```json
//! {
//!   "arch": "convnet",
//!   "config_json": "{\"num_classes\":2,\"channels\":[8,16]}",
//!   "labels": ["normal", "pneumonia"],
//!   "input": { "height": 64, "width": 64, "normalization": { "mode": "unit" } },
//!   "target_layer": "block2"
//! }
//! ```

use std::path::{Path, PathBuf};

use burn::module::Module;
use burn::prelude::*;
use burn::record::{FullPrecisionSettings, NamedMpkFileRecorder, Recorder};
use medvisor_core::InputSpec;
use serde::{Deserialize, Serialize};

use crate::error::{ModelError, Result};

/// Sidecar metadata stored next to a weights file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    /// Registered architecture name.
    pub arch: String,
    /// Architecture config as JSON.
    #[serde(default)]
    pub config_json: String,
    /// Class labels, indexed by class id.
    #[serde(default)]
    pub labels: Vec<String>,
    /// Input resolution and normalization.
    #[serde(default)]
    pub input: InputSpec,
    /// Preferred saliency target layer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_layer: Option<String>,
}

impl CheckpointMetadata {
    /// Create new metadata for an architecture.
    pub fn new(arch: impl Into<String>) -> Self {
        Self {
            arch: arch.into(),
            config_json: String::new(),
            labels: Vec::new(),
            input: InputSpec::default(),
            target_layer: None,
        }
    }

    /// Set the architecture config.
    pub fn with_config<C: Serialize>(mut self, config: &C) -> Result<Self> {
        self.config_json = serde_json::to_string(config)?;
        Ok(self)
    }

    /// Set the labels.
    #[must_use]
    pub fn with_labels<I, S>(mut self, labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.labels = labels.into_iter().map(Into::into).collect();
        self
    }

    /// Set the input spec.
    #[must_use]
    pub fn with_input(mut self, input: InputSpec) -> Self {
        self.input = input;
        self
    }

    /// Set the preferred target layer.
    #[must_use]
    pub fn with_target_layer(mut self, layer: impl Into<String>) -> Self {
        self.target_layer = Some(layer.into());
        self
    }

    /// Architecture config parsed as JSON; `{}` when unset.
    pub fn config_value(&self) -> Result<serde_json::Value> {
        if self.config_json.trim().is_empty() {
            return Ok(serde_json::Value::Object(Default::default()));
        }
        Ok(serde_json::from_str(&self.config_json)?)
    }

    /// Save metadata to a JSON file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json).map_err(|e| ModelError::Save(e.to_string()))?;
        Ok(())
    }

    /// Load metadata from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ModelError::NotFound(path.to_path_buf()));
        }
        let json = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }
}

/// Sidecar path for a weights file: same stem, `.json` extension.
pub fn sidecar_path(weights: impl AsRef<Path>) -> PathBuf {
    weights.as_ref().with_extension("json")
}

/// Write a module's parameters to `path`.
pub fn save_weights<B, M>(model: &M, path: impl AsRef<Path>) -> Result<()>
where
    B: Backend,
    M: Module<B>,
{
    let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
    recorder
        .record(model.clone().into_record(), path.as_ref().to_path_buf())
        .map_err(|e| ModelError::Save(e.to_string()))
}

/// Load parameters from `path` into `model`.
pub fn load_weights<B, M>(model: M, path: impl AsRef<Path>, device: &B::Device) -> Result<M>
where
    B: Backend,
    M: Module<B>,
{
    let path = path.as_ref();
    if !path.exists() {
        return Err(ModelError::NotFound(path.to_path_buf()));
    }
    let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
    let record = recorder
        .load(path.to_path_buf(), device)
        .map_err(|e| ModelError::Load(e.to_string()))?;
    Ok(model.load_record(record))
}

/// Save weights to `path` and metadata to its sidecar.
pub fn save_checkpoint<B, M>(
    model: &M,
    metadata: &CheckpointMetadata,
    path: impl AsRef<Path>,
) -> Result<()>
where
    B: Backend,
    M: Module<B>,
{
    let path = path.as_ref();
    save_weights::<B, M>(model, path)?;
    metadata.save(sidecar_path(path))?;
    tracing::info!("Saved {} checkpoint to {}", metadata.arch, path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cnn::ConvNetConfig;
    use crate::traits::ImageClassifier;
    use burn_ndarray::NdArray;
    use medvisor_core::Normalization;

    type TestBackend = NdArray;

    #[test]
    fn test_metadata_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.json");
        let meta = CheckpointMetadata::new("convnet")
            .with_config(&ConvNetConfig::new(2))
            .unwrap()
            .with_labels(["normal", "pneumonia"])
            .with_input(InputSpec::new(32, 32, Normalization::Unit))
            .with_target_layer("block3");

        meta.save(&path).unwrap();
        let loaded = CheckpointMetadata::load(&path).unwrap();
        assert_eq!(loaded, meta);
        assert_eq!(loaded.config_value().unwrap()["num_classes"], 2);
    }

    #[test]
    fn test_minimal_sidecar_defaults() {
        let meta: CheckpointMetadata = serde_json::from_str(r#"{"arch":"mobilenet_v2"}"#).unwrap();
        assert!(meta.labels.is_empty());
        assert_eq!(meta.input, InputSpec::mobilenet());
        assert!(meta.target_layer.is_none());
        assert!(meta.config_value().unwrap().as_object().unwrap().is_empty());
    }

    #[test]
    fn test_sidecar_path() {
        assert_eq!(
            sidecar_path("/models/xray.mpk"),
            PathBuf::from("/models/xray.json")
        );
    }

    #[test]
    fn test_weights_roundtrip() {
        let device = Default::default();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("convnet.mpk");
        let config = ConvNetConfig::new(3).with_channels(vec![4, 8]);

        let model = config.init::<TestBackend>(&device);
        save_checkpoint::<TestBackend, _>(&model, &CheckpointMetadata::new("convnet"), &path)
            .unwrap();
        assert!(sidecar_path(&path).exists());

        let fresh = config.init::<TestBackend>(&device);
        let loaded = load_weights::<TestBackend, _>(fresh, &path, &device).unwrap();

        let x = Tensor::<TestBackend, 4>::ones([1, 3, 8, 8], &device);
        let a: Vec<f32> = model.forward(x.clone()).into_data().to_vec().unwrap();
        let b: Vec<f32> = loaded.forward(x).into_data().to_vec().unwrap();
        for (a, b) in a.iter().zip(&b) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn test_load_missing_weights() {
        let device = Default::default();
        let model = ConvNetConfig::new(2).init::<TestBackend>(&device);
        let result = load_weights::<TestBackend, _>(model, "/nonexistent/model.mpk", &device);
        assert!(matches!(result, Err(ModelError::NotFound(_))));
    }
}

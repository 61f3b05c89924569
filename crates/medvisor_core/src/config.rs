//! Layered configuration.
//!
//! Uses `figment`: defaults -> optional TOML file -> `MEDVISOR_` environment.
//! Nested keys are split on `__`, e.g. `MEDVISOR_SALIENCY__MAX_PENDING=8`.

use std::path::{Path, PathBuf};

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::error::{DiagnosticError, Result};
use crate::result::Severity;

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MedvisorConfig {
    /// Model artifact locations and target layers.
    pub model: ModelConfig,
    /// Inference settings.
    pub inference: InferenceConfig,
    /// Input decoding limits.
    pub preprocess: PreprocessConfig,
    /// Saliency (Grad-CAM) settings.
    pub saliency: SaliencyConfig,
    /// Heatmap compositing.
    pub heatmap: HeatmapConfig,
    /// Severity placeholder policy.
    pub severity: SeverityConfig,
}

/// Where the classifier comes from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Custom checkpoint (`*.mpk` with a `<stem>.json` sidecar).
    pub path: Option<PathBuf>,
    /// Primary saliency target layer. Overrides the sidecar and the
    /// architecture default.
    pub target_layer: Option<String>,
    /// Layers tried in order when the primary is absent.
    pub fallback_layers: Vec<String>,
    /// ImageNet MobileNetV2 weights used when `path` is unset or missing:
    /// a torchvision or timm `*.safetensors` state dict, or a checkpoint
    /// written by `medvisor import`. An optional `<stem>.json` sidecar
    /// overrides the architecture config, labels and input spec.
    pub fallback_weights: PathBuf,
    /// ImageNet labels, one per line.
    pub fallback_labels: PathBuf,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            path: None,
            target_layer: None,
            fallback_layers: Vec::new(),
            fallback_weights: PathBuf::from("models/mobilenet_v2.safetensors"),
            fallback_labels: PathBuf::from("models/imagenet_labels.txt"),
        }
    }
}

/// Inference settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    /// Number of classes kept for the differential.
    pub top_k: usize,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self { top_k: 3 }
    }
}

/// Input decoding limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreprocessConfig {
    /// Uploads larger than this are rejected before decoding.
    pub max_bytes: usize,
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        Self {
            max_bytes: 20 * 1024 * 1024,
        }
    }
}

/// Saliency settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SaliencyConfig {
    /// Compute Grad-CAM at all.
    pub enabled: bool,
    /// Added to the map maximum before dividing.
    pub epsilon: f32,
    /// Queued-or-running saliency computations above which new requests
    /// skip saliency.
    pub max_pending: usize,
}

impl Default for SaliencyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            epsilon: 1e-10,
            max_pending: 4,
        }
    }
}

/// Heatmap compositing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeatmapConfig {
    /// Heatmap weight in the blend; the image gets `1 - intensity`.
    pub intensity: f32,
}

impl Default for HeatmapConfig {
    fn default() -> Self {
        Self { intensity: 0.5 }
    }
}

/// A label token that forces a severity regardless of confidence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeverityOverride {
    /// Lowercase substring matched against the lowercase raw label.
    pub token: String,
    /// Severity forced on a match.
    pub severity: Severity,
}

impl SeverityOverride {
    /// Create a new override rule.
    #[must_use]
    pub fn new(token: impl Into<String>, severity: Severity) -> Self {
        Self {
            token: token.into(),
            severity,
        }
    }
}

/// Confidence thresholds (percent, exclusive lower bounds) and overrides.
///
/// These are demo heuristics with no clinical basis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SeverityConfig {
    /// Confidence above this is `severe`.
    pub severe_above: f32,
    /// Confidence above this is `moderate`.
    pub moderate_above: f32,
    /// Confidence above this is `mild`; anything else is `normal`.
    pub mild_above: f32,
    /// Label token rules, first match wins.
    pub overrides: Vec<SeverityOverride>,
}

impl Default for SeverityConfig {
    fn default() -> Self {
        Self {
            severe_above: 80.0,
            moderate_above: 50.0,
            mild_above: 20.0,
            overrides: vec![
                SeverityOverride::new("normal", Severity::Normal),
                SeverityOverride::new("monitor", Severity::Normal),
            ],
        }
    }
}

impl MedvisorConfig {
    /// Check cross-field consistency.
    ///
    /// # Errors
    ///
    /// Returns [`DiagnosticError::Config`] describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.inference.top_k == 0 {
            return Err(DiagnosticError::Config(
                "inference.top_k must be at least 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.heatmap.intensity) {
            return Err(DiagnosticError::Config(format!(
                "heatmap.intensity must be in [0, 1], got {}",
                self.heatmap.intensity
            )));
        }
        if !(self.saliency.epsilon.is_finite() && self.saliency.epsilon > 0.0) {
            return Err(DiagnosticError::Config(format!(
                "saliency.epsilon must be positive, got {}",
                self.saliency.epsilon
            )));
        }
        let s = &self.severity;
        if !(s.mild_above < s.moderate_above && s.moderate_above < s.severe_above) {
            return Err(DiagnosticError::Config(format!(
                "severity thresholds must increase: mild {} < moderate {} < severe {}",
                s.mild_above, s.moderate_above, s.severe_above
            )));
        }
        if let Some(rule) = s.overrides.iter().find(|r| r.token.trim().is_empty()) {
            return Err(DiagnosticError::Config(format!(
                "severity override token must not be empty (severity {})",
                rule.severity
            )));
        }
        Ok(())
    }

    /// Render as TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| DiagnosticError::SerializationError(e.to_string()))
    }
}

/// Load configuration from layered sources.
///
/// Priority (highest to lowest):
/// 1. Environment variables (prefixed with `MEDVISOR_`)
/// 2. The TOML file at `path`, if given
/// 3. Built-in defaults
///
/// # Errors
///
/// Returns an error if `path` is given but missing, if a source fails to
/// parse, or if the merged configuration does not validate.
pub fn load_config(path: Option<&Path>) -> Result<MedvisorConfig> {
    let mut figment = Figment::from(Serialized::defaults(MedvisorConfig::default()));

    if let Some(path) = path {
        if !path.exists() {
            return Err(DiagnosticError::Config(format!(
                "config file not found: {}",
                path.display()
            )));
        }
        figment = figment.merge(Toml::file(path));
    }

    figment = figment.merge(Env::prefixed("MEDVISOR_").split("__"));

    let config: MedvisorConfig = figment.extract()?;
    config.validate()?;
    Ok(config)
}

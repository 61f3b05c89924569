//! Activation and gradient capture.
//!
//! burn's autodiff graph only keeps gradients for leaf tensors, so the
//! forward pass is split at the target layer and the activation is re-entered
//! as a fresh leaf before the remainder runs.

use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use medvisor_core::ScoreVector;
use medvisor_models::ImageClassifier;

use crate::error::{Result, SaliencyError};

/// Output of one split forward pass: the target-layer activation and the
/// class probabilities computed from it.
#[derive(Debug, Clone)]
pub struct LayerCapture<B: AutodiffBackend> {
    layer: String,
    activation: Tensor<B, 4>,
    scores: Tensor<B, 2>,
}

impl<B: AutodiffBackend> LayerCapture<B> {
    /// Run `model` on `input`, keeping the output of `layer` differentiable.
    ///
    /// Returns `None` if the model has no layer called `layer`.
    pub fn record(
        model: &dyn ImageClassifier<B>,
        layer: &str,
        input: Tensor<B, 4>,
    ) -> Option<Self> {
        let activation = model.forward_features(layer, input)?.detach().require_grad();
        let scores = model.forward_head(layer, activation.clone())?;
        Some(Self {
            layer: layer.to_string(),
            activation,
            scores,
        })
    }

    /// Captured layer name.
    pub fn layer(&self) -> &str {
        &self.layer
    }

    /// Activation dims `(N, C, H, W)`.
    pub fn dims(&self) -> [usize; 4] {
        self.activation.dims()
    }

    /// Activation without the autodiff graph.
    pub fn activation(&self) -> Tensor<B::InnerBackend, 4> {
        self.activation.clone().inner()
    }

    /// Class probabilities of this pass.
    pub fn scores(&self) -> Result<ScoreVector> {
        ScoreVector::from_tensor(self.scores.clone().inner())
            .map_err(|e| SaliencyError::Forward(e.to_string()))
    }

    /// Gradient of class `class_id`'s score with respect to the activation.
    pub fn gradient(&self, class_id: usize) -> Result<Tensor<B::InnerBackend, 4>> {
        let [batch, classes] = self.scores.dims();
        if batch == 0 || class_id >= classes {
            return Err(SaliencyError::Forward(format!(
                "class {} out of range for {} scores",
                class_id, classes
            )));
        }
        let target = self
            .scores
            .clone()
            .slice([0..1, class_id..class_id + 1])
            .sum();
        let grads = target.backward();
        self.activation
            .grad(&grads)
            .ok_or_else(|| SaliencyError::MissingGradient(self.layer.clone()))
    }
}

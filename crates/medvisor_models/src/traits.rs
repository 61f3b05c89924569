//! Classifier traits.
//!
//! [`ImageClassifier`] is what the rest of the pipeline sees: a forward pass
//! plus the ability to stop at, and resume from, a named internal layer.
//! Architectures built as a chain of stages implement [`StagedNetwork`] and
//! get [`ImageClassifier`] for free.

use std::fmt::Debug;
use std::ops::Range;

use burn::prelude::*;

/// A differentiable image classifier with addressable internal layers.
///
/// Module types are `Send` but not `Sync` (parameters use `OnceCell`), so
/// shared handles must be serialized by the owner.
pub trait ImageClassifier<B: Backend>: Send + Debug {
    /// Architecture name as stored in checkpoint metadata.
    fn architecture(&self) -> &'static str;

    /// Number of output classes.
    fn num_classes(&self) -> usize;

    /// Names of every layer whose output can be retrieved, in forward order.
    fn layer_names(&self) -> Vec<String>;

    /// Whether `name` is a retrievable layer.
    fn has_layer(&self, name: &str) -> bool {
        self.layer_names().iter().any(|n| n == name)
    }

    /// Layer Grad-CAM targets when nothing else is configured.
    fn default_target_layer(&self) -> String;

    /// Forward pass returning class probabilities `(N, n_classes)`.
    ///
    /// # Arguments
    ///
    /// * `x` - Input tensor of shape (batch, 3, height, width)
    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 2>;

    /// Run the network up to and including `layer`; `None` if the layer does
    /// not exist.
    fn forward_features(&self, layer: &str, x: Tensor<B, 4>) -> Option<Tensor<B, 4>>;

    /// Resume the forward pass from the output of `layer`, returning class
    /// probabilities. `None` if the layer does not exist or `activation` has
    /// the wrong channel count.
    fn forward_head(&self, layer: &str, activation: Tensor<B, 4>) -> Option<Tensor<B, 2>>;
}

/// A classifier expressed as numbered stages followed by a pooling head.
pub trait StagedNetwork<B: Backend>: Send + Debug {
    /// Architecture name.
    const ARCHITECTURE: &'static str;

    /// Number of output classes.
    fn output_classes(&self) -> usize;

    /// Number of stages.
    fn stage_count(&self) -> usize;

    /// Name of stage `index`.
    fn stage_name(&self, index: usize) -> String;

    /// Output channels of stage `index`.
    fn stage_out_channels(&self, index: usize) -> usize;

    /// Run stage `index`.
    fn stage(&self, index: usize, x: Tensor<B, 4>) -> Tensor<B, 4>;

    /// Pool and classify the final stage output.
    fn head(&self, x: Tensor<B, 4>) -> Tensor<B, 2>;

    /// Stage targeted by default.
    fn default_target_index(&self) -> usize;

    /// Index of the stage called `name`.
    fn stage_index(&self, name: &str) -> Option<usize> {
        (0..self.stage_count()).find(|&i| self.stage_name(i) == name)
    }

    /// Run the stages in `range` in order.
    fn run_stages(&self, x: Tensor<B, 4>, range: Range<usize>) -> Tensor<B, 4> {
        range.fold(x, |x, index| self.stage(index, x))
    }
}

impl<B: Backend, T: StagedNetwork<B>> ImageClassifier<B> for T {
    fn architecture(&self) -> &'static str {
        T::ARCHITECTURE
    }

    fn num_classes(&self) -> usize {
        self.output_classes()
    }

    fn layer_names(&self) -> Vec<String> {
        (0..self.stage_count()).map(|i| self.stage_name(i)).collect()
    }

    fn has_layer(&self, name: &str) -> bool {
        self.stage_index(name).is_some()
    }

    fn default_target_layer(&self) -> String {
        self.stage_name(self.default_target_index())
    }

    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 2> {
        let features = self.run_stages(x, 0..self.stage_count());
        self.head(features)
    }

    fn forward_features(&self, layer: &str, x: Tensor<B, 4>) -> Option<Tensor<B, 4>> {
        let index = self.stage_index(layer)?;
        Some(self.run_stages(x, 0..index + 1))
    }

    fn forward_head(&self, layer: &str, activation: Tensor<B, 4>) -> Option<Tensor<B, 2>> {
        let index = self.stage_index(layer)?;
        let [_, channels, _, _] = activation.dims();
        if channels != self.stage_out_channels(index) {
            tracing::debug!(
                "activation for '{}' has {} channels, expected {}",
                layer,
                channels,
                self.stage_out_channels(index)
            );
            return None;
        }
        let features = self.run_stages(activation, index + 1..self.stage_count());
        Some(self.head(features))
    }
}

//! The diagnostic engine: preprocessing, inference, saliency, compositing,
//! derivation and result assembly behind one shared context object.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};

use burn::tensor::backend::AutodiffBackend;
use medvisor_analysis::{Diagnosis, DiagnosisDeriver, SeverityPolicy};
use medvisor_core::{
    DiagnosticError, DiagnosticResult, InputTensor, MedvisorConfig, Result, SaliencyStatus,
    ScoreVector,
};
use medvisor_explain::{HeatmapCompositor, SaliencyGenerator, SaliencyMap};
use medvisor_models::{Labels, LoadedModel, ModelProvider, TargetLayerSpec};
use medvisor_transforms::Preprocessor;
use parking_lot::Mutex;

/// Model state shared by every request. Evaluation goes through `model`'s
/// lock; everything else is read without it.
struct Loaded<B: AutodiffBackend> {
    model: Mutex<LoadedModel<B>>,
    preprocessor: Preprocessor,
    labels: Labels,
    target: TargetLayerSpec,
    layers: Vec<String>,
    architecture: &'static str,
}

/// One reserved saliency computation. Dropping it frees the slot.
struct SaliencySlot<'a> {
    pending: &'a AtomicUsize,
}

impl<'a> SaliencySlot<'a> {
    fn try_acquire(pending: &'a AtomicUsize, max: usize) -> Option<Self> {
        pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < max).then_some(n + 1))
            .ok()
            .map(|_| Self { pending })
    }
}

impl Drop for SaliencySlot<'_> {
    fn drop(&mut self) {
        self.pending.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Runs the full pipeline for one image at a time, safely shared across
/// threads.
///
/// Built once; a missing model is recorded at construction and every
/// [`predict`](Self::predict) then fails with
/// [`DiagnosticError::ModelUnavailable`].
///
/// All forward and backward evaluations are serialized through one lock.
/// Saliency is additionally bounded by `saliency.max_pending`; requests over
/// the bound are classified without an overlay
/// ([`SaliencyStatus::Skipped`]).
pub struct DiagnosticEngine<B: AutodiffBackend> {
    loaded: Option<Loaded<B>>,
    saliency: SaliencyGenerator,
    saliency_enabled: bool,
    max_pending: usize,
    pending: AtomicUsize,
    compositor: HeatmapCompositor,
    deriver: DiagnosisDeriver,
}

impl<B: AutodiffBackend> fmt::Debug for DiagnosticEngine<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiagnosticEngine")
            .field("architecture", &self.loaded.as_ref().map(|l| l.architecture))
            .field("saliency_enabled", &self.saliency_enabled)
            .field("max_pending", &self.max_pending)
            .field("compositor", &self.compositor)
            .field("deriver", &self.deriver)
            .finish()
    }
}

impl<B: AutodiffBackend> DiagnosticEngine<B> {
    /// Build an engine around an already loaded model (or none).
    ///
    /// An invalid `config` leaves the engine without a model.
    pub fn new(config: &MedvisorConfig, model: Option<LoadedModel<B>>) -> Self {
        let model = match config.validate() {
            Ok(()) => model,
            Err(err) => {
                tracing::error!("Rejecting engine configuration: {}", err);
                None
            }
        };
        let loaded = model.map(|model| {
            let preprocessor =
                Preprocessor::new(*model.input_spec()).with_max_bytes(config.preprocess.max_bytes);
            Loaded {
                preprocessor,
                labels: model.labels().clone(),
                target: model.target().clone(),
                layers: model.layer_names(),
                architecture: model.explain_model().architecture(),
                model: Mutex::new(model),
            }
        });
        if loaded.is_none() {
            tracing::error!("Diagnostic engine started without a model; predictions will fail");
        }

        Self {
            loaded,
            saliency: SaliencyGenerator::from_config(&config.saliency),
            saliency_enabled: config.saliency.enabled,
            max_pending: config.saliency.max_pending,
            pending: AtomicUsize::new(0),
            compositor: HeatmapCompositor::from_config(&config.heatmap),
            deriver: DiagnosisDeriver::new(
                SeverityPolicy::from_config(&config.severity),
                config.inference.top_k,
            ),
        }
    }

    /// Load the model described by `config.model` and build an engine.
    pub fn from_config(config: &MedvisorConfig, device: &B::Device) -> Self {
        let model = ModelProvider::<B>::new().load(&config.model, device);
        Self::new(config, model)
    }

    /// Enable or disable saliency for every request.
    #[must_use]
    pub fn with_saliency(mut self, enabled: bool) -> Self {
        self.saliency_enabled = enabled;
        self
    }

    /// Whether a model is loaded.
    pub fn is_available(&self) -> bool {
        self.loaded.is_some()
    }

    /// Layers the loaded model exposes as saliency targets.
    pub fn layers(&self) -> Option<&[String]> {
        self.loaded.as_ref().map(|l| l.layers.as_slice())
    }

    /// Target layer spec bound to the loaded model.
    pub fn target(&self) -> Option<&TargetLayerSpec> {
        self.loaded.as_ref().map(|l| &l.target)
    }

    /// The layer saliency currently resolves to.
    pub fn resolved_target(&self) -> Option<String> {
        let loaded = self.loaded.as_ref()?;
        loaded
            .target
            .resolve(|name| loaded.layers.iter().any(|l| l == name))
            .map(String::from)
    }

    /// Architecture of the loaded model.
    pub fn architecture(&self) -> Option<&'static str> {
        self.loaded.as_ref().map(|l| l.architecture)
    }

    /// Saliency computations queued or running right now.
    pub fn pending_saliency(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    fn loaded(&self) -> Result<&Loaded<B>> {
        self.loaded
            .as_ref()
            .ok_or_else(|| DiagnosticError::ModelUnavailable("no model loaded".to_string()))
    }

    /// Decode and classify, returning the full score vector.
    pub fn classify(&self, bytes: &[u8]) -> Result<ScoreVector> {
        let loaded = self.loaded()?;
        let input = loaded.preprocessor.decode_and_normalize(bytes)?;
        self.forward(loaded, &input)
    }

    /// Run the full pipeline on one encoded image.
    ///
    /// `principal` is copied into the result untouched.
    ///
    /// # Errors
    ///
    /// [`DiagnosticError::ModelUnavailable`] when no model is loaded and
    /// [`DiagnosticError::InvalidImage`] when `bytes` cannot be decoded.
    /// Saliency failures never surface here.
    pub fn predict(&self, bytes: &[u8], principal: Option<String>) -> Result<DiagnosticResult> {
        let loaded = self.loaded()?;
        let input = loaded.preprocessor.decode_and_normalize(bytes)?;

        let slot = if self.saliency_enabled {
            let slot = SaliencySlot::try_acquire(&self.pending, self.max_pending);
            if slot.is_none() {
                tracing::warn!(
                    "{} saliency computations pending, skipping saliency",
                    self.max_pending
                );
            }
            slot
        } else {
            None
        };

        let scores = self.forward(loaded, &input)?;
        let diagnosis = self
            .deriver
            .derive(&scores, |id| loaded.labels.get(id))
            .ok_or_else(|| DiagnosticError::Inference("model returned no scores".to_string()))?;

        let (map, status) = match slot {
            Some(slot) => {
                let map = self.saliency_map(loaded, &input);
                drop(slot);
                let status = if map.is_some() {
                    SaliencyStatus::Produced
                } else {
                    SaliencyStatus::Unavailable
                };
                (map, status)
            }
            None => (None, SaliencyStatus::Skipped),
        };

        let result = self.assemble(diagnosis, map.as_ref(), &input, status, principal);
        tracing::info!(
            "Predicted '{}' ({:.2}%, {}), saliency {:?}",
            result.predicted_class(),
            result.confidence(),
            result.severity(),
            result.saliency_status()
        );
        Ok(result)
    }

    fn forward(&self, loaded: &Loaded<B>, input: &InputTensor) -> Result<ScoreVector> {
        let model = loaded.model.lock();
        let probs = catch_unwind(AssertUnwindSafe(|| {
            let x = input.to_tensor::<B::InnerBackend>(model.device());
            model.inference_model().forward(x)
        }))
        .map_err(|_| DiagnosticError::Inference("forward pass panicked".to_string()))?;
        drop(model);

        ScoreVector::from_tensor(probs)
    }

    fn saliency_map(&self, loaded: &Loaded<B>, input: &InputTensor) -> Option<SaliencyMap> {
        let model = loaded.model.lock();
        self.saliency
            .compute(model.explain_model(), model.target(), input, model.device())
    }

    fn assemble(
        &self,
        diagnosis: Diagnosis,
        map: Option<&SaliencyMap>,
        input: &InputTensor,
        status: SaliencyStatus,
        principal: Option<String>,
    ) -> DiagnosticResult {
        let overlay = self.compositor.compose(map, input.image());
        DiagnosticResult::new(
            diagnosis.top,
            diagnosis.severity,
            diagnosis.differential,
            overlay,
            status,
            principal,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_bound() {
        let pending = AtomicUsize::new(0);
        let a = SaliencySlot::try_acquire(&pending, 2);
        let b = SaliencySlot::try_acquire(&pending, 2);
        assert!(a.is_some() && b.is_some());
        assert!(SaliencySlot::try_acquire(&pending, 2).is_none());
        assert_eq!(pending.load(Ordering::Acquire), 2);

        drop(a);
        assert_eq!(pending.load(Ordering::Acquire), 1);
        assert!(SaliencySlot::try_acquire(&pending, 2).is_some());
        drop(b);
        assert_eq!(pending.load(Ordering::Acquire), 0);
    }

    #[test]
    fn test_zero_bound_always_skips() {
        let pending = AtomicUsize::new(0);
        assert!(SaliencySlot::try_acquire(&pending, 0).is_none());
        assert_eq!(pending.load(Ordering::Acquire), 0);
    }
}

//! Grad-CAM (Selvaraju et al., 2017).

use std::panic::{catch_unwind, AssertUnwindSafe};

use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use medvisor_core::{InputTensor, SaliencyConfig};
use medvisor_models::{ImageClassifier, TargetLayerSpec};

use crate::activation::LayerCapture;
use crate::error::{Result, SaliencyError};

/// Added to the maximum before dividing.
pub const DEFAULT_EPSILON: f32 = 1e-10;

/// A 2D importance grid with values in `[0, 1]`, row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct SaliencyMap {
    width: usize,
    height: usize,
    values: Vec<f32>,
}

impl SaliencyMap {
    /// Create a map from row-major values.
    ///
    /// Returns `None` if the length does not match or any value lies
    /// outside `[0, 1]`.
    pub fn new(width: usize, height: usize, values: Vec<f32>) -> Option<Self> {
        let valid = values.len() == width * height
            && values.iter().all(|v| (0.0..=1.0).contains(v));
        valid.then_some(Self {
            width,
            height,
            values,
        })
    }

    /// Width in cells.
    pub fn width(&self) -> usize {
        self.width
    }

    /// Height in cells.
    pub fn height(&self) -> usize {
        self.height
    }

    /// Row-major values.
    pub fn values(&self) -> &[f32] {
        &self.values
    }

    /// Value at `(x, y)`.
    pub fn get(&self, x: usize, y: usize) -> Option<f32> {
        if x < self.width && y < self.height {
            Some(self.values[y * self.width + x])
        } else {
            None
        }
    }

    /// Largest value.
    pub fn max(&self) -> f32 {
        self.values.iter().copied().fold(0.0, f32::max)
    }

    /// Whether every cell is zero.
    pub fn is_zero(&self) -> bool {
        self.values.iter().all(|v| *v == 0.0)
    }
}

/// Compute a Grad-CAM map from a single-image activation and the gradient
/// of the target class score with respect to it.
///
/// Channel weights are the spatial mean of the gradient. The weighted
/// channel sum is clipped at zero and divided by `max + epsilon`, so an
/// all-zero map stays zero.
///
/// # Arguments
///
/// * `activation` - Target-layer output (1, channels, height, width)
/// * `gradient` - Gradient of the class score w.r.t. `activation`
/// * `epsilon` - Added to the maximum before dividing
pub fn grad_cam<B: Backend>(
    activation: Tensor<B, 4>,
    gradient: Tensor<B, 4>,
    epsilon: f32,
) -> Result<SaliencyMap> {
    let dims = activation.dims();
    let grad_dims = gradient.dims();
    if dims != grad_dims || dims[0] != 1 {
        return Err(SaliencyError::ShapeMismatch {
            activation: dims,
            gradient: grad_dims,
        });
    }
    let [_, _, height, width] = dims;

    // (1, C, H, W) -> (1, C, 1, 1)
    let weights = gradient.mean_dim(3).mean_dim(2);
    // (1, C, H, W) -> (1, 1, H, W)
    let cam = (activation * weights).sum_dim(1).clamp_min(0.0);

    let raw: Vec<f32> = cam
        .into_data()
        .to_vec()
        .map_err(|e| SaliencyError::Forward(format!("{:?}", e)))?;
    if raw.iter().any(|v| !v.is_finite()) {
        return Err(SaliencyError::NonFinite);
    }

    let max = raw.iter().copied().fold(0.0f32, f32::max);
    let denom = max + epsilon;
    let values = raw.into_iter().map(|v| (v / denom).clamp(0.0, 1.0)).collect();

    SaliencyMap::new(width, height, values).ok_or(SaliencyError::NonFinite)
}

/// Produces saliency maps for the top predicted class.
///
/// Failures never propagate: [`SaliencyGenerator::compute`] logs them and
/// returns `None`.
#[derive(Debug, Clone, Copy)]
pub struct SaliencyGenerator {
    epsilon: f32,
}

impl Default for SaliencyGenerator {
    fn default() -> Self {
        Self::new(DEFAULT_EPSILON)
    }
}

impl SaliencyGenerator {
    /// Create a generator.
    pub fn new(epsilon: f32) -> Self {
        Self { epsilon }
    }

    /// Create from config.
    pub fn from_config(config: &SaliencyConfig) -> Self {
        Self::new(config.epsilon)
    }

    /// Normalization epsilon.
    pub fn epsilon(&self) -> f32 {
        self.epsilon
    }

    /// Saliency map for the arg-max class, or `None` on any failure.
    pub fn compute<B: AutodiffBackend>(
        &self,
        model: &dyn ImageClassifier<B>,
        spec: &TargetLayerSpec,
        input: &InputTensor,
        device: &B::Device,
    ) -> Option<SaliencyMap> {
        match self.try_compute(model, spec, input, device) {
            Ok(map) => Some(map),
            Err(err) => {
                tracing::warn!("Saliency unavailable: {}", err);
                None
            }
        }
    }

    /// Saliency map for the arg-max class, with the reason for failure.
    pub fn try_compute<B: AutodiffBackend>(
        &self,
        model: &dyn ImageClassifier<B>,
        spec: &TargetLayerSpec,
        input: &InputTensor,
        device: &B::Device,
    ) -> Result<SaliencyMap> {
        let layer = spec
            .resolve(|name| model.has_layer(name))
            .ok_or_else(|| SaliencyError::TargetLayerNotFound {
                tried: spec.candidates().into_iter().map(String::from).collect(),
            })?;
        if layer != spec.primary() {
            tracing::debug!(
                "Target layer '{}' not found, using fallback '{}'",
                spec.primary(),
                layer
            );
        } else {
            tracing::debug!("Target layer '{}' resolved", layer);
        }

        let epsilon = self.epsilon;
        catch_unwind(AssertUnwindSafe(|| {
            let x = input.to_tensor::<B>(device);
            let capture = LayerCapture::record(model, layer, x)
                .ok_or_else(|| SaliencyError::Forward(format!("layer '{}' vanished", layer)))?;
            let top = capture
                .scores()?
                .argmax()
                .ok_or_else(|| SaliencyError::Forward("empty score vector".into()))?;
            let gradient = capture.gradient(top.class_id)?;
            grad_cam(capture.activation(), gradient, epsilon)
        }))
        .map_err(|payload| SaliencyError::Panicked(panic_message(payload.as_ref())))?
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_autodiff::Autodiff;
    use burn_ndarray::NdArray;
    use image::RgbImage;
    use medvisor_core::{ImageShape, Normalization};
    use medvisor_models::{ConvNetConfig, StagedNetwork};
    use proptest::prelude::*;

    type TestBackend = NdArray;
    type ExplainBackend = Autodiff<NdArray>;

    /// One identity stage followed by a head that fails.
    #[derive(Debug)]
    struct BrokenHead;

    impl<B: Backend> StagedNetwork<B> for BrokenHead {
        const ARCHITECTURE: &'static str = "broken_head";

        fn output_classes(&self) -> usize {
            2
        }

        fn stage_count(&self) -> usize {
            1
        }

        fn stage_name(&self, _index: usize) -> String {
            "features".to_string()
        }

        fn stage_out_channels(&self, _index: usize) -> usize {
            3
        }

        fn stage(&self, _index: usize, x: Tensor<B, 4>) -> Tensor<B, 4> {
            x
        }

        fn head(&self, _x: Tensor<B, 4>) -> Tensor<B, 2> {
            panic!("classifier head failed")
        }

        fn default_target_index(&self) -> usize {
            0
        }
    }

    /// Scores that ignore the captured activation.
    #[derive(Debug)]
    struct ConstantHead;

    impl StagedNetwork<ExplainBackend> for ConstantHead {
        const ARCHITECTURE: &'static str = "constant_head";

        fn output_classes(&self) -> usize {
            2
        }

        fn stage_count(&self) -> usize {
            1
        }

        fn stage_name(&self, _index: usize) -> String {
            "features".to_string()
        }

        fn stage_out_channels(&self, _index: usize) -> usize {
            3
        }

        fn stage(&self, _index: usize, x: Tensor<ExplainBackend, 4>) -> Tensor<ExplainBackend, 4> {
            x
        }

        fn head(&self, x: Tensor<ExplainBackend, 4>) -> Tensor<ExplainBackend, 2> {
            let logits = Tensor::<ExplainBackend, 2>::from_floats([[2.0, 1.0]], &x.device());
            burn::tensor::activation::softmax(logits.require_grad(), 1)
        }

        fn default_target_index(&self) -> usize {
            0
        }
    }

    fn tensor(values: Vec<f32>, dims: [usize; 4]) -> Tensor<TestBackend, 4> {
        Tensor::<TestBackend, 1>::from_floats(values.as_slice(), &Default::default()).reshape(dims)
    }

    fn test_input(size: usize) -> InputTensor {
        let image = RgbImage::from_fn(size as u32, size as u32, |x, y| {
            image::Rgb([(x * 20) as u8, (y * 20) as u8, ((x + y) * 10) as u8])
        });
        let plane = size * size;
        let mut data = vec![0.0; 3 * plane];
        for (x, y, p) in image.enumerate_pixels() {
            for c in 0..3 {
                data[c * plane + y as usize * size + x as usize] =
                    Normalization::Symmetric.apply(c, p[c]);
            }
        }
        InputTensor::new(data, ImageShape::new(1, 3, size, size), (-1.0, 1.0), image).unwrap()
    }

    #[test]
    fn test_grad_cam_known_values() {
        // Two channels; channel 0 weighted +1, channel 1 weighted -1.
        let activation = tensor(vec![1.0, 2.0, 3.0, 4.0, 4.0, 0.0, 0.0, 0.0], [1, 2, 2, 2]);
        let gradient = tensor(vec![1.0; 4].into_iter().chain(vec![-1.0; 4]).collect(), [1, 2, 2, 2]);

        let map = grad_cam(activation, gradient, DEFAULT_EPSILON).unwrap();
        assert_eq!((map.width(), map.height()), (2, 2));
        // [1-4, 2, 3, 4] -> relu -> [0, 2, 3, 4] / 4
        let expected = [0.0, 0.5, 0.75, 1.0];
        for (v, e) in map.values().iter().zip(expected) {
            assert!((v - e).abs() < 1e-6);
        }
    }

    #[test]
    fn test_zero_gradient_gives_zero_map() {
        let activation = tensor(vec![0.5; 18], [1, 2, 3, 3]);
        let gradient = tensor(vec![0.0; 18], [1, 2, 3, 3]);

        let map = grad_cam(activation, gradient, DEFAULT_EPSILON).unwrap();
        assert!(map.is_zero());
        assert!(map.values().iter().all(|v| !v.is_nan()));
    }

    #[test]
    fn test_all_negative_clips_to_zero() {
        let activation = tensor(vec![1.0; 4], [1, 1, 2, 2]);
        let gradient = tensor(vec![-2.0; 4], [1, 1, 2, 2]);

        let map = grad_cam(activation, gradient, DEFAULT_EPSILON).unwrap();
        assert!(map.is_zero());
    }

    #[test]
    fn test_shape_mismatch() {
        let activation = tensor(vec![1.0; 8], [1, 2, 2, 2]);
        let gradient = tensor(vec![1.0; 4], [1, 1, 2, 2]);

        assert!(matches!(
            grad_cam(activation, gradient, DEFAULT_EPSILON),
            Err(SaliencyError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_non_finite_rejected() {
        let activation = tensor(vec![f32::INFINITY, 1.0, 1.0, 1.0], [1, 1, 2, 2]);
        let gradient = tensor(vec![1.0; 4], [1, 1, 2, 2]);

        assert_eq!(
            grad_cam(activation, gradient, DEFAULT_EPSILON),
            Err(SaliencyError::NonFinite)
        );
    }

    #[test]
    fn test_generator_on_convnet() {
        let device = Default::default();
        let model = ConvNetConfig::new(3)
            .with_channels(vec![4, 8])
            .init::<ExplainBackend>(&device);
        let model: &dyn ImageClassifier<ExplainBackend> = &model;
        let spec = TargetLayerSpec::new("block2");
        let input = test_input(16);
        let generator = SaliencyGenerator::default();

        let map = generator.compute(model, &spec, &input, &device).unwrap();
        assert_eq!((map.width(), map.height()), (8, 8));
        assert!(map.values().iter().all(|v| (0.0..=1.0).contains(v)));

        let again = generator.compute(model, &spec, &input, &device).unwrap();
        for (a, b) in map.values().iter().zip(again.values()) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn test_generator_uses_fallback() {
        let device = Default::default();
        let model = ConvNetConfig::new(2)
            .with_channels(vec![4, 8])
            .init::<ExplainBackend>(&device);
        let spec = TargetLayerSpec::new("conv5_block3_out").with_fallbacks(["block1"]);

        let map = SaliencyGenerator::default()
            .compute::<ExplainBackend>(&model, &spec, &test_input(16), &device)
            .unwrap();
        assert_eq!((map.width(), map.height()), (8, 8));
    }

    #[test]
    fn test_generator_unknown_layer() {
        let device = Default::default();
        let model = ConvNetConfig::new(2).init::<ExplainBackend>(&device);
        let spec = TargetLayerSpec::new("conv5_block3_out").with_fallbacks(["Conv_1"]);
        let generator = SaliencyGenerator::default();

        assert!(generator
            .compute::<ExplainBackend>(&model, &spec, &test_input(8), &device)
            .is_none());
        assert_eq!(
            generator.try_compute::<ExplainBackend>(&model, &spec, &test_input(8), &device),
            Err(SaliencyError::TargetLayerNotFound {
                tried: vec!["conv5_block3_out".into(), "Conv_1".into()]
            })
        );
    }

    #[test]
    fn test_generator_contains_head_panic() {
        let device = Default::default();
        let spec = TargetLayerSpec::new("features");
        let generator = SaliencyGenerator::default();

        assert!(generator
            .compute::<ExplainBackend>(&BrokenHead, &spec, &test_input(8), &device)
            .is_none());
        match generator.try_compute::<ExplainBackend>(&BrokenHead, &spec, &test_input(8), &device) {
            Err(SaliencyError::Panicked(message)) => {
                assert!(message.contains("classifier head failed"))
            }
            other => panic!("expected Panicked, got {:?}", other),
        }
    }

    #[test]
    fn test_generator_missing_gradient() {
        let device = Default::default();
        let spec = TargetLayerSpec::new("features");
        let generator = SaliencyGenerator::default();

        assert_eq!(
            generator.try_compute::<ExplainBackend>(&ConstantHead, &spec, &test_input(8), &device),
            Err(SaliencyError::MissingGradient("features".into()))
        );
        assert!(generator
            .compute::<ExplainBackend>(&ConstantHead, &spec, &test_input(8), &device)
            .is_none());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prop_map_in_unit_range(
            act in proptest::collection::vec(-10.0f32..10.0, 3 * 4 * 5),
            grad in proptest::collection::vec(-1.0f32..1.0, 3 * 4 * 5),
        ) {
            let map = grad_cam(tensor(act, [1, 3, 4, 5]), tensor(grad, [1, 3, 4, 5]), DEFAULT_EPSILON)
                .unwrap();
            prop_assert_eq!((map.width(), map.height()), (5, 4));
            prop_assert!(map.values().iter().all(|v| (0.0..=1.0).contains(v)));
            prop_assert!(map.max() <= 1.0);
        }
    }
}

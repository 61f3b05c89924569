//! MobileNetV2 (Sandler et al., 2018) with Keras layer naming.
//!
//! Addressable layers are `Conv1`, `expanded_conv`, `block_1` … `block_16`,
//! `Conv_1` (the final 1×1 convolution, before its batch norm) and
//! `out_relu`. Grad-CAM targets `Conv_1` by default.
//!
//! Convolutions are padded symmetrically, as in the PyTorch reference
//! models, so weights published for torchvision and timm load unchanged
//! (see [`crate::import`]).

use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig};
use burn::nn::{Linear, LinearConfig, PaddingConfig2d};
use burn::prelude::*;
use burn::tensor::activation::softmax;
use serde::{Deserialize, Serialize};

use super::conv_out_channels;
use crate::error::{ModelError, Result};
use crate::import::{BlockKeys, ConvBnKeys, WeightLayout, WeightSource};
use crate::norm::FrozenBatchNorm;
use crate::traits::StagedNetwork;

/// `(expansion, channels, repeats, first stride)` per stage group.
pub(crate) const INVERTED_RESIDUAL_SETTINGS: [(usize, usize, usize, usize); 7] = [
    (1, 16, 1, 1),
    (6, 24, 2, 2),
    (6, 32, 3, 2),
    (6, 64, 4, 2),
    (6, 96, 3, 1),
    (6, 160, 3, 2),
    (6, 320, 1, 1),
];

const STEM_CHANNELS: usize = 32;
const LAST_CHANNELS: usize = 1280;

/// Batch norm epsilon of the Keras reference model.
pub const DEFAULT_BN_EPSILON: f64 = 1e-3;

fn default_bn_epsilon() -> f64 {
    DEFAULT_BN_EPSILON
}

/// Round `value` to a multiple of `divisor`, never dropping more than 10%.
fn make_divisible(value: f32, divisor: usize) -> usize {
    let d = divisor as f32;
    let rounded = (((value + d / 2.0) / d).floor() * d).max(d) as usize;
    if (rounded as f32) < 0.9 * value {
        rounded + divisor
    } else {
        rounded
    }
}

fn relu6<B: Backend>(x: Tensor<B, 4>) -> Tensor<B, 4> {
    x.clamp(0.0, 6.0)
}

/// Configuration for MobileNetV2.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MobileNetV2Config {
    /// Number of output classes.
    pub num_classes: usize,
    /// Channel width multiplier (alpha).
    pub width_multiplier: f32,
    /// Batch norm variance epsilon.
    #[serde(default = "default_bn_epsilon")]
    pub bn_epsilon: f64,
}

impl Default for MobileNetV2Config {
    fn default() -> Self {
        Self::imagenet()
    }
}

impl MobileNetV2Config {
    /// Create a new config.
    pub fn new(num_classes: usize) -> Self {
        Self {
            num_classes,
            width_multiplier: 1.0,
            bn_epsilon: DEFAULT_BN_EPSILON,
        }
    }

    /// The ImageNet-1k classifier (alpha 1.0).
    pub fn imagenet() -> Self {
        Self::new(1000)
    }

    /// Set the width multiplier.
    #[must_use]
    pub fn with_width_multiplier(mut self, alpha: f32) -> Self {
        self.width_multiplier = alpha;
        self
    }

    /// Set the batch norm epsilon.
    #[must_use]
    pub fn with_bn_epsilon(mut self, epsilon: f64) -> Self {
        self.bn_epsilon = epsilon;
        self
    }

    /// Initialize the model.
    pub fn init<B: Backend>(&self, device: &B::Device) -> MobileNetV2<B> {
        MobileNetV2::new(self.clone(), device)
    }
}

/// Convolution, frozen batch norm and optional ReLU6.
#[derive(Module, Debug)]
pub struct ConvBnAct<B: Backend> {
    conv: Conv2d<B>,
    bn: FrozenBatchNorm<B>,
    activate: bool,
}

impl<B: Backend> ConvBnAct<B> {
    /// Create a new block.
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        stride: usize,
        groups: usize,
        activate: bool,
        device: &B::Device,
    ) -> Self {
        let padding = kernel_size / 2;
        let conv = Conv2dConfig::new([in_channels, out_channels], [kernel_size, kernel_size])
            .with_stride([stride, stride])
            .with_padding(PaddingConfig2d::Explicit(padding, padding))
            .with_groups(groups)
            .with_bias(false)
            .init(device);
        let bn = FrozenBatchNorm::new(out_channels, device);

        Self { conv, bn, activate }
    }

    /// Set the batch norm epsilon.
    #[must_use]
    pub fn with_bn_epsilon(mut self, epsilon: f64) -> Self {
        self.bn = self.bn.with_epsilon(epsilon);
        self
    }

    /// Output channels.
    pub fn out_channels(&self) -> usize {
        conv_out_channels(&self.conv)
    }

    fn import(self, source: &WeightSource<'_, B>, keys: &ConvBnKeys) -> Result<Self> {
        Ok(Self {
            conv: source.conv(self.conv, &keys.conv)?,
            bn: source.batch_norm(self.bn, &keys.bn)?,
            activate: self.activate,
        })
    }

    /// Forward pass.
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let out = self.bn.forward(self.conv.forward(x));
        if self.activate {
            relu6(out)
        } else {
            out
        }
    }
}

/// Inverted residual block: expand, depthwise, linear projection.
#[derive(Module, Debug)]
pub struct InvertedResidual<B: Backend> {
    expand: Option<ConvBnAct<B>>,
    depthwise: ConvBnAct<B>,
    project: ConvBnAct<B>,
    use_residual: bool,
}

impl<B: Backend> InvertedResidual<B> {
    /// Create a new block.
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        stride: usize,
        expansion: usize,
        device: &B::Device,
    ) -> Self {
        let hidden = in_channels * expansion;
        let expand = (expansion != 1)
            .then(|| ConvBnAct::new(in_channels, hidden, 1, 1, 1, true, device));
        let depthwise = ConvBnAct::new(hidden, hidden, 3, stride, hidden, true, device);
        let project = ConvBnAct::new(hidden, out_channels, 1, 1, 1, false, device);

        Self {
            expand,
            depthwise,
            project,
            use_residual: stride == 1 && in_channels == out_channels,
        }
    }

    /// Set the batch norm epsilon of every convolution.
    #[must_use]
    pub fn with_bn_epsilon(self, epsilon: f64) -> Self {
        Self {
            expand: self.expand.map(|expand| expand.with_bn_epsilon(epsilon)),
            depthwise: self.depthwise.with_bn_epsilon(epsilon),
            project: self.project.with_bn_epsilon(epsilon),
            use_residual: self.use_residual,
        }
    }

    /// Output channels.
    pub fn out_channels(&self) -> usize {
        self.project.out_channels()
    }

    fn import(self, source: &WeightSource<'_, B>, keys: &BlockKeys) -> Result<Self> {
        let expand = match (self.expand, &keys.expand) {
            (Some(expand), Some(expand_keys)) => Some(expand.import(source, expand_keys)?),
            (None, None) => None,
            _ => {
                return Err(ModelError::Metadata(format!(
                    "expansion layout of block '{}' does not match the model",
                    keys.depthwise.conv
                )))
            }
        };
        Ok(Self {
            expand,
            depthwise: self.depthwise.import(source, &keys.depthwise)?,
            project: self.project.import(source, &keys.project)?,
            use_residual: self.use_residual,
        })
    }

    /// Forward pass.
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let out = match &self.expand {
            Some(expand) => expand.forward(x.clone()),
            None => x.clone(),
        };
        let out = self.project.forward(self.depthwise.forward(out));
        if self.use_residual {
            out + x
        } else {
            out
        }
    }
}

/// MobileNetV2 classifier.
#[derive(Module, Debug)]
pub struct MobileNetV2<B: Backend> {
    stem: ConvBnAct<B>,
    blocks: Vec<InvertedResidual<B>>,
    last_conv: Conv2d<B>,
    last_bn: FrozenBatchNorm<B>,
    gap: AdaptiveAvgPool2d,
    classifier: Linear<B>,
    num_classes: usize,
}

impl<B: Backend> MobileNetV2<B> {
    /// Create a new MobileNetV2 model.
    pub fn new(config: MobileNetV2Config, device: &B::Device) -> Self {
        let alpha = config.width_multiplier;
        let epsilon = config.bn_epsilon;
        let stem_channels = make_divisible(STEM_CHANNELS as f32 * alpha, 8);
        let stem = ConvBnAct::new(3, stem_channels, 3, 2, 1, true, device).with_bn_epsilon(epsilon);

        let mut blocks = Vec::new();
        let mut in_channels = stem_channels;
        for (expansion, channels, repeats, stride) in INVERTED_RESIDUAL_SETTINGS {
            let out_channels = make_divisible(channels as f32 * alpha, 8);
            for i in 0..repeats {
                let stride = if i == 0 { stride } else { 1 };
                blocks.push(
                    InvertedResidual::new(in_channels, out_channels, stride, expansion, device)
                        .with_bn_epsilon(epsilon),
                );
                in_channels = out_channels;
            }
        }

        let last_channels = if alpha > 1.0 {
            make_divisible(LAST_CHANNELS as f32 * alpha, 8)
        } else {
            LAST_CHANNELS
        };
        let last_conv = Conv2dConfig::new([in_channels, last_channels], [1, 1])
            .with_bias(false)
            .init(device);
        let last_bn = FrozenBatchNorm::new(last_channels, device).with_epsilon(epsilon);

        let gap = AdaptiveAvgPool2dConfig::new([1, 1]).init();
        let classifier = LinearConfig::new(last_channels, config.num_classes).init(device);

        Self {
            stem,
            blocks,
            last_conv,
            last_bn,
            gap,
            classifier,
            num_classes: config.num_classes,
        }
    }
}

impl<B: Backend> MobileNetV2<B> {
    /// Replace every parameter with the tensor stored under its `layout`
    /// key. Shapes must match exactly.
    pub(crate) fn import_weights(
        self,
        source: &WeightSource<'_, B>,
        layout: WeightLayout,
    ) -> Result<Self> {
        let blocks = self
            .blocks
            .into_iter()
            .enumerate()
            .map(|(index, block)| block.import(source, &layout.block(index)))
            .collect::<Result<Vec<_>>>()?;
        let head = layout.head();

        Ok(Self {
            stem: self.stem.import(source, &layout.stem())?,
            blocks,
            last_conv: source.conv(self.last_conv, &head.conv)?,
            last_bn: source.batch_norm(self.last_bn, &head.bn)?,
            gap: self.gap,
            classifier: source.linear(self.classifier, layout.classifier())?,
            num_classes: self.num_classes,
        })
    }
}

impl<B: Backend> StagedNetwork<B> for MobileNetV2<B> {
    const ARCHITECTURE: &'static str = "mobilenet_v2";

    fn output_classes(&self) -> usize {
        self.num_classes
    }

    fn stage_count(&self) -> usize {
        self.blocks.len() + 3
    }

    fn stage_name(&self, index: usize) -> String {
        let n = self.blocks.len();
        match index {
            0 => "Conv1".to_string(),
            1 => "expanded_conv".to_string(),
            i if i <= n => format!("block_{}", i - 1),
            i if i == n + 1 => "Conv_1".to_string(),
            _ => "out_relu".to_string(),
        }
    }

    fn stage_out_channels(&self, index: usize) -> usize {
        let n = self.blocks.len();
        match index {
            0 => self.stem.out_channels(),
            i if i <= n => self.blocks[i - 1].out_channels(),
            _ => conv_out_channels(&self.last_conv),
        }
    }

    fn stage(&self, index: usize, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let n = self.blocks.len();
        match index {
            0 => self.stem.forward(x),
            i if i <= n => self.blocks[i - 1].forward(x),
            i if i == n + 1 => self.last_conv.forward(x),
            _ => relu6(self.last_bn.forward(x)),
        }
    }

    fn head(&self, x: Tensor<B, 4>) -> Tensor<B, 2> {
        let out = self.gap.forward(x);
        let [batch, channels, _, _] = out.dims();
        let logits = self.classifier.forward(out.reshape([batch, channels]));
        softmax(logits, 1)
    }

    fn default_target_index(&self) -> usize {
        self.blocks.len() + 1
    }
}

#[cfg(test)]
type NamedTensor = (String, Vec<usize>, Vec<u8>);

#[cfg(test)]
fn push_tensor<B: Backend, const D: usize>(
    out: &mut Vec<NamedTensor>,
    key: String,
    tensor: Tensor<B, D>,
) {
    let shape = tensor.dims().to_vec();
    let values: Vec<f32> = tensor.into_data().to_vec().unwrap();
    let bytes = values.iter().flat_map(|v| v.to_le_bytes()).collect();
    out.push((key, shape, bytes));
}

#[cfg(test)]
fn push_conv_bn<B: Backend>(
    out: &mut Vec<NamedTensor>,
    conv: &Conv2d<B>,
    bn: &FrozenBatchNorm<B>,
    keys: &ConvBnKeys,
) {
    push_tensor(out, format!("{}.weight", keys.conv), conv.weight.val());
    push_tensor(out, format!("{}.weight", keys.bn), bn.gamma.val());
    push_tensor(out, format!("{}.bias", keys.bn), bn.beta.val());
    push_tensor(out, format!("{}.running_mean", keys.bn), bn.running_mean.val());
    push_tensor(out, format!("{}.running_var", keys.bn), bn.running_var.val());
}

#[cfg(test)]
impl<B: Backend> MobileNetV2<B> {
    /// Serialize as a PyTorch-style safetensors state dict in `layout`.
    pub(crate) fn state_dict(&self, layout: WeightLayout) -> Vec<u8> {
        use safetensors::tensor::TensorView;
        use safetensors::Dtype;

        let mut tensors = Vec::new();
        push_conv_bn(&mut tensors, &self.stem.conv, &self.stem.bn, &layout.stem());
        for (index, block) in self.blocks.iter().enumerate() {
            let keys = layout.block(index);
            if let (Some(expand), Some(expand_keys)) = (&block.expand, &keys.expand) {
                push_conv_bn(&mut tensors, &expand.conv, &expand.bn, expand_keys);
            }
            push_conv_bn(&mut tensors, &block.depthwise.conv, &block.depthwise.bn, &keys.depthwise);
            push_conv_bn(&mut tensors, &block.project.conv, &block.project.bn, &keys.project);
        }
        push_conv_bn(&mut tensors, &self.last_conv, &self.last_bn, &layout.head());
        let classifier = layout.classifier();
        push_tensor(
            &mut tensors,
            format!("{classifier}.weight"),
            self.classifier.weight.val().transpose(),
        );
        if let Some(bias) = &self.classifier.bias {
            push_tensor(&mut tensors, format!("{classifier}.bias"), bias.val());
        }

        let counter = 0i64.to_le_bytes();
        let mut views: Vec<(String, TensorView<'_>)> = tensors
            .iter()
            .map(|(key, shape, bytes)| {
                (key.clone(), TensorView::new(Dtype::F32, shape.clone(), bytes).unwrap())
            })
            .collect();
        views.push((
            format!("{}.num_batches_tracked", layout.stem().bn),
            TensorView::new(Dtype::I64, vec![], &counter).unwrap(),
        ));
        safetensors::serialize(views, &None).unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::import::{import_mobilenet_v2, PYTORCH_BN_EPSILON};
    use crate::traits::ImageClassifier;
    use burn::module::Param;
    use burn::tensor::Distribution;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray;

    fn tiny_config() -> MobileNetV2Config {
        MobileNetV2Config::new(4)
            .with_width_multiplier(0.35)
            .with_bn_epsilon(PYTORCH_BN_EPSILON)
    }

    #[test]
    fn test_make_divisible() {
        assert_eq!(make_divisible(32.0, 8), 32);
        assert_eq!(make_divisible(32.0 * 0.35, 8), 16);
        assert_eq!(make_divisible(16.0 * 0.35, 8), 8);
        assert_eq!(make_divisible(1280.0 * 1.4, 8), 1792);
    }

    #[test]
    fn test_layer_names() {
        let device = Default::default();
        let model = MobileNetV2Config::new(4)
            .with_width_multiplier(0.35)
            .init::<TestBackend>(&device);

        let names = model.layer_names();
        assert_eq!(names.len(), 20);
        assert_eq!(names[0], "Conv1");
        assert_eq!(names[1], "expanded_conv");
        assert_eq!(names[2], "block_1");
        assert_eq!(names[17], "block_16");
        assert_eq!(names[18], "Conv_1");
        assert_eq!(names[19], "out_relu");
        assert_eq!(model.default_target_layer(), "Conv_1");
        assert_eq!(model.architecture(), "mobilenet_v2");
    }

    #[test]
    fn test_forward_split_matches_full() {
        let device = Default::default();
        let model = MobileNetV2Config::new(4)
            .with_width_multiplier(0.35)
            .init::<TestBackend>(&device);
        let x = Tensor::<TestBackend, 4>::random(
            [1, 3, 32, 32],
            burn::tensor::Distribution::Uniform(-1.0, 1.0),
            &device,
        );

        let full: Vec<f32> = model.forward(x.clone()).into_data().to_vec().unwrap();
        let act = model.forward_features("Conv_1", x).unwrap();
        assert_eq!(act.dims(), [1, 1280, 1, 1]);
        let split: Vec<f32> = model
            .forward_head("Conv_1", act)
            .unwrap()
            .into_data()
            .to_vec()
            .unwrap();

        assert_eq!(full.len(), 4);
        for (a, b) in full.iter().zip(&split) {
            assert!((a - b).abs() < 1e-6);
        }
        let sum: f32 = full.iter().sum();
        assert!((sum - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_bn_epsilon_config() {
        let legacy: MobileNetV2Config =
            serde_json::from_str(r#"{"num_classes":3,"width_multiplier":1.0}"#).unwrap();
        assert_eq!(legacy.bn_epsilon, DEFAULT_BN_EPSILON);

        let device = Default::default();
        let model = tiny_config().init::<TestBackend>(&device);
        assert_eq!(model.stem.bn.epsilon(), PYTORCH_BN_EPSILON);
        assert_eq!(model.last_bn.epsilon(), PYTORCH_BN_EPSILON);
        assert_eq!(model.blocks[5].project.bn.epsilon(), PYTORCH_BN_EPSILON);
    }

    #[test]
    fn test_import_state_dict_layouts() {
        let device = Default::default();
        let config = tiny_config();
        let mut original = config.init::<TestBackend>(&device);
        let [features] = original.last_bn.running_mean.val().dims();
        original.last_bn.running_mean = Param::from_tensor(Tensor::random(
            [features],
            Distribution::Uniform(-0.5, 0.5),
            &device,
        ));
        original.last_bn.beta = Param::from_tensor(Tensor::random(
            [features],
            Distribution::Uniform(-0.5, 0.5),
            &device,
        ));
        let x = Tensor::<TestBackend, 4>::random([1, 3, 32, 32], Distribution::Uniform(-1.0, 1.0), &device);
        let expected: Vec<f32> = original.forward(x.clone()).into_data().to_vec().unwrap();

        let dir = tempfile::tempdir().unwrap();
        for layout in [WeightLayout::Torchvision, WeightLayout::Timm] {
            let path = dir.path().join(format!("{layout}.safetensors"));
            std::fs::write(&path, original.state_dict(layout)).unwrap();

            let imported = import_mobilenet_v2::<TestBackend>(&config, &path, &device).unwrap();
            let actual: Vec<f32> = imported.forward(x.clone()).into_data().to_vec().unwrap();
            for (a, b) in expected.iter().zip(&actual) {
                assert!((a - b).abs() < 1e-5, "{layout}: {a} vs {b}");
            }
        }
    }

    #[test]
    fn test_import_rejects_mismatched_config() {
        let device = Default::default();
        let original = tiny_config().init::<TestBackend>(&device);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mobilenet.safetensors");
        std::fs::write(&path, original.state_dict(WeightLayout::Timm)).unwrap();

        let wider = MobileNetV2Config::new(5).with_width_multiplier(0.35);
        let result = import_mobilenet_v2::<TestBackend>(&wider, &path, &device);
        assert!(matches!(result, Err(ModelError::Metadata(_))));

        let missing = dir.path().join("absent.safetensors");
        let result = import_mobilenet_v2::<TestBackend>(&tiny_config(), &missing, &device);
        assert!(matches!(result, Err(ModelError::NotFound(_))));
    }
}

//! Import of published MobileNetV2 ImageNet weights.
//!
//! Reads a `*.safetensors` state dict in either of the two common PyTorch
//! layouts and copies it into a [`MobileNetV2`]:
//!
//! - **torchvision** `mobilenet_v2` (`features.0.0.weight`, ...,
//!   `classifier.1.weight`)
//! - **timm** `mobilenetv2_100` (`conv_stem.weight`, `blocks.1.0.conv_pw.weight`,
//!   ..., `classifier.weight`)
//!
//! Both are trained on RGB input normalized with the ImageNet mean/std
//! ([`InputSpec::imagenet`]) and batch norm epsilon [`PYTORCH_BN_EPSILON`].
//!
//! ```rust,ignore
//! let config = MobileNetV2Config::imagenet().with_bn_epsilon(PYTORCH_BN_EPSILON);
//! let model = import_mobilenet_v2::<NdArray>(&config, "models/mobilenet_v2.safetensors", &device)?;
//! ```
//!
//! [`InputSpec::imagenet`]: medvisor_core::InputSpec::imagenet

use std::fmt;
use std::path::Path;

use burn::module::Param;
use burn::nn::conv::Conv2d;
use burn::nn::Linear;
use burn::prelude::*;
use half::{bf16, f16};
use safetensors::{Dtype, SafeTensors};

use crate::cnn::mobilenet::INVERTED_RESIDUAL_SETTINGS;
use crate::cnn::{MobileNetV2, MobileNetV2Config};
use crate::error::{ModelError, Result};
use crate::norm::FrozenBatchNorm;

/// Batch norm epsilon used by PyTorch.
pub const PYTORCH_BN_EPSILON: f64 = 1e-5;

/// Key naming scheme of a MobileNetV2 state dict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeightLayout {
    /// `torchvision.models.mobilenet_v2`.
    Torchvision,
    /// `timm` `mobilenetv2_*`.
    Timm,
}

impl fmt::Display for WeightLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Torchvision => write!(f, "torchvision"),
            Self::Timm => write!(f, "timm"),
        }
    }
}

/// Keys of a convolution and the batch norm that follows it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ConvBnKeys {
    pub conv: String,
    pub bn: String,
}

impl ConvBnKeys {
    fn new(conv: impl Into<String>, bn: impl Into<String>) -> Self {
        Self {
            conv: conv.into(),
            bn: bn.into(),
        }
    }
}

/// Keys of one inverted residual block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct BlockKeys {
    pub expand: Option<ConvBnKeys>,
    pub depthwise: ConvBnKeys,
    pub project: ConvBnKeys,
}

/// `(stage, index within stage, has expansion)` of inverted residual block `index`.
fn block_position(index: usize) -> (usize, usize, bool) {
    let mut start = 0;
    for (stage, (expansion, _, repeats, _)) in INVERTED_RESIDUAL_SETTINGS.iter().enumerate() {
        if index < start + repeats {
            return (stage, index - start, *expansion != 1);
        }
        start += repeats;
    }
    (INVERTED_RESIDUAL_SETTINGS.len(), index - start, true)
}

fn block_count() -> usize {
    INVERTED_RESIDUAL_SETTINGS.iter().map(|(_, _, repeats, _)| repeats).sum()
}

impl WeightLayout {
    /// Recognize the layout from the tensor names of a state dict.
    pub fn detect<'a>(names: impl IntoIterator<Item = &'a str>) -> Option<Self> {
        names.into_iter().find_map(|name| {
            if name.starts_with("features.") {
                Some(Self::Torchvision)
            } else if name.starts_with("conv_stem.") {
                Some(Self::Timm)
            } else {
                None
            }
        })
    }

    pub(crate) fn stem(self) -> ConvBnKeys {
        match self {
            Self::Torchvision => ConvBnKeys::new("features.0.0", "features.0.1"),
            Self::Timm => ConvBnKeys::new("conv_stem", "bn1"),
        }
    }

    pub(crate) fn block(self, index: usize) -> BlockKeys {
        let (stage, position, expands) = block_position(index);
        match self {
            Self::Torchvision => {
                let p = format!("features.{}.conv", index + 1);
                if expands {
                    BlockKeys {
                        expand: Some(ConvBnKeys::new(format!("{p}.0.0"), format!("{p}.0.1"))),
                        depthwise: ConvBnKeys::new(format!("{p}.1.0"), format!("{p}.1.1")),
                        project: ConvBnKeys::new(format!("{p}.2"), format!("{p}.3")),
                    }
                } else {
                    BlockKeys {
                        expand: None,
                        depthwise: ConvBnKeys::new(format!("{p}.0.0"), format!("{p}.0.1")),
                        project: ConvBnKeys::new(format!("{p}.1"), format!("{p}.2")),
                    }
                }
            }
            Self::Timm => {
                let p = format!("blocks.{stage}.{position}");
                if expands {
                    BlockKeys {
                        expand: Some(ConvBnKeys::new(format!("{p}.conv_pw"), format!("{p}.bn1"))),
                        depthwise: ConvBnKeys::new(format!("{p}.conv_dw"), format!("{p}.bn2")),
                        project: ConvBnKeys::new(format!("{p}.conv_pwl"), format!("{p}.bn3")),
                    }
                } else {
                    BlockKeys {
                        expand: None,
                        depthwise: ConvBnKeys::new(format!("{p}.conv_dw"), format!("{p}.bn1")),
                        project: ConvBnKeys::new(format!("{p}.conv_pw"), format!("{p}.bn2")),
                    }
                }
            }
        }
    }

    pub(crate) fn head(self) -> ConvBnKeys {
        match self {
            Self::Torchvision => {
                let index = block_count() + 1;
                ConvBnKeys::new(format!("features.{index}.0"), format!("features.{index}.1"))
            }
            Self::Timm => ConvBnKeys::new("conv_head", "bn2"),
        }
    }

    pub(crate) fn classifier(self) -> &'static str {
        match self {
            Self::Torchvision => "classifier.1",
            Self::Timm => "classifier",
        }
    }
}

fn decode(dtype: Dtype, bytes: &[u8]) -> Option<Vec<f32>> {
    let values = match dtype {
        Dtype::F32 => bytes
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect(),
        Dtype::F16 => bytes
            .chunks_exact(2)
            .map(|b| f16::from_le_bytes([b[0], b[1]]).to_f32())
            .collect(),
        Dtype::BF16 => bytes
            .chunks_exact(2)
            .map(|b| bf16::from_le_bytes([b[0], b[1]]).to_f32())
            .collect(),
        Dtype::F64 => bytes
            .chunks_exact(8)
            .map(|b| f64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]) as f32)
            .collect(),
        _ => return None,
    };
    Some(values)
}

/// Named tensors read from a safetensors buffer.
pub(crate) struct WeightSource<'a, B: Backend> {
    tensors: SafeTensors<'a>,
    device: B::Device,
}

impl<'a, B: Backend> WeightSource<'a, B> {
    pub(crate) fn new(bytes: &'a [u8], device: &B::Device) -> Result<Self> {
        let tensors = SafeTensors::deserialize(bytes)
            .map_err(|e| ModelError::Load(format!("invalid safetensors file: {e}")))?;
        Ok(Self {
            tensors,
            device: device.clone(),
        })
    }

    pub(crate) fn layout(&self) -> Option<WeightLayout> {
        WeightLayout::detect(self.tensors.names().into_iter().map(String::as_str))
    }

    fn tensor<const D: usize>(&self, key: &str, dims: [usize; D]) -> Result<Tensor<B, D>> {
        let view = self
            .tensors
            .tensor(key)
            .map_err(|_| ModelError::Metadata(format!("missing tensor '{key}'")))?;
        let shape = view.shape().to_vec();
        if shape != dims {
            return Err(ModelError::Metadata(format!(
                "tensor '{key}' has shape {shape:?}, expected {dims:?}"
            )));
        }
        let values = decode(view.dtype(), view.data()).ok_or_else(|| {
            ModelError::Metadata(format!("tensor '{key}' has unsupported dtype {:?}", view.dtype()))
        })?;
        Ok(Tensor::from_data(TensorData::new(values, dims), &self.device))
    }

    pub(crate) fn conv(&self, mut conv: Conv2d<B>, key: &str) -> Result<Conv2d<B>> {
        let dims = conv.weight.val().dims();
        conv.weight = Param::from_tensor(self.tensor(&format!("{key}.weight"), dims)?);
        conv.bias = match conv.bias {
            Some(bias) => Some(Param::from_tensor(
                self.tensor(&format!("{key}.bias"), bias.val().dims())?,
            )),
            None => None,
        };
        Ok(conv)
    }

    pub(crate) fn batch_norm(
        &self,
        mut bn: FrozenBatchNorm<B>,
        key: &str,
    ) -> Result<FrozenBatchNorm<B>> {
        let dims = [bn.num_features()];
        bn.gamma = Param::from_tensor(self.tensor(&format!("{key}.weight"), dims)?);
        bn.beta = Param::from_tensor(self.tensor(&format!("{key}.bias"), dims)?);
        bn.running_mean = Param::from_tensor(self.tensor(&format!("{key}.running_mean"), dims)?);
        bn.running_var = Param::from_tensor(self.tensor(&format!("{key}.running_var"), dims)?);
        Ok(bn)
    }

    /// PyTorch stores linear weights as `[out, in]`; burn as `[in, out]`.
    pub(crate) fn linear(&self, mut linear: Linear<B>, key: &str) -> Result<Linear<B>> {
        let [d_input, d_output] = linear.weight.val().dims();
        let weight: Tensor<B, 2> = self.tensor(&format!("{key}.weight"), [d_output, d_input])?;
        linear.weight = Param::from_tensor(weight.transpose());
        linear.bias = match linear.bias {
            Some(_) => Some(Param::from_tensor(
                self.tensor(&format!("{key}.bias"), [d_output])?,
            )),
            None => None,
        };
        Ok(linear)
    }
}

/// Whether `path` names a safetensors file.
pub fn is_safetensors(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("safetensors"))
}

/// Build a MobileNetV2 from `config` and fill it from a torchvision or timm
/// safetensors state dict.
///
/// The file must match `config` exactly (width multiplier and class count);
/// any missing tensor or shape mismatch is an error.
pub fn import_mobilenet_v2<B: Backend>(
    config: &MobileNetV2Config,
    path: impl AsRef<Path>,
    device: &B::Device,
) -> Result<MobileNetV2<B>> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(ModelError::NotFound(path.to_path_buf()));
    }
    let bytes = std::fs::read(path)?;
    let source = WeightSource::<B>::new(&bytes, device)?;
    let layout = source.layout().ok_or_else(|| {
        ModelError::Metadata(format!(
            "{} is not a torchvision or timm MobileNetV2 state dict",
            path.display()
        ))
    })?;

    let model = config.init::<B>(device).import_weights(&source, layout)?;
    tracing::info!(
        "Imported {} MobileNetV2 weights ({} classes) from {}",
        layout,
        config.num_classes,
        path.display()
    );
    Ok(model)
}

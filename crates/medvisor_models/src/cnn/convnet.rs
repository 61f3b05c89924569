//! Plain convolutional classifier for small custom models.

use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig, MaxPool2d, MaxPool2dConfig};
use burn::nn::{Linear, LinearConfig, PaddingConfig2d, Relu};
use burn::prelude::*;
use burn::tensor::activation::softmax;
use serde::{Deserialize, Serialize};

use super::conv_out_channels;
use crate::norm::FrozenBatchNorm;
use crate::traits::StagedNetwork;

/// Configuration for ConvNet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConvNetConfig {
    /// Number of input channels.
    pub in_channels: usize,
    /// Number of output classes.
    pub num_classes: usize,
    /// Output channels of each block.
    pub channels: Vec<usize>,
}

impl ConvNetConfig {
    /// Create a new config with three blocks of 16, 32 and 64 channels.
    pub fn new(num_classes: usize) -> Self {
        Self {
            in_channels: 3,
            num_classes,
            channels: vec![16, 32, 64],
        }
    }

    /// Set block widths.
    #[must_use]
    pub fn with_channels(mut self, channels: Vec<usize>) -> Self {
        self.channels = channels;
        self
    }

    /// Initialize the model.
    pub fn init<B: Backend>(&self, device: &B::Device) -> ConvNet<B> {
        ConvNet::new(self.clone(), device)
    }
}

/// Conv 3x3, frozen batch norm, ReLU, optional 2x2 max pool.
#[derive(Module, Debug)]
pub struct ConvBlock<B: Backend> {
    conv: Conv2d<B>,
    bn: FrozenBatchNorm<B>,
    relu: Relu,
    pool: Option<MaxPool2d>,
}

impl<B: Backend> ConvBlock<B> {
    /// Create a new block.
    pub fn new(in_channels: usize, out_channels: usize, pool: bool, device: &B::Device) -> Self {
        let conv = Conv2dConfig::new([in_channels, out_channels], [3, 3])
            .with_padding(PaddingConfig2d::Explicit(1, 1))
            .with_bias(false)
            .init(device);
        let pool = pool.then(|| MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init());

        Self {
            conv,
            bn: FrozenBatchNorm::new(out_channels, device),
            relu: Relu::new(),
            pool,
        }
    }

    /// Forward pass.
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let out = self.relu.forward(self.bn.forward(self.conv.forward(x)));
        match &self.pool {
            Some(pool) => pool.forward(out),
            None => out,
        }
    }
}

/// Stack of [`ConvBlock`]s followed by global average pooling and a linear
/// classifier. Blocks are named `block1` … `blockN`.
#[derive(Module, Debug)]
pub struct ConvNet<B: Backend> {
    blocks: Vec<ConvBlock<B>>,
    gap: AdaptiveAvgPool2d,
    fc: Linear<B>,
    num_classes: usize,
}

impl<B: Backend> ConvNet<B> {
    /// Create a new ConvNet model.
    ///
    /// Every block but the last halves the spatial size.
    pub fn new(config: ConvNetConfig, device: &B::Device) -> Self {
        let depth = config.channels.len();
        let mut in_channels = config.in_channels;
        let mut blocks = Vec::with_capacity(depth);
        for (i, &out_channels) in config.channels.iter().enumerate() {
            blocks.push(ConvBlock::new(in_channels, out_channels, i + 1 < depth, device));
            in_channels = out_channels;
        }

        Self {
            blocks,
            gap: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            fc: LinearConfig::new(in_channels, config.num_classes).init(device),
            num_classes: config.num_classes,
        }
    }
}

impl<B: Backend> StagedNetwork<B> for ConvNet<B> {
    const ARCHITECTURE: &'static str = "convnet";

    fn output_classes(&self) -> usize {
        self.num_classes
    }

    fn stage_count(&self) -> usize {
        self.blocks.len()
    }

    fn stage_name(&self, index: usize) -> String {
        format!("block{}", index + 1)
    }

    fn stage_out_channels(&self, index: usize) -> usize {
        conv_out_channels(&self.blocks[index].conv)
    }

    fn stage(&self, index: usize, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.blocks[index].forward(x)
    }

    fn head(&self, x: Tensor<B, 4>) -> Tensor<B, 2> {
        let out = self.gap.forward(x);
        let [batch, channels, _, _] = out.dims();
        softmax(self.fc.forward(out.reshape([batch, channels])), 1)
    }

    fn default_target_index(&self) -> usize {
        self.blocks.len().saturating_sub(1)
    }
}

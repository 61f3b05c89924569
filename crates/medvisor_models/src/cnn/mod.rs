//! Convolutional image classifiers.

mod convnet;
pub(crate) mod mobilenet;

pub use convnet::{ConvBlock, ConvNet, ConvNetConfig};
pub use mobilenet::{
    ConvBnAct, InvertedResidual, MobileNetV2, MobileNetV2Config, DEFAULT_BN_EPSILON,
};

use burn::nn::conv::Conv2d;
use burn::prelude::*;

/// Output channels of a 2D convolution.
pub(crate) fn conv_out_channels<B: Backend>(conv: &Conv2d<B>) -> usize {
    let [out_channels, _, _, _] = conv.weight.val().dims();
    out_channels
}

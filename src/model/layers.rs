use burn::nn::conv::{Conv2d, Conv2dConfig, ConvTranspose2d, ConvTranspose2dConfig};
use burn::nn::{InstanceNorm, InstanceNormConfig, PaddingConfig2d};
use burn::prelude::*;
use burn::tensor::activation::relu;

/// Convolution followed by instance norm and ReLU.
///
/// The convolution has no bias since the norm removes any per-channel offset.
#[derive(Module, Debug)]
pub struct ConvNormRelu<B: Backend> {
    conv: Conv2d<B>,
    norm: InstanceNorm<B>,
}

impl<B: Backend> ConvNormRelu<B> {
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        kernel: usize,
        stride: usize,
        device: &B::Device,
    ) -> Self {
        Self {
            conv: conv(in_channels, out_channels, kernel, stride, false, device),
            norm: InstanceNormConfig::new(out_channels).init(device),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        relu(self.norm.forward(self.conv.forward(x)))
    }
}

/// Transposed convolution that doubles spatial size, then norm and ReLU.
#[derive(Module, Debug)]
pub struct UpNormRelu<B: Backend> {
    conv: ConvTranspose2d<B>,
    norm: InstanceNorm<B>,
}

impl<B: Backend> UpNormRelu<B> {
    pub fn new(in_channels: usize, out_channels: usize, device: &B::Device) -> Self {
        Self {
            conv: up_conv(in_channels, out_channels, false, device),
            norm: InstanceNormConfig::new(out_channels).init(device),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        relu(self.norm.forward(self.conv.forward(x)))
    }
}

/// Residual block: two 3x3 conv/norm stages with a skip connection.
#[derive(Module, Debug)]
pub struct ResnetBlock<B: Backend> {
    conv1: Conv2d<B>,
    norm1: InstanceNorm<B>,
    conv2: Conv2d<B>,
    norm2: InstanceNorm<B>,
}

impl<B: Backend> ResnetBlock<B> {
    pub fn new(channels: usize, device: &B::Device) -> Self {
        Self {
            conv1: conv(channels, channels, 3, 1, false, device),
            norm1: InstanceNormConfig::new(channels).init(device),
            conv2: conv(channels, channels, 3, 1, false, device),
            norm2: InstanceNormConfig::new(channels).init(device),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let h = relu(self.norm1.forward(self.conv1.forward(x.clone())));
        let h = self.norm2.forward(self.conv2.forward(h));
        x + h
    }
}

/// Same-padded convolution; `stride` 2 halves the spatial size.
pub fn conv<B: Backend>(
    in_channels: usize,
    out_channels: usize,
    kernel: usize,
    stride: usize,
    bias: bool,
    device: &B::Device,
) -> Conv2d<B> {
    let padding = kernel / 2;
    Conv2dConfig::new([in_channels, out_channels], [kernel, kernel])
        .with_stride([stride, stride])
        .with_padding(PaddingConfig2d::Explicit(padding, padding))
        .with_bias(bias)
        .init(device)
}

/// 4x4 stride-2 transposed convolution (exact 2x upsampling).
pub fn up_conv<B: Backend>(
    in_channels: usize,
    out_channels: usize,
    bias: bool,
    device: &B::Device,
) -> ConvTranspose2d<B> {
    ConvTranspose2dConfig::new([in_channels, out_channels], [4, 4])
        .with_stride([2, 2])
        .with_padding([1, 1])
        .with_bias(bias)
        .init(device)
}

/// Output size of a same-padded convolution.
pub fn conv_out(input: usize, kernel: usize, stride: usize) -> usize {
    let padding = kernel / 2;
    (input + 2 * padding - kernel) / stride + 1
}

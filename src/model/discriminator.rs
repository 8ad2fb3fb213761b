use crate::model::layers::conv;
use burn::nn::conv::Conv2d;
use burn::nn::{InstanceNorm, InstanceNormConfig};
use burn::prelude::*;
use burn::tensor::activation::leaky_relu;

/// Architecture of one discriminator in the registry.
#[derive(Config, Debug, Copy, PartialEq, Eq)]
pub enum DiscriminatorArch {
    /// PatchGAN with `n_layers` strided stages.
    Patch,
    /// 1x1 convolutions only, one logit per pixel.
    Pixel,
    /// Frozen random projector followed by a trainable PatchGAN head.
    Projected,
}

/// Configuration for one discriminator network.
#[derive(Config, Debug)]
pub struct DiscriminatorConfig {
    pub arch: DiscriminatorArch,
    pub input_channels: usize,
    #[config(default = 16)]
    pub ndf: usize,
    #[config(default = 3)]
    pub n_layers: usize,
    #[config(default = 32)]
    pub projector_channels: usize,
}

/// PatchGAN discriminator; returns one logit per patch.
#[derive(Module, Debug)]
pub struct PatchDiscriminator<B: Backend> {
    convs: Vec<Conv2d<B>>,
    norms: Vec<InstanceNorm<B>>,
    out: Conv2d<B>,
}

impl<B: Backend> PatchDiscriminator<B> {
    pub fn new(input_channels: usize, ndf: usize, n_layers: usize, device: &B::Device) -> Self {
        let n_layers = n_layers.max(1);
        let mut convs = Vec::with_capacity(n_layers + 1);
        let mut norms = Vec::with_capacity(n_layers);
        convs.push(conv(input_channels, ndf, 3, 2, true, device));

        let mut channels = ndf;
        for layer in 1..=n_layers {
            let next = ndf * (1 << layer.min(3));
            let stride = if layer < n_layers { 2 } else { 1 };
            convs.push(conv(channels, next, 3, stride, false, device));
            norms.push(InstanceNormConfig::new(next).init(device));
            channels = next;
        }
        let out = conv(channels, 1, 3, 1, true, device);

        Self { convs, norms, out }
    }

    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let mut x = leaky_relu(self.convs[0].forward(images), 0.2);
        for (conv, norm) in self.convs.iter().skip(1).zip(&self.norms) {
            x = leaky_relu(norm.forward(conv.forward(x)), 0.2);
        }
        flatten_logits(self.out.forward(x))
    }
}

/// Per-pixel discriminator built from 1x1 convolutions.
#[derive(Module, Debug)]
pub struct PixelDiscriminator<B: Backend> {
    conv1: Conv2d<B>,
    conv2: Conv2d<B>,
    norm: InstanceNorm<B>,
    out: Conv2d<B>,
}

impl<B: Backend> PixelDiscriminator<B> {
    pub fn new(input_channels: usize, ndf: usize, device: &B::Device) -> Self {
        Self {
            conv1: conv(input_channels, ndf, 1, 1, true, device),
            conv2: conv(ndf, ndf * 2, 1, 1, false, device),
            norm: InstanceNormConfig::new(ndf * 2).init(device),
            out: conv(ndf * 2, 1, 1, 1, false, device),
        }
    }

    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let x = leaky_relu(self.conv1.forward(images), 0.2);
        let x = leaky_relu(self.norm.forward(self.conv2.forward(x)), 0.2);
        flatten_logits(self.out.forward(x))
    }
}

/// Discriminator operating in the embedding space of a frozen projector.
///
/// The projector parameters never require gradients, so optimizers leave
/// them untouched and only the head trains.
#[derive(Module, Debug)]
pub struct ProjectedDiscriminator<B: Backend> {
    projector: Conv2d<B>,
    head: PatchDiscriminator<B>,
}

impl<B: Backend> ProjectedDiscriminator<B> {
    pub fn new(
        input_channels: usize,
        projector_channels: usize,
        ndf: usize,
        n_layers: usize,
        device: &B::Device,
    ) -> Self {
        let projector = conv(input_channels, projector_channels, 3, 1, true, device).no_grad();
        let head = PatchDiscriminator::new(projector_channels, ndf, n_layers, device);
        Self { projector, head }
    }

    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let features = leaky_relu(self.projector.forward(images), 0.2);
        self.head.forward(features)
    }
}

/// One registered discriminator; exactly one of the variants is populated.
#[derive(Module, Debug)]
pub struct Discriminator<B: Backend> {
    patch: Option<PatchDiscriminator<B>>,
    pixel: Option<PixelDiscriminator<B>>,
    projected: Option<ProjectedDiscriminator<B>>,
}

impl DiscriminatorConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> Discriminator<B> {
        let mut discriminator = Discriminator {
            patch: None,
            pixel: None,
            projected: None,
        };
        match self.arch {
            DiscriminatorArch::Patch => {
                discriminator.patch = Some(PatchDiscriminator::new(
                    self.input_channels,
                    self.ndf,
                    self.n_layers,
                    device,
                ));
            }
            DiscriminatorArch::Pixel => {
                discriminator.pixel =
                    Some(PixelDiscriminator::new(self.input_channels, self.ndf, device));
            }
            DiscriminatorArch::Projected => {
                discriminator.projected = Some(ProjectedDiscriminator::new(
                    self.input_channels,
                    self.projector_channels,
                    self.ndf,
                    self.n_layers,
                    device,
                ));
            }
        }
        discriminator
    }
}

impl<B: Backend> Discriminator<B> {
    /// Logits of shape `[batch, patches]`.
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        match (&self.patch, &self.pixel, &self.projected) {
            (Some(patch), _, _) => patch.forward(images),
            (_, Some(pixel), _) => pixel.forward(images),
            (_, _, Some(projected)) => projected.forward(images),
            _ => {
                let batch = images.dims()[0];
                Tensor::zeros([batch, 1], &images.device())
            }
        }
    }
}

fn flatten_logits<B: Backend>(logits: Tensor<B, 4>) -> Tensor<B, 2> {
    let [batch, channels, height, width] = logits.dims();
    logits.reshape([batch, channels * height * width])
}

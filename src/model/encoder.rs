use crate::model::layers::ConvNormRelu;
use burn::nn::pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig};
use burn::nn::{Linear, LinearConfig};
use burn::prelude::*;

/// Configuration for the multimodal latent encoder `E`.
#[derive(Config, Debug)]
pub struct EncoderConfig {
    pub input_channels: usize,
    /// Latent size; must match the generator's extra input channels.
    pub nz: usize,
    #[config(default = 16)]
    pub nef: usize,
    #[config(default = 3)]
    pub n_down: usize,
}

/// Maps a translated image back to the latent code that produced it.
#[derive(Module, Debug)]
pub struct MultimodalEncoder<B: Backend> {
    convs: Vec<ConvNormRelu<B>>,
    pool: AdaptiveAvgPool2d,
    fc: Linear<B>,
}

impl EncoderConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> MultimodalEncoder<B> {
        let mut convs = Vec::with_capacity(self.n_down + 1);
        convs.push(ConvNormRelu::new(self.input_channels, self.nef, 3, 1, device));
        let mut channels = self.nef;
        for _ in 0..self.n_down {
            let next = (channels * 2).min(self.nef * 8);
            convs.push(ConvNormRelu::new(channels, next, 3, 2, device));
            channels = next;
        }

        MultimodalEncoder {
            convs,
            pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            fc: LinearConfig::new(channels, self.nz).init(device),
        }
    }
}

impl<B: Backend> MultimodalEncoder<B> {
    /// Returns `[batch, nz]`.
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let mut x = images;
        for conv in &self.convs {
            x = conv.forward(x);
        }
        let [batch, channels, _, _] = x.dims();
        let pooled = self.pool.forward(x).reshape([batch, channels]);
        self.fc.forward(pooled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    #[test]
    fn encodes_to_latent_size() {
        let device = Default::default();
        let encoder = EncoderConfig::new(3, 5)
            .with_nef(4)
            .init::<NdArray<f32>>(&device);
        let z = encoder.forward(Tensor::zeros([2, 3, 8, 8], &device));
        assert_eq!(z.dims(), [2, 5]);
    }
}

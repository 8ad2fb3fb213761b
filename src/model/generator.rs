use crate::model::layers::{conv, ConvNormRelu, ResnetBlock, UpNormRelu};
use burn::nn::conv::Conv2d;
use burn::prelude::*;

/// Configuration for the ResNet-style translation generator.
#[derive(Config, Debug)]
pub struct GeneratorConfig {
    pub input_channels: usize,
    pub output_channels: usize,
    #[config(default = 16)]
    pub ngf: usize,
    #[config(default = 2)]
    pub n_blocks: usize,
}

/// Encoder / residual trunk / decoder generator.
///
/// Layers are numbered for feature extraction: `0` is the raw input, `1`
/// the stem, `2..=3` the downsampling stages, then one index per residual
/// block, the two upsampling stages and finally the output head.
#[derive(Module, Debug)]
pub struct Generator<B: Backend> {
    down: Vec<ConvNormRelu<B>>,
    blocks: Vec<ResnetBlock<B>>,
    up: Vec<UpNormRelu<B>>,
    head: Conv2d<B>,
}

impl GeneratorConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> Generator<B> {
        let ngf = self.ngf;
        let down = vec![
            ConvNormRelu::new(self.input_channels, ngf, 7, 1, device),
            ConvNormRelu::new(ngf, ngf * 2, 3, 2, device),
            ConvNormRelu::new(ngf * 2, ngf * 4, 3, 2, device),
        ];
        let blocks = (0..self.n_blocks)
            .map(|_| ResnetBlock::new(ngf * 4, device))
            .collect();
        let up = vec![
            UpNormRelu::new(ngf * 4, ngf * 2, device),
            UpNormRelu::new(ngf * 2, ngf, device),
        ];
        let head = conv(ngf, self.output_channels, 7, 1, true, device);

        Generator {
            down,
            blocks,
            up,
            head,
        }
    }

    /// Number of addressable layers, including the raw input.
    pub fn num_layers(&self) -> usize {
        1 + 3 + self.n_blocks + 2 + 1
    }

    /// Channel count of the feature map produced after `layer`.
    pub fn feature_channels(&self, layer: usize) -> Option<usize> {
        let ngf = self.ngf;
        let trunk_end = 3 + self.n_blocks;
        let channels = match layer {
            0 => self.input_channels,
            1 => ngf,
            2 => ngf * 2,
            3 => ngf * 4,
            l if l <= trunk_end => ngf * 4,
            l if l == trunk_end + 1 => ngf * 2,
            l if l == trunk_end + 2 => ngf,
            l if l == trunk_end + 3 => self.output_channels,
            _ => return None,
        };
        Some(channels)
    }
}

impl<B: Backend> Generator<B> {
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 4> {
        let mut x = images;
        for layer in 1..=self.last_layer() {
            x = self.run_layer(layer, x);
        }
        x
    }

    /// Intermediate feature maps for each requested layer, in request order.
    ///
    /// Stops as soon as the deepest requested layer has been computed.
    pub fn extract_features(&self, images: Tensor<B, 4>, layer_ids: &[usize]) -> Vec<Tensor<B, 4>> {
        let deepest = layer_ids.iter().copied().max().unwrap_or(0).min(self.last_layer());
        let mut collected: Vec<Option<Tensor<B, 4>>> = vec![None; layer_ids.len()];
        let mut x = images;
        for layer in 0..=deepest {
            if layer > 0 {
                x = self.run_layer(layer, x);
            }
            for (slot, &id) in collected.iter_mut().zip(layer_ids) {
                if id == layer {
                    *slot = Some(x.clone());
                }
            }
        }
        collected.into_iter().flatten().collect()
    }

    fn last_layer(&self) -> usize {
        self.down.len() + self.blocks.len() + self.up.len() + 1
    }

    fn run_layer(&self, layer: usize, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let down_end = self.down.len();
        let trunk_end = down_end + self.blocks.len();
        let up_end = trunk_end + self.up.len();
        match layer {
            l if l <= down_end => self.down[l - 1].forward(x),
            l if l <= trunk_end => self.blocks[l - down_end - 1].forward(x),
            l if l <= up_end => self.up[l - trunk_end - 1].forward(x),
            _ => self.head.forward(x).tanh(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type B = NdArray<f32>;

    #[test]
    fn forward_preserves_resolution() {
        let device = Default::default();
        let config = GeneratorConfig::new(3, 3).with_ngf(4).with_n_blocks(1);
        let generator = config.init::<B>(&device);
        let out = generator.forward(Tensor::zeros([2, 3, 8, 8], &device));
        assert_eq!(out.dims(), [2, 3, 8, 8]);
    }

    #[test]
    fn features_match_declared_channels() {
        let device = Default::default();
        let config = GeneratorConfig::new(3, 3).with_ngf(4).with_n_blocks(2);
        let generator = config.init::<B>(&device);
        let layers = [0, 1, 2, 3, 5];
        let feats = generator.extract_features(Tensor::ones([1, 3, 8, 8], &device), &layers);
        assert_eq!(feats.len(), layers.len());
        for (feat, &layer) in feats.iter().zip(&layers) {
            assert_eq!(Some(feat.dims()[1]), config.feature_channels(layer));
        }
        assert_eq!(feats[3].dims(), [1, 16, 2, 2]);
        assert_eq!(config.num_layers(), 9);
        assert_eq!(config.feature_channels(8), Some(3));
        assert_eq!(config.feature_channels(9), None);
    }
}

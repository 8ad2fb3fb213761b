use crate::model::layers::{conv, ConvNormRelu};
use burn::nn::conv::Conv2d;
use burn::nn::pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig};
use burn::nn::{Linear, LinearConfig};
use burn::prelude::*;

/// Configuration for the semantic networks: classifier `CLS` and segmenter `f_s`.
#[derive(Config, Debug)]
pub struct SemanticConfig {
    pub input_channels: usize,
    /// Number of image classes. A regression classifier uses a single output.
    #[config(default = 2)]
    pub num_classes: usize,
    /// Number of mask labels predicted by the segmenter.
    #[config(default = 2)]
    pub semantic_nc: usize,
    #[config(default = 16)]
    pub width: usize,
    #[config(default = false)]
    pub regression: bool,
}

/// Image-level classifier.
#[derive(Module, Debug)]
pub struct Classifier<B: Backend> {
    convs: Vec<ConvNormRelu<B>>,
    pool: AdaptiveAvgPool2d,
    fc: Linear<B>,
}

/// Per-pixel segmenter; keeps the input resolution.
#[derive(Module, Debug)]
pub struct Segmenter<B: Backend> {
    convs: Vec<ConvNormRelu<B>>,
    head: Conv2d<B>,
}

impl SemanticConfig {
    pub fn init_classifier<B: Backend>(&self, device: &B::Device) -> Classifier<B> {
        let width = self.width;
        let outputs = if self.regression { 1 } else { self.num_classes };
        Classifier {
            convs: vec![
                ConvNormRelu::new(self.input_channels, width, 3, 2, device),
                ConvNormRelu::new(width, width * 2, 3, 2, device),
            ],
            pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            fc: LinearConfig::new(width * 2, outputs).init(device),
        }
    }

    pub fn init_segmenter<B: Backend>(&self, device: &B::Device) -> Segmenter<B> {
        let width = self.width;
        Segmenter {
            convs: vec![
                ConvNormRelu::new(self.input_channels, width, 3, 1, device),
                ConvNormRelu::new(width, width, 3, 1, device),
            ],
            head: conv(width, self.semantic_nc, 1, 1, true, device),
        }
    }
}

impl<B: Backend> Classifier<B> {
    /// Class logits `[batch, classes]`.
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let mut x = images;
        for conv in &self.convs {
            x = conv.forward(x);
        }
        let [batch, channels, _, _] = x.dims();
        self.fc.forward(self.pool.forward(x).reshape([batch, channels]))
    }
}

impl<B: Backend> Segmenter<B> {
    /// Mask logits `[batch, labels, height, width]`.
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 4> {
        let mut x = images;
        for conv in &self.convs {
            x = conv.forward(x);
        }
        self.head.forward(x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type B = NdArray<f32>;

    #[test]
    fn output_shapes() {
        let device = Default::default();
        let config = SemanticConfig::new(3).with_num_classes(4).with_semantic_nc(3).with_width(4);
        let images = Tensor::<B, 4>::zeros([2, 3, 8, 8], &device);
        assert_eq!(config.init_classifier::<B>(&device).forward(images.clone()).dims(), [2, 4]);
        assert_eq!(
            config.init_segmenter::<B>(&device).forward(images.clone()).dims(),
            [2, 3, 8, 8]
        );
        let regression = config.with_regression(true).init_classifier::<B>(&device);
        assert_eq!(regression.forward(images).dims(), [2, 1]);
    }
}

pub mod discriminator;
pub mod encoder;
pub mod generator;
pub mod layers;
pub mod projector;
pub mod semantic;

use crate::error::{TrainError, TrainResult};
use burn::prelude::*;
use std::fmt;

pub use discriminator::{Discriminator, DiscriminatorArch, DiscriminatorConfig};
pub use encoder::{EncoderConfig, MultimodalEncoder};
pub use generator::{Generator, GeneratorConfig};
pub use projector::{PatchSampleConfig, PatchSampleF};
pub use semantic::{Classifier, Segmenter, SemanticConfig};

/// Architecture hyperparameters and the optional networks to build.
#[derive(Config, Debug)]
pub struct ModelConfig {
    #[config(default = 3)]
    pub input_nc: usize,
    #[config(default = 3)]
    pub output_nc: usize,
    #[config(default = 16)]
    pub ngf: usize,
    #[config(default = 2)]
    pub n_blocks: usize,
    #[config(default = 16)]
    pub ndf: usize,
    #[config(default = 3)]
    pub d_n_layers: usize,
    #[config(default = 32)]
    pub projector_channels: usize,
    #[config(default = 64)]
    pub netf_nc: usize,
    #[config(default = true)]
    pub netf_use_mlp: bool,
    /// Condition the generator on a random latent code and train `E`.
    #[config(default = false)]
    pub multimodal: bool,
    #[config(default = 8)]
    pub nz: usize,
    #[config(default = 16)]
    pub nef: usize,
    #[config(default = false)]
    pub semantic_cls: bool,
    #[config(default = false)]
    pub semantic_mask: bool,
    #[config(default = 2)]
    pub num_classes: usize,
    #[config(default = 2)]
    pub semantic_nc: usize,
    #[config(default = false)]
    pub cls_regression: bool,
    #[config(default = 16)]
    pub semantic_width: usize,
}

impl ModelConfig {
    pub fn generator_config(&self) -> GeneratorConfig {
        let latent = if self.multimodal { self.nz } else { 0 };
        GeneratorConfig::new(self.input_nc + latent, self.output_nc)
            .with_ngf(self.ngf)
            .with_n_blocks(self.n_blocks)
    }

    /// Projector sized for the generator layers NCE samples from.
    pub fn patch_sample_config(&self, nce_layers: &[usize]) -> TrainResult<PatchSampleConfig> {
        let generator = self.generator_config();
        let feature_channels = nce_layers
            .iter()
            .map(|&layer| {
                generator.feature_channels(layer).ok_or_else(|| {
                    TrainError::InvalidConfig(format!(
                        "NCE layer {layer} is out of range, generator has {} layers",
                        generator.num_layers()
                    ))
                })
            })
            .collect::<TrainResult<Vec<_>>>()?;
        Ok(PatchSampleConfig::new(feature_channels)
            .with_nc(self.netf_nc)
            .with_use_mlp(self.netf_use_mlp))
    }

    pub fn encoder_config(&self) -> EncoderConfig {
        EncoderConfig::new(self.output_nc, self.nz).with_nef(self.nef)
    }

    pub fn semantic_config(&self) -> SemanticConfig {
        SemanticConfig::new(self.input_nc)
            .with_num_classes(self.num_classes)
            .with_semantic_nc(self.semantic_nc)
            .with_width(self.semantic_width)
            .with_regression(self.cls_regression)
    }

    /// Build every network of the recipe, discriminators in registry order.
    pub fn init_networks<B: Backend>(
        &self,
        nce_layers: &[usize],
        discriminators: &[DiscriminatorConfig],
        device: &B::Device,
    ) -> TrainResult<Networks<B>> {
        let semantic = self.semantic_config();
        Ok(Networks {
            g_a: self.generator_config().init(device),
            f: self.patch_sample_config(nce_layers)?.init(device),
            e: self.multimodal.then(|| self.encoder_config().init(device)),
            discriminators: discriminators
                .iter()
                .map(|config| config.init(device))
                .collect(),
            cls: self.semantic_cls.then(|| semantic.init_classifier(device)),
            f_s: self.semantic_mask.then(|| semantic.init_segmenter(device)),
        })
    }
}

/// Every trainable network of one run.
#[derive(Module, Debug)]
pub struct Networks<B: Backend> {
    pub g_a: Generator<B>,
    pub f: PatchSampleF<B>,
    pub e: Option<MultimodalEncoder<B>>,
    pub discriminators: Vec<Discriminator<B>>,
    pub cls: Option<Classifier<B>>,
    pub f_s: Option<Segmenter<B>>,
}

impl<B: Backend> Networks<B> {
    pub fn contains(&self, id: NetworkId) -> bool {
        match id {
            NetworkId::GA | NetworkId::F => true,
            NetworkId::E => self.e.is_some(),
            NetworkId::D(idx) => idx < self.discriminators.len(),
            NetworkId::Cls => self.cls.is_some(),
            NetworkId::FS => self.f_s.is_some(),
        }
    }
}

/// Handle naming one network of [`Networks`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum NetworkId {
    GA,
    F,
    E,
    /// Discriminator by registry position.
    D(usize),
    Cls,
    FS,
}

impl fmt::Display for NetworkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkId::GA => write!(f, "G_A"),
            NetworkId::F => write!(f, "F"),
            NetworkId::E => write!(f, "E"),
            NetworkId::D(idx) => write!(f, "D[{idx}]"),
            NetworkId::Cls => write!(f, "CLS"),
            NetworkId::FS => write!(f, "f_s"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    #[test]
    fn optional_networks_follow_the_config() {
        let device = Default::default();
        let config = ModelConfig::new()
            .with_ngf(4)
            .with_multimodal(true)
            .with_nz(2)
            .with_semantic_mask(true);
        let discs = [DiscriminatorConfig::new(DiscriminatorArch::Pixel, 3).with_ndf(4)];
        let nets = config
            .init_networks::<NdArray<f32>>(&[0, 2], &discs, &device)
            .unwrap();
        assert!(nets.contains(NetworkId::E));
        assert!(nets.contains(NetworkId::FS));
        assert!(!nets.contains(NetworkId::Cls));
        assert!(nets.contains(NetworkId::D(0)));
        assert!(!nets.contains(NetworkId::D(1)));
        assert_eq!(config.generator_config().input_channels, 5);
    }

    #[test]
    fn out_of_range_nce_layer_is_rejected() {
        let config = ModelConfig::new();
        let err = config.patch_sample_config(&[0, 42]).unwrap_err();
        assert!(matches!(err, TrainError::InvalidConfig(_)));
    }
}

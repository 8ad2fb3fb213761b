use crate::error::{TrainError, TrainResult};
use crate::loss::{AdversarialLoss, ApaConfig, GanMode, LossConfig, Scalar};
use crate::model::{Discriminator, DiscriminatorArch, DiscriminatorConfig, ModelConfig};
use crate::training::context::{StepContext, TensorKey};
use burn::prelude::*;
use std::str::FromStr;

pub const D_TOTAL: &str = "D_tot";
pub const G_TOTAL: &str = "G_tot";

/// Discriminator flavours that can be listed in a training recipe.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DiscriminatorKind {
    Basic,
    NLayers,
    Pixel,
    ProjectedD,
    Temporal,
}

impl FromStr for DiscriminatorKind {
    type Err = TrainError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        match name {
            "basic" => Ok(Self::Basic),
            "n_layers" => Ok(Self::NLayers),
            "pixel" => Ok(Self::Pixel),
            "projected_d" => Ok(Self::ProjectedD),
            "temporal" => Ok(Self::Temporal),
            other => Err(TrainError::UnknownDiscriminator(other.to_string())),
        }
    }
}

impl DiscriminatorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Basic => "basic",
            Self::NLayers => "n_layers",
            Self::Pixel => "pixel",
            Self::ProjectedD => "projected_d",
            Self::Temporal => "temporal",
        }
    }

    /// Temporal and projected discriminators always train in projected mode.
    pub fn gan_mode(&self, configured: GanMode) -> GanMode {
        match self {
            Self::Temporal | Self::ProjectedD => GanMode::Projected,
            _ => configured,
        }
    }

    pub fn network_config(&self, model: &ModelConfig, temporal_frames: usize) -> DiscriminatorConfig {
        let (arch, channels, n_layers) = match self {
            Self::Basic => (DiscriminatorArch::Patch, model.output_nc, 3),
            Self::NLayers => (DiscriminatorArch::Patch, model.output_nc, model.d_n_layers),
            Self::Pixel => (DiscriminatorArch::Pixel, model.output_nc, 1),
            Self::ProjectedD => (DiscriminatorArch::Projected, model.output_nc, model.d_n_layers),
            Self::Temporal => (
                DiscriminatorArch::Patch,
                model.output_nc * temporal_frames.max(1),
                model.d_n_layers,
            ),
        };
        DiscriminatorConfig::new(arch, channels)
            .with_ndf(model.ndf)
            .with_n_layers(n_layers)
            .with_projector_channels(model.projector_channels)
    }
}

/// Naming, lookup overrides and cadence of one registered discriminator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiscriminatorDescriptor {
    pub name: String,
    pub loss_name_d: String,
    pub loss_name_g: String,
    pub kind: DiscriminatorKind,
    /// Replaces the default fake lookup (`fake_B` through the pool).
    pub fake_key: Option<TensorKey>,
    /// Replaces the default real lookup (`real_B`).
    pub real_key: Option<TensorKey>,
    pub compute_every: usize,
}

impl DiscriminatorDescriptor {
    pub fn new(kind: DiscriminatorKind, temporal_every: usize) -> Self {
        let name = format!("D_B_{}", kind.as_str());
        let (fake_key, real_key, compute_every) = match kind {
            DiscriminatorKind::Temporal => (
                Some(TensorKey::TemporalFakeB),
                Some(TensorKey::TemporalRealB),
                temporal_every,
            ),
            _ => (None, None, 1),
        };
        Self {
            loss_name_d: format!("D_GAN_{name}"),
            loss_name_g: format!("G_GAN_{name}"),
            name,
            kind,
            fake_key,
            real_key,
            compute_every,
        }
    }

    pub fn is_due(&self, step: usize) -> bool {
        step % self.compute_every == 0
    }

    /// Keys read when computing the discriminator loss.
    pub fn d_reads(&self, noisy: bool) -> [TensorKey; 2] {
        let (default_real, default_fake) = if noisy {
            (TensorKey::RealBNoisy, TensorKey::FakeBNoisy)
        } else {
            (TensorKey::RealB, TensorKey::FakeB)
        };
        [
            self.real_key.unwrap_or(default_real),
            self.fake_key.unwrap_or(default_fake),
        ]
    }

    /// Key of the attached fake scored by the generator loss.
    pub fn g_fake_key(&self) -> TensorKey {
        self.fake_key.unwrap_or(TensorKey::FakeB)
    }
}

/// Ordered discriminators with their loss calculators.
///
/// Every registered loss name is bound on every step: a discriminator whose
/// cadence does not divide the step contributes the exact zero scalar.
#[derive(Clone, Debug)]
pub struct DiscriminatorRegistry {
    descriptors: Vec<DiscriminatorDescriptor>,
    calculators: Vec<AdversarialLoss>,
}

impl DiscriminatorRegistry {
    pub fn from_names(
        names: &[String],
        loss: &LossConfig,
        apa: &ApaConfig,
        batch_size: usize,
        temporal_every: usize,
    ) -> TrainResult<Self> {
        if temporal_every == 0 {
            return Err(TrainError::InvalidConfig(
                "temporal discriminator cadence must be at least 1".to_string(),
            ));
        }
        let mut descriptors: Vec<DiscriminatorDescriptor> = Vec::with_capacity(names.len());
        let mut calculators = Vec::with_capacity(names.len());
        for name in names {
            let kind = name.parse::<DiscriminatorKind>()?;
            if descriptors.iter().any(|d| d.kind == kind) {
                return Err(TrainError::InvalidConfig(format!(
                    "discriminator `{name}` is listed twice"
                )));
            }
            descriptors.push(DiscriminatorDescriptor::new(kind, temporal_every));
            calculators.push(AdversarialLoss::new(
                kind.gan_mode(loss.gan_mode),
                loss,
                apa,
                batch_size,
            ));
        }
        Ok(Self {
            descriptors,
            calculators,
        })
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    pub fn descriptors(&self) -> &[DiscriminatorDescriptor] {
        &self.descriptors
    }

    pub fn calculators(&self) -> &[AdversarialLoss] {
        &self.calculators
    }

    pub fn has_temporal(&self) -> bool {
        self.descriptors
            .iter()
            .any(|d| d.kind == DiscriminatorKind::Temporal)
    }

    pub fn wants_apa_images(&self) -> bool {
        self.calculators.iter().any(AdversarialLoss::wants_apa_images)
    }

    pub fn network_configs(&self, model: &ModelConfig, temporal_frames: usize) -> Vec<DiscriminatorConfig> {
        self.descriptors
            .iter()
            .map(|d| d.kind.network_config(model, temporal_frames))
            .collect()
    }

    /// Bind every discriminator loss and `D_tot` for this step.
    ///
    /// `pooled_fake` is the default fake after the fake pool has been
    /// queried for this step; `fake_2` feeds adaptive augmentation.
    pub fn compute_d_losses<B: Backend>(
        &mut self,
        discriminators: &[Discriminator<B>],
        ctx: &mut StepContext<B>,
        pooled_fake: Option<Tensor<B, 4>>,
        fake_2: Option<Tensor<B, 4>>,
        noisy: bool,
    ) -> TrainResult<()> {
        let step = ctx.step();
        ctx.set_zero_loss(D_TOTAL);
        for (idx, descriptor) in self.descriptors.iter().enumerate() {
            if !descriptor.is_due(step) {
                ctx.set_zero_loss(descriptor.loss_name_d.as_str());
                continue;
            }
            let [real_key, fake_key] = descriptor.d_reads(noisy);
            let consumer = descriptor.loss_name_d.as_str();
            let real = ctx.image(real_key, consumer)?;
            let (fake, buffered) = match (&descriptor.fake_key, &pooled_fake) {
                (None, Some(pooled)) => (pooled.clone(), fake_2.clone()),
                _ => (ctx.image(fake_key, consumer)?, None),
            };
            let net = network(discriminators, idx, &descriptor.name)?;
            let value = self.calculators[idx].compute_loss_d(net, real, fake, buffered, step);
            ctx.add_to_loss(D_TOTAL, value.clone());
            ctx.set_loss(descriptor.loss_name_d.as_str(), value);
        }
        Ok(())
    }

    /// Bind every generator adversarial loss and return their sum.
    pub fn compute_g_losses<B: Backend>(
        &self,
        discriminators: &[Discriminator<B>],
        ctx: &mut StepContext<B>,
    ) -> TrainResult<Scalar<B>> {
        let step = ctx.step();
        let mut total = Tensor::zeros([1], ctx.device());
        for (idx, descriptor) in self.descriptors.iter().enumerate() {
            if !descriptor.is_due(step) {
                ctx.set_zero_loss(descriptor.loss_name_g.as_str());
                continue;
            }
            let fake = ctx.image(descriptor.g_fake_key(), &descriptor.loss_name_g)?;
            let net = network(discriminators, idx, &descriptor.name)?;
            let value = self.calculators[idx].compute_loss_g(net, fake);
            total = total + value.clone();
            ctx.set_loss(descriptor.loss_name_g.as_str(), value);
        }
        Ok(total)
    }

    /// Advance every calculator's per-step state.
    pub fn update(&mut self, step: usize) {
        for calculator in &mut self.calculators {
            calculator.update(step);
        }
    }
}

fn network<'a, B: Backend>(
    discriminators: &'a [Discriminator<B>],
    idx: usize,
    name: &str,
) -> TrainResult<&'a Discriminator<B>> {
    discriminators.get(idx).ok_or_else(|| {
        TrainError::InvalidConfig(format!("no network was built for discriminator `{name}`"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loss::scalar_value;
    use burn::backend::NdArray;
    use burn::tensor::Distribution;

    type B = NdArray<f32>;

    fn registry(names: &[&str], temporal_every: usize) -> TrainResult<DiscriminatorRegistry> {
        let names = names.iter().map(|n| n.to_string()).collect::<Vec<_>>();
        DiscriminatorRegistry::from_names(&names, &LossConfig::new(), &ApaConfig::new(), 2, temporal_every)
    }

    #[test]
    fn naming_and_modes() {
        let registry = registry(&["basic", "temporal", "projected_d"], 3).unwrap();
        let names = registry
            .descriptors()
            .iter()
            .map(|d| (d.name.as_str(), d.loss_name_d.as_str(), d.loss_name_g.as_str(), d.compute_every))
            .collect::<Vec<_>>();
        assert_eq!(
            names,
            vec![
                ("D_B_basic", "D_GAN_D_B_basic", "G_GAN_D_B_basic", 1),
                ("D_B_temporal", "D_GAN_D_B_temporal", "G_GAN_D_B_temporal", 3),
                ("D_B_projected_d", "D_GAN_D_B_projected_d", "G_GAN_D_B_projected_d", 1),
            ]
        );
        let modes = registry.calculators().iter().map(|c| c.mode()).collect::<Vec<_>>();
        assert_eq!(modes, vec![GanMode::Lsgan, GanMode::Projected, GanMode::Projected]);
        assert!(registry.has_temporal());
    }

    #[test]
    fn unknown_kind_and_bad_cadence_are_rejected() {
        assert!(matches!(
            registry(&["basic", "vision"], 1),
            Err(TrainError::UnknownDiscriminator(name)) if name == "vision"
        ));
        assert!(matches!(registry(&["basic"], 0), Err(TrainError::InvalidConfig(_))));
        assert!(matches!(registry(&["basic", "basic"], 1), Err(TrainError::InvalidConfig(_))));
    }

    #[test]
    fn off_cadence_contributions_are_exact_zeros() {
        let device = Default::default();
        let frames = 2;
        let mut registry = registry(&["basic", "temporal"], 3).unwrap();
        let model = ModelConfig::new().with_ndf(4).with_d_n_layers(2);
        let nets = registry
            .network_configs(&model, frames)
            .iter()
            .map(|config| config.init::<B>(&device))
            .collect::<Vec<_>>();

        for step in 1..=6 {
            let mut ctx = StepContext::<B>::new(step, &device);
            let image = |channels| {
                Tensor::<B, 4>::random([2, channels, 8, 8], Distribution::Default, &device)
            };
            ctx.put_image(TensorKey::RealB, image(3));
            ctx.put_image(TensorKey::FakeB, image(3));
            ctx.put_image(TensorKey::TemporalRealB, image(3 * frames));
            ctx.put_image(TensorKey::TemporalFakeB, image(3 * frames));

            registry.compute_d_losses(&nets, &mut ctx, None, None, false).unwrap();
            registry.compute_g_losses(&nets, &mut ctx).unwrap();
            let values = ctx.loss_values();

            assert_ne!(values["D_GAN_D_B_basic"], 0.0);
            assert_ne!(values["G_GAN_D_B_basic"], 0.0);
            for name in ["D_GAN_D_B_temporal", "G_GAN_D_B_temporal"] {
                if step % 3 == 0 {
                    assert_ne!(values[name], 0.0, "{name} at step {step}");
                } else {
                    assert_eq!(values[name], 0.0, "{name} at step {step}");
                }
            }
            let total = scalar_value(&ctx.loss(D_TOTAL).unwrap());
            let expected = values["D_GAN_D_B_basic"] + values["D_GAN_D_B_temporal"];
            assert!((total - expected).abs() < 1e-5);
        }
    }
}

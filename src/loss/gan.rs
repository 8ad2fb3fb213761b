use crate::loss::apa::{ApaConfig, ApaState};
use crate::loss::{bce_with_logits, mse, scalar_value, GanMode, LossConfig, Scalar};
use crate::model::Discriminator;
use burn::prelude::*;
use burn::tensor::activation::relu;
use burn::tensor::Distribution;

/// Real target used when one-sided label smoothing is on.
const SMOOTH_REAL_LABEL: f64 = 0.9;
/// Step of the central difference used by the gradient penalty.
const GP_STEP: f64 = 1e-2;

/// Adversarial loss calculator bound to one discriminator.
///
/// Owns the adaptive pseudo augmentation controller of that discriminator.
#[derive(Clone, Debug)]
pub struct AdversarialLoss {
    mode: GanMode,
    label_smooth: bool,
    gp_lambda: f64,
    apa: Option<ApaState>,
}

impl AdversarialLoss {
    pub fn new(mode: GanMode, loss: &LossConfig, apa: &ApaConfig, batch_size: usize) -> Self {
        Self {
            mode,
            label_smooth: loss.label_smooth,
            gp_lambda: loss.gp_lambda,
            apa: apa.enabled.then(|| ApaState::new(apa, batch_size)),
        }
    }

    pub fn mode(&self) -> GanMode {
        self.mode
    }

    pub fn apa(&self) -> Option<&ApaState> {
        self.apa.as_ref()
    }

    /// Whether this calculator wants a batch of buffered fakes every step.
    pub fn wants_apa_images(&self) -> bool {
        self.apa.is_some()
    }

    /// Discriminator loss. The generator output is detached here.
    ///
    /// `fake_2` is a batch of previously generated samples; with probability
    /// `p` each fake sample is replaced by its buffered counterpart, and on
    /// adjustment steps the discriminator's response to `fake_2` feeds the
    /// controller.
    pub fn compute_loss_d<B: Backend>(
        &mut self,
        net: &Discriminator<B>,
        real: Tensor<B, 4>,
        fake: Tensor<B, 4>,
        fake_2: Option<Tensor<B, 4>>,
        step: usize,
    ) -> Scalar<B> {
        let real = real.detach();
        let fake_2 = fake_2.map(|tensor| tensor.detach());
        let mut fake = fake.detach();

        if let (Some(apa), Some(buffered)) = (&self.apa, &fake_2) {
            if apa.p() > 0.0 && buffered.dims() == fake.dims() {
                fake = substitute(fake, buffered.clone(), apa.p());
            }
        }

        let pred_real = net.forward(real.clone());
        let pred_fake = net.forward(fake.clone());

        if let (Some(apa), Some(buffered)) = (self.apa.as_mut(), fake_2) {
            if apa.is_due(step) {
                let real_score = scalar_value(&pred_real.clone().detach().mean());
                let fake_score = scalar_value(&net.forward(buffered).detach().mean());
                apa.observe(real_score, fake_score);
            }
        }

        match self.mode {
            GanMode::Vanilla => {
                let real_label = if self.label_smooth {
                    SMOOTH_REAL_LABEL
                } else {
                    1.0
                };
                bce_with_logits(pred_real, real_label)
                    .add(bce_with_logits(pred_fake, 0.0))
                    .mul_scalar(0.5)
            }
            GanMode::Lsgan => {
                let ones = pred_real.ones_like();
                let zeros = pred_fake.zeros_like();
                mse(pred_real, ones).add(mse(pred_fake, zeros)).mul_scalar(0.5)
            }
            GanMode::Wgangp => {
                let penalty = self.gradient_penalty(net, real, fake);
                pred_fake.mean().sub(pred_real.mean()).add(penalty)
            }
            GanMode::Projected => relu(pred_real.neg().add_scalar(1.0))
                .mean()
                .add(relu(pred_fake.add_scalar(1.0)).mean()),
        }
    }

    /// Generator loss on the attached fake.
    pub fn compute_loss_g<B: Backend>(&self, net: &Discriminator<B>, fake: Tensor<B, 4>) -> Scalar<B> {
        let pred_fake = net.forward(fake);
        match self.mode {
            GanMode::Vanilla => bce_with_logits(pred_fake, 1.0),
            GanMode::Lsgan => {
                let ones = pred_fake.ones_like();
                mse(pred_fake, ones)
            }
            GanMode::Wgangp | GanMode::Projected => pred_fake.mean().neg(),
        }
    }

    /// Per-step bookkeeping; moves the augmentation probability on cadence.
    pub fn update(&mut self, step: usize) {
        if let Some(apa) = self.apa.as_mut() {
            apa.update(step);
        }
    }

    /// Penalises critic slopes that deviate from one along the real-fake line.
    ///
    /// The slope is measured by a central difference at a random
    /// interpolate, which keeps the penalty differentiable in the critic
    /// parameters with first-order autodiff only.
    fn gradient_penalty<B: Backend>(
        &self,
        net: &Discriminator<B>,
        real: Tensor<B, 4>,
        fake: Tensor<B, 4>,
    ) -> Scalar<B> {
        let [batch, channels, height, width] = real.dims();
        let device = real.device();
        let alpha = Tensor::<B, 4>::random([batch, 1, 1, 1], Distribution::Default, &device);
        let interpolated = real.clone().mul(alpha.clone()) + fake.clone().mul(alpha.neg().add_scalar(1.0));

        let direction = real.sub(fake);
        let norm = direction
            .clone()
            .reshape([batch, channels * height * width])
            .square()
            .sum_dim(1)
            .sqrt()
            .add_scalar(1e-12)
            .reshape([batch, 1, 1, 1]);
        let unit = direction.div(norm).mul_scalar(GP_STEP);

        let critic = |x: Tensor<B, 4>| net.forward(x).mean_dim(1).reshape([batch]);
        let ahead = critic(interpolated.clone() + unit.clone());
        let behind = critic(interpolated - unit);
        let slope = ahead.sub(behind).div_scalar(2.0 * GP_STEP);

        slope.abs().sub_scalar(1.0).square().mean().mul_scalar(self.gp_lambda)
    }
}

/// Swap each sample of `fake` for the matching sample of `buffered` with
/// probability `p`.
fn substitute<B: Backend>(fake: Tensor<B, 4>, buffered: Tensor<B, 4>, p: f64) -> Tensor<B, 4> {
    let batch = fake.dims()[0];
    let mask = Tensor::<B, 4>::random([batch, 1, 1, 1], Distribution::Bernoulli(p), &fake.device());
    fake.mul(mask.clone().neg().add_scalar(1.0)) + buffered.mul(mask)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DiscriminatorArch, DiscriminatorConfig};
    use burn::backend::{Autodiff, NdArray};

    type B = Autodiff<NdArray<f32>>;

    fn discriminator() -> Discriminator<B> {
        DiscriminatorConfig::new(DiscriminatorArch::Patch, 3)
            .with_ndf(4)
            .with_n_layers(2)
            .init(&Default::default())
    }

    fn images(value: f64) -> Tensor<B, 4> {
        Tensor::<B, 4>::random(
            [2, 3, 8, 8],
            Distribution::Uniform(value - 0.5, value + 0.5),
            &Default::default(),
        )
    }

    #[test]
    fn every_mode_yields_finite_scalars() {
        let net = discriminator();
        for mode in [GanMode::Vanilla, GanMode::Lsgan, GanMode::Wgangp, GanMode::Projected] {
            let mut calc = AdversarialLoss::new(
                mode,
                &LossConfig::new().with_label_smooth(true),
                &ApaConfig::new(),
                2,
            );
            let d = calc.compute_loss_d(&net, images(0.5), images(-0.5), None, 1);
            let g = calc.compute_loss_g(&net, images(-0.5));
            assert_eq!(d.dims(), [1]);
            assert!(scalar_value(&d).is_finite(), "{mode:?}");
            assert!(scalar_value(&g).is_finite(), "{mode:?}");
        }
    }

    #[test]
    fn d_loss_never_reaches_the_generator_output() {
        let net = discriminator();
        let mut calc = AdversarialLoss::new(GanMode::Lsgan, &LossConfig::new(), &ApaConfig::new(), 2);
        let fake = images(0.0).require_grad();

        let grads = calc.compute_loss_d(&net, images(0.5), fake.clone(), None, 1).backward();
        assert!(fake.grad(&grads).is_none());

        let grads = calc.compute_loss_g(&net, fake.clone()).backward();
        assert!(fake.grad(&grads).is_some());
    }

    #[test]
    fn apa_probability_moves_on_cadence() {
        let net = discriminator();
        let apa = ApaConfig::new()
            .with_enabled(true)
            .with_initial_p(0.5)
            .with_every(2)
            .with_nimg(20);
        let mut calc = AdversarialLoss::new(GanMode::Lsgan, &LossConfig::new(), &apa, 2);

        calc.compute_loss_d(&net, images(0.5), images(-0.5), Some(images(-0.5)), 1);
        calc.update(1);
        assert_eq!(calc.apa().map(ApaState::p), Some(0.5));

        calc.compute_loss_d(&net, images(0.5), images(-0.5), Some(images(-0.5)), 2);
        calc.update(2);
        let p = calc.apa().map(ApaState::p).unwrap_or_default();
        assert!((p - 0.5).abs() > 1e-9);
        assert!((0.0..=1.0).contains(&p));
    }

    /// Calculator whose controller holds `p` fixed for the first steps.
    fn with_probability(p: f64) -> AdversarialLoss {
        let apa = ApaConfig::new()
            .with_enabled(true)
            .with_initial_p(p)
            .with_every(1000);
        AdversarialLoss::new(GanMode::Lsgan, &LossConfig::new(), &apa, 2)
    }

    fn plain_loss_d(net: &Discriminator<B>, real: Tensor<B, 4>, fake: Tensor<B, 4>) -> f64 {
        let mut plain = AdversarialLoss::new(GanMode::Lsgan, &LossConfig::new(), &ApaConfig::new(), 2);
        scalar_value(&plain.compute_loss_d(net, real, fake, None, 1))
    }

    #[test]
    fn certain_substitution_scores_the_buffered_fakes() {
        let net = discriminator();
        let (real, fake, buffered) = (images(0.5), images(-0.5), images(1.5));

        let mut calc = with_probability(1.0);
        let loss = calc.compute_loss_d(&net, real.clone(), fake.clone(), Some(buffered.clone()), 1);

        let expected = plain_loss_d(&net, real.clone(), buffered);
        assert!((scalar_value(&loss) - expected).abs() < 1e-5);
        assert!((plain_loss_d(&net, real, fake) - expected).abs() > 1e-6);
    }

    #[test]
    fn zero_probability_keeps_the_fresh_fakes() {
        let net = discriminator();
        let (real, fake, buffered) = (images(0.5), images(-0.5), images(1.5));

        let mut calc = with_probability(0.0);
        let loss = calc.compute_loss_d(&net, real.clone(), fake.clone(), Some(buffered), 1);

        let expected = plain_loss_d(&net, real, fake);
        assert!((scalar_value(&loss) - expected).abs() < 1e-5);
    }

    #[test]
    fn mismatched_buffer_is_not_substituted() {
        let net = discriminator();
        let (real, fake) = (images(0.5), images(-0.5));
        let short = Tensor::<B, 4>::ones([1, 3, 8, 8], &Default::default());

        let mut calc = with_probability(1.0);
        let loss = calc.compute_loss_d(&net, real.clone(), fake.clone(), Some(short), 1);

        let expected = plain_loss_d(&net, real, fake);
        assert!((scalar_value(&loss) - expected).abs() < 1e-5);
    }
}

pub mod apa;
pub mod gan;
pub mod nce;
pub mod temporal;

use burn::prelude::*;
use burn::tensor::activation::{log_sigmoid, log_softmax};

pub use apa::{ApaConfig, ApaState};
pub use gan::AdversarialLoss;
pub use nce::{NceCriterion, NceKind};
pub use temporal::{temporal_consistency, TemporalCriterion};

/// Adversarial objective used by a loss calculator.
#[derive(Config, Debug, Copy, PartialEq, Eq)]
pub enum GanMode {
    Vanilla,
    Lsgan,
    Wgangp,
    Projected,
}

/// Weighting and switches for every loss term.
#[derive(Config, Debug)]
pub struct LossConfig {
    #[config(default = "GanMode::Lsgan")]
    pub gan_mode: GanMode,
    /// One-sided label smoothing of the real target (vanilla mode).
    #[config(default = false)]
    pub label_smooth: bool,
    #[config(default = 10.0)]
    pub gp_lambda: f64,
    /// Standard deviation of the instance noise added to discriminator inputs.
    #[config(default = 0.0)]
    pub d_noise: f64,

    #[config(default = 1.0)]
    pub lambda_nce: f64,
    #[config(default = true)]
    pub nce_idt: bool,
    #[config(default = "vec![0, 2, 3, 5]")]
    pub nce_layers: Vec<usize>,
    #[config(default = 0.07)]
    pub nce_t: f64,
    #[config(default = 64)]
    pub num_patches: usize,
    #[config(default = false)]
    pub nce_includes_all_negatives_from_minibatch: bool,
    #[config(default = "NceKind::PatchNce")]
    pub nce_loss: NceKind,
    #[config(default = 1.0)]
    pub monce_eps: f64,
    #[config(default = 5)]
    pub monce_iters: usize,
    #[config(default = false)]
    pub flip_equivariance: bool,

    #[config(default = false)]
    pub mse_idt: bool,
    #[config(default = 1.0)]
    pub lambda_mse_idt: f64,
    #[config(default = 0.5)]
    pub lambda_z: f64,

    #[config(default = 1.0)]
    pub lambda_sem_cls: f64,
    #[config(default = 1.0)]
    pub lambda_sem_mask: f64,
    /// Also supervise the identity output with the target-domain mask.
    #[config(default = false)]
    pub sem_idt: bool,
    /// Semantic generator terms stay at zero until the semantic network's
    /// own loss reaches this value.
    #[config(default = 1.0)]
    pub semantic_threshold: f64,

    #[config(default = false)]
    pub temporal_criterion: bool,
    #[config(default = 1.0)]
    pub lambda_temporal: f64,
    #[config(default = "TemporalCriterion::L1")]
    pub temporal_criterion_kind: TemporalCriterion,
}

/// Scalar loss with shape `[1]`.
pub type Scalar<B> = Tensor<B, 1>;

pub fn l1<B: Backend, const D: usize>(input: Tensor<B, D>, target: Tensor<B, D>) -> Scalar<B> {
    input.sub(target).abs().mean()
}

pub fn mse<B: Backend, const D: usize>(input: Tensor<B, D>, target: Tensor<B, D>) -> Scalar<B> {
    input.sub(target).square().mean()
}

/// Binary cross entropy on logits against a constant float target.
pub fn bce_with_logits<B: Backend, const D: usize>(logits: Tensor<B, D>, target: f64) -> Scalar<B> {
    let pos = log_sigmoid(logits.clone()).mul_scalar(target);
    let neg = log_sigmoid(logits.neg()).mul_scalar(1.0 - target);
    pos.add(neg).neg().mean()
}

/// Mean cross entropy of `[batch, classes]` logits against class indices.
pub fn cross_entropy<B: Backend>(logits: Tensor<B, 2>, labels: Tensor<B, 1, Int>) -> Scalar<B> {
    let [batch, classes] = logits.dims();
    let log_probs = log_softmax(logits, 1);
    let one_hot = labels.one_hot::<2>(classes).float();
    log_probs.mul(one_hot).sum().div_scalar(batch as f64).neg()
}

/// Per-pixel cross entropy of `[batch, labels, h, w]` logits against a mask.
pub fn segmentation_cross_entropy<B: Backend>(
    logits: Tensor<B, 4>,
    mask: Tensor<B, 3, Int>,
) -> Scalar<B> {
    let [batch, labels, height, width] = logits.dims();
    let flat = logits
        .reshape([batch, labels, height * width])
        .swap_dims(1, 2)
        .reshape([batch * height * width, labels]);
    cross_entropy(flat, mask.reshape([batch * height * width]))
}

/// Extract the value of a `[1]` scalar.
pub fn scalar_value<B: Backend>(loss: &Scalar<B>) -> f64 {
    loss.clone().into_scalar().elem::<f64>()
}

use crate::loss::Scalar;
use burn::prelude::*;
use burn::tensor::activation::log_softmax;
use burn::tensor::TensorData;

/// Patch contrastive objective.
#[derive(Config, Debug, Copy, PartialEq, Eq)]
pub enum NceKind {
    PatchNce,
    /// PatchNCE with negatives reweighted by an entropic transport plan.
    MoNce,
}

/// Logit assigned to the masked query/self-key pairs among the negatives.
const MASKED_LOGIT: f64 = -10.0;

/// Contrastive loss between projected query and key patches.
///
/// Row `i` of the query matrix is the positive of row `i` of the key
/// matrix; every other sampled patch of the same image (or of the whole
/// minibatch) is a negative.
#[derive(Clone, Debug)]
pub struct NceCriterion {
    kind: NceKind,
    temperature: f64,
    all_negatives_from_minibatch: bool,
    sinkhorn_eps: f64,
    sinkhorn_iters: usize,
}

impl NceCriterion {
    pub fn new(kind: NceKind, temperature: f64, all_negatives_from_minibatch: bool) -> Self {
        Self {
            kind,
            temperature,
            all_negatives_from_minibatch,
            sinkhorn_eps: 1.0,
            sinkhorn_iters: 5,
        }
    }

    pub fn with_sinkhorn(mut self, eps: f64, iters: usize) -> Self {
        self.sinkhorn_eps = eps;
        self.sinkhorn_iters = iters;
        self
    }

    /// Per-patch loss, shape `[patches]`. Keys are treated as constants.
    pub fn forward<B: Backend>(
        &self,
        feat_q: Tensor<B, 2>,
        feat_k: Tensor<B, 2>,
        batch: usize,
    ) -> Tensor<B, 1> {
        let [num_patches, dim] = feat_q.dims();
        let device = feat_q.device();
        let feat_k = feat_k.detach();

        let l_pos = feat_q.clone().mul(feat_k.clone()).sum_dim(1);

        let groups = if self.all_negatives_from_minibatch {
            1
        } else {
            batch.max(1)
        };
        let per_group = num_patches / groups;
        let q = feat_q.reshape([groups, per_group, dim]);
        let k = feat_k.reshape([groups, per_group, dim]);
        let mut l_neg = q.matmul(k.swap_dims(1, 2));

        let diagonal = identity::<B>(per_group, &device).unsqueeze::<3>();
        if self.kind == NceKind::MoNce {
            let seed = l_neg.clone().detach() * diagonal.clone().neg().add_scalar(1.0)
                + diagonal.clone().mul_scalar(MASKED_LOGIT);
            let weights = self.transport_weights(seed) + diagonal.clone();
            l_neg = l_neg + weights.add_scalar(1e-8).log();
        }
        let l_neg = l_neg * diagonal.clone().neg().add_scalar(1.0)
            + diagonal.mul_scalar(MASKED_LOGIT);
        let l_neg = l_neg.reshape([num_patches, per_group]);

        let logits = Tensor::cat(vec![l_pos, l_neg], 1).div_scalar(self.temperature);
        log_softmax(logits, 1)
            .slice_dim(1, 0..1)
            .reshape([num_patches])
            .neg()
    }

    /// Mean loss over patches.
    pub fn loss<B: Backend>(&self, feat_q: Tensor<B, 2>, feat_k: Tensor<B, 2>, batch: usize) -> Scalar<B> {
        self.forward(feat_q, feat_k, batch).mean()
    }

    /// Entropic transport plan over the negative similarities, scaled so a
    /// uniform plan weighs every negative by one.
    fn transport_weights<B: Backend>(&self, similarity: Tensor<B, 3>) -> Tensor<B, 3> {
        let [groups, rows, cols] = similarity.dims();
        let kernel = similarity.div_scalar(self.sinkhorn_eps).exp();
        let mut r = Tensor::<B, 3>::ones([groups, rows, 1], &kernel.device());
        let mut c = Tensor::<B, 3>::ones([groups, 1, cols], &kernel.device());
        for _ in 0..self.sinkhorn_iters.max(1) {
            let kc = kernel.clone().mul(c.clone()).sum_dim(2);
            r = kc.add_scalar(1e-8).recip().div_scalar(rows as f64);
            let kr = kernel.clone().mul(r.clone()).sum_dim(1);
            c = kr.add_scalar(1e-8).recip().div_scalar(cols as f64);
        }
        kernel.mul(r).mul(c).mul_scalar((rows * cols) as f64)
    }
}

fn identity<B: Backend>(size: usize, device: &B::Device) -> Tensor<B, 2> {
    let mut values = vec![0.0f32; size * size];
    for idx in 0..size {
        values[idx * size + idx] = 1.0;
    }
    Tensor::from_data(TensorData::new(values, [size, size]), device)
}

use crate::loss::{l1, mse, Scalar};
use burn::prelude::*;

#[derive(Config, Debug, Copy, PartialEq, Eq)]
pub enum TemporalCriterion {
    L1,
    Mse,
}

/// Consistency between consecutive generated frames of `[batch, T, c, h, w]`.
///
/// Each frame is pulled towards the detached frame before it, never the
/// other way round. Fewer than two frames yields an exact zero.
pub fn temporal_consistency<B: Backend>(
    frames: Tensor<B, 5>,
    criterion: TemporalCriterion,
) -> Scalar<B> {
    let [batch, count, channels, height, width] = frames.dims();
    let device = frames.device();
    let frame = |idx: usize| {
        frames
            .clone()
            .slice_dim(1, idx..idx + 1)
            .reshape([batch, channels, height, width])
    };

    let mut total = Tensor::<B, 1>::zeros([1], &device);
    for idx in 1..count {
        let previous = frame(idx - 1).detach();
        let current = frame(idx);
        total = total
            + match criterion {
                TemporalCriterion::L1 => l1(previous, current),
                TemporalCriterion::Mse => mse(previous, current),
            };
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loss::scalar_value;
    use burn::backend::{Autodiff, NdArray};
    use burn::tensor::Distribution;

    type B = NdArray<f32>;

    #[test]
    fn single_frame_is_exactly_zero() {
        let device = Default::default();
        let frames = Tensor::<B, 5>::random([2, 1, 3, 4, 4], Distribution::Default, &device);
        assert_eq!(scalar_value(&temporal_consistency(frames, TemporalCriterion::L1)), 0.0);
    }

    #[test]
    fn identical_frames_are_exactly_zero() {
        let device = Default::default();
        let frame = Tensor::<B, 4>::random([2, 3, 4, 4], Distribution::Default, &device);
        let frames = Tensor::stack::<5>(vec![frame.clone(), frame.clone(), frame], 1);
        for criterion in [TemporalCriterion::L1, TemporalCriterion::Mse] {
            assert_eq!(scalar_value(&temporal_consistency(frames.clone(), criterion)), 0.0);
        }
    }

    #[test]
    fn gradient_only_reaches_later_frames() {
        type AB = Autodiff<B>;
        let device = Default::default();
        let first = Tensor::<AB, 4>::zeros([1, 1, 2, 2], &device).require_grad();
        let second = Tensor::<AB, 4>::ones([1, 1, 2, 2], &device).require_grad();
        let frames = Tensor::stack::<5>(vec![first.clone(), second.clone()], 1);
        let grads = temporal_consistency(frames, TemporalCriterion::Mse).backward();
        let first_grad = first.grad(&grads).map(|g| g.abs().sum().into_scalar());
        assert_eq!(first_grad.unwrap_or(0.0), 0.0);
        let second_grad = second.grad(&grads).map(|g| g.abs().sum().into_scalar());
        assert!(second_grad.is_some_and(|value| value > 0.0));
    }
}

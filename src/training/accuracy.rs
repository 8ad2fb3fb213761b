use crate::loss::GanMode;
use crate::model::Discriminator;
use burn::prelude::*;
use burn::tensor::activation::sigmoid;

/// Score above which a discriminator output counts as "real".
pub const REAL_THRESHOLD: f64 = 0.5;

/// Classification quality of a discriminator on stored real and fake samples.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct DiscriminatorAccuracy {
    pub precision_real: f64,
    pub recall_real: f64,
    pub precision_fake: f64,
    pub recall_fake: f64,
    pub accuracy: f64,
}

impl DiscriminatorAccuracy {
    /// Confusion statistics of per-sample scores against [`REAL_THRESHOLD`].
    pub fn from_scores(real_scores: &[f64], fake_scores: &[f64]) -> Self {
        let true_real = real_scores.iter().filter(|&&s| s > REAL_THRESHOLD).count() as f64;
        let false_fake = real_scores.len() as f64 - true_real;
        let true_fake = fake_scores.iter().filter(|&&s| s <= REAL_THRESHOLD).count() as f64;
        let false_real = fake_scores.len() as f64 - true_fake;

        let ratio = |num: f64, den: f64| if den > 0.0 { num / den } else { 0.0 };
        Self {
            precision_real: ratio(true_real, true_real + false_real),
            recall_real: ratio(true_real, true_real + false_fake),
            precision_fake: ratio(true_fake, true_fake + false_fake),
            recall_fake: ratio(true_fake, true_fake + false_real),
            accuracy: ratio(
                true_real + true_fake,
                (real_scores.len() + fake_scores.len()) as f64,
            ),
        }
    }

    /// Score `real` and `fake` sample batches with `net`.
    ///
    /// Vanilla discriminators emit logits, every other mode is read as is.
    pub fn evaluate<B: Backend>(
        net: &Discriminator<B>,
        mode: GanMode,
        real: Tensor<B, 4>,
        fake: Tensor<B, 4>,
    ) -> Self {
        let scores = |images: Tensor<B, 4>| -> Vec<f64> {
            let mut out = net.forward(images).mean_dim(1);
            if mode == GanMode::Vanilla {
                out = sigmoid(out);
            }
            out.into_data()
                .iter::<f64>()
                .collect()
        };
        Self::from_scores(&scores(real), &scores(fake))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn perfect_separation() {
        let stats = DiscriminatorAccuracy::from_scores(&[0.9, 0.8], &[0.1, 0.2, 0.0]);
        assert_eq!(stats.accuracy, 1.0);
        assert_eq!(stats.precision_real, 1.0);
        assert_eq!(stats.recall_fake, 1.0);
    }

    #[test]
    fn mixed_predictions() {
        // One real mistaken for fake, one fake mistaken for real.
        let stats = DiscriminatorAccuracy::from_scores(&[0.9, 0.2], &[0.7, 0.1]);
        assert_eq!(stats.accuracy, 0.5);
        assert_eq!(stats.precision_real, 0.5);
        assert_eq!(stats.recall_real, 0.5);
        assert_eq!(stats.precision_fake, 0.5);
        assert_eq!(stats.recall_fake, 0.5);
    }

    #[test]
    fn empty_inputs_do_not_divide_by_zero() {
        assert_eq!(
            DiscriminatorAccuracy::from_scores(&[], &[]),
            DiscriminatorAccuracy::default()
        );
    }
}

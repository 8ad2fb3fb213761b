use burn::nn::{Linear, LinearConfig};
use burn::prelude::*;
use burn::tensor::activation::relu;
use burn::tensor::TensorData;
use rand::seq::SliceRandom;
use rand::Rng;

/// Configuration for the patch feature projector.
#[derive(Config, Debug)]
pub struct PatchSampleConfig {
    /// Channel count of every feature map that will be sampled, in order.
    pub feature_channels: Vec<usize>,
    #[config(default = 64)]
    pub nc: usize,
    #[config(default = true)]
    pub use_mlp: bool,
}

/// Two-layer projection head for one feature map.
#[derive(Module, Debug)]
pub struct PatchMlp<B: Backend> {
    fc1: Linear<B>,
    fc2: Linear<B>,
}

impl<B: Backend> PatchMlp<B> {
    fn forward(&self, x: Tensor<B, 2>) -> Tensor<B, 2> {
        self.fc2.forward(relu(self.fc1.forward(x)))
    }
}

/// Samples spatial patches from generator features and projects them.
///
/// Every feature map gets its own two-layer head. Sampling the query and the
/// key with the same patch ids is what turns them into positive pairs.
#[derive(Module, Debug)]
pub struct PatchSampleF<B: Backend> {
    mlps: Vec<PatchMlp<B>>,
}

impl PatchSampleConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> PatchSampleF<B> {
        let mlps = if self.use_mlp {
            self.feature_channels
                .iter()
                .map(|&channels| PatchMlp {
                    fc1: LinearConfig::new(channels, self.nc).init(device),
                    fc2: LinearConfig::new(self.nc, self.nc).init(device),
                })
                .collect()
        } else {
            Vec::new()
        };
        PatchSampleF { mlps }
    }
}

impl<B: Backend> PatchSampleF<B> {
    /// Sample `num_patches` locations per feature map (all of them when zero).
    ///
    /// Returns one `[batch * patches, channels]` matrix per feature map,
    /// L2-normalised along channels, plus the ids used so that a second call
    /// can sample the same locations.
    pub fn sample(
        &self,
        features: &[Tensor<B, 4>],
        num_patches: usize,
        patch_ids: Option<&[Vec<usize>]>,
        rng: &mut impl Rng,
    ) -> (Vec<Tensor<B, 2>>, Vec<Vec<usize>>) {
        let mut pooled = Vec::with_capacity(features.len());
        let mut used_ids = Vec::with_capacity(features.len());

        for (idx, feat) in features.iter().enumerate() {
            let [batch, channels, height, width] = feat.dims();
            let locations = height * width;
            let device = feat.device();
            let flat = feat.clone().reshape([batch, channels, locations]).swap_dims(1, 2);

            let (sampled, ids) = if num_patches > 0 {
                let ids = match patch_ids.and_then(|ids| ids.get(idx)) {
                    Some(ids) => ids.clone(),
                    None => {
                        let mut ids: Vec<usize> = (0..locations).collect();
                        ids.shuffle(rng);
                        ids.truncate(num_patches.min(locations));
                        ids
                    }
                };
                let index = Tensor::<B, 1, Int>::from_data(
                    TensorData::new(
                        ids.iter().map(|&id| id as i64).collect::<Vec<_>>(),
                        [ids.len()],
                    ),
                    &device,
                );
                let picked = flat.select(1, index).reshape([batch * ids.len(), channels]);
                (picked, ids)
            } else {
                (flat.reshape([batch * locations, channels]), Vec::new())
            };

            let projected = match self.mlps.get(idx) {
                Some(mlp) => mlp.forward(sampled),
                None => sampled,
            };
            pooled.push(l2_normalize(projected));
            used_ids.push(ids);
        }

        (pooled, used_ids)
    }
}

fn l2_normalize<B: Backend>(x: Tensor<B, 2>) -> Tensor<B, 2> {
    let norm = x.clone().square().sum_dim(1).sqrt().add_scalar(1e-7);
    x.div(norm)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use rand::{rngs::StdRng, SeedableRng};

    type B = NdArray<f32>;

    #[test]
    fn shared_ids_select_the_same_locations() {
        let device = Default::default();
        let mut rng = StdRng::seed_from_u64(5);
        let projector = PatchSampleConfig::new(vec![4, 8])
            .with_use_mlp(false)
            .init::<B>(&device);
        let feats = vec![
            Tensor::<B, 4>::random([2, 4, 4, 4], burn::tensor::Distribution::Default, &device),
            Tensor::<B, 4>::random([2, 8, 2, 2], burn::tensor::Distribution::Default, &device),
        ];
        let (first, ids) = projector.sample(&feats, 3, None, &mut rng);
        let (second, _) = projector.sample(&feats, 3, Some(&ids), &mut rng);

        assert_eq!(first[0].dims(), [6, 4]);
        assert_eq!(first[1].dims(), [6, 8]);
        first[0]
            .clone()
            .into_data()
            .assert_approx_eq::<f32>(&second[0].clone().into_data(), Default::default());
    }

    #[test]
    fn output_rows_have_unit_norm() {
        let device = Default::default();
        let mut rng = StdRng::seed_from_u64(1);
        let projector = PatchSampleConfig::new(vec![4])
            .with_use_mlp(false)
            .init::<B>(&device);
        let feats = vec![Tensor::<B, 4>::random(
            [1, 4, 2, 2],
            burn::tensor::Distribution::Uniform(0.5, 1.0),
            &device,
        )];
        let (pooled, _) = projector.sample(&feats, 0, None, &mut rng);
        assert_eq!(pooled[0].dims(), [4, 4]);
        let norms = pooled[0].clone().square().sum_dim(1).sqrt().into_data();
        norms.assert_approx_eq::<f32>(
            &TensorData::new(vec![1.0f32; 4], [4, 1]),
            Default::default(),
        );
    }
}

use crate::error::{TrainError, TrainResult};
use crate::loss::{scalar_value, Scalar};
use burn::prelude::*;
use std::collections::{BTreeMap, HashMap};

/// Name of every tensor a training step can produce or consume.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TensorKey {
    RealA,
    RealB,
    /// Generator input: `real_A`, plus `real_B` when identity NCE is on.
    Real,
    /// Generator output for [`TensorKey::Real`].
    Fake,
    FakeB,
    IdtB,
    RealBNoisy,
    FakeBNoisy,
    DiffRealAFakeB,
    /// Latent code drawn for this step, `[batch, nz]`.
    ZRandom,
    /// Latent code recovered by `E` from `fake_B`.
    Mu2,
    LabelClsA,
    LabelMaskA,
    LabelMaskB,
    PredClsRealA,
    PredClsFakeB,
    PredFsRealA,
    PredFsFakeB,
    PredFsIdtB,
    /// `[batch, T, c, h, w]` frames of domain A.
    TemporalRealA,
    /// Frames of domain B stacked along channels.
    TemporalRealB,
    /// `[batch, T, c, h, w]` generated frames.
    TemporalFakeBFrames,
    /// Generated frames stacked along channels.
    TemporalFakeB,
    /// Buffered fakes last shown to a discriminator under augmentation.
    ApaImg,
}

/// A tensor stored in the step context.
#[derive(Clone, Debug)]
pub enum Slot<B: Backend> {
    Image(Tensor<B, 4>),
    Sequence(Tensor<B, 5>),
    Matrix(Tensor<B, 2>),
    Labels(Tensor<B, 1, Int>),
    Mask(Tensor<B, 3, Int>),
}

impl<B: Backend> Slot<B> {
    fn kind(&self) -> &'static str {
        match self {
            Slot::Image(_) => "image",
            Slot::Sequence(_) => "sequence",
            Slot::Matrix(_) => "matrix",
            Slot::Labels(_) => "labels",
            Slot::Mask(_) => "mask",
        }
    }

    fn detach(self) -> Self {
        match self {
            Slot::Image(t) => Slot::Image(t.detach()),
            Slot::Sequence(t) => Slot::Sequence(t.detach()),
            Slot::Matrix(t) => Slot::Matrix(t.detach()),
            other => other,
        }
    }
}

macro_rules! typed_access {
    ($get:ident, $put:ident, $variant:ident, $ty:ty, $label:literal) => {
        pub fn $put(&mut self, key: TensorKey, tensor: $ty) {
            self.tensors.insert(key, Slot::$variant(tensor));
        }

        pub fn $get(&self, key: TensorKey, consumer: &str) -> TrainResult<$ty> {
            match self.tensors.get(&key) {
                Some(Slot::$variant(tensor)) => Ok(tensor.clone()),
                Some(other) => Err(TrainError::TensorKind {
                    key,
                    expected: $label,
                    found: other.kind(),
                }),
                None => Err(TrainError::MissingTensor {
                    key,
                    consumer: consumer.to_string(),
                }),
            }
        }
    };
}

/// Everything one training step produces, passed through every forward and
/// backward function and dropped when the step ends.
#[derive(Debug)]
pub struct StepContext<B: Backend> {
    step: usize,
    device: B::Device,
    tensors: HashMap<TensorKey, Slot<B>>,
    losses: BTreeMap<String, Scalar<B>>,
    flipped_for_equivariance: bool,
}

impl<B: Backend> StepContext<B> {
    pub fn new(step: usize, device: &B::Device) -> Self {
        Self {
            step,
            device: device.clone(),
            tensors: HashMap::new(),
            losses: BTreeMap::new(),
            flipped_for_equivariance: false,
        }
    }

    pub fn step(&self) -> usize {
        self.step
    }

    pub fn device(&self) -> &B::Device {
        &self.device
    }

    pub fn contains(&self, key: TensorKey) -> bool {
        self.tensors.contains_key(&key)
    }

    pub fn keys(&self) -> impl Iterator<Item = TensorKey> + '_ {
        self.tensors.keys().copied()
    }

    typed_access!(image, put_image, Image, Tensor<B, 4>, "image");
    typed_access!(sequence, put_sequence, Sequence, Tensor<B, 5>, "sequence");
    typed_access!(matrix, put_matrix, Matrix, Tensor<B, 2>, "matrix");
    typed_access!(labels, put_labels, Labels, Tensor<B, 1, Int>, "labels");
    typed_access!(mask, put_mask, Mask, Tensor<B, 3, Int>, "mask");

    pub fn flipped_for_equivariance(&self) -> bool {
        self.flipped_for_equivariance
    }

    pub fn set_flipped_for_equivariance(&mut self, flipped: bool) {
        self.flipped_for_equivariance = flipped;
    }

    pub fn set_loss(&mut self, name: impl Into<String>, value: Scalar<B>) {
        self.losses.insert(name.into(), value);
    }

    /// Bind `name` to the exact zero scalar.
    pub fn set_zero_loss(&mut self, name: impl Into<String>) {
        let zero = Tensor::zeros([1], &self.device);
        self.losses.insert(name.into(), zero);
    }

    pub fn add_to_loss(&mut self, name: &str, value: Scalar<B>) {
        let total = match self.losses.remove(name) {
            Some(current) => current + value,
            None => value,
        };
        self.losses.insert(name.to_string(), total);
    }

    pub fn loss(&self, name: &str) -> Option<Scalar<B>> {
        self.losses.get(name).cloned()
    }

    pub fn require_loss(&self, name: &str, group: &str) -> TrainResult<Scalar<B>> {
        self.loss(name).ok_or_else(|| TrainError::MissingLoss {
            name: name.to_string(),
            group: group.to_string(),
        })
    }

    /// Current values of every bound loss.
    pub fn loss_values(&self) -> BTreeMap<String, f64> {
        self.losses
            .iter()
            .map(|(name, value)| (name.clone(), scalar_value(value)))
            .collect()
    }

    /// Cut every stored tensor and loss off the autodiff graph.
    ///
    /// Called after a group has stepped so that later groups cannot
    /// propagate into parameters that were already updated.
    pub fn detach_all(&mut self) {
        self.tensors = std::mem::take(&mut self.tensors)
            .into_iter()
            .map(|(key, slot)| (key, slot.detach()))
            .collect();
        for value in self.losses.values_mut() {
            *value = value.clone().detach();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::{Autodiff, NdArray};

    type B = Autodiff<NdArray<f32>>;

    #[test]
    fn missing_and_mistyped_tensors_are_reported() {
        let device = Default::default();
        let mut ctx = StepContext::<B>::new(1, &device);
        ctx.put_image(TensorKey::RealA, Tensor::zeros([1, 3, 2, 2], &device));

        assert!(ctx.image(TensorKey::RealA, "test").is_ok());
        assert!(matches!(
            ctx.image(TensorKey::FakeB, "test"),
            Err(TrainError::MissingTensor { key: TensorKey::FakeB, .. })
        ));
        assert!(matches!(
            ctx.matrix(TensorKey::RealA, "test"),
            Err(TrainError::TensorKind { expected: "matrix", found: "image", .. })
        ));
    }

    #[test]
    fn losses_accumulate_and_report() {
        let device = Default::default();
        let mut ctx = StepContext::<B>::new(3, &device);
        ctx.set_zero_loss("G_tot");
        ctx.add_to_loss("G_tot", Tensor::ones([1], &device));
        ctx.add_to_loss("G_tot", Tensor::ones([1], &device));
        assert_eq!(ctx.loss_values().get("G_tot"), Some(&2.0));
        assert!(matches!(
            ctx.require_loss("D_tot", "D"),
            Err(TrainError::MissingLoss { .. })
        ));
    }

    #[test]
    fn detach_all_stops_gradients() {
        let device = Default::default();
        let leaf = Tensor::<B, 4>::ones([1, 1, 2, 2], &device).require_grad();
        let mut ctx = StepContext::<B>::new(1, &device);
        ctx.put_image(TensorKey::FakeB, leaf.clone().mul_scalar(2.0));
        ctx.detach_all();

        let bias = Tensor::<B, 1>::ones([1], &device).require_grad();
        let loss = ctx.image(TensorKey::FakeB, "test").unwrap().sum() + bias.clone();
        let grads = loss.backward();
        assert!(leaf.grad(&grads).is_none());
        assert!(bias.grad(&grads).is_some());
    }
}

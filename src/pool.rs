use burn::prelude::*;
use rand::Rng;

/// Probability that a full pool hands back a stored sample instead of the fresh one.
pub const DEFAULT_SWAP_PROBABILITY: f64 = 0.5;

/// Fixed-capacity reservoir of previously seen samples for one domain.
///
/// While filling up, every fresh sample is stored and returned as is. Once
/// full, a query returns either the fresh sample or a stored one chosen at
/// random, and in the latter case the fresh sample takes its slot.
#[derive(Clone, Debug)]
pub struct ImagePool<T> {
    capacity: usize,
    swap_probability: f64,
    items: Vec<T>,
}

impl<T: Clone> ImagePool<T> {
    pub fn new(capacity: usize) -> Self {
        Self::with_swap_probability(capacity, DEFAULT_SWAP_PROBABILITY)
    }

    pub fn with_swap_probability(capacity: usize, swap_probability: f64) -> Self {
        Self {
            capacity,
            swap_probability: swap_probability.clamp(0.0, 1.0),
            items: Vec::with_capacity(capacity),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Offer one fresh sample and get back the sample to train on.
    pub fn query(&mut self, fresh: T, rng: &mut impl Rng) -> T {
        if self.capacity == 0 {
            return fresh;
        }
        if self.items.len() < self.capacity {
            self.items.push(fresh.clone());
            return fresh;
        }
        if rng.gen::<f64>() < self.swap_probability {
            let slot = rng.gen_range(0..self.items.len());
            std::mem::replace(&mut self.items[slot], fresh)
        } else {
            fresh
        }
    }

    pub fn get_all(&self) -> &[T] {
        &self.items
    }

    /// Draw `count` stored samples uniformly with replacement.
    pub fn get_random(&self, count: usize, rng: &mut impl Rng) -> Option<Vec<T>> {
        if self.items.is_empty() || count == 0 {
            return None;
        }
        Some(
            (0..count)
                .map(|_| self.items[rng.gen_range(0..self.items.len())].clone())
                .collect(),
        )
    }
}

impl<B: Backend> ImagePool<Tensor<B, 4>> {
    /// Run a whole batch through the pool one sample at a time.
    pub fn query_batch(&mut self, batch: Tensor<B, 4>, rng: &mut impl Rng) -> Tensor<B, 4> {
        if self.capacity == 0 {
            return batch;
        }
        let samples = split_batch(batch);
        let returned = samples
            .into_iter()
            .map(|sample| self.query(sample, rng))
            .collect::<Vec<_>>();
        Tensor::cat(returned, 0)
    }

    pub fn get_all_batch(&self) -> Option<Tensor<B, 4>> {
        if self.items.is_empty() {
            return None;
        }
        Some(Tensor::cat(self.items.clone(), 0))
    }

    pub fn get_random_batch(&self, count: usize, rng: &mut impl Rng) -> Option<Tensor<B, 4>> {
        self.get_random(count, rng)
            .map(|samples| Tensor::cat(samples, 0))
    }
}

fn split_batch<B: Backend>(batch: Tensor<B, 4>) -> Vec<Tensor<B, 4>> {
    let batch_size = batch.dims()[0];
    (0..batch_size)
        .map(|idx| batch.clone().slice_dim(0, idx..idx + 1))
        .collect()
}

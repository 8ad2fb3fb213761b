use burn::module::{Module, ModuleMapper, ModuleVisitor, Param, ParamId};
use burn::prelude::*;
use std::collections::HashMap;

/// Shadow copy of a module whose weights trail the live ones:
/// `shadow = beta * shadow + (1 - beta) * live`.
///
/// Parameters are matched by id, so the live module must share its
/// parameter ids with the one the shadow was created from (as `valid()`
/// guarantees).
#[derive(Clone, Debug)]
pub struct EmaModel<M> {
    model: M,
    beta: f64,
}

impl<M> EmaModel<M> {
    pub fn new(model: M, beta: f64) -> Self {
        Self {
            model,
            beta: beta.clamp(0.0, 1.0),
        }
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn beta(&self) -> f64 {
        self.beta
    }
}

impl<M> EmaModel<M> {
    pub fn update<B: Backend>(&mut self, live: &M)
    where
        M: Module<B>,
    {
        let mut snapshot = ParamSnapshot::<B>::default();
        live.visit(&mut snapshot);
        let mut mapper = EmaMapper {
            beta: self.beta,
            live: snapshot.params,
        };
        self.model = self.model.clone().map(&mut mapper);
    }
}

#[derive(Default)]
struct ParamSnapshot<B: Backend> {
    params: HashMap<ParamId, Tensor<B, 1>>,
}

impl<B: Backend> ModuleVisitor<B> for ParamSnapshot<B> {
    fn visit_float<const D: usize>(&mut self, param: &Param<Tensor<B, D>>) {
        let tensor = param.val();
        let numel = tensor.shape().num_elements();
        self.params.insert(param.id, tensor.reshape([numel]));
    }
}

struct EmaMapper<B: Backend> {
    beta: f64,
    live: HashMap<ParamId, Tensor<B, 1>>,
}

impl<B: Backend> ModuleMapper<B> for EmaMapper<B> {
    fn map_float<const D: usize>(&mut self, param: Param<Tensor<B, D>>) -> Param<Tensor<B, D>> {
        let Some(live) = self.live.remove(&param.id) else {
            return param;
        };
        let beta = self.beta;
        param.map(|shadow| {
            let dims = shadow.dims();
            shadow.mul_scalar(beta) + live.reshape(dims).mul_scalar(1.0 - beta)
        })
    }
}

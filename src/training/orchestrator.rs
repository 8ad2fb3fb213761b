use crate::data::CutBatch;
use crate::error::{TrainError, TrainResult};
use crate::loss::{
    cross_entropy, l1, mse, scalar_value, segmentation_cross_entropy, temporal_consistency,
    LossConfig, NceCriterion, Scalar,
};
use crate::model::{
    Classifier, Discriminator, Generator, MultimodalEncoder, Networks, PatchSampleF, Segmenter,
};
use crate::pool::ImagePool;
use crate::training::accumulator::{IterCalculator, RunningLosses};
use crate::training::accuracy::DiscriminatorAccuracy;
use crate::training::context::{StepContext, TensorKey};
use crate::training::ema::EmaModel;
use crate::training::group::{
    cut_groups, validate_groups, BackwardFn, ForwardFn, NetworkGroup, OptimizerId, Recipe, CLS,
    F_S, G_MSE_IDT, G_NCE, G_NCE_Y, G_SEM_CLS, G_SEM_MASK, G_SEM_MASK_IDT, G_TEMPORAL, G_Z,
};
use crate::training::registry::{DiscriminatorRegistry, G_TOTAL};
use crate::training::TrainingConfig;
use burn::module::AutodiffModule;
use burn::optim::adaptor::OptimizerAdaptor;
use burn::optim::{Adam, AdamConfig, GradientsAccumulator, GradientsParams, Optimizer};
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::Distribution;
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Adam state and pending gradients of one network.
struct NetworkOptimizer<B: AutodiffBackend, M: AutodiffModule<B>> {
    optim: OptimizerAdaptor<Adam, M, B>,
    accumulator: GradientsAccumulator<M>,
    base_lr: f64,
}

impl<B: AutodiffBackend, M: AutodiffModule<B>> NetworkOptimizer<B, M> {
    fn new(config: &AdamConfig, base_lr: f64) -> Self {
        Self {
            optim: config.init::<B, M>(),
            accumulator: GradientsAccumulator::new(),
            base_lr,
        }
    }

    /// Move this network's gradients out of `grads` into the accumulator.
    fn accumulate(&mut self, module: &M, grads: &mut B::Gradients) {
        let params = GradientsParams::from_module::<B, M>(grads, module);
        self.accumulator.accumulate::<B>(module, params);
    }

    fn step(&mut self, module: M, lr_factor: f64) -> M {
        let grads = self.accumulator.grads();
        if grads.is_empty() {
            return module;
        }
        self.optim.step(self.base_lr * lr_factor, module, grads)
    }
}

struct Optimizers<B: AutodiffBackend> {
    g: NetworkOptimizer<B, Generator<B>>,
    f: NetworkOptimizer<B, PatchSampleF<B>>,
    e: Option<NetworkOptimizer<B, MultimodalEncoder<B>>>,
    d: NetworkOptimizer<B, Vec<Discriminator<B>>>,
    cls: Option<NetworkOptimizer<B, Classifier<B>>>,
    f_s: Option<NetworkOptimizer<B, Segmenter<B>>>,
}

/// Result of one call to [`GanTrainer::optimize_parameters`].
#[derive(Clone, Debug)]
pub struct StepOutput {
    pub step: usize,
    pub losses: BTreeMap<String, f64>,
    /// Whether the optimizers stepped (last micro-step of the window).
    pub stepped: bool,
}

/// Runs the ordered network groups of a CUT recipe, one batch at a time.
///
/// Owns the networks, their optimizers, the discriminator registry, the
/// sample pools and the iteration counter that drives every cadence.
pub struct GanTrainer<B: AutodiffBackend> {
    networks: Networks<B>,
    optimizers: Optimizers<B>,
    registry: DiscriminatorRegistry,
    groups: Vec<NetworkGroup>,
    recipe: Recipe,
    loss: LossConfig,
    nce: NceCriterion,
    nz: usize,
    cls_regression: bool,
    fake_pool: ImagePool<Tensor<B, 4>>,
    real_pool: ImagePool<Tensor<B::InnerBackend, 4>>,
    ema: Option<EmaModel<Generator<B::InnerBackend>>>,
    iter: IterCalculator,
    running: RunningLosses,
    last_losses: BTreeMap<String, f64>,
    backpropagated: BTreeMap<String, f64>,
    lr_factor: f64,
    rng: StdRng,
    device: B::Device,
    niter: usize,
}

impl<B: AutodiffBackend> GanTrainer<B> {
    /// Build every network of the recipe and check the group dataflow.
    pub fn new(config: &TrainingConfig, device: &B::Device) -> TrainResult<Self> {
        let registry = DiscriminatorRegistry::from_names(
            &config.d_net_ds,
            &config.loss,
            &config.apa,
            config.batch_size,
            config.d_temporal_every,
        )?;
        let networks = config.model.init_networks::<B>(
            &config.loss.nce_layers,
            &registry.network_configs(&config.model, config.temporal_frames),
            device,
        )?;

        let nce = config.loss.lambda_nce > 0.0;
        let recipe = Recipe {
            nce,
            nce_idt: nce && config.loss.nce_idt,
            mse_idt: config.loss.mse_idt,
            multimodal: config.model.multimodal,
            noisy: config.loss.d_noise > 0.0,
            semantic_cls: config.model.semantic_cls,
            semantic_mask: config.model.semantic_mask,
            sem_idt: config.loss.sem_idt,
            temporal: config.temporal_frames > 1,
            temporal_criterion: config.loss.temporal_criterion,
            ema: config.ema,
            discriminators: registry.descriptors().to_vec(),
        };
        let groups = cut_groups(&recipe);
        validate_groups(&groups, &recipe, |id| networks.contains(id))?;
        info!(
            groups = ?groups.iter().map(|g| g.name.as_str()).collect::<Vec<_>>(),
            discriminators = ?registry.descriptors().iter().map(|d| d.name.as_str()).collect::<Vec<_>>(),
            "assembled training recipe"
        );

        let optimizers = Optimizers {
            g: NetworkOptimizer::new(&config.optimizer_g, config.lr_g),
            f: NetworkOptimizer::new(&config.optimizer_g, config.lr_g),
            e: networks
                .e
                .as_ref()
                .map(|_| NetworkOptimizer::new(&config.optimizer_g, config.lr_g)),
            d: NetworkOptimizer::new(&config.optimizer_d, config.lr_d),
            cls: networks
                .cls
                .as_ref()
                .map(|_| NetworkOptimizer::new(&config.optimizer_sem, config.lr_sem)),
            f_s: networks
                .f_s
                .as_ref()
                .map(|_| NetworkOptimizer::new(&config.optimizer_sem, config.lr_sem)),
        };
        let ema = config
            .ema
            .then(|| EmaModel::new(networks.g_a.valid(), config.ema_beta));

        Ok(Self {
            networks,
            optimizers,
            registry,
            groups,
            recipe,
            loss: config.loss.clone(),
            nce: NceCriterion::new(
                config.loss.nce_loss,
                config.loss.nce_t,
                config.loss.nce_includes_all_negatives_from_minibatch,
            )
            .with_sinkhorn(config.loss.monce_eps, config.loss.monce_iters),
            nz: config.model.nz,
            cls_regression: config.model.cls_regression,
            fake_pool: ImagePool::new(config.pool_size),
            real_pool: ImagePool::new(config.pool_size),
            ema,
            iter: IterCalculator::new(config.iter_size),
            running: RunningLosses::new(),
            last_losses: BTreeMap::new(),
            backpropagated: BTreeMap::new(),
            lr_factor: 1.0,
            rng: StdRng::seed_from_u64(config.seed),
            device: device.clone(),
            niter: 0,
        })
    }

    pub fn networks(&self) -> &Networks<B> {
        &self.networks
    }

    pub fn groups(&self) -> &[NetworkGroup] {
        &self.groups
    }

    pub fn registry(&self) -> &DiscriminatorRegistry {
        &self.registry
    }

    pub fn ema_generator(&self) -> Option<&Generator<B::InnerBackend>> {
        self.ema.as_ref().map(EmaModel::model)
    }

    /// Replace the networks (and EMA shadow) with restored ones.
    pub fn restore(&mut self, networks: Networks<B>, ema: Option<Generator<B::InnerBackend>>) {
        self.networks = networks;
        if let Some(shadow) = self.ema.as_mut() {
            let beta = shadow.beta();
            let model = ema.unwrap_or_else(|| self.networks.g_a.valid());
            *shadow = EmaModel::new(model, beta);
        }
    }

    pub fn niter(&self) -> usize {
        self.niter
    }

    pub fn set_niter(&mut self, niter: usize) {
        self.niter = niter;
    }

    /// Scale applied to every base learning rate.
    pub fn set_lr_factor(&mut self, factor: f64) {
        self.lr_factor = factor;
    }

    pub fn last_losses(&self) -> &BTreeMap<String, f64> {
        &self.last_losses
    }

    /// Scalar each group passed to `backward()` in the latest step, after
    /// the `iter_size` scaling.
    pub fn backpropagated(&self) -> &BTreeMap<String, f64> {
        &self.backpropagated
    }

    /// Running means since the last call.
    pub fn take_running_losses(&mut self) -> BTreeMap<String, f64> {
        self.running.take()
    }

    /// `<loss>_avg` values of the last completed accumulation window.
    pub fn window_averages(&self) -> &BTreeMap<String, f64> {
        self.iter.averages()
    }

    /// Current augmentation probability per discriminator using it.
    pub fn apa_probabilities(&self) -> Vec<(String, f64)> {
        self.registry
            .descriptors()
            .iter()
            .zip(self.registry.calculators())
            .filter_map(|(d, c)| c.apa().map(|apa| (d.name.clone(), apa.p())))
            .collect()
    }

    /// One training iteration: every group in order, then per-step bookkeeping.
    pub fn optimize_parameters(&mut self, batch: CutBatch<B>) -> TrainResult<StepOutput> {
        let mut ctx = self.start_step(batch)?;
        for index in 0..self.groups.len() {
            self.run_group(index, &mut ctx)?;
        }
        Ok(self.finish_step(ctx))
    }

    /// Advance the iteration counter and bind the batch into a fresh context.
    pub fn start_step(&mut self, batch: CutBatch<B>) -> TrainResult<StepContext<B>> {
        self.niter += 1;
        self.begin_step(batch)
    }

    /// Forward, backward and (on the last micro-step) optimizer step of the
    /// group at `index`.
    pub fn run_group(&mut self, index: usize, ctx: &mut StepContext<B>) -> TrainResult<()> {
        let group = self.groups.get(index).cloned().ok_or_else(|| {
            TrainError::InvalidConfig(format!(
                "no network group at index {index} ({} groups)",
                self.groups.len()
            ))
        })?;
        let last_micro_step = self.iter.is_last();
        self.execute_group(&group, ctx, last_micro_step)
    }

    /// Cadence updates and loss bookkeeping once every group has run.
    pub fn finish_step(&mut self, ctx: StepContext<B>) -> StepOutput {
        let step = ctx.step();
        let stepped = self.iter.is_last();
        self.registry.update(step);

        let losses = ctx.loss_values();
        self.iter.finish(&losses);
        self.running.push(&losses);
        self.last_losses = losses.clone();
        debug!(step, stepped, ?losses, "finished training step");

        StepOutput {
            step,
            losses,
            stepped,
        }
    }

    /// Translate domain A images with the EMA generator when kept, the live
    /// one otherwise. Multimodal runs draw a fresh latent code.
    pub fn translate(&self, real_a: Tensor<B::InnerBackend, 4>) -> Tensor<B::InnerBackend, 4> {
        let live;
        let generator = match self.ema_generator() {
            Some(shadow) => shadow,
            None => {
                live = self.networks.g_a.valid();
                &live
            }
        };
        let z = self.recipe.multimodal.then(|| {
            let batch = real_a.dims()[0];
            Tensor::random([batch, self.nz], Distribution::Normal(0.0, 1.0), &real_a.device())
        });
        generator.forward(with_latent(real_a, z.as_ref()))
    }

    /// Precision, recall and accuracy of every default-key discriminator on
    /// the stored real and fake samples.
    pub fn discriminator_accuracy(&self) -> Vec<(String, DiscriminatorAccuracy)> {
        let (Some(real), Some(fake)) = (self.real_pool.get_all_batch(), self.fake_pool.get_all_batch())
        else {
            return Vec::new();
        };
        let fake = fake.inner();
        let discriminators = self.networks.discriminators.valid();
        self.registry
            .descriptors()
            .iter()
            .zip(self.registry.calculators())
            .zip(&discriminators)
            .filter(|((descriptor, _), _)| descriptor.fake_key.is_none())
            .map(|((descriptor, calculator), net)| {
                let stats =
                    DiscriminatorAccuracy::evaluate(net, calculator.mode(), real.clone(), fake.clone());
                (descriptor.name.clone(), stats)
            })
            .collect()
    }

    fn begin_step(&self, batch: CutBatch<B>) -> TrainResult<StepContext<B>> {
        let mut ctx = StepContext::new(self.niter, &self.device);
        ctx.put_image(TensorKey::RealA, batch.real_a);
        ctx.put_image(TensorKey::RealB, batch.real_b);
        if let Some(labels) = batch.class_a {
            ctx.put_labels(TensorKey::LabelClsA, labels);
        }
        if let Some(mask) = batch.mask_a {
            ctx.put_mask(TensorKey::LabelMaskA, mask);
        }
        if let Some(mask) = batch.mask_b {
            ctx.put_mask(TensorKey::LabelMaskB, mask);
        }
        if let Some(frames) = batch.frames_a {
            ctx.put_sequence(TensorKey::TemporalRealA, frames);
        }
        if let Some(frames) = batch.frames_b {
            ctx.put_image(TensorKey::TemporalRealB, stack_frames(frames));
        }

        match self.recipe.batch_keys().into_iter().find(|key| !ctx.contains(*key)) {
            Some(key) => Err(TrainError::MissingTensor {
                key,
                consumer: "batch".to_string(),
            }),
            None => Ok(ctx),
        }
    }

    fn execute_group(
        &mut self,
        group: &NetworkGroup,
        ctx: &mut StepContext<B>,
        last_micro_step: bool,
    ) -> TrainResult<()> {
        for function in &group.forward_functions {
            self.run_forward(*function, ctx)?;
        }
        for function in &group.backward_functions {
            self.run_backward(*function, ctx)?;
        }

        let mut total: Scalar<B> = Tensor::zeros([1], &self.device);
        for name in &group.loss_backward {
            let value = ctx.require_loss(name, &group.name)?;
            let current = scalar_value(&value);
            if !current.is_finite() {
                return Err(TrainError::NonFinite {
                    loss: name.clone(),
                    group: group.name.clone(),
                    step: ctx.step(),
                    value: current,
                });
            }
            total = total + value;
        }

        let total = total.div_scalar(self.iter.iter_size() as f64);
        self.backpropagated
            .insert(group.name.clone(), scalar_value(&total));
        let mut grads = total.backward();
        for &optimizer in &group.optimizers {
            self.accumulate(optimizer, &mut grads);
        }
        if last_micro_step {
            for &optimizer in &group.optimizers {
                self.step(optimizer);
            }
            if !group.networks_to_ema.is_empty() {
                if let Some(ema) = self.ema.as_mut() {
                    ema.update(&self.networks.g_a.valid());
                }
            }
        }

        ctx.detach_all();
        Ok(())
    }

    fn accumulate(&mut self, optimizer: OptimizerId, grads: &mut B::Gradients) {
        let nets = &self.networks;
        let optim = &mut self.optimizers;
        match optimizer {
            OptimizerId::G => optim.g.accumulate(&nets.g_a, grads),
            OptimizerId::F => optim.f.accumulate(&nets.f, grads),
            OptimizerId::E => {
                if let (Some(o), Some(m)) = (optim.e.as_mut(), nets.e.as_ref()) {
                    o.accumulate(m, grads);
                }
            }
            OptimizerId::D => optim.d.accumulate(&nets.discriminators, grads),
            OptimizerId::Cls => {
                if let (Some(o), Some(m)) = (optim.cls.as_mut(), nets.cls.as_ref()) {
                    o.accumulate(m, grads);
                }
            }
            OptimizerId::FS => {
                if let (Some(o), Some(m)) = (optim.f_s.as_mut(), nets.f_s.as_ref()) {
                    o.accumulate(m, grads);
                }
            }
        }
    }

    fn step(&mut self, optimizer: OptimizerId) {
        let factor = self.lr_factor;
        let nets = &mut self.networks;
        let optim = &mut self.optimizers;
        match optimizer {
            OptimizerId::G => nets.g_a = optim.g.step(nets.g_a.clone(), factor),
            OptimizerId::F => nets.f = optim.f.step(nets.f.clone(), factor),
            OptimizerId::E => {
                if let (Some(o), Some(m)) = (optim.e.as_mut(), nets.e.as_mut()) {
                    *m = o.step(m.clone(), factor);
                }
            }
            OptimizerId::D => {
                nets.discriminators = optim.d.step(nets.discriminators.clone(), factor)
            }
            OptimizerId::Cls => {
                if let (Some(o), Some(m)) = (optim.cls.as_mut(), nets.cls.as_mut()) {
                    *m = o.step(m.clone(), factor);
                }
            }
            OptimizerId::FS => {
                if let (Some(o), Some(m)) = (optim.f_s.as_mut(), nets.f_s.as_mut()) {
                    *m = o.step(m.clone(), factor);
                }
            }
        }
    }

    fn run_forward(&mut self, function: ForwardFn, ctx: &mut StepContext<B>) -> TrainResult<()> {
        match function {
            ForwardFn::Cut => self.forward_cut(ctx),
            ForwardFn::Gan => self.forward_gan(ctx),
            ForwardFn::Encoder => {
                let fake_b = ctx.image(TensorKey::FakeB, "forward_E")?;
                let mu2 = self.encoder()?.forward(fake_b);
                ctx.put_matrix(TensorKey::Mu2, mu2);
                Ok(())
            }
            ForwardFn::SemanticFake => self.forward_semantic_fake(ctx),
            ForwardFn::ClassifierReal => {
                let real_a = ctx.image(TensorKey::RealA, "forward_CLS")?;
                let pred = self.classifier()?.forward(real_a);
                ctx.put_matrix(TensorKey::PredClsRealA, pred);
                Ok(())
            }
            ForwardFn::SegmenterReal => {
                let real_a = ctx.image(TensorKey::RealA, "forward_f_s")?;
                let pred = self.segmenter()?.forward(real_a);
                ctx.put_image(TensorKey::PredFsRealA, pred);
                Ok(())
            }
        }
    }

    fn run_backward(&mut self, function: BackwardFn, ctx: &mut StepContext<B>) -> TrainResult<()> {
        match function {
            BackwardFn::GeneratorLoss => self.compute_g_loss(ctx),
            BackwardFn::EncoderLoss => {
                let value = self.latent_loss(ctx)?;
                ctx.set_loss(G_Z, value);
                Ok(())
            }
            BackwardFn::DiscriminatorLoss => self.compute_d_loss(ctx),
            BackwardFn::ClassifierLoss => {
                let pred = ctx.matrix(TensorKey::PredClsRealA, CLS)?;
                let labels = ctx.labels(TensorKey::LabelClsA, CLS)?;
                let value = self.classification_loss(pred, labels);
                ctx.set_loss(CLS, value);
                Ok(())
            }
            BackwardFn::SegmenterLoss => {
                let pred = ctx.image(TensorKey::PredFsRealA, F_S)?;
                let mask = ctx.mask(TensorKey::LabelMaskA, F_S)?;
                ctx.set_loss(F_S, segmentation_cross_entropy(pred, mask));
                Ok(())
            }
        }
    }

    fn forward_cut(&mut self, ctx: &mut StepContext<B>) -> TrainResult<()> {
        let real_a = ctx.image(TensorKey::RealA, "forward_cut")?;
        let batch = real_a.dims()[0];

        let mut real = if self.recipe.identity() {
            let real_b = ctx.image(TensorKey::RealB, "forward_cut")?;
            Tensor::cat(vec![real_a.clone(), real_b], 0)
        } else {
            real_a.clone()
        };
        let flipped = self.loss.flip_equivariance && self.rng.gen_bool(0.5);
        if flipped {
            real = real.flip([3]);
        }
        ctx.set_flipped_for_equivariance(flipped);

        let z = if self.recipe.multimodal {
            let z = Tensor::<B, 2>::random([batch, self.nz], Distribution::Normal(0.0, 1.0), &self.device);
            ctx.put_matrix(TensorKey::ZRandom, z.clone());
            Some(z)
        } else {
            None
        };

        let fake = self.networks.g_a.forward(with_latent(real.clone(), z.as_ref()));
        let total = fake.dims()[0];
        let fake_b = fake.clone().slice_dim(0, 0..batch);
        if self.recipe.identity() {
            ctx.put_image(TensorKey::IdtB, fake.clone().slice_dim(0, batch..total));
        }
        ctx.put_image(TensorKey::Real, real);
        ctx.put_image(TensorKey::Fake, fake);
        ctx.put_image(TensorKey::FakeB, fake_b.clone());
        ctx.put_image(TensorKey::DiffRealAFakeB, real_a.sub(fake_b.clone()));

        if self.recipe.noisy {
            let real_b = ctx.image(TensorKey::RealB, "forward_cut")?;
            let std = self.loss.d_noise;
            ctx.put_image(TensorKey::FakeBNoisy, add_noise(fake_b.clone(), std));
            ctx.put_image(TensorKey::RealBNoisy, add_noise(real_b, std));
        }
        if self.recipe.multimodal {
            let mu2 = self.encoder()?.forward(fake_b);
            ctx.put_matrix(TensorKey::Mu2, mu2);
        }
        Ok(())
    }

    fn forward_gan(&mut self, ctx: &mut StepContext<B>) -> TrainResult<()> {
        let real_b = ctx.image(TensorKey::RealB, "forward_GAN")?;
        let _ = self.real_pool.query_batch(real_b.inner(), &mut self.rng);

        if !self.recipe.temporal {
            return Ok(());
        }
        let frames = ctx.sequence(TensorKey::TemporalRealA, "forward_GAN")?;
        let [batch, count, channels, height, width] = frames.dims();
        let flat = frames.reshape([batch * count, channels, height, width]);
        let z = if self.recipe.multimodal {
            let z = ctx.matrix(TensorKey::ZRandom, "forward_GAN")?;
            let nz = z.dims()[1];
            Some(z.reshape([batch, 1, nz]).repeat_dim(1, count).reshape([batch * count, nz]))
        } else {
            None
        };

        let fakes = self.networks.g_a.forward(with_latent(flat, z.as_ref()));
        let out_channels = fakes.dims()[1];
        let sequence = fakes.reshape([batch, count, out_channels, height, width]);
        ctx.put_image(TensorKey::TemporalFakeB, stack_frames(sequence.clone()));
        ctx.put_sequence(TensorKey::TemporalFakeBFrames, sequence);
        Ok(())
    }

    fn forward_semantic_fake(&mut self, ctx: &mut StepContext<B>) -> TrainResult<()> {
        let fake_b = ctx.image(TensorKey::FakeB, "forward_semantic")?;
        if self.recipe.semantic_cls {
            let pred = self.classifier()?.forward(fake_b.clone());
            ctx.put_matrix(TensorKey::PredClsFakeB, pred);
        }
        if self.recipe.semantic_mask {
            let segmenter = self.segmenter()?;
            ctx.put_image(TensorKey::PredFsFakeB, segmenter.forward(fake_b));
            if self.recipe.sem_idt {
                let idt_b = ctx.image(TensorKey::IdtB, "forward_semantic")?;
                ctx.put_image(TensorKey::PredFsIdtB, segmenter.forward(idt_b));
            }
        }
        Ok(())
    }

    fn compute_g_loss(&mut self, ctx: &mut StepContext<B>) -> TrainResult<()> {
        let mut total = self
            .registry
            .compute_g_losses(&self.networks.discriminators, ctx)?;
        let z = if self.recipe.multimodal {
            Some(ctx.matrix(TensorKey::ZRandom, G_TOTAL)?)
        } else {
            None
        };
        let flipped = ctx.flipped_for_equivariance();

        if self.recipe.nce {
            let real_a = ctx.image(TensorKey::RealA, G_NCE)?;
            let fake_b = ctx.image(TensorKey::FakeB, G_NCE)?;
            let nce = self.nce_loss(real_a, fake_b, z.as_ref(), flipped);
            ctx.set_loss(G_NCE, nce.clone());
            let both = if self.recipe.nce_idt {
                let real_b = ctx.image(TensorKey::RealB, G_NCE_Y)?;
                let idt_b = ctx.image(TensorKey::IdtB, G_NCE_Y)?;
                let nce_y = self.nce_loss(real_b, idt_b, z.as_ref(), flipped);
                ctx.set_loss(G_NCE_Y, nce_y.clone());
                nce.add(nce_y).mul_scalar(0.5)
            } else {
                nce
            };
            total = total + both;
        } else {
            ctx.set_zero_loss(G_NCE);
        }

        if self.recipe.mse_idt {
            let real_b = ctx.image(TensorKey::RealB, G_MSE_IDT)?;
            let idt_b = ctx.image(TensorKey::IdtB, G_MSE_IDT)?;
            let value = l1(idt_b, real_b).mul_scalar(self.loss.lambda_mse_idt);
            ctx.set_loss(G_MSE_IDT, value.clone());
            total = total + value;
        }

        if self.recipe.multimodal {
            let value = self.latent_loss(ctx)?;
            ctx.set_loss(G_Z, value.clone());
            total = total + value;
        }

        if self.recipe.semantic_cls {
            if self.semantic_open(CLS) {
                let pred = ctx.matrix(TensorKey::PredClsFakeB, G_SEM_CLS)?;
                let labels = ctx.labels(TensorKey::LabelClsA, G_SEM_CLS)?;
                let value = self
                    .classification_loss(pred, labels)
                    .mul_scalar(self.loss.lambda_sem_cls);
                ctx.set_loss(G_SEM_CLS, value.clone());
                total = total + value;
            } else {
                ctx.set_zero_loss(G_SEM_CLS);
            }
        }

        if self.recipe.semantic_mask {
            let open = self.semantic_open(F_S);
            let terms = [
                (G_SEM_MASK, TensorKey::PredFsFakeB, TensorKey::LabelMaskA, true),
                (G_SEM_MASK_IDT, TensorKey::PredFsIdtB, TensorKey::LabelMaskB, self.recipe.sem_idt),
            ];
            for (name, pred_key, mask_key, active) in terms {
                if !active {
                    continue;
                }
                if !open {
                    ctx.set_zero_loss(name);
                    continue;
                }
                let pred = ctx.image(pred_key, name)?;
                let mask = ctx.mask(mask_key, name)?;
                let value = segmentation_cross_entropy(pred, mask).mul_scalar(self.loss.lambda_sem_mask);
                ctx.set_loss(name, value.clone());
                total = total + value;
            }
        }

        if self.recipe.temporal_criterion {
            let frames = ctx.sequence(TensorKey::TemporalFakeBFrames, G_TEMPORAL)?;
            let value = temporal_consistency(frames, self.loss.temporal_criterion_kind)
                .mul_scalar(self.loss.lambda_temporal);
            ctx.set_loss(G_TEMPORAL, value.clone());
            total = total + value;
        }

        ctx.set_loss(G_TOTAL, total);
        Ok(())
    }

    fn compute_d_loss(&mut self, ctx: &mut StepContext<B>) -> TrainResult<()> {
        let noisy = self.recipe.noisy;
        let uses_pool = self
            .registry
            .descriptors()
            .iter()
            .any(|descriptor| descriptor.fake_key.is_none());

        let (pooled, fake_2) = if uses_pool {
            let key = if noisy {
                TensorKey::FakeBNoisy
            } else {
                TensorKey::FakeB
            };
            let fresh = ctx.image(key, "fake pool")?.detach();
            let batch = fresh.dims()[0];
            let fake_2 = if self.registry.wants_apa_images() {
                self.fake_pool.get_random_batch(batch, &mut self.rng)
            } else {
                None
            };
            if let Some(buffered) = &fake_2 {
                ctx.put_image(TensorKey::ApaImg, buffered.clone());
            }
            (Some(self.fake_pool.query_batch(fresh, &mut self.rng)), fake_2)
        } else {
            (None, None)
        };

        self.registry
            .compute_d_losses(&self.networks.discriminators, ctx, pooled, fake_2, noisy)
    }

    /// Layer-averaged patch contrastive loss between `src` and its translation `tgt`.
    fn nce_loss(
        &mut self,
        src: Tensor<B, 4>,
        tgt: Tensor<B, 4>,
        z: Option<&Tensor<B, 2>>,
        flipped: bool,
    ) -> Scalar<B> {
        let layers = &self.loss.nce_layers;
        let batch = src.dims()[0];

        let mut feat_q = self.networks.g_a.extract_features(with_latent(tgt, z), layers);
        if flipped {
            feat_q = feat_q.into_iter().map(|feat| feat.flip([3])).collect();
        }
        let feat_k = self.networks.g_a.extract_features(with_latent(src, z), layers);

        let num_patches = self.loss.num_patches;
        let (pool_k, ids) = self.networks.f.sample(&feat_k, num_patches, None, &mut self.rng);
        let (pool_q, _) = self
            .networks
            .f
            .sample(&feat_q, num_patches, Some(&ids), &mut self.rng);

        let mut total = Tensor::zeros([1], &self.device);
        for (q, k) in pool_q.into_iter().zip(pool_k) {
            total = total + self.nce.loss(q, k, batch).mul_scalar(self.loss.lambda_nce);
        }
        total.div_scalar(layers.len().max(1) as f64)
    }

    fn latent_loss(&self, ctx: &StepContext<B>) -> TrainResult<Scalar<B>> {
        let mu2 = ctx.matrix(TensorKey::Mu2, G_Z)?;
        let z = ctx.matrix(TensorKey::ZRandom, G_Z)?;
        Ok(l1(mu2, z).mul_scalar(self.loss.lambda_z))
    }

    fn classification_loss(&self, pred: Tensor<B, 2>, labels: Tensor<B, 1, Int>) -> Scalar<B> {
        if self.cls_regression {
            let batch = pred.dims()[0];
            mse(pred.reshape([batch]), labels.float())
        } else {
            cross_entropy(pred, labels)
        }
    }

    /// Semantic generator terms wait until their network's previous loss
    /// is at or below the threshold.
    fn semantic_open(&self, network_loss: &str) -> bool {
        self.last_losses
            .get(network_loss)
            .is_some_and(|value| *value <= self.loss.semantic_threshold)
    }

    fn encoder(&self) -> TrainResult<&MultimodalEncoder<B>> {
        self.networks
            .e
            .as_ref()
            .ok_or_else(|| TrainError::InvalidConfig("multimodal encoder was not built".to_string()))
    }

    fn classifier(&self) -> TrainResult<&Classifier<B>> {
        self.networks
            .cls
            .as_ref()
            .ok_or_else(|| TrainError::InvalidConfig("semantic classifier was not built".to_string()))
    }

    fn segmenter(&self) -> TrainResult<&Segmenter<B>> {
        self.networks
            .f_s
            .as_ref()
            .ok_or_else(|| TrainError::InvalidConfig("semantic segmenter was not built".to_string()))
    }
}

/// Append a latent code as constant planes; `z` rows repeat to cover the batch.
fn with_latent<B: Backend>(images: Tensor<B, 4>, z: Option<&Tensor<B, 2>>) -> Tensor<B, 4> {
    let Some(z) = z else {
        return images;
    };
    let [batch, _, height, width] = images.dims();
    let [z_batch, nz] = z.dims();
    let z = if z_batch == batch {
        z.clone()
    } else {
        z.clone().repeat_dim(0, batch / z_batch.max(1))
    };
    let planes = z
        .reshape([batch, nz, 1, 1])
        .repeat_dim(2, height)
        .repeat_dim(3, width);
    Tensor::cat(vec![images, planes], 1)
}

/// `[batch, T, c, h, w]` to `[batch, T * c, h, w]`.
pub fn stack_frames<B: Backend>(frames: Tensor<B, 5>) -> Tensor<B, 4> {
    let [batch, count, channels, height, width] = frames.dims();
    frames.reshape([batch, count * channels, height, width])
}

fn add_noise<B: Backend>(images: Tensor<B, 4>, std: f64) -> Tensor<B, 4> {
    let noise = Tensor::random(images.shape(), Distribution::Normal(0.0, std), &images.device());
    images + noise
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ModelConfig;
    use burn::backend::{Autodiff, NdArray};
    use burn::tensor::TensorData;

    type B = Autodiff<NdArray<f32>>;

    fn config() -> TrainingConfig {
        TrainingConfig::new("unused".to_string())
            .with_model(
                ModelConfig::new()
                    .with_ngf(4)
                    .with_n_blocks(1)
                    .with_ndf(4)
                    .with_d_n_layers(2)
                    .with_netf_nc(8),
            )
            .with_loss(LossConfig::new().with_nce_layers(vec![0, 2, 4]).with_num_patches(8))
            .with_batch_size(2)
            .with_pool_size(4)
    }

    fn batch(device: &<B as Backend>::Device) -> CutBatch<B> {
        CutBatch::new(
            Tensor::random([2, 3, 8, 8], Distribution::Uniform(-1.0, 1.0), device),
            Tensor::random([2, 3, 8, 8], Distribution::Uniform(-1.0, 1.0), device),
        )
    }

    #[test]
    fn every_declared_loss_is_bound_each_step() {
        let device = Default::default();
        let mut trainer = GanTrainer::<B>::new(&config(), &device).unwrap();
        let output = trainer.optimize_parameters(batch(&device)).unwrap();
        for group in trainer.groups() {
            for name in group.loss_names_list.iter().chain(&group.loss_backward) {
                assert!(output.losses.contains_key(name), "{name} missing");
                assert!(output.losses[name].is_finite());
            }
        }
        assert_eq!(output.step, 1);
        assert!(output.stepped);
    }

    #[test]
    fn generator_total_matches_its_terms() {
        let device = Default::default();
        let mut trainer = GanTrainer::<B>::new(&config(), &device).unwrap();
        let losses = trainer.optimize_parameters(batch(&device)).unwrap().losses;
        let expected = losses["G_GAN_D_B_basic"] + 0.5 * (losses["G_NCE"] + losses["G_NCE_Y"]);
        assert!((losses["G_tot"] - expected).abs() < 1e-4);
    }

    #[test]
    fn backpropagated_scalar_is_the_scaled_sum_of_claimed_losses() {
        let device = Default::default();
        let config = config().with_iter_size(2).with_model(
            ModelConfig::new()
                .with_ngf(4)
                .with_n_blocks(1)
                .with_ndf(4)
                .with_d_n_layers(2)
                .with_netf_nc(8)
                .with_multimodal(true)
                .with_nz(2),
        );
        let mut trainer = GanTrainer::<B>::new(&config, &device).unwrap();
        assert_eq!(
            trainer.groups()[0].loss_backward,
            vec![G_TOTAL.to_string(), G_Z.to_string()]
        );

        let mut ctx = trainer.start_step(batch(&device)).unwrap();
        for index in 0..trainer.groups().len() {
            let group = trainer.groups()[index].clone();
            trainer.run_group(index, &mut ctx).unwrap();
            let losses = ctx.loss_values();
            let claimed: f64 = group.loss_backward.iter().map(|name| losses[name]).sum();
            let passed = trainer.backpropagated()[&group.name];
            assert!(
                (passed - claimed / 2.0).abs() < 1e-4,
                "group {} passed {passed}, claimed {claimed}",
                group.name
            );
        }

        // G_z is part of G_tot and claimed again on its own.
        let losses = ctx.loss_values();
        assert!(losses[G_Z] > 0.0);
        let g_passed = trainer.backpropagated()["G"];
        assert!((g_passed - (losses[G_TOTAL] + losses[G_Z]) / 2.0).abs() < 1e-4);
    }

    #[test]
    fn missing_batch_field_is_a_configuration_error() {
        let device = Default::default();
        let config = config().with_model(
            ModelConfig::new()
                .with_ngf(4)
                .with_n_blocks(1)
                .with_ndf(4)
                .with_semantic_cls(true),
        );
        let mut trainer = GanTrainer::<B>::new(&config, &device).unwrap();
        assert!(matches!(
            trainer.optimize_parameters(batch(&device)),
            Err(TrainError::MissingTensor { key: TensorKey::LabelClsA, .. })
        ));
    }

    #[test]
    fn semantic_terms_wait_for_the_classifier() {
        let device = Default::default();
        let config = config()
            .with_model(
                ModelConfig::new()
                    .with_ngf(4)
                    .with_n_blocks(1)
                    .with_ndf(4)
                    .with_semantic_cls(true),
            )
            .with_loss(
                LossConfig::new()
                    .with_nce_layers(vec![0, 2])
                    .with_num_patches(8)
                    .with_semantic_threshold(100.0),
            );
        let mut trainer = GanTrainer::<B>::new(&config, &device).unwrap();
        let labelled = |device| {
            let mut batch = batch(device);
            batch.class_a = Some(Tensor::<B, 1, Int>::from_data(
                TensorData::new(vec![0i64, 1], [2]),
                device,
            ));
            batch
        };

        let first = trainer.optimize_parameters(labelled(&device)).unwrap().losses;
        assert_eq!(first["G_sem_cls_AB"], 0.0);
        assert!(first["CLS"] > 0.0);

        let second = trainer.optimize_parameters(labelled(&device)).unwrap().losses;
        assert!(second["G_sem_cls_AB"] > 0.0);
    }

    #[test]
    fn temporal_frames_feed_the_temporal_discriminator() {
        let device = Default::default();
        let frames = 2;
        let config = config()
            .with_d_net_ds(vec!["basic".to_string(), "temporal".to_string()])
            .with_d_temporal_every(2)
            .with_temporal_frames(frames)
            .with_loss(
                LossConfig::new()
                    .with_lambda_nce(0.0)
                    .with_temporal_criterion(true),
            );
        let mut trainer = GanTrainer::<B>::new(&config, &device).unwrap();
        let sequence = || {
            Tensor::<B, 5>::random([2, frames, 3, 8, 8], Distribution::Uniform(-1.0, 1.0), &device)
        };
        for step in 1..=2 {
            let mut batch = batch(&device);
            batch.frames_a = Some(sequence());
            batch.frames_b = Some(sequence());
            let losses = trainer.optimize_parameters(batch).unwrap().losses;
            if step == 1 {
                assert_eq!(losses["D_GAN_D_B_temporal"], 0.0);
            } else {
                assert_ne!(losses["D_GAN_D_B_temporal"], 0.0);
            }
            assert_eq!(losses["G_NCE"], 0.0);
            assert!(losses["G_temporal_criterion"] > 0.0);
        }
    }

    #[test]
    fn latent_planes_cover_the_whole_batch() {
        let device = Default::default();
        let images = Tensor::<NdArray<f32>, 4>::zeros([4, 3, 2, 2], &device);
        let z = Tensor::<NdArray<f32>, 2>::ones([2, 5], &device);
        assert_eq!(with_latent(images, Some(&z)).dims(), [4, 8, 2, 2]);
    }
}

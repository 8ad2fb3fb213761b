pub mod accumulator;
pub mod accuracy;
pub mod context;
pub mod ema;
pub mod group;
pub mod orchestrator;
pub mod registry;

pub use accumulator::{IterCalculator, RunningLosses};
pub use accuracy::DiscriminatorAccuracy;
pub use context::{StepContext, TensorKey};
pub use ema::EmaModel;
pub use group::{cut_groups, validate_groups, NetworkGroup, OptimizerId, Recipe};
pub use orchestrator::{GanTrainer, StepOutput};
pub use registry::{DiscriminatorDescriptor, DiscriminatorKind, DiscriminatorRegistry};

use crate::data::{CutBatch, CutBatcher, DataConfig, UnalignedDataset, UnalignedItem};
use crate::error::{TrainError, TrainResult};
use crate::loss::{ApaConfig, LossConfig};
use crate::model::{Generator, ModelConfig, Networks};
use crate::utils::save_sample_grid;
use anyhow::{Context, Result};
use burn::config::Config;
use burn::data::dataloader::{DataLoader, DataLoaderBuilder};
use burn::data::dataset::Dataset;
use burn::optim::lr_scheduler::LrScheduler;
use burn::optim::AdamConfig;
use burn::prelude::*;
use burn::record::{FullPrecisionSettings, NamedMpkFileRecorder, Record};
use burn::tensor::backend::AutodiffBackend;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Training configuration loaded from `config.json`.
#[derive(Config, Debug)]
pub struct TrainingConfig {
    pub data_dir: String,
    #[config(default = "String::from(\"train\")")]
    pub phase: String,
    #[config(default = "ModelConfig::new()")]
    pub model: ModelConfig,
    #[config(default = "LossConfig::new()")]
    pub loss: LossConfig,
    #[config(default = "ApaConfig::new()")]
    pub apa: ApaConfig,
    /// Discriminator kinds, one `D_B_<kind>` each.
    #[config(default = "vec![String::from(\"basic\")]")]
    pub d_net_ds: Vec<String>,
    #[config(default = 1)]
    pub d_temporal_every: usize,
    /// Frames per sample; more than one enables the temporal pipeline.
    #[config(default = 1)]
    pub temporal_frames: usize,
    #[config(default = 50)]
    pub pool_size: usize,
    #[config(default = 1)]
    pub batch_size: usize,
    /// Micro-steps per optimizer step.
    #[config(default = 1)]
    pub iter_size: usize,
    #[config(default = 256)]
    pub crop_size: u32,
    #[config(default = true)]
    pub flip: bool,
    /// Pair A and B images by index instead of drawing B at random.
    #[config(default = false)]
    pub serial_batches: bool,
    #[config(default = 2e-4)]
    pub lr_g: f64,
    #[config(default = 2e-4)]
    pub lr_d: f64,
    #[config(default = 2e-4)]
    pub lr_sem: f64,
    #[config(default = "AdamConfig::new().with_beta_1(0.5).with_beta_2(0.999)")]
    pub optimizer_g: AdamConfig,
    #[config(default = "AdamConfig::new().with_beta_1(0.5).with_beta_2(0.999)")]
    pub optimizer_d: AdamConfig,
    #[config(default = "AdamConfig::new().with_beta_1(0.5).with_beta_2(0.999)")]
    pub optimizer_sem: AdamConfig,
    /// Epochs at the base learning rate.
    #[config(default = 100)]
    pub n_epochs: usize,
    /// Epochs of linear decay to zero afterwards.
    #[config(default = 100)]
    pub n_epochs_decay: usize,
    #[config(default = false)]
    pub ema: bool,
    #[config(default = 0.999)]
    pub ema_beta: f64,
    #[config(default = 100)]
    pub print_every: usize,
    #[config(default = 1000)]
    pub d_accuracy_every: usize,
    #[config(default = 500)]
    pub sample_steps: usize,
    #[config(default = 5000)]
    pub checkpoint_steps: usize,
    #[config(default = 42)]
    pub seed: u64,
    #[config(default = false)]
    pub resume: bool,
}

impl TrainingConfig {
    /// What the dataset has to provide for this recipe.
    pub fn data_config(&self) -> DataConfig {
        DataConfig {
            crop_size: self.crop_size,
            flip: self.flip,
            temporal_frames: self.temporal_frames,
            class_labels: self.model.semantic_cls,
            masks_a: self.model.semantic_mask,
            masks_b: self.model.semantic_mask && self.loss.sem_idt,
            serial_batches: self.serial_batches,
        }
    }

    /// Whether real B also goes through the generator each step.
    pub fn identity_pass(&self) -> bool {
        let nce_idt = self.loss.lambda_nce > 0.0 && self.loss.nce_idt;
        nce_idt || self.loss.mse_idt || (self.model.semantic_mask && self.loss.sem_idt)
    }

    pub fn total_epochs(&self) -> usize {
        self.n_epochs + self.n_epochs_decay
    }
}

/// Persisted training state for resume support.
#[derive(Serialize, Deserialize, Default, Clone, Debug, PartialEq)]
pub struct TrainingState {
    pub step: usize,
    pub epoch: usize,
}

/// Constant for `n_epochs`, then linear decay to zero over `n_epochs_decay`.
///
/// Yields a factor applied to every base learning rate.
#[derive(Clone, Debug)]
pub struct LinearDecay {
    n_epochs: usize,
    n_epochs_decay: usize,
    epoch: usize,
}

#[derive(Record, Clone)]
pub struct LinearDecayRecord {
    epoch: usize,
}

impl LinearDecay {
    pub fn new(n_epochs: usize, n_epochs_decay: usize) -> Self {
        Self {
            n_epochs,
            n_epochs_decay,
            epoch: 0,
        }
    }

    /// Factor for the zero-based `epoch`.
    pub fn factor_at(&self, epoch: usize) -> f64 {
        let decayed = (epoch + 1).saturating_sub(self.n_epochs) as f64;
        (1.0 - decayed / (self.n_epochs_decay + 1) as f64).max(0.0)
    }
}

impl LrScheduler for LinearDecay {
    type Record<B: Backend> = LinearDecayRecord;

    fn step(&mut self) -> f64 {
        let factor = self.factor_at(self.epoch);
        self.epoch += 1;
        factor
    }

    fn to_record<B: Backend>(&self) -> Self::Record<B> {
        LinearDecayRecord { epoch: self.epoch }
    }

    fn load_record<B: Backend>(mut self, record: Self::Record<B>) -> Self {
        self.epoch = record.epoch;
        self
    }
}

/// Weights are kept at full precision so a resumed run continues from
/// exactly the saved parameters.
type CheckpointRecorder = NamedMpkFileRecorder<FullPrecisionSettings>;

fn networks_path(dir: &Path, step: usize) -> PathBuf {
    dir.join(format!("networks-{step}"))
}

fn ema_path(dir: &Path, step: usize) -> PathBuf {
    dir.join(format!("ema-generator-{step}"))
}

/// Save every network, and the EMA generator when kept, for `step`.
pub fn save_checkpoint<B: AutodiffBackend>(
    trainer: &GanTrainer<B>,
    dir: &Path,
    step: usize,
) -> TrainResult<()> {
    let recorder = CheckpointRecorder::new();
    trainer
        .networks()
        .clone()
        .save_file(networks_path(dir, step), &recorder)
        .map_err(|err| TrainError::Checkpoint {
            what: format!("networks at step {step}"),
            message: format!("{err:?}"),
        })?;
    if let Some(generator) = trainer.ema_generator() {
        generator
            .clone()
            .save_file(ema_path(dir, step), &recorder)
            .map_err(|err| TrainError::Checkpoint {
                what: format!("EMA generator at step {step}"),
                message: format!("{err:?}"),
            })?;
    }
    Ok(())
}

/// Load the networks saved at `step` into `trainer`.
pub fn load_checkpoint<B: AutodiffBackend>(
    trainer: &mut GanTrainer<B>,
    dir: &Path,
    step: usize,
    device: &B::Device,
) -> TrainResult<()> {
    let recorder = CheckpointRecorder::new();
    let networks: Networks<B> = trainer
        .networks()
        .clone()
        .load_file(networks_path(dir, step), &recorder, device)
        .map_err(|err| TrainError::Checkpoint {
            what: format!("networks at step {step}"),
            message: format!("{err:?}"),
        })?;
    let ema = match trainer.ema_generator() {
        Some(generator) => {
            let generator: Generator<B::InnerBackend> = generator
                .clone()
                .load_file(ema_path(dir, step), &recorder, device)
                .map_err(|err| TrainError::Checkpoint {
                    what: format!("EMA generator at step {step}"),
                    message: format!("{err:?}"),
                })?;
            Some(generator)
        }
        None => None,
    };
    trainer.restore(networks, ema);
    Ok(())
}

fn write_training_state(state_path: &Path, state: &TrainingState) -> Result<()> {
    let state_json =
        serde_json::to_string_pretty(state).context("failed to serialize training state")?;
    std::fs::write(state_path, state_json)
        .with_context(|| format!("failed to write {}", state_path.display()))
}

fn read_training_state(state_path: &Path) -> Result<TrainingState> {
    let contents = std::fs::read_to_string(state_path)
        .with_context(|| format!("failed to read {}", state_path.display()))?;
    serde_json::from_str(&contents)
        .with_context(|| format!("failed to parse {}", state_path.display()))
}

/// Resolve `data_dir` relative to the experiment directory if needed.
fn resolve_data_dir(experiment_dir: &Path, data_dir: &str) -> PathBuf {
    let candidate = PathBuf::from(data_dir);
    if candidate.is_relative() {
        experiment_dir.join(candidate)
    } else {
        candidate
    }
}

fn is_due(step: usize, every: usize) -> bool {
    every > 0 && step % every == 0
}

/// Train a CUT recipe with Burn, handling checkpoints, samples and resume.
pub fn train<B: AutodiffBackend>(
    experiment_dir: &Path,
    config: TrainingConfig,
    device: B::Device,
) -> Result<()> {
    let model_dir = experiment_dir.join("checkpoint");
    let sample_dir = experiment_dir.join("samples");
    std::fs::create_dir_all(&model_dir)
        .with_context(|| format!("failed to create {}", model_dir.display()))?;
    config.save(model_dir.join("config.json"))?;

    let state_path = model_dir.join("state.json");
    let mut state = if config.resume && state_path.exists() {
        read_training_state(&state_path)?
    } else {
        TrainingState::default()
    };

    let data_config = config.data_config();
    let data_dir = resolve_data_dir(experiment_dir, &config.data_dir);
    let dataset = UnalignedDataset::open(&data_dir, &config.phase, &data_config)
        .with_context(|| format!("failed to open dataset under {}", data_dir.display()))?;
    info!(
        len_a = dataset.len_a(),
        len_b = dataset.len_b(),
        classes = dataset.classes().len(),
        "opened unaligned dataset"
    );
    if config.batch_size == 0 || dataset.len() < config.batch_size {
        return Err(anyhow::anyhow!(
            "batch_size {} does not fit a dataset of {} samples",
            config.batch_size,
            dataset.len()
        ));
    }

    B::seed(&device, config.seed);
    let mut trainer =
        GanTrainer::<B>::new(&config, &device).context("failed to assemble training recipe")?;
    if config.resume && state.step > 0 {
        load_checkpoint(&mut trainer, &model_dir, state.step, &device)?;
        trainer.set_niter(state.step);
        info!(step = state.step, epoch = state.epoch, "resumed from checkpoint");
    }

    let mut scheduler = LinearDecay::new(config.n_epochs, config.n_epochs_decay)
        .load_record::<B>(LinearDecayRecord { epoch: state.epoch });
    let batcher = CutBatcher::new(
        data_config,
        true,
        dataset.domain_b().to_vec(),
        config.seed.wrapping_add(state.epoch as u64),
    );
    let loader = DataLoaderBuilder::<B, UnalignedItem, TrainResult<CutBatch<B>>>::new(batcher)
        .batch_size(config.batch_size)
        .shuffle(config.seed.wrapping_add(state.epoch as u64))
        .set_device(device.clone())
        .build(dataset);
    let mut factor_prev = 1.0;

    for epoch in state.epoch..config.total_epochs() {
        let factor = scheduler.step();
        trainer.set_lr_factor(factor);
        if factor != factor_prev {
            info!(epoch, lr_g = config.lr_g * factor, lr_d = config.lr_d * factor, "decayed learning rate");
            factor_prev = factor;
        }

        let mut iterator = loader.iter();
        while let Some(batch) = iterator.next() {
            let batch = batch.with_context(|| format!("epoch {epoch} data loading failed"))?;
            if batch.batch_size() < config.batch_size {
                debug!(epoch, size = batch.batch_size(), "skipping incomplete trailing batch");
                continue;
            }
            let preview = is_due(trainer.niter() + 1, config.sample_steps)
                .then(|| (batch.real_a.clone().inner(), batch.real_b.clone().inner()));

            let output = trainer
                .optimize_parameters(batch)
                .with_context(|| format!("training step {} failed", trainer.niter()))?;
            state.step = output.step;

            if is_due(state.step, config.print_every) {
                let means = trainer.take_running_losses();
                info!(epoch, step = state.step, losses = ?means, "running losses");
                if config.iter_size > 1 {
                    info!(step = state.step, averages = ?trainer.window_averages(), "accumulation window");
                }
                for (name, p) in trainer.apa_probabilities() {
                    info!(discriminator = %name, p, "adaptive pseudo augmentation");
                }
            }

            if is_due(state.step, config.d_accuracy_every) {
                for (name, stats) in trainer.discriminator_accuracy() {
                    info!(
                        discriminator = %name,
                        accuracy = stats.accuracy,
                        precision_real = stats.precision_real,
                        recall_real = stats.recall_real,
                        precision_fake = stats.precision_fake,
                        recall_fake = stats.recall_fake,
                        "discriminator accuracy"
                    );
                }
            }

            if let Some((real_a, real_b)) = preview {
                let fake_b = trainer.translate(real_a.clone());
                let path = sample_dir.join(format!("sample_{epoch:03}_{:06}.png", state.step));
                save_sample_grid(real_a, fake_b, real_b, &path)?;
            }

            if is_due(state.step, config.checkpoint_steps) {
                save_checkpoint(&trainer, &model_dir, state.step)?;
                write_training_state(&state_path, &state)?;
            }
        }
        state.epoch = epoch + 1;
    }

    save_checkpoint(&trainer, &model_dir, state.step)?;
    write_training_state(&state_path, &state)?;
    info!(step = state.step, epoch = state.epoch, "training finished");
    Ok(())
}

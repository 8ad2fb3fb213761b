#![recursion_limit = "256"]
use anyhow::{Context, Result};
use burn::backend::Autodiff;
use burn::config::Config;
use clap::Parser;
use cutgan_burn::model::layers::conv_out;
use cutgan_burn::training::TrainingConfig;
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(about = "Train a CUT-family image translation model with Burn")]
struct Args {
    #[arg(long)]
    experiment_dir: PathBuf,
    #[arg(long, default_value = "config.json")]
    config: PathBuf,
}

fn init_logging() {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,cutgan_burn=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[cfg(not(feature = "cuda"))]
fn main() -> Result<()> {
    use burn::backend::wgpu::graphics::AutoGraphicsApi;
    use burn::backend::wgpu::{init_setup, RuntimeOptions, WgpuDevice};
    use burn::backend::WebGpu;

    init_logging();
    let args = Args::parse();
    let mut config = load_config(&args)?;

    let device = WgpuDevice::default();
    let setup = init_setup::<AutoGraphicsApi>(&device, RuntimeOptions::default());
    let max_storage_buffer_binding_size =
        setup.device.limits().max_storage_buffer_binding_size as u64;
    adjust_batch_size_for_wgpu(&mut config, max_storage_buffer_binding_size)?;

    cutgan_burn::training::train::<Autodiff<WebGpu<f32, i32>>>(
        &args.experiment_dir,
        config,
        device,
    )
}

#[cfg(feature = "cuda")]
fn main() -> Result<()> {
    use burn::backend::cuda::CudaDevice;
    use burn::backend::Cuda;

    init_logging();
    let args = Args::parse();
    let config = load_config(&args)?;
    cutgan_burn::training::train::<Autodiff<Cuda<f32, i32>>>(
        &args.experiment_dir,
        config,
        CudaDevice::default(),
    )
}

fn load_config(args: &Args) -> Result<TrainingConfig> {
    let config = TrainingConfig::load(&args.config)
        .with_context(|| format!("failed to load config from {}", args.config.display()))?;
    info!(
        config = %args.config.display(),
        discriminators = ?config.d_net_ds,
        batch_size = config.batch_size,
        iter_size = config.iter_size,
        "loaded training config"
    );
    Ok(config)
}

#[cfg_attr(feature = "cuda", allow(dead_code))]
fn adjust_batch_size_for_wgpu(
    config: &mut TrainingConfig,
    max_storage_buffer_binding_size: u64,
) -> Result<()> {
    let elem_bytes = std::mem::size_of::<f32>() as u64;
    let per_sample_bytes = estimate_max_conv_workspace_elems(config).saturating_mul(elem_bytes);
    if per_sample_bytes == 0 {
        return Ok(());
    }

    let safe_limit = max_storage_buffer_binding_size.saturating_sub(1);
    let max_batch = (safe_limit / per_sample_bytes) as usize;
    if max_batch == 0 {
        return Err(anyhow::anyhow!(
            "WGPU max storage buffer size ({max_storage_buffer_binding_size} bytes) is too small for a single sample (estimated {per_sample_bytes} bytes). Reduce crop_size or model dims."
        ));
    }

    let lowered = fitted_batch_size(config, max_batch);
    if lowered != config.batch_size {
        warn!(
            max_storage_buffer_binding_size,
            per_sample_bytes,
            from = config.batch_size,
            to = lowered,
            "lowering batch_size to fit the wgpu storage buffer"
        );
        config.batch_size = lowered;
    }
    Ok(())
}

/// Batch size whose generator pass fits `max_batch` samples. Identity
/// passes run real B through the generator too, doubling its batch.
#[cfg_attr(feature = "cuda", allow(dead_code))]
fn fitted_batch_size(config: &TrainingConfig, max_batch: usize) -> usize {
    let factor = if config.identity_pass() { 2 } else { 1 };
    if config.batch_size * factor <= max_batch {
        return config.batch_size;
    }
    (max_batch / factor).max(1)
}

/// Largest im2col workspace of one sample over the generator and the
/// patch discriminator.
#[cfg_attr(feature = "cuda", allow(dead_code))]
fn estimate_max_conv_workspace_elems(config: &TrainingConfig) -> u64 {
    let model = &config.model;
    let extra = if model.multimodal { model.nz } else { 0 };
    let mut max_elems = 0u64;
    let mut track = |in_channels: usize, size: usize, kernel: usize| {
        let elems = (in_channels * size * size * kernel * kernel) as u64;
        max_elems = max_elems.max(elems);
    };

    let mut size = config.crop_size as usize;
    track(model.input_nc + extra, size, 7);
    size = conv_out(size, 3, 2);
    track(model.ngf, size, 3);
    size = conv_out(size, 3, 2);
    track(model.ngf * 2, size, 3);
    track(model.ngf * 4, size, 3);
    track(model.ngf, config.crop_size as usize, 7);

    let frames = config.temporal_frames.max(1);
    let mut disc_size = conv_out(config.crop_size as usize, 3, 2);
    track(model.output_nc * frames, config.crop_size as usize, 3);
    let mut channels = model.ndf;
    for layer in 1..=model.d_n_layers.max(1) {
        let stride = if layer < model.d_n_layers { 2 } else { 1 };
        track(channels, disc_size, 3);
        disc_size = conv_out(disc_size, 3, stride);
        channels = model.ndf * (1 << layer.min(3));
    }

    max_elems
}

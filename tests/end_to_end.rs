use burn::backend::{Autodiff, NdArray};
use burn::module::{Module, ModuleVisitor, Param};
use burn::prelude::*;
use burn::tensor::Distribution;
use cutgan_burn::data::CutBatch;
use cutgan_burn::loss::{GanMode, LossConfig};
use cutgan_burn::model::ModelConfig;
use cutgan_burn::training::{GanTrainer, TrainingConfig};

type B = Autodiff<NdArray<f32>>;

/// Flattened values of every float parameter, in visit order.
#[derive(Default)]
struct Snapshot {
    params: Vec<Vec<f32>>,
}

impl<B: Backend> ModuleVisitor<B> for Snapshot {
    fn visit_float<const D: usize>(&mut self, param: &Param<Tensor<B, D>>) {
        let values = param.val().into_data().to_vec::<f32>().unwrap();
        self.params.push(values);
    }
}

fn snapshot<M: Module<B>>(module: &M) -> Vec<Vec<f32>> {
    let mut visitor = Snapshot::default();
    module.visit(&mut visitor);
    visitor.params
}

fn config() -> TrainingConfig {
    TrainingConfig::new("synthetic".to_string())
        .with_model(
            ModelConfig::new()
                .with_ngf(4)
                .with_n_blocks(1)
                .with_ndf(4)
                .with_d_n_layers(2)
                .with_netf_nc(8),
        )
        .with_loss(
            LossConfig::new()
                .with_gan_mode(GanMode::Lsgan)
                .with_nce_layers(vec![0, 2, 4])
                .with_num_patches(8),
        )
        .with_d_net_ds(vec!["basic".to_string()])
        .with_batch_size(2)
        .with_pool_size(4)
}

fn batch(device: &<B as Backend>::Device) -> CutBatch<B> {
    let image = || Tensor::<B, 4>::random([2, 3, 8, 8], Distribution::Uniform(-1.0, 1.0), device);
    CutBatch::new(image(), image())
}

#[test]
fn generator_step_leaves_discriminator_untouched() {
    let device = Default::default();
    let mut trainer = GanTrainer::<B>::new(&config(), &device).unwrap();
    let names: Vec<&str> = trainer.groups().iter().map(|g| g.name.as_str()).collect();
    assert_eq!(names, vec!["G", "D"]);
    assert_eq!(trainer.groups()[0].loss_backward, vec!["G_tot".to_string()]);
    assert_eq!(trainer.registry().descriptors()[0].name, "D_B_basic");
    assert_eq!(trainer.registry().descriptors()[0].compute_every, 1);

    let g_before = snapshot(&trainer.networks().g_a);
    let d_before = snapshot(&trainer.networks().discriminators);

    let mut ctx = trainer.start_step(batch(&device)).unwrap();
    trainer.run_group(0, &mut ctx).unwrap();

    // Every generator parameter received a gradient and moved.
    let g_after = snapshot(&trainer.networks().g_a);
    assert_eq!(g_before.len(), g_after.len());
    for (idx, (before, after)) in g_before.iter().zip(&g_after).enumerate() {
        let moved = before.iter().zip(after).any(|(b, a)| b != a);
        assert!(moved, "generator parameter {idx} did not change");
    }
    assert_eq!(snapshot(&trainer.networks().discriminators), d_before);

    trainer.run_group(1, &mut ctx).unwrap();
    let d_after = snapshot(&trainer.networks().discriminators);
    assert_ne!(d_after, d_before);
    assert_eq!(snapshot(&trainer.networks().g_a), g_after);

    let output = trainer.finish_step(ctx);
    assert_eq!(output.step, 1);
    for name in ["G_tot", "D_tot", "G_GAN_D_B_basic", "D_GAN_D_B_basic", "G_NCE"] {
        assert!(output.losses[name].is_finite(), "{name} is not finite");
    }
}

#[test]
fn accumulated_steps_only_move_weights_on_the_last_micro_step() {
    let device = Default::default();
    let mut trainer = GanTrainer::<B>::new(&config().with_iter_size(2), &device).unwrap();
    let before = snapshot(&trainer.networks().g_a);

    let first = trainer.optimize_parameters(batch(&device)).unwrap();
    assert!(!first.stepped);
    assert_eq!(snapshot(&trainer.networks().g_a), before);

    let second = trainer.optimize_parameters(batch(&device)).unwrap();
    assert!(second.stepped);
    assert_ne!(snapshot(&trainer.networks().g_a), before);
    assert!(trainer.window_averages().contains_key("G_tot_avg"));
}

#[test]
fn out_of_range_group_is_rejected() {
    let device = Default::default();
    let mut trainer = GanTrainer::<B>::new(&config(), &device).unwrap();
    let mut ctx = trainer.start_step(batch(&device)).unwrap();
    assert!(trainer.run_group(5, &mut ctx).is_err());
}

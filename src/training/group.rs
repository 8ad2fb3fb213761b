use crate::error::{TrainError, TrainResult};
use crate::model::NetworkId;
use crate::training::context::TensorKey;
use crate::training::registry::{DiscriminatorDescriptor, D_TOTAL, G_TOTAL};
use std::collections::{BTreeMap, BTreeSet};
use tracing::warn;

pub const G_Z: &str = "G_z";
pub const G_NCE: &str = "G_NCE";
pub const G_NCE_Y: &str = "G_NCE_Y";
pub const G_MSE_IDT: &str = "G_MSE_idt";
pub const G_SEM_CLS: &str = "G_sem_cls_AB";
pub const G_SEM_MASK: &str = "G_sem_mask_AB";
pub const G_SEM_MASK_IDT: &str = "G_sem_mask_idt_B";
pub const G_TEMPORAL: &str = "G_temporal_criterion";
pub const CLS: &str = "CLS";
pub const F_S: &str = "f_s";

/// Which optional parts of the pipeline are active in a run.
///
/// Built once from the configuration; forward and backward functions
/// declare what they read and write against it.
#[derive(Clone, Debug, Default)]
pub struct Recipe {
    pub nce: bool,
    pub nce_idt: bool,
    pub mse_idt: bool,
    pub multimodal: bool,
    pub noisy: bool,
    pub semantic_cls: bool,
    pub semantic_mask: bool,
    pub sem_idt: bool,
    pub temporal: bool,
    pub temporal_criterion: bool,
    pub ema: bool,
    pub discriminators: Vec<DiscriminatorDescriptor>,
}

impl Recipe {
    /// The generator also translates `real_B` (identity pass).
    pub fn identity(&self) -> bool {
        self.nce_idt || self.mse_idt || (self.semantic_mask && self.sem_idt)
    }

    /// Tensors the batch record supplies.
    pub fn batch_keys(&self) -> Vec<TensorKey> {
        let mut keys = vec![TensorKey::RealA, TensorKey::RealB];
        if self.semantic_cls {
            keys.push(TensorKey::LabelClsA);
        }
        if self.semantic_mask {
            keys.push(TensorKey::LabelMaskA);
            if self.sem_idt {
                keys.push(TensorKey::LabelMaskB);
            }
        }
        if self.temporal {
            keys.extend([TensorKey::TemporalRealA, TensorKey::TemporalRealB]);
        }
        keys
    }
}

/// Forward passes a group can run, in the order listed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ForwardFn {
    /// Main translation pass.
    Cut,
    /// Real-pool bookkeeping and generated temporal sequences.
    Gan,
    /// Latent recovery pass used to train `E` on its own.
    Encoder,
    /// Semantic predictions on generated images.
    SemanticFake,
    ClassifierReal,
    SegmenterReal,
}

impl ForwardFn {
    pub fn reads(&self, recipe: &Recipe) -> Vec<TensorKey> {
        match self {
            ForwardFn::Gan => {
                let mut keys = vec![TensorKey::RealB];
                if recipe.temporal {
                    keys.push(TensorKey::TemporalRealA);
                    if recipe.multimodal {
                        keys.push(TensorKey::ZRandom);
                    }
                }
                keys
            }
            ForwardFn::Cut => {
                let mut keys = vec![TensorKey::RealA];
                if recipe.identity() || recipe.noisy {
                    keys.push(TensorKey::RealB);
                }
                keys
            }
            ForwardFn::Encoder => vec![TensorKey::FakeB, TensorKey::ZRandom],
            ForwardFn::ClassifierReal | ForwardFn::SegmenterReal => vec![TensorKey::RealA],
            ForwardFn::SemanticFake => {
                let mut keys = vec![TensorKey::FakeB];
                if recipe.semantic_mask && recipe.sem_idt {
                    keys.push(TensorKey::IdtB);
                }
                keys
            }
        }
    }

    pub fn writes(&self, recipe: &Recipe) -> Vec<TensorKey> {
        match self {
            ForwardFn::Gan if recipe.temporal => {
                vec![TensorKey::TemporalFakeBFrames, TensorKey::TemporalFakeB]
            }
            ForwardFn::Gan => Vec::new(),
            ForwardFn::Cut => {
                let mut keys = vec![
                    TensorKey::Real,
                    TensorKey::Fake,
                    TensorKey::FakeB,
                    TensorKey::DiffRealAFakeB,
                ];
                if recipe.identity() {
                    keys.push(TensorKey::IdtB);
                }
                if recipe.multimodal {
                    keys.extend([TensorKey::ZRandom, TensorKey::Mu2]);
                }
                if recipe.noisy {
                    keys.extend([TensorKey::FakeBNoisy, TensorKey::RealBNoisy]);
                }
                keys
            }
            ForwardFn::Encoder => vec![TensorKey::Mu2],
            ForwardFn::SemanticFake => {
                let mut keys = Vec::new();
                if recipe.semantic_cls {
                    keys.push(TensorKey::PredClsFakeB);
                }
                if recipe.semantic_mask {
                    keys.push(TensorKey::PredFsFakeB);
                    if recipe.sem_idt {
                        keys.push(TensorKey::PredFsIdtB);
                    }
                }
                keys
            }
            ForwardFn::ClassifierReal => vec![TensorKey::PredClsRealA],
            ForwardFn::SegmenterReal => vec![TensorKey::PredFsRealA],
        }
    }
}

/// Loss computations a group can run. None of them back-propagates.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackwardFn {
    GeneratorLoss,
    EncoderLoss,
    DiscriminatorLoss,
    ClassifierLoss,
    SegmenterLoss,
}

impl BackwardFn {
    pub fn reads(&self, recipe: &Recipe) -> Vec<TensorKey> {
        let mut keys = BTreeSet::new();
        match self {
            BackwardFn::GeneratorLoss => {
                keys.extend(recipe.discriminators.iter().map(|d| d.g_fake_key()));
                if recipe.nce {
                    keys.extend([TensorKey::RealA, TensorKey::FakeB]);
                    if recipe.nce_idt {
                        keys.extend([TensorKey::RealB, TensorKey::IdtB]);
                    }
                }
                if recipe.mse_idt {
                    keys.extend([TensorKey::RealB, TensorKey::IdtB]);
                }
                if recipe.multimodal {
                    keys.extend([TensorKey::Mu2, TensorKey::ZRandom]);
                }
                if recipe.semantic_cls {
                    keys.extend([TensorKey::PredClsFakeB, TensorKey::LabelClsA]);
                }
                if recipe.semantic_mask {
                    keys.extend([TensorKey::PredFsFakeB, TensorKey::LabelMaskA]);
                    if recipe.sem_idt {
                        keys.extend([TensorKey::PredFsIdtB, TensorKey::LabelMaskB]);
                    }
                }
                if recipe.temporal_criterion {
                    keys.insert(TensorKey::TemporalFakeBFrames);
                }
            }
            BackwardFn::EncoderLoss => {
                keys.extend([TensorKey::Mu2, TensorKey::ZRandom]);
            }
            BackwardFn::DiscriminatorLoss => {
                for descriptor in &recipe.discriminators {
                    keys.extend(descriptor.d_reads(recipe.noisy));
                }
            }
            BackwardFn::ClassifierLoss => {
                keys.extend([TensorKey::PredClsRealA, TensorKey::LabelClsA]);
            }
            BackwardFn::SegmenterLoss => {
                keys.extend([TensorKey::PredFsRealA, TensorKey::LabelMaskA]);
            }
        }
        keys.into_iter().collect()
    }

    pub fn losses(&self, recipe: &Recipe) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        match self {
            BackwardFn::GeneratorLoss => {
                names.push(G_TOTAL.to_string());
                names.extend(recipe.discriminators.iter().map(|d| d.loss_name_g.clone()));
                names.push(G_NCE.to_string());
                if recipe.nce_idt {
                    names.push(G_NCE_Y.to_string());
                }
                if recipe.mse_idt {
                    names.push(G_MSE_IDT.to_string());
                }
                if recipe.multimodal {
                    names.push(G_Z.to_string());
                }
                if recipe.semantic_cls {
                    names.push(G_SEM_CLS.to_string());
                }
                if recipe.semantic_mask {
                    names.push(G_SEM_MASK.to_string());
                    if recipe.sem_idt {
                        names.push(G_SEM_MASK_IDT.to_string());
                    }
                }
                if recipe.temporal_criterion {
                    names.push(G_TEMPORAL.to_string());
                }
            }
            BackwardFn::EncoderLoss => names.push(G_Z.to_string()),
            BackwardFn::DiscriminatorLoss => {
                names.push(D_TOTAL.to_string());
                names.extend(recipe.discriminators.iter().map(|d| d.loss_name_d.clone()));
            }
            BackwardFn::ClassifierLoss => names.push(CLS.to_string()),
            BackwardFn::SegmenterLoss => names.push(F_S.to_string()),
        }
        names
    }

    pub fn writes(&self) -> Vec<TensorKey> {
        match self {
            BackwardFn::DiscriminatorLoss => vec![TensorKey::ApaImg],
            _ => Vec::new(),
        }
    }
}

/// Optimizer handles; each covers a fixed set of networks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OptimizerId {
    G,
    F,
    E,
    /// One optimizer over every discriminator.
    D,
    Cls,
    FS,
}

impl OptimizerId {
    pub fn covers(&self, network: NetworkId) -> bool {
        matches!(
            (self, network),
            (OptimizerId::G, NetworkId::GA)
                | (OptimizerId::F, NetworkId::F)
                | (OptimizerId::E, NetworkId::E)
                | (OptimizerId::D, NetworkId::D(_))
                | (OptimizerId::Cls, NetworkId::Cls)
                | (OptimizerId::FS, NetworkId::FS)
        )
    }
}

/// Networks optimized together from one summed loss.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NetworkGroup {
    pub name: String,
    pub networks_to_optimize: Vec<NetworkId>,
    pub forward_functions: Vec<ForwardFn>,
    pub backward_functions: Vec<BackwardFn>,
    /// Losses reported for this group.
    pub loss_names_list: Vec<String>,
    pub optimizers: Vec<OptimizerId>,
    /// Losses summed into the scalar that is back-propagated.
    pub loss_backward: Vec<String>,
    pub networks_to_ema: Vec<NetworkId>,
}

impl NetworkGroup {
    /// Every loss this group's backward functions bind.
    pub fn produced_losses(&self, recipe: &Recipe) -> BTreeSet<String> {
        self.backward_functions
            .iter()
            .flat_map(|f| f.losses(recipe))
            .collect()
    }
}

/// The groups of a CUT run, in execution order.
pub fn cut_groups(recipe: &Recipe) -> Vec<NetworkGroup> {
    let mut groups = Vec::new();

    let mut g_forward = vec![ForwardFn::Cut, ForwardFn::Gan];
    if recipe.semantic_cls || recipe.semantic_mask {
        g_forward.push(ForwardFn::SemanticFake);
    }
    let mut g_backward = vec![G_TOTAL.to_string()];
    if recipe.multimodal {
        g_backward.push(G_Z.to_string());
    }
    let g_losses = BackwardFn::GeneratorLoss.losses(recipe);
    groups.push(NetworkGroup {
        name: "G".to_string(),
        networks_to_optimize: vec![NetworkId::GA, NetworkId::F],
        forward_functions: g_forward,
        backward_functions: vec![BackwardFn::GeneratorLoss],
        loss_names_list: g_losses,
        optimizers: vec![OptimizerId::G, OptimizerId::F],
        loss_backward: g_backward,
        networks_to_ema: if recipe.ema { vec![NetworkId::GA] } else { Vec::new() },
    });

    if recipe.multimodal {
        groups.push(NetworkGroup {
            name: "E".to_string(),
            networks_to_optimize: vec![NetworkId::E],
            forward_functions: vec![ForwardFn::Encoder],
            backward_functions: vec![BackwardFn::EncoderLoss],
            loss_names_list: vec![G_Z.to_string()],
            optimizers: vec![OptimizerId::E],
            loss_backward: vec![G_Z.to_string()],
            networks_to_ema: Vec::new(),
        });
    }

    if !recipe.discriminators.is_empty() {
        groups.push(NetworkGroup {
            name: "D".to_string(),
            networks_to_optimize: (0..recipe.discriminators.len()).map(NetworkId::D).collect(),
            forward_functions: Vec::new(),
            backward_functions: vec![BackwardFn::DiscriminatorLoss],
            loss_names_list: BackwardFn::DiscriminatorLoss.losses(recipe),
            optimizers: vec![OptimizerId::D],
            loss_backward: vec![D_TOTAL.to_string()],
            networks_to_ema: Vec::new(),
        });
    }

    if recipe.semantic_cls {
        groups.push(NetworkGroup {
            name: "CLS".to_string(),
            networks_to_optimize: vec![NetworkId::Cls],
            forward_functions: vec![ForwardFn::ClassifierReal],
            backward_functions: vec![BackwardFn::ClassifierLoss],
            loss_names_list: vec![CLS.to_string()],
            optimizers: vec![OptimizerId::Cls],
            loss_backward: vec![CLS.to_string()],
            networks_to_ema: Vec::new(),
        });
    }

    if recipe.semantic_mask {
        groups.push(NetworkGroup {
            name: "f_s".to_string(),
            networks_to_optimize: vec![NetworkId::FS],
            forward_functions: vec![ForwardFn::SegmenterReal],
            backward_functions: vec![BackwardFn::SegmenterLoss],
            loss_names_list: vec![F_S.to_string()],
            optimizers: vec![OptimizerId::FS],
            loss_backward: vec![F_S.to_string()],
            networks_to_ema: Vec::new(),
        });
    }

    groups
}

/// Check an ordered group list against the recipe before any step runs.
///
/// `exists` reports whether a network was built. Loss names claimed by the
/// `loss_backward` of several groups are allowed but logged.
pub fn validate_groups(
    groups: &[NetworkGroup],
    recipe: &Recipe,
    exists: impl Fn(NetworkId) -> bool,
) -> TrainResult<()> {
    let mut available: BTreeSet<TensorKey> = recipe.batch_keys().into_iter().collect();
    let mut claims: BTreeMap<&str, Vec<&str>> = BTreeMap::new();

    for group in groups {
        for &network in &group.networks_to_optimize {
            if !exists(network) {
                return Err(TrainError::InvalidConfig(format!(
                    "group `{}` optimizes {network}, which was not built",
                    group.name
                )));
            }
            if !group.optimizers.iter().any(|o| o.covers(network)) {
                return Err(TrainError::UncoveredNetwork {
                    network: network.to_string(),
                    group: group.name.clone(),
                });
            }
        }
        for network in &group.networks_to_ema {
            if *network != NetworkId::GA || !group.networks_to_optimize.contains(network) {
                return Err(TrainError::InvalidConfig(format!(
                    "group `{}` cannot keep an EMA copy of {network}",
                    group.name
                )));
            }
        }

        for function in &group.forward_functions {
            require_keys(&available, function.reads(recipe), &group.name, function)?;
            available.extend(function.writes(recipe));
        }
        for function in &group.backward_functions {
            require_keys(&available, function.reads(recipe), &group.name, function)?;
            available.extend(function.writes());
        }

        let produced = group.produced_losses(recipe);
        for name in group.loss_backward.iter().chain(&group.loss_names_list) {
            if !produced.contains(name) {
                return Err(TrainError::MissingLoss {
                    name: name.clone(),
                    group: group.name.clone(),
                });
            }
        }
        for name in &group.loss_backward {
            claims.entry(name.as_str()).or_default().push(group.name.as_str());
        }
    }

    for (loss, owners) in claims {
        if owners.len() > 1 {
            warn!(
                loss,
                groups = ?owners,
                "loss is back-propagated by several groups"
            );
        }
    }
    Ok(())
}

fn require_keys(
    available: &BTreeSet<TensorKey>,
    reads: Vec<TensorKey>,
    group: &str,
    function: &impl std::fmt::Debug,
) -> TrainResult<()> {
    match reads.into_iter().find(|key| !available.contains(key)) {
        Some(key) => Err(TrainError::MissingTensor {
            key,
            consumer: format!("{group}/{function:?}"),
        }),
        None => Ok(()),
    }
}

use crate::training::context::TensorKey;
use thiserror::Error;

/// Failures surfaced by the training core.
///
/// Configuration variants indicate an invalid training recipe and are
/// raised at assembly time or on the first step that touches the
/// offending name. Numerical variants abort the step that produced them.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum TrainError {
    #[error("tensor {key:?} is not available in the step context (needed by {consumer})")]
    MissingTensor { key: TensorKey, consumer: String },

    #[error("tensor {key:?} has kind {found}, expected {expected}")]
    TensorKind {
        key: TensorKey,
        expected: &'static str,
        found: &'static str,
    },

    #[error("loss `{name}` was never computed (needed by group `{group}`)")]
    MissingLoss { name: String, group: String },

    #[error("unknown discriminator kind `{0}`")]
    UnknownDiscriminator(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("network {network} in group `{group}` is not covered by any of its optimizers")]
    UncoveredNetwork { network: String, group: String },

    #[error("non-finite value {value} in loss `{loss}` of group `{group}` at step {step}")]
    NonFinite {
        loss: String,
        group: String,
        step: usize,
        value: f64,
    },

    #[error("failed to assemble batch: {0}")]
    Batch(String),

    #[error("failed to persist {what}: {message}")]
    Checkpoint { what: String, message: String },
}

pub type TrainResult<T> = Result<T, TrainError>;

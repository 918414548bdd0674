//! The model side of training: what a trainer needs from a ProtoNN model.
//!
//! The trainer never looks inside a model. It builds predictions through
//! [`ProtoNnModel::forward`], reads the trainable matrices for
//! regularization and fetches the accuracy node the model defines.

pub mod protonn;

pub use protonn::ProtoNN;

use crate::tensor::Tensor;
use serde::{Deserialize, Serialize};

/// Hyperparameters of a ProtoNN model. Fixed once the model is built.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HyperParams {
    /// Feature dimension `d`.
    pub d: usize,
    /// Projection dimension `d̂`.
    pub d_cap: usize,
    /// Number of prototypes `m`.
    pub m: usize,
    /// Number of classes `L`.
    pub l: usize,
    /// Similarity scale `γ`.
    pub gamma: f32,
}

/// Graph handles of the model matrices.
#[derive(Debug, Clone)]
pub struct ModelMatrices {
    /// Projection `[d, d̂]`.
    pub w: Tensor,
    /// Prototypes, one per column, `[d̂, m]`.
    pub b: Tensor,
    /// Prototype label scores `[L, m]`.
    pub z: Tensor,
    /// Similarity scale as a scalar node. Not trained.
    pub gamma: Tensor,
}

/// Contract between a ProtoNN model and its trainer.
pub trait ProtoNnModel {
    /// Appends the scoring graph for a batch `x` (`[?, d]`) and returns the
    /// `[?, L]` prediction scores. `y` (`[?, L]`) is used for the accuracy node.
    fn forward(&self, x: &Tensor, y: &Tensor) -> Tensor;

    fn hyper_params(&self) -> HyperParams;

    fn model_matrices(&self) -> ModelMatrices;

    /// Scalar accuracy node. `None` until `forward` has run.
    fn accuracy_op(&self) -> Option<Tensor>;
}

use crate::analysis::shape_inference::ShapeInferenceError;
use crate::autograd::AutogradError;
use crate::data::DataError;
use crate::runtime::session::SessionError;
use thiserror::Error;

/// Everything that can go wrong while building or running a trainer.
#[derive(Error, Debug)]
pub enum TrainerError {
    /// Invalid hyperparameter of the trainer itself.
    #[error("{param}: {message}")]
    Config { param: String, message: String },

    #[error("Invalid loss type '{0}'. Values can be 'l2' or 'xentropy'")]
    InvalidLossType(String),

    /// Placeholder or data array does not match the model dimensions.
    #[error("{0}")]
    Shape(String),

    #[error("Invalid session: {0}")]
    InvalidSession(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Model error: {0}")]
    Model(String),

    #[error("Model graph does not type-check: {0}")]
    ShapeInference(#[from] ShapeInferenceError),

    #[error("Cannot differentiate loss: {0}")]
    Autograd(#[from] AutogradError),

    #[error(transparent)]
    Data(#[from] DataError),

    #[error(transparent)]
    Execution(#[from] SessionError),

    #[error("Cannot write report: {0}")]
    Io(#[from] std::io::Error),
}

pub type TrainerResult<T> = Result<T, TrainerError>;

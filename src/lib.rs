//! # protonn: ProtoNN training on a graph-based autodiff engine
//!
//! ProtoNN scores a sample by projecting it with `W`, comparing the
//! projection against learned prototypes `B` with an RBF kernel and mixing
//! the prototype label vectors `Z` by those similarities.
//!
//! The crate is built around an **Abstract Semantic Graph (ASG)**: model and
//! loss are recorded as graph nodes through [`tensor::Tensor`] handles,
//! [`autograd`] derives a gradient graph from them, and [`runtime`] executes
//! both on the CPU.
//!
//! ## Usage Example
//!
//! ```no_run
//! use protonn::model::{HyperParams, ProtoNN};
//! use protonn::runtime::session::Session;
//! use protonn::tensor::{GraphContext, Tensor};
//! use protonn::trainer::{ProtoNnTrainer, TrainOptions, TrainerConfig};
//! use ndarray::ArrayD;
//!
//! let context = GraphContext::shared();
//! let hyper = HyperParams { d: 2, d_cap: 2, m: 2, l: 2, gamma: 1.0 };
//! let x = Tensor::new_input(&context, "X", &[None, Some(2)]);
//! let y = Tensor::new_input(&context, "Y", &[None, Some(2)]);
//!
//! let model = ProtoNN::new(&context, hyper);
//! let trainer = ProtoNnTrainer::new(model, TrainerConfig::default(), x, y).unwrap();
//!
//! let mut session = Session::with_seed(&context, 7);
//! let x_train = ArrayD::<f32>::zeros(vec![4, 2]);
//! let y_train = ArrayD::<f32>::zeros(vec![4, 2]);
//! trainer
//!     .train(2, 3, &mut session, &x_train, &x_train, &y_train, &y_train, TrainOptions::default(), None)
//!     .unwrap();
//! ```

pub mod analysis;
pub mod asg;
pub mod autograd;
pub mod data;
pub mod losses;
pub mod metrics;
pub mod model;
pub mod optimizers;
pub mod runtime;
pub mod tensor;
pub mod trainer;

//! Optimizers that update parameter values from computed gradients.
//!
//! Optimizers work on concrete `Value`s on the host. They receive the current
//! weights and the gradients and apply their update rule in place.
//!
//! [`Adam::minimize`] additionally turns a scalar loss into a [`TrainStep`]:
//! a frozen forward graph, its gradient graph and the list of trainable
//! parameters the loss depends on. A session executes the step.

use crate::analysis::shape_inference::ShapeInference;
use crate::asg::{Asg, NodeId, NodeType, Value};
use crate::autograd::{AutogradError, Gradients};
use crate::tensor::{GraphContext, Tensor};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use thiserror::Error;

const SCOPE: &str = "protonn-gradient-adam";

#[derive(Error, Debug, Clone, PartialEq)]
pub enum OptimizerError {
    #[error("No value for parameter '{0}'. Initialize variables before stepping.")]
    MissingParameter(String),
    #[error("Gradient of '{name}' has shape {grad:?}, parameter has shape {param:?}")]
    ShapeMismatch { name: String, param: Vec<usize>, grad: Vec<usize> },
}

/// Common interface of all optimizers.
pub trait Optimizer {
    /// Performs one optimization step, updating the weights in place.
    ///
    /// # Arguments
    ///
    /// * `parameters` - Current parameter values keyed by name (e.g. `"W"`).
    /// * `gradients` - Gradients for those parameters. Every gradient must
    ///   have a matching parameter of the same shape.
    fn step(
        &mut self,
        parameters: &mut HashMap<String, Value>,
        gradients: &HashMap<String, Value>,
    ) -> Result<(), OptimizerError>;
}

#[derive(Debug, Clone, PartialEq)]
struct Moments {
    v: ndarray::ArrayD<f32>,
    s: ndarray::ArrayD<f32>,
}

/// Adam with bias-corrected step size and a constant learning rate.
#[derive(Debug, Clone, PartialEq)]
pub struct Adam {
    learning_rate: f32,
    beta1: f32,
    beta2: f32,
    epsilon: f32,
    beta1_t: f32,
    beta2_t: f32,
    t: u32,
    moments: HashMap<String, Moments>,
}

impl Adam {
    /// Creates an `Adam` optimizer with the usual defaults
    /// (`beta1 = 0.9`, `beta2 = 0.999`, `epsilon = 1e-8`).
    pub fn new(learning_rate: f32) -> Self {
        Self::with_hyperparams(learning_rate, 0.9, 0.999, 1e-8)
    }

    pub fn with_hyperparams(learning_rate: f32, beta1: f32, beta2: f32, epsilon: f32) -> Self {
        Self {
            learning_rate,
            beta1,
            beta2,
            epsilon,
            beta1_t: 1.,
            beta2_t: 1.,
            t: 0,
            moments: HashMap::new(),
        }
    }

    pub fn learning_rate(&self) -> f32 {
        self.learning_rate
    }

    /// Number of updates applied so far.
    pub fn steps_taken(&self) -> u32 {
        self.t
    }

    /// Builds the step that minimizes `loss` over every trainable parameter it
    /// depends on. The forward graph is frozen at this point: nodes appended
    /// to the context afterwards are not part of the step.
    pub fn minimize(&self, loss: &Tensor) -> Result<TrainStep, AutogradError> {
        let forward = loss.context.borrow().main_graph().clone();

        let mut reachable = forward.clone();
        reachable.set_output(loss.node_id);
        let mut params = Vec::new();
        for id in ShapeInference::topological_sort(&reachable)? {
            if let NodeType::Parameter { name } = &forward.get_node(id)?.node_type {
                params.push((id, name.clone()));
            }
        }

        let wrt: Vec<NodeId> = params.iter().map(|(id, _)| *id).collect();
        let grad = Gradients::new(forward.clone()).build(loss.node_id, &wrt)?;
        let id = loss.context.borrow_mut().allocate_step_id();

        log::debug!(
            target: SCOPE,
            step = id, params = params.len(), grad_nodes = grad.nodes.len();
            "built Adam step (lr={})", self.learning_rate
        );

        Ok(TrainStep {
            id,
            context: Rc::clone(&loss.context),
            forward,
            loss: loss.node_id,
            grad,
            params,
            optimizer: self.clone(),
        })
    }
}

impl Optimizer for Adam {
    fn step(
        &mut self,
        parameters: &mut HashMap<String, Value>,
        gradients: &HashMap<String, Value>,
    ) -> Result<(), OptimizerError> {
        // Validate everything first so a failing step leaves no partial update.
        for (name, grad) in gradients {
            let param = parameters
                .get(name)
                .ok_or_else(|| OptimizerError::MissingParameter(name.clone()))?;
            let (param_shape, grad_shape) = (value_shape(param), value_shape(grad));
            if param_shape != grad_shape {
                return Err(OptimizerError::ShapeMismatch {
                    name: name.clone(),
                    param: param_shape,
                    grad: grad_shape,
                });
            }
        }

        let Self { learning_rate: lr, beta1: b1, beta2: b2, epsilon: eps, .. } = *self;

        self.beta1_t *= b1;
        self.beta2_t *= b2;
        self.t += 1;

        let bc1 = 1. - self.beta1_t;
        let bc2 = 1. - self.beta2_t;
        let step_size = lr * (bc2.sqrt() / bc1);

        for (name, grad) in gradients {
            let grad = grad.clone().into_array();
            let Some(param) = parameters.remove(name) else { continue };
            let mut param = param.into_array();
            let moments = self.moments.entry(name.clone()).or_insert_with(|| Moments {
                v: ndarray::ArrayD::zeros(grad.raw_dim()),
                s: ndarray::ArrayD::zeros(grad.raw_dim()),
            });

            ndarray::azip!((p in &mut param, &g in &grad, v in &mut moments.v, s in &mut moments.s) {
                *v = b1 * *v + (1. - b1) * g;
                *s = b2 * *s + (1. - b2) * g.powi(2);
                *p -= step_size * *v / (s.sqrt() + eps);
            });
            parameters.insert(name.clone(), Value::Tensor(param));
        }

        Ok(())
    }
}

fn value_shape(value: &Value) -> Vec<usize> {
    match value {
        Value::Tensor(arr) => arr.shape().to_vec(),
        Value::ScalarF32(_) => vec![],
    }
}

/// One minimization step over a frozen forward graph.
///
/// Holds no numeric state: the optimizer here is a template whose copy the
/// session keeps per step id, so reinitializing variables also resets the
/// moments.
#[derive(Debug, Clone)]
pub struct TrainStep {
    pub id: usize,
    pub(crate) context: Rc<RefCell<GraphContext>>,
    pub forward: Asg,
    pub loss: NodeId,
    pub grad: Asg,
    /// Trainable parameters reachable from the loss, in gradient output order.
    pub params: Vec<(NodeId, String)>,
    pub optimizer: Adam,
}

impl TrainStep {
    pub fn is_bound_to(&self, context: &Rc<RefCell<GraphContext>>) -> bool {
        Rc::ptr_eq(&self.context, context)
    }

    pub fn param_names(&self) -> impl Iterator<Item = &str> {
        self.params.iter().map(|(_, name)| name.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::Initializer;
    use ndarray::{array, ArrayD};

    fn single(name: &str, v: ArrayD<f32>) -> HashMap<String, Value> {
        HashMap::from([(name.to_string(), Value::Tensor(v))])
    }

    #[test]
    fn first_step_moves_by_learning_rate_against_gradient() {
        let mut adam = Adam::new(0.1);
        let mut params = single("w", array![1.0_f32, -1.0, 0.5].into_dyn());
        let grads = single("w", array![3.0_f32, -0.2, 0.0].into_dyn());
        adam.step(&mut params, &grads).unwrap();

        let w = params["w"].clone().into_array();
        assert!((w[0] - 0.9).abs() < 1e-4);
        assert!((w[1] - (-0.9)).abs() < 1e-4);
        assert_eq!(w[2], 0.5);
        assert_eq!(adam.steps_taken(), 1);
    }

    #[test]
    fn shape_mismatch_leaves_parameters_untouched() {
        let mut adam = Adam::new(0.1);
        let mut params = single("w", array![1.0_f32, 2.0].into_dyn());
        let grads = single("w", array![1.0_f32, 2.0, 3.0].into_dyn());
        let err = adam.step(&mut params, &grads).unwrap_err();
        assert!(matches!(err, OptimizerError::ShapeMismatch { .. }));
        assert_eq!(params["w"], Value::Tensor(array![1.0_f32, 2.0].into_dyn()));
        assert_eq!(adam.steps_taken(), 0);
    }

    #[test]
    fn step_count_without_first_moment_decay() {
        let mut adam = Adam::with_hyperparams(0.1, 0.0, 0.999, 1e-8);
        let mut params = single("w", array![1.0_f32].into_dyn());
        let grads = single("w", array![2.0_f32].into_dyn());
        for _ in 0..3 {
            adam.step(&mut params, &grads).unwrap();
        }
        assert_eq!(adam.steps_taken(), 3);
        let w = params["w"].clone().into_array();
        assert!(w[0].is_finite() && w[0] < 1.0);
    }

    #[test]
    fn missing_parameter_is_an_error() {
        let mut adam = Adam::new(0.1);
        let mut params = HashMap::new();
        let grads = single("w", array![1.0_f32].into_dyn());
        assert_eq!(
            adam.step(&mut params, &grads),
            Err(OptimizerError::MissingParameter("w".into()))
        );
    }

    #[test]
    fn minimize_collects_only_reachable_parameters() {
        let ctx = GraphContext::shared();
        let x = Tensor::new_input(&ctx, "x", &[None, Some(2)]);
        let w = Tensor::new_parameter(&ctx, "w", &[2, 1], Initializer::Zeros);
        let _unused = Tensor::new_parameter(&ctx, "unused", &[4], Initializer::Zeros);
        let loss = x.dot(&w).sum();

        let step = Adam::new(0.01).minimize(&loss).unwrap();
        assert_eq!(step.param_names().collect::<Vec<_>>(), vec!["w"]);
        assert_eq!(step.grad.outputs.len(), 1);
        assert!(step.is_bound_to(&ctx));

        let second = Adam::new(0.01).minimize(&loss).unwrap();
        assert_ne!(step.id, second.id);
    }
}

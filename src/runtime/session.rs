//! Execution session: live variable values plus graph execution.
//!
//! A `Session` is bound to one `GraphContext`. It owns the current value of
//! every trainable parameter, the optimizer state of every train step it has
//! executed, and the RNG used by parameter initializers. Graphs are run on a
//! `CpuBackend`.

use super::backend::{Backend, Memo, RuntimeError};
use super::cpu_backend::CpuBackend;
use crate::asg::{Asg, NodeId, NodeType, Shape, SymbolicShape, Value};
use crate::optimizers::{Adam, Optimizer, OptimizerError, TrainStep};
use crate::tensor::{GraphContext, Initializer, ParameterSpec, Tensor};
use ndarray::{ArrayD, IxDyn};
use ndarray_rand::rand_distr::{Normal, Uniform};
use ndarray_rand::RandomExt;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SessionError {
    #[error("Session is closed")]
    Closed,
    #[error("Tensor or train step belongs to a different graph context than this session")]
    ForeignGraph,
    #[error("No input named '{0}' in the graph")]
    UnknownFeed(String),
    #[error("Feed '{name}' has shape {actual:?}, placeholder declares {expected:?}")]
    FeedShape { name: String, expected: SymbolicShape, actual: Shape },
    #[error("Cannot initialize parameter '{name}': {message}")]
    Initializer { name: String, message: String },
    #[error("Variables have not been initialized")]
    Uninitialized,
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
    #[error(transparent)]
    Optimizer(#[from] OptimizerError),
}

pub type SessionResult<T> = Result<T, SessionError>;

pub struct Session {
    backend: CpuBackend,
    context: Rc<RefCell<GraphContext>>,
    variables: HashMap<String, Value>,
    /// Optimizer state per train step id.
    slots: HashMap<usize, Adam>,
    rng: StdRng,
    init_count: usize,
    open: bool,
}

impl Session {
    /// Opens a session on `context` with an entropy-seeded RNG.
    pub fn new(context: &Rc<RefCell<GraphContext>>) -> Self {
        Self::with_rng(context, StdRng::from_entropy())
    }

    /// Opens a session whose initializers are reproducible.
    pub fn with_seed(context: &Rc<RefCell<GraphContext>>, seed: u64) -> Self {
        Self::with_rng(context, StdRng::seed_from_u64(seed))
    }

    fn with_rng(context: &Rc<RefCell<GraphContext>>, rng: StdRng) -> Self {
        Self {
            backend: CpuBackend::new(),
            context: Rc::clone(context),
            variables: HashMap::new(),
            slots: HashMap::new(),
            rng,
            init_count: 0,
            open: true,
        }
    }

    pub fn close(&mut self) {
        self.open = false;
        self.variables.clear();
        self.slots.clear();
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn is_bound_to(&self, context: &Rc<RefCell<GraphContext>>) -> bool {
        Rc::ptr_eq(&self.context, context)
    }

    /// How many times `initialize_variables` has run.
    pub fn init_count(&self) -> usize {
        self.init_count
    }

    pub fn variable(&self, name: &str) -> Option<&Value> {
        self.variables.get(name)
    }

    /// (Re)initializes every registered parameter from its initializer and
    /// resets all optimizer state.
    pub fn initialize_variables(&mut self) -> SessionResult<()> {
        self.ensure_open()?;
        let specs: Vec<ParameterSpec> = self.context.borrow().parameters().to_vec();

        let mut fresh = HashMap::with_capacity(specs.len());
        for spec in &specs {
            let value = self.sample(spec)?;
            fresh.insert(spec.name.clone(), Value::Tensor(value));
        }

        self.variables = fresh;
        self.slots.clear();
        self.init_count += 1;
        log::debug!(params = specs.len(), round = self.init_count; "initialized variables");
        Ok(())
    }

    fn sample(&mut self, spec: &ParameterSpec) -> SessionResult<ArrayD<f32>> {
        let dim = IxDyn(&spec.shape);
        let invalid = |message: String| SessionError::Initializer { name: spec.name.clone(), message };
        match &spec.initializer {
            Initializer::Zeros => Ok(ArrayD::zeros(dim)),
            Initializer::Normal { mean, std_dev } => {
                let dist = Normal::new(*mean, *std_dev).map_err(|e| invalid(e.to_string()))?;
                Ok(ArrayD::random_using(dim, dist, &mut self.rng))
            }
            Initializer::Uniform { low, high } => {
                if !(low < high) {
                    return Err(invalid(format!("empty range [{}, {})", low, high)));
                }
                Ok(ArrayD::random_using(dim, Uniform::new(*low, *high), &mut self.rng))
            }
            Initializer::Constant(value) => {
                if value.shape() != spec.shape.as_slice() {
                    return Err(invalid(format!(
                        "constant has shape {:?}, parameter is {:?}",
                        value.shape(),
                        spec.shape
                    )));
                }
                Ok(value.clone())
            }
        }
    }

    /// Evaluates `fetches` with the given placeholder values.
    pub fn run(&mut self, fetches: &[&Tensor], feeds: &HashMap<String, Value>) -> SessionResult<Vec<Value>> {
        self.ensure_open()?;
        if fetches.iter().any(|t| !Rc::ptr_eq(&t.context, &self.context)) {
            return Err(SessionError::ForeignGraph);
        }

        let mut graph = self.context.borrow().main_graph().clone();
        graph.set_outputs(fetches.iter().map(|t| t.node_id).collect());

        let memo = self.initial_memo(&graph, feeds)?;
        let (outputs, _) = self.backend.run(&graph, memo)?;
        Ok(self.backend.retrieve_data(&outputs)?)
    }

    /// Runs one optimizer update: forward pass, gradient graph, Adam step.
    /// Returns the loss computed by the forward pass.
    pub fn run_train_step(&mut self, step: &TrainStep, feeds: &HashMap<String, Value>) -> SessionResult<f32> {
        self.ensure_open()?;
        if !step.is_bound_to(&self.context) {
            return Err(SessionError::ForeignGraph);
        }

        let mut forward = step.forward.clone();
        forward.set_output(step.loss);
        let memo = self.initial_memo(&forward, feeds)?;
        let (outputs, memo) = self.backend.run(&forward, memo)?;
        let loss = outputs
            .first()
            .and_then(Value::as_scalar)
            .ok_or_else(|| RuntimeError::ShapeError("loss is not a scalar".to_string()))?;

        let (grads, _) = self.backend.run(&step.grad, memo)?;
        let gradients: HashMap<String, Value> = step
            .params
            .iter()
            .map(|(_, name)| name.clone())
            .zip(grads)
            .collect();

        let optimizer = self.slots.entry(step.id).or_insert_with(|| step.optimizer.clone());
        optimizer.step(&mut self.variables, &gradients)?;

        log::trace!(step = step.id, loss = loss; "applied train step");
        Ok(loss)
    }

    /// Feeds and current variable values keyed for the forward graph.
    fn initial_memo(&self, graph: &Asg, feeds: &HashMap<String, Value>) -> SessionResult<Memo<Value>> {
        let mut declared: HashMap<&str, (NodeId, &SymbolicShape)> = HashMap::new();
        for node in graph.nodes.values() {
            if let NodeType::Input { name, shape } = &node.node_type {
                declared.insert(name.as_str(), (node.id, shape));
            }
        }

        let mut memo = Memo::new();
        for (name, value) in self.backend.load_data(feeds)? {
            let (node_id, expected) = declared
                .get(name.as_str())
                .copied()
                .ok_or_else(|| SessionError::UnknownFeed(name.clone()))?;
            check_feed(&name, expected, &value)?;
            memo.insert((graph.id, node_id), value);
        }

        for node in graph.nodes.values() {
            if let NodeType::Parameter { name } = &node.node_type {
                if let Some(value) = self.variables.get(name) {
                    memo.insert((graph.id, node.id), value.clone());
                } else if self.init_count == 0 {
                    return Err(SessionError::Uninitialized);
                }
            }
        }
        Ok(memo)
    }

    fn ensure_open(&self) -> SessionResult<()> {
        if self.open {
            Ok(())
        } else {
            Err(SessionError::Closed)
        }
    }
}

fn check_feed(name: &str, expected: &SymbolicShape, value: &Value) -> SessionResult<()> {
    let actual: Shape = match value {
        Value::Tensor(arr) => arr.shape().to_vec(),
        Value::ScalarF32(_) => vec![],
    };
    let fits = actual.len() == expected.len()
        && expected.iter().zip(&actual).all(|(want, got)| want.map_or(true, |w| w == *got));
    if fits {
        Ok(())
    } else {
        Err(SessionError::FeedShape { name: name.to_string(), expected: expected.clone(), actual })
    }
}

//! `Tensor` handles and the `GraphContext` that owns the graph they point into.
//!
//! A `Tensor` holds no data. It is a lightweight handle to a node of the
//! abstract semantic graph (ASG); every operation on it appends a node to the
//! graph instead of computing anything. Values only appear when a
//! [`Session`](crate::runtime::session::Session) executes the graph.
//!
//! `GraphContext` is the single explicit owner of the graph, of the registry
//! of trainable parameters and of their initializers. Nothing is global: two
//! contexts never share nodes.

use crate::asg::{Asg, NodeId, NodeType, Shape, SymbolicShape, Value};
use ndarray::ArrayD;
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::ops::{Add, Div, Mul, Sub};
use std::rc::Rc;

/// How a parameter gets its starting value when a session initializes variables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Initializer {
    Zeros,
    Normal { mean: f32, std_dev: f32 },
    Uniform { low: f32, high: f32 },
    /// Fixed starting value; its shape must match the parameter's.
    Constant(ArrayD<f32>),
}

/// Registry entry for a trainable parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSpec {
    pub node_id: NodeId,
    pub name: String,
    pub shape: Shape,
    pub initializer: Initializer,
}

/// Owns the graph under construction.
///
/// Wrapped in `Rc<RefCell<>>` so that many `Tensor` handles can share it.
#[derive(Debug, Clone)]
pub struct GraphContext {
    main_graph: Asg,
    parameters: Vec<ParameterSpec>,
    next_step_id: usize,
}

impl GraphContext {
    /// Creates a new, empty graph context.
    pub fn new() -> Self {
        Self {
            main_graph: Asg::new(0, Some("main".to_string())),
            parameters: Vec::new(),
            next_step_id: 0,
        }
    }

    /// Convenience constructor for the shared handle every API expects.
    pub fn shared() -> Rc<RefCell<Self>> {
        Rc::new(RefCell::new(Self::new()))
    }

    pub fn main_graph_mut(&mut self) -> &mut Asg {
        &mut self.main_graph
    }

    pub fn main_graph(&self) -> &Asg {
        &self.main_graph
    }

    /// All trainable parameters registered so far, in creation order.
    pub fn parameters(&self) -> &[ParameterSpec] {
        &self.parameters
    }

    pub fn parameter(&self, name: &str) -> Option<&ParameterSpec> {
        self.parameters.iter().find(|p| p.name == name)
    }

    /// Hands out a fresh id for an optimizer step built on this graph.
    pub(crate) fn allocate_step_id(&mut self) -> usize {
        let id = self.next_step_id;
        self.next_step_id += 1;
        id
    }
}

impl Default for GraphContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Symbolic handle to a node of the ASG.
///
/// Consists of the node id and a shared reference to the `GraphContext` the
/// node lives in.
#[derive(Debug, Clone)]
pub struct Tensor {
    pub node_id: NodeId,
    pub context: Rc<RefCell<GraphContext>>,
}

impl Tensor {
    fn from_op(context: &Rc<RefCell<GraphContext>>, node_type: NodeType) -> Self {
        let node_id = context.borrow_mut().main_graph_mut().add_node(None, node_type);
        Self { node_id, context: Rc::clone(context) }
    }

    /// Creates a placeholder that receives data at execution time.
    ///
    /// `shape` is the declared symbolic shape; `None` entries are dynamic.
    pub fn new_input(context: &Rc<RefCell<GraphContext>>, name: &str, shape: &[Option<usize>]) -> Self {
        let mut ctx = context.borrow_mut();
        let graph = ctx.main_graph_mut();
        let node_id = graph.add_node(
            Some(name.to_string()),
            NodeType::Input { name: name.to_string(), shape: shape.to_vec() },
        );
        graph.inputs.push(node_id);
        Self { node_id, context: Rc::clone(context) }
    }

    /// Creates a trainable parameter and registers its shape and initializer.
    pub fn new_parameter(
        context: &Rc<RefCell<GraphContext>>,
        name: &str,
        shape: &[usize],
        initializer: Initializer,
    ) -> Self {
        let mut ctx = context.borrow_mut();
        let node_id = ctx
            .main_graph_mut()
            .add_node(Some(name.to_string()), NodeType::Parameter { name: name.to_string() });
        ctx.parameters.push(ParameterSpec {
            node_id,
            name: name.to_string(),
            shape: shape.to_vec(),
            initializer,
        });
        Self { node_id, context: Rc::clone(context) }
    }

    /// Creates a constant node embedding `data` in the graph.
    pub fn new_literal(context: &Rc<RefCell<GraphContext>>, data: ArrayD<f32>, name: &str) -> Self {
        let node_id = context
            .borrow_mut()
            .main_graph_mut()
            .add_node(Some(name.to_string()), NodeType::Literal(Value::Tensor(data)));
        Self { node_id, context: Rc::clone(context) }
    }

    /// Creates a scalar constant.
    pub fn scalar(context: &Rc<RefCell<GraphContext>>, value: f32) -> Self {
        Self::from_op(context, NodeType::Literal(Value::ScalarF32(value)))
    }

    /// Declared shape of this node, when one is known without running inference.
    ///
    /// Inputs report their placeholder shape, parameters their registered
    /// shape. Other nodes report `None`.
    pub fn symbolic_shape(&self) -> Option<SymbolicShape> {
        let ctx = self.context.borrow();
        let node = ctx.main_graph().get_node(self.node_id).ok()?;
        match &node.node_type {
            NodeType::Input { shape, .. } => Some(shape.clone()),
            NodeType::Parameter { name } => ctx
                .parameter(name)
                .map(|spec| spec.shape.iter().copied().map(Some).collect()),
            _ => None,
        }
    }

    /// Name of the input or parameter behind this handle.
    pub fn name(&self) -> Option<String> {
        let ctx = self.context.borrow();
        let node = ctx.main_graph().get_node(self.node_id).ok()?;
        node.name.clone()
    }

    /// Number of nodes in the graph, handy for build-time logging.
    pub fn graph_len(&self) -> usize {
        self.context.borrow().main_graph().nodes.len()
    }

    // --- Math ---

    pub fn dot(&self, other: &Tensor) -> Self {
        Self::from_op(&self.context, NodeType::MatrixMultiply(self.node_id, other.node_id))
    }

    pub fn neg(&self) -> Self {
        Self::from_op(&self.context, NodeType::Negate(self.node_id))
    }

    pub fn exp(&self) -> Self {
        Self::from_op(&self.context, NodeType::Exp(self.node_id))
    }

    pub fn log(&self) -> Self {
        Self::from_op(&self.context, NodeType::Log(self.node_id))
    }

    pub fn square(&self) -> Self {
        self * self
    }

    pub fn softmax(&self) -> Self {
        Self::from_op(&self.context, NodeType::Softmax(self.node_id))
    }

    pub fn argmax(&self) -> Self {
        Self::from_op(&self.context, NodeType::ArgMax(self.node_id))
    }

    pub fn equal(&self, other: &Tensor) -> Self {
        Self::from_op(&self.context, NodeType::Equal(self.node_id, other.node_id))
    }

    // --- Reductions ---

    pub fn sum(&self) -> Self {
        Self::from_op(&self.context, NodeType::Sum(self.node_id))
    }

    /// Sums over `axis`, keeping it with length 1.
    pub fn sum_axis(&self, axis: usize) -> Self {
        Self::from_op(&self.context, NodeType::SumAxis(self.node_id, axis))
    }

    pub fn mean(&self) -> Self {
        Self::from_op(&self.context, NodeType::Mean(self.node_id))
    }

    // --- Transformations ---

    pub fn transpose(&self, axis1: usize, axis2: usize) -> Self {
        Self::from_op(&self.context, NodeType::Transpose(self.node_id, axis1, axis2))
    }

    /// Per-row softmax cross-entropy of `self` (logits) against `labels`.
    pub fn softmax_cross_entropy(&self, labels: &Tensor) -> Self {
        Self::from_op(
            &self.context,
            NodeType::SoftmaxCrossEntropy { logits: self.node_id, labels: labels.node_id },
        )
    }
}

// Operator impls for the `&a + &b` syntax.

impl Add<&Tensor> for &Tensor {
    type Output = Tensor;
    fn add(self, rhs: &Tensor) -> Self::Output {
        Tensor::from_op(&self.context, NodeType::Add(self.node_id, rhs.node_id))
    }
}

impl Sub<&Tensor> for &Tensor {
    type Output = Tensor;
    fn sub(self, rhs: &Tensor) -> Self::Output {
        Tensor::from_op(&self.context, NodeType::Subtract(self.node_id, rhs.node_id))
    }
}

impl Mul<&Tensor> for &Tensor {
    type Output = Tensor;
    fn mul(self, rhs: &Tensor) -> Self::Output {
        Tensor::from_op(&self.context, NodeType::Multiply(self.node_id, rhs.node_id))
    }
}

impl Div<&Tensor> for &Tensor {
    type Output = Tensor;
    fn div(self, rhs: &Tensor) -> Self::Output {
        Tensor::from_op(&self.context, NodeType::Divide(self.node_id, rhs.node_id))
    }
}

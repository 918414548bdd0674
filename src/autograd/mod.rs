//! Autograd: builds the gradient graph d(loss)/d(param).
//!
//! Algorithm:
//!  - walk the forward graph in reverse topological order starting from the loss;
//!  - for every node holding an upstream gradient, emit the contributions to its
//!    operands and accumulate them (sum) per operand;
//!  - emit a separate ASG whose outputs are the gradients of the requested
//!    parameters, in the requested order.
//!
//! Forward values needed by the gradient rules are read through `External`
//! nodes, so the gradient graph must be executed with the memo produced by the
//! forward run. Shape-dependent rules (`Broadcast`, `ReduceSumTo`, `Size`) take
//! their target shape from those runtime values, which keeps the gradient graph
//! valid for any batch size.

use crate::analysis::shape_inference::{ShapeInference, ShapeInferenceError};
use crate::asg::{Asg, AsgError, NodeId, NodeType, Value};
use std::collections::HashMap;
use thiserror::Error;

/// Id given to every gradient graph; forward graphs use `0`.
pub const GRAD_ASG_ID: usize = 1;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AutogradError {
    #[error("ASG: {0}")]
    Asg(#[from] AsgError),
    #[error("Shape: {0}")]
    Shape(#[from] ShapeInferenceError),
    #[error("Node {0} is not a parameter or input and cannot be differentiated against")]
    NotALeaf(NodeId),
}

pub type AutogradResult<T> = Result<T, AutogradError>;

/// Builds gradient graphs for a snapshot of a forward graph.
pub struct Gradients {
    src: Asg,
    grad: Asg,
    /// forward node -> its accumulated gradient in `grad`
    gmap: HashMap<NodeId, NodeId>,
    /// forward node -> `External` image of it in `grad`
    images: HashMap<NodeId, NodeId>,
}

impl Gradients {
    pub fn new(src: Asg) -> Self {
        Self {
            src,
            grad: Asg::new(GRAD_ASG_ID, Some("grad".to_string())),
            gmap: HashMap::new(),
            images: HashMap::new(),
        }
    }

    /// Builds the gradient graph of `loss_id` (seeded with 1.0) with respect
    /// to `wrt`. The returned graph has one output per entry of `wrt`.
    ///
    /// A target the loss does not depend on gets a zero gradient of its own shape.
    pub fn build(mut self, loss_id: NodeId, wrt: &[NodeId]) -> AutogradResult<Asg> {
        for &id in wrt {
            match &self.src.get_node(id)?.node_type {
                NodeType::Parameter { .. } | NodeType::Input { .. } => {}
                _ => return Err(AutogradError::NotALeaf(id)),
            }
        }

        let mut walk = self.src.clone();
        walk.set_output(loss_id);
        let order = ShapeInference::topological_sort(&walk)?;

        let seed = self.lit_scalar(1.0);
        self.gmap.insert(loss_id, seed);

        for &id in order.iter().rev() {
            let g_out = match self.gmap.get(&id).copied() {
                Some(g) => g,
                None => continue,
            };
            let node_type = self.src.get_node(id)?.node_type.clone();
            self.backprop(id, &node_type, g_out)?;
        }

        let mut outputs = Vec::with_capacity(wrt.len());
        for &id in wrt {
            let g = match self.gmap.get(&id).copied() {
                Some(g) => g,
                None => {
                    let zero = self.lit_scalar(0.0);
                    let target = self.reuse(id)?;
                    self.add_node(NodeType::Broadcast(zero, target))
                }
            };
            outputs.push(g);
        }

        // Gradients of inputs/parameters carry the source names.
        for (&src_id, &g_id) in self.gmap.iter() {
            let name = match &self.src.get_node(src_id)?.node_type {
                NodeType::Input { name, .. } | NodeType::Parameter { name } => Some(name.clone()),
                _ => None,
            };
            if let Some(name) = name {
                if let Ok(gn) = self.grad.get_node_mut(g_id) {
                    if gn.name.is_none() {
                        gn.name = Some(format!("grad/{}", name));
                    }
                }
            }
        }

        self.grad.set_outputs(outputs);
        Ok(self.grad)
    }

    fn backprop(&mut self, id: NodeId, node_type: &NodeType, g_out: NodeId) -> AutogradResult<()> {
        match node_type {
            // Leaves
            NodeType::Input { .. }
            | NodeType::Parameter { .. }
            | NodeType::Literal(_)
            | NodeType::External { .. } => {}

            // -------- Binary --------
            NodeType::Add(a, b) => {
                let ra = self.reduce_to(g_out, *a)?;
                self.acc(*a, ra);
                let rb = self.reduce_to(g_out, *b)?;
                self.acc(*b, rb);
            }
            NodeType::Subtract(a, b) => {
                let ra = self.reduce_to(g_out, *a)?;
                self.acc(*a, ra);
                let neg = self.add_node(NodeType::Negate(g_out));
                let rb = self.reduce_to(neg, *b)?;
                self.acc(*b, rb);
            }
            NodeType::Multiply(a, b) => {
                let a_im = self.reuse(*a)?;
                let b_im = self.reuse(*b)?;
                let g_a = self.add_node(NodeType::Multiply(g_out, b_im));
                let g_b = self.add_node(NodeType::Multiply(g_out, a_im));
                let ra = self.reduce_to(g_a, *a)?;
                self.acc(*a, ra);
                let rb = self.reduce_to(g_b, *b)?;
                self.acc(*b, rb);
            }
            NodeType::Divide(a, b) => {
                let a_im = self.reuse(*a)?;
                let b_im = self.reuse(*b)?;
                // g_a = g / b
                let g_a = self.add_node(NodeType::Divide(g_out, b_im));
                // g_b = -g * a / b^2
                let b2 = self.add_node(NodeType::Multiply(b_im, b_im));
                let num = self.add_node(NodeType::Multiply(g_out, a_im));
                let quot = self.add_node(NodeType::Divide(num, b2));
                let g_b = self.add_node(NodeType::Negate(quot));
                let ra = self.reduce_to(g_a, *a)?;
                self.acc(*a, ra);
                let rb = self.reduce_to(g_b, *b)?;
                self.acc(*b, rb);
            }
            NodeType::MatrixMultiply(a, b) => {
                // g_a = g @ b^T
                let b_im = self.reuse(*b)?;
                let bt = self.add_node(NodeType::Transpose(b_im, 0, 1));
                let g_a = self.add_node(NodeType::MatrixMultiply(g_out, bt));
                // g_b = a^T @ g
                let a_im = self.reuse(*a)?;
                let at = self.add_node(NodeType::Transpose(a_im, 0, 1));
                let g_b = self.add_node(NodeType::MatrixMultiply(at, g_out));
                self.acc(*a, g_a);
                self.acc(*b, g_b);
            }

            // -------- Unary --------
            NodeType::Negate(x) => {
                let g_x = self.add_node(NodeType::Negate(g_out));
                self.acc(*x, g_x);
            }
            NodeType::Exp(x) => {
                // d exp(x) = exp(x), which is this node's own forward value
                let y_im = self.reuse(id)?;
                let g_x = self.add_node(NodeType::Multiply(g_out, y_im));
                self.acc(*x, g_x);
            }
            NodeType::Log(x) => {
                let x_im = self.reuse(*x)?;
                let g_x = self.add_node(NodeType::Divide(g_out, x_im));
                self.acc(*x, g_x);
            }
            NodeType::Softmax(x) => {
                // g_x = y * (g - sum_last(g * y))
                let y_im = self.reuse(id)?;
                let last_axis = self.rank_of(id)?.saturating_sub(1);
                let gy = self.add_node(NodeType::Multiply(g_out, y_im));
                let dot = self.add_node(NodeType::SumAxis(gy, last_axis));
                let centered = self.add_node(NodeType::Subtract(g_out, dot));
                let g_x = self.add_node(NodeType::Multiply(y_im, centered));
                self.acc(*x, g_x);
            }

            // -------- Reductions --------
            NodeType::Sum(x) | NodeType::SumAxis(x, _) => {
                let x_im = self.reuse(*x)?;
                let g_x = self.add_node(NodeType::Broadcast(g_out, x_im));
                self.acc(*x, g_x);
            }
            NodeType::Mean(x) => {
                let x_im = self.reuse(*x)?;
                let spread = self.add_node(NodeType::Broadcast(g_out, x_im));
                let count = self.add_node(NodeType::Size(x_im));
                let g_x = self.add_node(NodeType::Divide(spread, count));
                self.acc(*x, g_x);
            }

            // -------- Transformations --------
            NodeType::Transpose(x, a1, a2) => {
                let g_x = self.add_node(NodeType::Transpose(g_out, *a2, *a1));
                self.acc(*x, g_x);
            }
            NodeType::Broadcast(x, _target) => {
                let x_im = self.reuse(*x)?;
                let g_x = self.add_node(NodeType::ReduceSumTo(g_out, x_im));
                self.acc(*x, g_x);
            }
            NodeType::ReduceSumTo(x, _target) => {
                let x_im = self.reuse(*x)?;
                let g_x = self.add_node(NodeType::Broadcast(g_out, x_im));
                self.acc(*x, g_x);
            }

            // -------- Fused --------
            NodeType::SoftmaxCrossEntropy { logits, labels } => {
                // g_logits = g * (softmax(logits) - labels); labels are data, not differentiated
                let logits_im = self.reuse(*logits)?;
                let labels_im = self.reuse(*labels)?;
                let probs = self.add_node(NodeType::Softmax(logits_im));
                let diff = self.add_node(NodeType::Subtract(probs, labels_im));
                let g_l = self.add_node(NodeType::Multiply(g_out, diff));
                self.acc(*logits, g_l);
            }

            // Piecewise constant, zero derivative
            NodeType::Equal(_, _) | NodeType::ArgMax(_) | NodeType::Size(_) => {}
        }
        Ok(())
    }

    fn add_node(&mut self, node_type: NodeType) -> NodeId {
        self.grad.add_node(None, node_type)
    }

    fn lit_scalar(&mut self, v: f32) -> NodeId {
        self.grad.add_node(None, NodeType::Literal(Value::ScalarF32(v)))
    }

    /// `External` image of a forward node inside the gradient graph.
    fn reuse(&mut self, src_id: NodeId) -> AutogradResult<NodeId> {
        if let Some(&existing) = self.images.get(&src_id) {
            return Ok(existing);
        }
        let src = self.src.get_node(src_id)?;
        let name = format!("external_{}_{}", self.src.id, src_id);
        let (shape, dtype) = (src.shape.clone(), src.dtype);
        let id = self.grad.add_node(
            Some(name.clone()),
            NodeType::External { name, source_asg_id: self.src.id, source_node_id: src_id },
        );
        if let Ok(image) = self.grad.get_node_mut(id) {
            image.shape = shape;
            image.dtype = dtype;
        }
        self.images.insert(src_id, id);
        Ok(id)
    }

    /// Accumulate: dL/d(target) += contrib
    fn acc(&mut self, target_src_id: NodeId, contrib: NodeId) {
        let next = match self.gmap.get(&target_src_id).copied() {
            Some(prev) => self.add_node(NodeType::Add(prev, contrib)),
            None => contrib,
        };
        self.gmap.insert(target_src_id, next);
    }

    /// Sums `g` down to the shape of `src_id` along broadcast axes.
    fn reduce_to(&mut self, g: NodeId, src_id: NodeId) -> AutogradResult<NodeId> {
        let src_im = self.reuse(src_id)?;
        Ok(self.add_node(NodeType::ReduceSumTo(g, src_im)))
    }

    /// Rank of a forward node. Softmax is only ever applied to 2-D scores,
    /// so an un-inferred node falls back to rank 2.
    fn rank_of(&self, src_id: NodeId) -> AutogradResult<usize> {
        let node = self.src.get_node(src_id)?;
        Ok(node.shape.as_ref().map_or(2, |s| s.len()))
    }
}

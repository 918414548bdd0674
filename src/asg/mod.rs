//! ASG: the abstract semantic graph every `Tensor` handle points into.
//!
//! The graph is append-only. Node ids are dense and never reused, so a
//! snapshot taken at any point stays valid for nodes that already existed.

use ndarray::ArrayD;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Node identifier
pub type NodeId = usize;
/// Graph identifier
pub type AsgId = usize;
/// Concrete tensor shape
pub type Shape = Vec<usize>;
/// Declared shape of a placeholder; `None` marks a dynamic dimension (the batch).
pub type SymbolicShape = Vec<Option<usize>>;

pub type AsgResult<T> = std::result::Result<T, AsgError>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AsgError {
    #[error("Node with ID {0} not found")]
    NodeNotFound(NodeId),
}

#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub enum DType {
    F32,
    I32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Node id (duplicates the HashMap key for convenience)
    pub id: NodeId,
    pub name: Option<String>,
    pub node_type: NodeType,
    pub shape: Option<Shape>,
    pub dtype: Option<DType>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NodeType {
    // Data
    Input { name: String, shape: SymbolicShape },
    Parameter { name: String },
    Literal(Value),
    /// Value of a node that lives in another graph (the forward graph, for
    /// gradient graphs). Resolved from the execution memo.
    External { name: String, source_asg_id: AsgId, source_node_id: NodeId },

    // Binary
    Add(NodeId, NodeId),
    Subtract(NodeId, NodeId),
    Multiply(NodeId, NodeId),
    Divide(NodeId, NodeId),
    MatrixMultiply(NodeId, NodeId),
    Equal(NodeId, NodeId),

    // Unary
    Negate(NodeId),
    Exp(NodeId),
    Log(NodeId),
    Softmax(NodeId), // over the last axis
    ArgMax(NodeId),  // over the last axis, keepdim=1

    // Reductions
    Sum(NodeId),            // over all elements, scalar result
    SumAxis(NodeId, usize), // over one axis, keepdim=1
    Mean(NodeId),           // over all elements, scalar result
    Size(NodeId),           // element count as a scalar

    // Transformations
    Transpose(NodeId, usize, usize),
    Broadcast(NodeId, NodeId),
    ReduceSumTo(NodeId, NodeId),

    // Fused
    /// Per-row softmax cross-entropy computed from unnormalized logits.
    /// Output is `[batch, 1]`.
    SoftmaxCrossEntropy { logits: NodeId, labels: NodeId },
}

impl NodeType {
    /// Ids of the nodes this node reads from, in operand order.
    pub fn operands(&self) -> Vec<NodeId> {
        match self {
            NodeType::Input { .. }
            | NodeType::Parameter { .. }
            | NodeType::Literal(_)
            | NodeType::External { .. } => vec![],

            NodeType::Add(a, b)
            | NodeType::Subtract(a, b)
            | NodeType::Multiply(a, b)
            | NodeType::Divide(a, b)
            | NodeType::MatrixMultiply(a, b)
            | NodeType::Equal(a, b)
            | NodeType::Broadcast(a, b)
            | NodeType::ReduceSumTo(a, b) => vec![*a, *b],

            NodeType::Negate(a)
            | NodeType::Exp(a)
            | NodeType::Log(a)
            | NodeType::Softmax(a)
            | NodeType::ArgMax(a)
            | NodeType::Sum(a)
            | NodeType::SumAxis(a, _)
            | NodeType::Mean(a)
            | NodeType::Size(a)
            | NodeType::Transpose(a, _, _) => vec![*a],

            NodeType::SoftmaxCrossEntropy { logits, labels } => vec![*logits, *labels],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Tensor(ArrayD<f32>),
    ScalarF32(f32),
}

impl Value {
    /// Consumes the value as an n-dimensional array; scalars become 0-d arrays.
    pub fn into_array(self) -> ArrayD<f32> {
        match self {
            Value::Tensor(arr) => arr,
            Value::ScalarF32(v) => ndarray::arr0(v).into_dyn(),
        }
    }

    /// Reads a single-element value as a plain `f32`.
    pub fn as_scalar(&self) -> Option<f32> {
        match self {
            Value::ScalarF32(v) => Some(*v),
            Value::Tensor(arr) if arr.len() == 1 => arr.iter().next().copied(),
            Value::Tensor(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Asg {
    pub id: AsgId,
    pub name: Option<String>,
    pub nodes: HashMap<NodeId, Node>,
    pub inputs: Vec<NodeId>,
    pub outputs: Vec<NodeId>,
}

impl Asg {
    pub fn new(id: AsgId, name: Option<String>) -> Self {
        Self { id, name, nodes: HashMap::new(), inputs: vec![], outputs: vec![] }
    }

    pub fn add_node(&mut self, name: Option<String>, node_type: NodeType) -> NodeId {
        let new_id = self.nodes.len();
        let mut node = Node { id: new_id, name, node_type, shape: None, dtype: None };

        // Literals know their shape up front so inference never stalls on them.
        match &node.node_type {
            NodeType::Literal(Value::Tensor(arr)) => {
                node.shape = Some(arr.shape().to_vec());
                node.dtype = Some(DType::F32);
            }
            NodeType::Literal(Value::ScalarF32(_)) => {
                node.shape = Some(vec![]);
                node.dtype = Some(DType::F32);
            }
            _ => {}
        }

        self.nodes.insert(new_id, node);
        new_id
    }

    pub fn set_outputs(&mut self, outputs: Vec<NodeId>) {
        self.outputs = outputs;
    }

    pub fn set_output(&mut self, output: NodeId) {
        self.set_outputs(vec![output]);
    }

    pub fn get_node(&self, id: NodeId) -> AsgResult<&Node> {
        self.nodes.get(&id).ok_or(AsgError::NodeNotFound(id))
    }

    pub fn get_node_mut(&mut self, id: NodeId) -> AsgResult<&mut Node> {
        self.nodes.get_mut(&id).ok_or(AsgError::NodeNotFound(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_nodes_carry_their_shape() {
        let mut asg = Asg::new(0, None);
        let id = asg.add_node(None, NodeType::Literal(Value::Tensor(ArrayD::zeros(ndarray::IxDyn(&[2, 3])))));
        let node = asg.get_node(id).unwrap();
        assert_eq!(node.shape, Some(vec![2, 3]));
        assert_eq!(node.dtype, Some(DType::F32));
    }

    #[test]
    fn scalar_values_convert_to_zero_dim_arrays() {
        let arr = Value::ScalarF32(2.5).into_array();
        assert_eq!(arr.ndim(), 0);
        assert_eq!(Value::ScalarF32(2.5).as_scalar(), Some(2.5));
    }
}

//! Module for shape and data type inference (Shape Inference).
//!
//! Traverses the computation graph and determines the shape and data type of
//! each node's output from its operands' shapes and the operation type.

use crate::asg::{Asg, AsgError, DType, Node, NodeId, NodeType, Shape, Value};
use std::collections::{HashMap, HashSet};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ShapeInferenceError {
    #[error("Graph error: {0}")]
    AsgError(#[from] AsgError),

    #[error("Incompatible shapes for operation '{op}': left operand {shape1:?}, right operand {shape2:?}. \
             Ensure dimensions are compatible for broadcasting or matrix multiplication.")]
    IncompatibleShapes {
        op: String,
        shape1: Shape,
        shape2: Shape,
    },

    #[error("Shape information missing for node {0}. \
             The node has not been processed yet or the graph contains a cyclic dependency.")]
    MissingShapeInfo(NodeId),

    #[error("Initial shape not specified for '{0}'. \
             Add the shape to the initial_shapes HashMap when calling ShapeInference::run().")]
    MissingInitialShape(String),

    #[error("Invalid tensor rank for node {node_id}: expected {expected}D, got {actual}D.")]
    InvalidRank {
        node_id: NodeId,
        expected: usize,
        actual: usize,
    },

    #[error("Broadcast error: cannot broadcast shapes {0:?} and {1:?} to a common shape.")]
    BroadcastError(Shape, Shape),
}

type Result<T> = std::result::Result<T, ShapeInferenceError>;

/// Performs shape inference for an ASG.
pub struct ShapeInference;

impl ShapeInference {
    /// Runs shape inference over every node reachable from the graph outputs.
    ///
    /// Modifies the graph in place, filling in `shape` and `dtype`.
    ///
    /// # Arguments
    /// * `asg` - Graph to analyze.
    /// * `initial_shapes` - Shapes and types of all `Input`, `Parameter` and
    ///   `External` nodes, keyed by node name.
    pub fn run(asg: &mut Asg, initial_shapes: &HashMap<String, (Shape, DType)>) -> Result<()> {
        let sorted_nodes = Self::topological_sort(asg)?;

        for node_id in sorted_nodes {
            let mut node = asg.get_node(node_id)?.clone();
            let (shape, dtype) = Self::infer_node_shape(asg, &node, initial_shapes)?;
            node.shape = Some(shape);
            node.dtype = Some(dtype);
            asg.nodes.insert(node_id, node);
        }

        Ok(())
    }

    fn infer_node_shape(
        asg: &Asg,
        node: &Node,
        initial_shapes: &HashMap<String, (Shape, DType)>,
    ) -> Result<(Shape, DType)> {
        match &node.node_type {
            NodeType::Input { name, .. }
            | NodeType::Parameter { name }
            | NodeType::External { name, .. } => initial_shapes
                .get(name)
                .cloned()
                .ok_or_else(|| ShapeInferenceError::MissingInitialShape(name.clone())),

            NodeType::Literal(value) => match value {
                Value::Tensor(arr) => Ok((arr.shape().to_vec(), DType::F32)),
                Value::ScalarF32(_) => Ok((vec![], DType::F32)),
            },

            NodeType::Add(l, r)
            | NodeType::Subtract(l, r)
            | NodeType::Multiply(l, r)
            | NodeType::Divide(l, r) => {
                let (ls, ld) = Self::get_shape_dtype(asg, *l)?;
                let (rs, _) = Self::get_shape_dtype(asg, *r)?;
                Ok((broadcast_shapes(&ls, &rs)?, ld))
            }

            NodeType::Equal(l, r) => {
                let (ls, _) = Self::get_shape_dtype(asg, *l)?;
                let (rs, _) = Self::get_shape_dtype(asg, *r)?;
                // 0.0 / 1.0 mask, so F32
                Ok((broadcast_shapes(&ls, &rs)?, DType::F32))
            }

            NodeType::MatrixMultiply(l, r) => {
                let (ls, ld) = Self::get_shape_dtype(asg, *l)?;
                let (rs, _) = Self::get_shape_dtype(asg, *r)?;

                if ls.len() != 2 || rs.len() != 2 {
                    return Err(ShapeInferenceError::InvalidRank {
                        node_id: node.id,
                        expected: 2,
                        actual: if ls.len() != 2 { ls.len() } else { rs.len() },
                    });
                }
                if ls[1] != rs[0] {
                    return Err(ShapeInferenceError::IncompatibleShapes {
                        op: "MatrixMultiply".to_string(),
                        shape1: ls,
                        shape2: rs,
                    });
                }
                Ok((vec![ls[0], rs[1]], ld))
            }

            // Element-wise, shape unchanged
            NodeType::Negate(id) | NodeType::Exp(id) | NodeType::Log(id) | NodeType::Softmax(id) => {
                Self::get_shape_dtype(asg, *id)
            }

            NodeType::ArgMax(id) => {
                let (mut shape, _) = Self::get_shape_dtype(asg, *id)?;
                if let Some(last) = shape.last_mut() {
                    *last = 1;
                }
                Ok((shape, DType::I32))
            }

            NodeType::Sum(_) | NodeType::Mean(_) | NodeType::Size(_) => Ok((vec![], DType::F32)),

            NodeType::SumAxis(id, axis) => {
                let (mut shape, dtype) = Self::get_shape_dtype(asg, *id)?;
                if *axis >= shape.len() {
                    return Err(ShapeInferenceError::InvalidRank {
                        node_id: node.id,
                        expected: axis + 1,
                        actual: shape.len(),
                    });
                }
                // keepdim: the reduced axis stays with length 1
                shape[*axis] = 1;
                Ok((shape, dtype))
            }

            NodeType::Transpose(id, axis1, axis2) => {
                let (mut shape, dtype) = Self::get_shape_dtype(asg, *id)?;
                if *axis1 >= shape.len() || *axis2 >= shape.len() {
                    return Err(ShapeInferenceError::InvalidRank {
                        node_id: node.id,
                        expected: axis1.max(axis2) + 1,
                        actual: shape.len(),
                    });
                }
                shape.swap(*axis1, *axis2);
                Ok((shape, dtype))
            }

            NodeType::Broadcast(source_id, target_id) | NodeType::ReduceSumTo(source_id, target_id) => {
                let (_, dtype) = Self::get_shape_dtype(asg, *source_id)?;
                let (target_shape, _) = Self::get_shape_dtype(asg, *target_id)?;
                Ok((target_shape, dtype))
            }

            NodeType::SoftmaxCrossEntropy { logits, labels } => {
                let (ls, dtype) = Self::get_shape_dtype(asg, *logits)?;
                let (ys, _) = Self::get_shape_dtype(asg, *labels)?;
                if ls.len() != 2 {
                    return Err(ShapeInferenceError::InvalidRank { node_id: node.id, expected: 2, actual: ls.len() });
                }
                if ls != ys {
                    return Err(ShapeInferenceError::IncompatibleShapes {
                        op: "SoftmaxCrossEntropy".to_string(),
                        shape1: ls,
                        shape2: ys,
                    });
                }
                Ok((vec![ls[0], 1], dtype))
            }
        }
    }

    /// Fetches the already inferred shape and type of a node.
    fn get_shape_dtype(asg: &Asg, node_id: NodeId) -> Result<(Shape, DType)> {
        let node = asg.get_node(node_id)?;
        match (&node.shape, &node.dtype) {
            (Some(s), Some(d)) => Ok((s.clone(), *d)),
            _ => Err(ShapeInferenceError::MissingShapeInfo(node_id)),
        }
    }

    /// Topological sort of everything reachable from the graph outputs.
    /// Returns node ids in an order suitable for computation.
    pub fn topological_sort(asg: &Asg) -> Result<Vec<NodeId>> {
        let mut sorted = Vec::new();
        let mut visited = HashSet::new();
        for output_id in &asg.outputs {
            Self::build_sorted_graph(*output_id, asg, &mut visited, &mut sorted)?;
        }
        Ok(sorted)
    }

    fn build_sorted_graph(
        node_id: NodeId,
        asg: &Asg,
        visited: &mut HashSet<NodeId>,
        sorted: &mut Vec<NodeId>,
    ) -> Result<()> {
        if visited.contains(&node_id) {
            return Ok(());
        }

        let node = asg.get_node(node_id)?;
        for input_id in node.node_type.operands() {
            Self::build_sorted_graph(input_id, asg, visited, sorted)?;
        }

        if visited.insert(node_id) {
            sorted.push(node_id);
        }
        Ok(())
    }
}

/// NumPy-style broadcast of two shapes.
pub fn broadcast_shapes(a: &[usize], b: &[usize]) -> Result<Shape> {
    let rank = a.len().max(b.len());
    let mut out = vec![0; rank];
    for i in 0..rank {
        let da = if i < rank - a.len() { 1 } else { a[i - (rank - a.len())] };
        let db = if i < rank - b.len() { 1 } else { b[i - (rank - b.len())] };
        out[i] = match (da, db) {
            (x, y) if x == y => x,
            (1, y) => y,
            (x, 1) => x,
            _ => return Err(ShapeInferenceError::BroadcastError(a.to_vec(), b.to_vec())),
        };
    }
    Ok(out)
}

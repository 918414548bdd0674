//! Backend that executes an ASG on the CPU.
//!
//! Walks the graph and evaluates every node with `ndarray`.

use super::backend::{Backend, Memo, RuntimeError};
use crate::analysis::shape_inference::{broadcast_shapes, ShapeInference};
use crate::asg::{Asg, AsgId, NodeId, NodeType, Value};
use ndarray::{ArrayD, Axis, Ix2, Zip};
use std::collections::HashMap;

/// Execution state for one graph run.
struct ExecutionContext<'a> {
    graph: &'a Asg,
    /// Values computed so far, keyed by (AsgId, NodeId). Entries of other
    /// graphs back the `External` nodes.
    memo: Memo<Value>,
}

impl<'a> ExecutionContext<'a> {
    fn new(graph: &'a Asg, initial_memo: Memo<Value>) -> Self {
        Self { graph, memo: initial_memo }
    }

    /// Evaluates a node, recursing into operands that are not memoized yet.
    fn evaluate_node(&mut self, asg_id: AsgId, node_id: NodeId) -> Result<Value, RuntimeError> {
        if let Some(value) = self.memo.get(&(asg_id, node_id)) {
            return Ok(value.clone());
        }

        let node = self
            .graph
            .nodes
            .get(&node_id)
            .ok_or(RuntimeError::NodeNotFound(node_id, asg_id))?;

        let result = match &node.node_type {
            NodeType::Input { name, .. } => {
                return Err(RuntimeError::MissingInput(name.clone(), node.id));
            }
            NodeType::Parameter { name } => {
                return Err(RuntimeError::MissingParameter(name.clone(), node.id));
            }
            NodeType::Literal(value) => Ok(value.clone()),
            NodeType::External { source_asg_id, source_node_id, .. } => self
                .memo
                .get(&(*source_asg_id, *source_node_id))
                .cloned()
                .ok_or(RuntimeError::NodeNotFound(*source_node_id, *source_asg_id)),

            NodeType::Add(l, r)
            | NodeType::Subtract(l, r)
            | NodeType::Multiply(l, r)
            | NodeType::Divide(l, r)
            | NodeType::MatrixMultiply(l, r)
            | NodeType::Equal(l, r)
            | NodeType::Broadcast(l, r)
            | NodeType::ReduceSumTo(l, r) => {
                let lhs = self.evaluate_node(asg_id, *l)?.into_array();
                let rhs = self.evaluate_node(asg_id, *r)?.into_array();
                match &node.node_type {
                    NodeType::Add(_, _) => op_elementwise(&lhs, &rhs, "Add", |a, b| a + b),
                    NodeType::Subtract(_, _) => op_elementwise(&lhs, &rhs, "Subtract", |a, b| a - b),
                    NodeType::Multiply(_, _) => op_elementwise(&lhs, &rhs, "Multiply", |a, b| a * b),
                    NodeType::Divide(_, _) => op_elementwise(&lhs, &rhs, "Divide", |a, b| a / b),
                    NodeType::MatrixMultiply(_, _) => op_matmul(lhs, rhs),
                    NodeType::Equal(_, _) => op_equal(&lhs, &rhs),
                    NodeType::Broadcast(_, _) => op_broadcast(lhs, rhs),
                    NodeType::ReduceSumTo(_, _) => op_reduce_sum_to(lhs, rhs),
                    _ => unreachable!(),
                }
            }

            NodeType::Negate(op)
            | NodeType::Exp(op)
            | NodeType::Log(op)
            | NodeType::Softmax(op)
            | NodeType::ArgMax(op)
            | NodeType::Sum(op)
            | NodeType::Mean(op)
            | NodeType::Size(op) => {
                let operand = self.evaluate_node(asg_id, *op)?.into_array();
                match &node.node_type {
                    NodeType::Negate(_) => Ok(Value::Tensor(operand.mapv(|x| -x))),
                    NodeType::Exp(_) => Ok(Value::Tensor(operand.mapv(f32::exp))),
                    NodeType::Log(_) => Ok(Value::Tensor(operand.mapv(f32::ln))),
                    NodeType::Softmax(_) => op_softmax(operand),
                    NodeType::ArgMax(_) => op_argmax(&operand),
                    NodeType::Sum(_) => Ok(Value::Tensor(ndarray::arr0(operand.sum()).into_dyn())),
                    NodeType::Mean(_) => op_mean(&operand),
                    NodeType::Size(_) => Ok(Value::Tensor(ndarray::arr0(operand.len() as f32).into_dyn())),
                    _ => unreachable!(),
                }
            }

            NodeType::SumAxis(op, axis) => {
                let operand = self.evaluate_node(asg_id, *op)?.into_array();
                op_sum_axis(operand, *axis)
            }

            NodeType::Transpose(op, ax1, ax2) => {
                let operand = self.evaluate_node(asg_id, *op)?.into_array();
                op_transpose(operand, *ax1, *ax2)
            }

            NodeType::SoftmaxCrossEntropy { logits, labels } => {
                let logits = self.evaluate_node(asg_id, *logits)?.into_array();
                let labels = self.evaluate_node(asg_id, *labels)?.into_array();
                op_softmax_cross_entropy(&logits, &labels)
            }
        }?;

        self.memo.insert((asg_id, node_id), result.clone());
        Ok(result)
    }
}

/// Reference backend: evaluates nodes one by one on the host.
#[derive(Debug, Default, Clone, Copy)]
pub struct CpuBackend;

impl CpuBackend {
    pub fn new() -> Self {
        Self
    }
}

impl Backend for CpuBackend {
    type DeviceData = Value;

    fn load_data(
        &self,
        data: &HashMap<String, Value>,
    ) -> Result<HashMap<String, Self::DeviceData>, RuntimeError> {
        Ok(data.clone())
    }

    fn run(
        &self,
        main_asg: &Asg,
        initial_memo: Memo<Self::DeviceData>,
    ) -> Result<(Vec<Self::DeviceData>, Memo<Self::DeviceData>), RuntimeError> {
        let sorted_nodes = ShapeInference::topological_sort(main_asg)
            .map_err(|e| RuntimeError::ShapeError(format!("Topological sort failed: {}", e)))?;

        let mut context = ExecutionContext::new(main_asg, initial_memo);
        for node_id in sorted_nodes {
            context.evaluate_node(main_asg.id, node_id)?;
        }

        let mut results = Vec::with_capacity(main_asg.outputs.len());
        for output_node_id in &main_asg.outputs {
            let result = context
                .memo
                .get(&(main_asg.id, *output_node_id))
                .ok_or(RuntimeError::NodeNotFound(*output_node_id, main_asg.id))?
                .clone();
            results.push(result);
        }
        Ok((results, context.memo))
    }

    fn retrieve_data(&self, device_data: &[Self::DeviceData]) -> Result<Vec<Value>, RuntimeError> {
        Ok(device_data.to_vec())
    }
}

fn op_elementwise(
    a: &ArrayD<f32>,
    b: &ArrayD<f32>,
    op: &str,
    f: impl Fn(f32, f32) -> f32,
) -> Result<Value, RuntimeError> {
    let shape = broadcast_shapes(a.shape(), b.shape())
        .map_err(|_| RuntimeError::ShapeError(format!("{}: cannot broadcast {:?} with {:?}", op, a.shape(), b.shape())))?;
    let lhs = a
        .broadcast(shape.clone())
        .ok_or_else(|| RuntimeError::ShapeError(format!("{}: cannot broadcast {:?} to {:?}", op, a.shape(), shape)))?;
    let rhs = b
        .broadcast(shape.clone())
        .ok_or_else(|| RuntimeError::ShapeError(format!("{}: cannot broadcast {:?} to {:?}", op, b.shape(), shape)))?;
    Ok(Value::Tensor(Zip::from(&lhs).and(&rhs).map_collect(|&x, &y| f(x, y))))
}

fn op_equal(a: &ArrayD<f32>, b: &ArrayD<f32>) -> Result<Value, RuntimeError> {
    op_elementwise(a, b, "Equal", |x, y| if x == y { 1.0 } else { 0.0 })
}

fn op_matmul(a: ArrayD<f32>, b: ArrayD<f32>) -> Result<Value, RuntimeError> {
    if a.ndim() == 0 || b.ndim() == 0 {
        return op_elementwise(&a, &b, "MatrixMultiply", |x, y| x * y);
    }
    let a_mat = a
        .view()
        .into_dimensionality::<Ix2>()
        .map_err(|e| RuntimeError::ShapeError(format!("MatrixMultiply lhs {:?}: {}", a.shape(), e)))?;
    let b_mat = b
        .view()
        .into_dimensionality::<Ix2>()
        .map_err(|e| RuntimeError::ShapeError(format!("MatrixMultiply rhs {:?}: {}", b.shape(), e)))?;
    if a_mat.ncols() != b_mat.nrows() {
        return Err(RuntimeError::ShapeError(format!(
            "Incompatible matmul shapes: {:?} and {:?}",
            a.shape(),
            b.shape()
        )));
    }
    Ok(Value::Tensor(a_mat.dot(&b_mat).into_dyn()))
}

fn last_axis(a: &ArrayD<f32>, op: &str) -> Result<Axis, RuntimeError> {
    if a.ndim() == 0 {
        return Err(RuntimeError::ShapeError(format!("{} needs at least one axis", op)));
    }
    Ok(Axis(a.ndim() - 1))
}

fn op_softmax(a: ArrayD<f32>) -> Result<Value, RuntimeError> {
    let axis = last_axis(&a, "Softmax")?;
    let mut result = a;
    for mut lane in result.lanes_mut(axis) {
        let max_val = lane.iter().fold(f32::NEG_INFINITY, |max, &v| max.max(v));
        lane.mapv_inplace(|x| (x - max_val).exp());
        let sum = lane.sum();
        lane.mapv_inplace(|x| x / sum);
    }
    Ok(Value::Tensor(result))
}

fn op_argmax(a: &ArrayD<f32>) -> Result<Value, RuntimeError> {
    let axis = last_axis(a, "ArgMax")?;
    let indices = Zip::from(a.lanes(axis)).map_collect(|lane| {
        // first maximum wins on ties
        let mut best = 0usize;
        for (i, &v) in lane.iter().enumerate() {
            if v > lane[best] {
                best = i;
            }
        }
        best as f32
    });
    Ok(Value::Tensor(indices.insert_axis(axis)))
}

fn op_mean(a: &ArrayD<f32>) -> Result<Value, RuntimeError> {
    let mean = a
        .mean()
        .ok_or_else(|| RuntimeError::ComputationError("Mean of an empty tensor".to_string()))?;
    Ok(Value::Tensor(ndarray::arr0(mean).into_dyn()))
}

fn op_sum_axis(a: ArrayD<f32>, axis: usize) -> Result<Value, RuntimeError> {
    if axis >= a.ndim() {
        return Err(RuntimeError::ShapeError(format!(
            "SumAxis: axis {} out of range for shape {:?}",
            axis,
            a.shape()
        )));
    }
    Ok(Value::Tensor(a.sum_axis(Axis(axis)).insert_axis(Axis(axis))))
}

fn op_transpose(a: ArrayD<f32>, axis1: usize, axis2: usize) -> Result<Value, RuntimeError> {
    if axis1 >= a.ndim() || axis2 >= a.ndim() {
        return Err(RuntimeError::ShapeError(format!(
            "Transpose: axes ({}, {}) out of range for shape {:?}",
            axis1,
            axis2,
            a.shape()
        )));
    }
    let mut axes: Vec<usize> = (0..a.ndim()).collect();
    axes.swap(axis1, axis2);
    Ok(Value::Tensor(a.permuted_axes(axes)))
}

fn op_broadcast(source: ArrayD<f32>, target: ArrayD<f32>) -> Result<Value, RuntimeError> {
    let target_shape = target.shape();
    if source.len() == 1 {
        let val = source.iter().next().copied().unwrap_or_default();
        return Ok(Value::Tensor(ArrayD::from_elem(target_shape, val)));
    }
    let broadcasted = source.broadcast(target_shape).ok_or_else(|| {
        RuntimeError::ShapeError(format!("Cannot broadcast {:?} to {:?}", source.shape(), target_shape))
    })?;
    Ok(Value::Tensor(broadcasted.to_owned()))
}

fn op_reduce_sum_to(source: ArrayD<f32>, target_shape_provider: ArrayD<f32>) -> Result<Value, RuntimeError> {
    let target_shape = target_shape_provider.shape().to_vec();
    let mut source_tensor = source;

    // Leading axes the target does not have are summed away.
    while source_tensor.ndim() > target_shape.len() {
        source_tensor = source_tensor.sum_axis(Axis(0));
    }

    // Axes broadcast from length 1 are summed back with keepdim.
    for (i, &dim) in target_shape.iter().enumerate() {
        if dim == 1 && source_tensor.shape()[i] > 1 {
            source_tensor = source_tensor.sum_axis(Axis(i)).insert_axis(Axis(i));
        }
    }

    source_tensor
        .to_shape(target_shape)
        .map_err(|e| RuntimeError::ShapeError(e.to_string()))
        .map(|view| Value::Tensor(view.to_owned()))
}

fn op_softmax_cross_entropy(logits: &ArrayD<f32>, labels: &ArrayD<f32>) -> Result<Value, RuntimeError> {
    if logits.shape() != labels.shape() {
        return Err(RuntimeError::ShapeError(format!(
            "SoftmaxCrossEntropy: logits {:?} and labels {:?} differ",
            logits.shape(),
            labels.shape()
        )));
    }
    let axis = last_axis(logits, "SoftmaxCrossEntropy")?;
    // xent = sum(y) * logsumexp(l) - sum(y * l)
    let losses = Zip::from(logits.lanes(axis)).and(labels.lanes(axis)).map_collect(|l, y| {
        let max_val = l.iter().fold(f32::NEG_INFINITY, |max, &v| max.max(v));
        let lse = max_val + l.iter().map(|&v| (v - max_val).exp()).sum::<f32>().ln();
        let mass: f32 = y.sum();
        let dot: f32 = l.iter().zip(y.iter()).map(|(&a, &b)| a * b).sum();
        mass * lse - dot
    });
    Ok(Value::Tensor(losses.insert_axis(axis)))
}

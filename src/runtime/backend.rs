//! Abstract interface (trait) for execution backends.

use crate::asg::{Asg, AsgId, NodeId, Value};
use std::collections::HashMap;
use thiserror::Error;

/// Errors raised while executing a graph. Shared by all backends.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RuntimeError {
    #[error("Node with ID {0} not found in graph {1}. Check that the graph was built correctly and all nodes exist.")]
    NodeNotFound(NodeId, AsgId),

    #[error("Tensor shape error: {0}")]
    ShapeError(String),

    #[error("Missing value for input '{0}' (node ID: {1}). Feed it when running the graph.")]
    MissingInput(String, NodeId),

    #[error("Missing value for parameter '{0}' (node ID: {1}). Initialize variables before running the graph.")]
    MissingParameter(String, NodeId),

    #[error("Computation error: {0}")]
    ComputationError(String),
}

/// Cache of computed node values, keyed by (AsgId, NodeId).
pub type Memo<T> = HashMap<(AsgId, NodeId), T>;

/// Common interface of an execution backend.
///
/// Anything implementing this trait can take an ASG plus data and run it.
pub trait Backend {
    /// Device-specific representation of a value.
    type DeviceData: std::fmt::Debug;

    /// Moves host values to the device.
    fn load_data(
        &self,
        data: &HashMap<String, Value>,
    ) -> Result<HashMap<String, Self::DeviceData>, RuntimeError>;

    /// Runs the graph, starting from and extending the given memo.
    ///
    /// # Arguments
    /// * `main_asg` - Graph to execute.
    /// * `initial_memo` - Inputs, parameters and, for gradient graphs, the
    ///   values computed by the forward run.
    ///
    /// # Returns
    /// The graph outputs and the final memo with every intermediate value.
    fn run(
        &self,
        main_asg: &Asg,
        initial_memo: Memo<Self::DeviceData>,
    ) -> Result<(Vec<Self::DeviceData>, Memo<Self::DeviceData>), RuntimeError>;

    /// Moves results back to the host.
    fn retrieve_data(&self, device_data: &[Self::DeviceData]) -> Result<Vec<Value>, RuntimeError>;
}

//! # Graph Analysis Module
//!
//! Analysis passes that process the ASG before execution.
//!
//! - [`ShapeInference`](shape_inference::ShapeInference): propagates tensor
//!   shapes through the graph, detecting mismatches before any data flows.
//!
//! ```text
//! ASG (untyped) -> Shape Inference -> ASG (with shapes/dtypes)
//! ```
//!
//! The trainer runs this pass once at construction with a one-row probe
//! batch, so a model whose matrices do not compose is rejected before the
//! first batch is fed.

pub mod shape_inference;

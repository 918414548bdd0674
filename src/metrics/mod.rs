//! Metrics accumulated while training.
//!
//! Per-batch accuracy is part of the model graph; this module only holds the
//! online accumulators used to average per-batch results over an epoch.

pub mod running;

pub use running::RunningMean;

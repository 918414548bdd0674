//! Execution side of the engine.
//!
//! `backend` defines the backend trait, `cpu_backend` executes graphs with
//! `ndarray`, and `session` holds live variable values and drives forward,
//! gradient and optimizer runs.

pub mod backend;
pub mod cpu_backend;
pub mod session;

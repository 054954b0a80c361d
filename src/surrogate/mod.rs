// src/surrogate/mod.rs

//! Gaussian-process surrogate of the log-discrepancy surface.

pub mod gp;
pub mod kernel;
mod optimization;

pub use self::gp::GpRegression;
pub use self::kernel::{Constraint, Hyperparameter, KernelSpec};

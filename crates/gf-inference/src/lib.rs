//! # gf-inference
//!
//! Parameter estimation for gammafold datasets.
//!
//! This crate provides:
//! - Optimizer backends over argmin (L-BFGS with clamped bounds, Nelder-Mead).
//! - The [`Fit`] driver: joint minimization of summed dataset statistics,
//!   covariance from the Hessian, profile-likelihood intervals and scans.
//!
//! Datasets enter through [`gf_core::StatDataset`] only.

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Joint fit driver.
pub mod fit;
/// Generic numerical optimizers.
pub mod optimizer;

pub use fit::{ConfidenceConfig, ConfidenceResult, Fit, FitConfig, StatProfile};
pub use optimizer::{
    LbfgsbOptimizer, NelderMeadOptimizer, ObjectiveFunction, OptimizationResult, OptimizerBackend,
    OptimizerConfig,
};

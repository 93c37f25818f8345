//! # gf-core
//!
//! Shared building blocks for the gammafold workspace.
//!
//! This crate provides:
//! - The error taxonomy used by every other crate ([`Error`], [`Result`]).
//! - Shared model parameters and their covariance ([`parameter`]).
//! - The [`FitResult`] record returned by the fit driver.
//! - The [`traits::StatDataset`] seam between datasets and the fit driver.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod parameter;
pub mod traits;
pub mod types;

pub use error::{Error, Result};
pub use parameter::{Covariance, Parameter, ParameterState, Parameters};
pub use traits::StatDataset;
pub use types::FitResult;

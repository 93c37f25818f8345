//! # gf-datasets
//!
//! Forward folding of sky models through instrument responses, and the
//! binned likelihoods that compare the prediction with observed counts.
//!
//! - [`models`]: spectral, spatial, sky and background models.
//! - [`irf`]: effective area, energy dispersion and PSF kernels.
//! - [`MapEvaluator`]: predicted counts of one sky model.
//! - [`MapDataset`] (Cash) and [`MapDatasetOnOff`] (WSTAT), both
//!   [`gf_core::StatDataset`]s.
//! - [`maker`]: event lists binned into datasets.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod dataset;
pub mod evaluator;
pub mod io;
pub mod irf;
pub mod maker;
pub mod models;
pub mod onoff;
pub mod stats;

pub use dataset::{DatasetInfo, DatasetState, MapDataset, ResidualMethod};
pub use evaluator::MapEvaluator;
pub use irf::{EDispKernel, EffectiveAreaTable, PsfKernel};
pub use maker::{EventList, MakerConfig, MapDatasetMaker};
pub use models::{BackgroundModel, SkyModel};
pub use onoff::MapDatasetOnOff;

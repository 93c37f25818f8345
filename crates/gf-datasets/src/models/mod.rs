//! Source and background models.
//!
//! The evaluator only calls the [`SpectralModel`] and [`SpatialModel`]
//! capabilities; concrete models are reference functional forms.

pub mod background;
pub mod spatial;
pub mod spectral;

pub use background::BackgroundModel;
pub use spatial::{
    DiskSpatialModel, GaussianSpatialModel, PointSpatialModel, SpatialModel,
    integrate_oversampled,
};
pub use spectral::{LogParabola, PowerLaw, SpectralModel};

use gf_core::Parameters;
use std::sync::Arc;

/// A source: spectral shape times spatial morphology
#[derive(Debug, Clone)]
pub struct SkyModel {
    name: String,
    spectral: Arc<dyn SpectralModel>,
    spatial: Arc<dyn SpatialModel>,
}

impl SkyModel {
    /// New source model
    pub fn new(
        name: impl Into<String>,
        spectral: Arc<dyn SpectralModel>,
        spatial: Arc<dyn SpatialModel>,
    ) -> Self {
        Self { name: name.into(), spectral, spatial }
    }

    /// Source name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Spectral component
    pub fn spectral(&self) -> &dyn SpectralModel {
        self.spectral.as_ref()
    }

    /// Spatial component
    pub fn spatial(&self) -> &dyn SpatialModel {
        self.spatial.as_ref()
    }

    /// Spectral then spatial parameters
    pub fn parameters(&self) -> Parameters {
        let mut p = self.spectral.parameters();
        p.extend(&self.spatial.parameters());
        p
    }
}

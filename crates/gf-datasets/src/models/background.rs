//! Spectral correction applied to a background template.


use gf_core::{Parameter, Parameters, Result};
use gf_maps::Map;
use ndarray::{ArrayD, IxDyn};

/// `norm * bkg * (E / reference)^(-tilt)` on the reconstructed-energy axis
#[derive(Debug, Clone)]
pub struct BackgroundModel {
    /// Overall scale, `>= 0`
    pub norm: Parameter,
    /// Spectral tilt, frozen at 0 by default
    pub tilt: Parameter,
    /// Energy at which the tilt pivots (TeV), frozen
    pub reference: Parameter,
}

impl Default for BackgroundModel {
    fn default() -> Self {
        Self::new(1.0)
    }
}

impl BackgroundModel {
    /// Free `norm`, `tilt` frozen at 0, reference frozen at `1 TeV`
    pub fn new(norm: f64) -> Self {
        Self {
            norm: Parameter::new("norm", norm).with_bounds(0.0, f64::INFINITY),
            tilt: Parameter::new("tilt", 0.0).with_frozen(true),
            reference: Parameter::new("reference", 1.0).with_unit("TeV").with_frozen(true),
        }
    }

    /// Parameters in `norm, tilt, reference` order
    pub fn parameters(&self) -> Parameters {
        Parameters::new(vec![self.norm.clone(), self.tilt.clone(), self.reference.clone()])
    }

    /// Corrected background.
    ///
    /// The tilt uses the bin centers of the `energy` axis; maps without one
    /// are only scaled by `norm`.
    pub fn evaluate(&self, background: &Map) -> Result<Map> {
        let norm = self.norm.value();
        let geom = background.geom();
        let Ok(k) = geom.axis_index("energy") else {
            return Ok(background * norm);
        };
        let (tilt, e_ref) = (self.tilt.value(), self.reference.value());
        let axis = &geom.axes()[k];
        let n = geom.axes().len();
        let mut shape = vec![1usize; n + 2];
        shape[n - 1 - k] = axis.nbin();
        let centers = axis.center();
        let factors = ArrayD::from_shape_fn(IxDyn(&shape), |ix| {
            norm * (centers[ix[n - 1 - k]] / e_ref).powf(-tilt)
        });
        let data = background.data() * &factors;
        background.with_data(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use gf_maps::{MapAxis, Projection, SkyCoord, WcsGeom};

    #[test]
    fn test_norm_and_tilt() {
        let energy = MapAxis::from_edges(vec![0.5, 2.0, 8.0], gf_maps::Interp::Log, "energy", "TeV")
            .unwrap();
        let geom = WcsGeom::create(SkyCoord::galactic(0.0, 0.0), 1.0, (2.0, 2.0), Projection::Car, vec![
            energy,
        ])
        .unwrap();
        let bkg = Map::from_elem(geom, 2.0, "");
        let model = BackgroundModel::new(1.5);
        let out = model.evaluate(&bkg).unwrap();
        assert_relative_eq!(out.sum(), 1.5 * bkg.sum());

        model.tilt.set_value(1.0);
        let out = model.evaluate(&bkg).unwrap();
        // centers at 1 and 4 TeV
        assert_relative_eq!(out.data()[[0, 0, 0]], 3.0, max_relative = 1e-12);
        assert_relative_eq!(out.data()[[1, 1, 1]], 0.75, max_relative = 1e-12);
        assert!(model.parameters().at(1).unwrap().ptr_eq(&model.tilt));
    }
}

//! Forward folding of one sky model into predicted counts.
//!
//! The pipeline runs on the exposure grid (true energy) and ends on the
//! counts grid (reconstructed energy):
//!
//! 1. spatial integral per pixel × spectral integral per true-energy bin
//! 2. × exposure
//! 3. per-slice PSF convolution
//! 4. energy-dispersion contraction
//! 5. paste back into the full geometry when a cutout was used

use crate::irf::{EDispKernel, ENERGY_TRUE, PsfKernel};
use crate::models::SkyModel;
use gf_core::{Error, Result};
use gf_maps::convolve::convolve2d_same;
use gf_maps::{CutoutMode, Map, MapAxis, WcsGeom};
use ndarray::{Array2, Array3, Axis};
use std::sync::Arc;

/// Name of the reconstructed-energy axis
pub const ENERGY: &str = "energy";

/// Evaluates one [`SkyModel`] on a dataset's exposure and counts geometries
#[derive(Debug, Clone)]
pub struct MapEvaluator {
    model: SkyModel,
    exposure: Arc<Map>,
    geom: Arc<WcsGeom>,
    psf: Option<PsfKernel>,
    edisp: Option<EDispKernel>,
    use_cutout: bool,
}

impl MapEvaluator {
    /// Check that the components agree and build the evaluator.
    ///
    /// `exposure` carries a single `energy_true` axis, `geom` a single
    /// `energy` axis on the same spatial grid. Without energy dispersion both
    /// axes must have the same binning.
    pub fn new(
        model: SkyModel,
        exposure: Arc<Map>,
        geom: Arc<WcsGeom>,
        psf: Option<PsfKernel>,
        edisp: Option<EDispKernel>,
    ) -> Result<Self> {
        check_components(exposure.geom(), &geom, psf.as_ref(), edisp.as_ref())?;
        Ok(Self { model, exposure, geom, psf, edisp, use_cutout: true })
    }

    /// Enable or disable cutout evaluation around compact sources
    pub fn with_cutout(mut self, use_cutout: bool) -> Self {
        self.use_cutout = use_cutout;
        self
    }

    /// Model being evaluated
    pub fn model(&self) -> &SkyModel {
        &self.model
    }

    /// Output geometry
    pub fn geom(&self) -> &WcsGeom {
        &self.geom
    }

    /// Angular width of the evaluation region, `None` for the full map
    fn cutout_width(&self) -> Option<f64> {
        if !self.use_cutout {
            return None;
        }
        let radius = self.model.spatial().evaluation_radius()?;
        let psf = self.psf.as_ref().map_or(0.0, |p| p.radius());
        let binsz = self.geom.binsz();
        let width = 2.0 * (radius + psf) + 4.0 * binsz;
        let (w, h) = self.geom.width();
        (width < w.min(h)).then_some(width)
    }

    /// Exposure and output geometry restricted to the evaluation region
    fn region(&self) -> Result<(Map, Arc<WcsGeom>, bool)> {
        let full = || Ok(((*self.exposure).clone(), self.geom.clone(), false));
        let (Some(width), Some(position)) = (self.cutout_width(), self.model.spatial().position())
        else {
            return full();
        };
        match (
            self.exposure.cutout(&position, (width, width), CutoutMode::Trim),
            self.geom.cutout(&position, (width, width), CutoutMode::Trim),
        ) {
            (Ok(exposure), Ok((geom, _))) => Ok((exposure, Arc::new(geom), true)),
            _ => {
                log::debug!(
                    "model '{}' outside the cutout region, evaluating on the full map",
                    self.model.name()
                );
                full()
            }
        }
    }

    /// Predicted counts of the model on the output geometry
    pub fn compute_npred(&self) -> Result<Map> {
        let (exposure, geom, is_cutout) = self.region()?;
        let image_geom = exposure.geom().to_image();

        let e_true = single_axis(exposure.geom(), ENERGY_TRUE)?;
        let spectral = self.model.spectral();
        let flux: Vec<f64> = e_true
            .edges_min()
            .iter()
            .zip(e_true.edges_max())
            .map(|(&lo, &hi)| spectral.integral(lo, hi))
            .collect();
        let spatial = self.model.spatial().integrate_geom(&image_geom)?;

        let mut npred = exposure.image_planes()?;
        for (mut plane, &f) in npred.outer_iter_mut().zip(&flux) {
            plane.zip_mut_with(&spatial, |e, &s| {
                *e = if e.is_finite() { *e * f * s } else { 0.0 };
            });
        }

        if let Some(psf) = &self.psf {
            npred = apply_psf(npred, psf)?;
        }

        let npred = match &self.edisp {
            Some(edisp) => apply_edisp(&npred, edisp.data())?,
            None => npred,
        };

        let out = Map::from_image_planes(geom, npred, "")?;
        if !is_cutout {
            return Ok(out);
        }
        let mut full = Map::from_geom(self.geom.clone(), "");
        full.paste(&out)?;
        Ok(full)
    }
}

/// Exposure, counts grid and IRF kernels must describe the same binning
pub(crate) fn check_components(
    exposure: &WcsGeom,
    geom: &WcsGeom,
    psf: Option<&PsfKernel>,
    edisp: Option<&EDispKernel>,
) -> Result<()> {
    let e_true = single_axis(exposure, ENERGY_TRUE)?;
    let e_reco = single_axis(geom, ENERGY)?;
    if !exposure.is_image_allclose(geom, 1e-9) {
        return Err(Error::GeometryMismatch(
            "exposure and counts geometries have different spatial grids".to_string(),
        ));
    }
    if let Some(psf) = psf {
        if psf.axis_true() != e_true {
            return Err(Error::GeometryMismatch(
                "psf kernel and exposure have different true-energy axes".to_string(),
            ));
        }
        psf.check_geom(geom)?;
    }
    match edisp {
        Some(edisp) => {
            if edisp.axis_true() != e_true || edisp.axis_reco() != e_reco {
                return Err(Error::GeometryMismatch(
                    "energy dispersion axes do not match exposure and counts".to_string(),
                ));
            }
        }
        None => {
            if !e_true.with_name(ENERGY).is_allclose(e_reco, 1e-9) {
                return Err(Error::GeometryMismatch(
                    "without energy dispersion true and reco energy binning must agree".to_string(),
                ));
            }
        }
    }
    Ok(())
}

pub(crate) fn single_axis<'a>(geom: &'a WcsGeom, name: &str) -> Result<&'a MapAxis> {
    match geom.axes() {
        [axis] if axis.name() == name => Ok(axis),
        axes => Err(Error::Configuration(format!(
            "expected a single '{name}' axis, got {:?}",
            axes.iter().map(|a| a.name()).collect::<Vec<_>>()
        ))),
    }
}

/// Convolve each true-energy plane with its own kernel slice
fn apply_psf(mut planes: Array3<f64>, psf: &PsfKernel) -> Result<Array3<f64>> {
    for (mut plane, kernel) in planes.outer_iter_mut().zip(psf.data().outer_iter()) {
        let smoothed = convolve2d_same(&plane.view(), &kernel)?;
        plane.assign(&smoothed);
    }
    Ok(planes)
}

/// `out[r, y, x] = Σ_t planes[t, y, x] · matrix[t, r]`
pub(crate) fn apply_edisp(planes: &Array3<f64>, matrix: &Array2<f64>) -> Result<Array3<f64>> {
    let (nt, ny, nx) = planes.dim();
    if matrix.nrows() != nt {
        return Err(Error::GeometryMismatch(format!(
            "energy dispersion has {} true bins, npred has {}",
            matrix.nrows(),
            nt
        )));
    }
    let flat = planes
        .as_standard_layout()
        .into_owned()
        .into_shape_with_order((nt, ny * nx))
        .map_err(|e| Error::Computation(e.to_string()))?;
    let reco = matrix.t().dot(&flat);
    let nr = reco.len_of(Axis(0));
    reco.into_shape_with_order((nr, ny, nx)).map_err(|e| Error::Computation(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::irf::EffectiveAreaTable;
    use crate::models::{GaussianSpatialModel, PointSpatialModel, PowerLaw};
    use approx::assert_relative_eq;
    use gf_maps::{Frame, Projection, SkyCoord};

    fn geoms(nbin: usize) -> (Arc<WcsGeom>, Arc<WcsGeom>) {
        let reco = MapAxis::from_energy_bounds(1.0, 10.0, nbin, "TeV", false).unwrap();
        let geom =
            WcsGeom::create(SkyCoord::galactic(0.0, 0.0), 0.1, (4.0, 4.0), Projection::Car, vec![reco])
                .unwrap();
        let true_axis = geom.axes()[0].with_name(ENERGY_TRUE);
        let geom_true = geom.to_cube(vec![true_axis]).unwrap();
        (Arc::new(geom), Arc::new(geom_true))
    }

    fn exposure(geom_true: &Arc<WcsGeom>, value: f64) -> Arc<Map> {
        Arc::new(Map::from_elem(geom_true.clone(), value, "cm2 s"))
    }

    fn point_model(lon: f64) -> SkyModel {
        SkyModel::new(
            "src",
            Arc::new(PowerLaw::new(2.0, 1e-12, 1.0)),
            Arc::new(PointSpatialModel::new(lon, 0.0, Frame::Galactic)),
        )
    }

    #[test]
    fn test_point_source_total_counts() {
        let (geom, geom_true) = geoms(3);
        let model = point_model(0.05);
        let eval = MapEvaluator::new(model.clone(), exposure(&geom_true, 1e12), geom, None, None)
            .unwrap();
        let npred = eval.compute_npred().unwrap();
        // ∫ 1e-12 E^-2 dE over [1, 10] TeV times 1e12 cm² s
        assert_relative_eq!(npred.sum(), 0.9, max_relative = 1e-9);
    }

    #[test]
    fn test_cutout_matches_full_evaluation() {
        let (geom, geom_true) = geoms(2);
        let axis = geom_true.axes()[0].clone();
        let psf = PsfKernel::from_gauss(axis, 0.1, &[0.1, 0.2], 0.5).unwrap();
        let model = SkyModel::new(
            "src",
            Arc::new(PowerLaw::default()),
            Arc::new(GaussianSpatialModel::new(0.5, -0.3, 0.1, Frame::Galactic)),
        );
        let exposure = exposure(&geom_true, 1e12);
        let eval = MapEvaluator::new(model, exposure, geom, Some(psf), None).unwrap();
        let cut = eval.compute_npred().unwrap();
        let full = eval.clone().with_cutout(false).compute_npred().unwrap();
        assert_relative_eq!(cut.sum(), full.sum(), max_relative = 1e-6);
        for (a, b) in cut.data().iter().zip(full.data().iter()) {
            assert_relative_eq!(a, b, epsilon = 1e-9 * full.sum());
        }
    }

    #[test]
    fn test_edisp_redistributes_counts() {
        let (geom, geom_true) = geoms(4);
        let e_true = geom_true.axes()[0].clone();
        let e_reco = geom.axes()[0].clone();
        let edisp = EDispKernel::from_gauss(e_true, e_reco, 0.2, 0.0).unwrap();
        let row_sums: Vec<f64> = edisp.data().rows().into_iter().map(|r| r.sum()).collect();
        let model = point_model(0.0);
        let exposure = exposure(&geom_true, 1e12);
        let no_edisp =
            MapEvaluator::new(model.clone(), exposure.clone(), geom.clone(), None, None).unwrap();
        let with_edisp = MapEvaluator::new(model, exposure, geom, None, Some(edisp)).unwrap();

        let a = no_edisp.compute_npred().unwrap().image_planes().unwrap();
        let b = with_edisp.compute_npred().unwrap();
        // counts lost at the range edges follow the row sums
        let expected: f64 =
            a.outer_iter().zip(&row_sums).map(|(plane, w)| plane.sum() * w).sum();
        assert_relative_eq!(b.sum(), expected, max_relative = 1e-9);
        assert!(b.sum() < a.sum());
    }

    #[test]
    fn test_geometry_mismatch_is_rejected() {
        let (geom, geom_true) = geoms(3);
        let (_, other_true) = geoms(4);
        let model = point_model(0.0);
        let err = MapEvaluator::new(model.clone(), exposure(&other_true, 1.0), geom.clone(), None, None);
        assert!(matches!(err, Err(Error::GeometryMismatch(_))));

        let wrong = EDispKernel::from_diagonal(other_true.axes()[0].clone(), geom.axes()[0].clone())
            .unwrap();
        let err = MapEvaluator::new(model.clone(), exposure(&geom_true, 1.0), geom.clone(), None, Some(wrong));
        assert!(matches!(err, Err(Error::GeometryMismatch(_))));

        let psf = PsfKernel::from_gauss(geom_true.axes()[0].clone(), 0.05, &[0.1; 3], 0.2).unwrap();
        let err = MapEvaluator::new(model, exposure(&geom_true, 1.0), geom, Some(psf), None);
        assert!(matches!(err, Err(Error::Configuration(_))));
    }

    #[test]
    fn test_aeff_exposure_feeds_npred() {
        let (geom, geom_true) = geoms(3);
        let aeff = EffectiveAreaTable::constant(geom_true.axes()[0].clone(), 1e5).unwrap();
        let exposure = crate::maker::make_exposure(&aeff, &geom_true, 1e7).unwrap();
        let eval = MapEvaluator::new(point_model(0.0), Arc::new(exposure), geom, None, None).unwrap();
        assert_relative_eq!(eval.compute_npred().unwrap().sum(), 0.9, max_relative = 1e-9);
    }
}

//! Spatial models: surface brightness per steradian on the sky.
//!
//! A spatial model integrates to one over the sphere, so the per-pixel
//! integral from [`SpatialModel::integrate_geom`] is the fraction of the
//! source flux falling into each pixel.


use gf_core::{Parameter, Parameters, Result};
use gf_maps::{Frame, SkyCoord, WcsGeom};
use ndarray::Array2;
use std::f64::consts::PI;
use std::fmt::Debug;

/// Capability required by the evaluator from a spatial model
pub trait SpatialModel: Debug + Send + Sync {
    /// Surface brightness (sr⁻¹) in the given direction
    fn evaluate(&self, direction: &SkyCoord) -> f64;

    /// Integral over every spatial pixel of `geom`, shape `(ny, nx)`.
    ///
    /// The default is the value at the pixel center times the pixel solid angle.
    fn integrate_geom(&self, geom: &WcsGeom) -> Result<Array2<f64>> {
        let (lon, lat) = geom.image_lonlat();
        let omega = geom.solid_angle();
        let frame = geom.frame();
        Ok(ndarray::Zip::from(&lon).and(&lat).and(&omega).map_collect(|&l, &b, &o| {
            if o.is_finite() { self.evaluate(&SkyCoord::new(l, b, frame)) * o } else { 0.0 }
        }))
    }

    /// Model center, if the model is localized
    fn position(&self) -> Option<SkyCoord> {
        None
    }

    /// Radius in degrees outside which the model is negligible
    fn evaluation_radius(&self) -> Option<f64> {
        None
    }

    /// Model parameters
    fn parameters(&self) -> Parameters;
}

/// Integrate on a grid oversampled until the pixel size is at most a third of
/// `scale` (degrees), then sum back onto `geom`.
pub fn integrate_oversampled<M: SpatialModel + ?Sized>(
    model: &M,
    geom: &WcsGeom,
    scale: f64,
) -> Result<Array2<f64>> {
    let image = geom.to_image();
    let factor = if scale > 0.0 {
        ((3.0 * image.binsz() / scale).ceil() as usize).clamp(1, 10)
    } else {
        1
    };
    let fine = image.upsample(factor)?;
    let (lon, lat) = fine.image_lonlat();
    let omega = fine.solid_angle();
    let frame = fine.frame();
    let (nx, ny) = image.npix();
    let mut out = Array2::zeros((ny, nx));
    for ((iy, ix), &o) in omega.indexed_iter() {
        if !o.is_finite() {
            continue;
        }
        let v = model.evaluate(&SkyCoord::new(lon[[iy, ix]], lat[[iy, ix]], frame));
        out[[iy / factor, ix / factor]] += v * o;
    }
    Ok(out)
}

fn position_parameters(lon: f64, lat: f64) -> (Parameter, Parameter) {
    (
        Parameter::new("lon_0", lon).with_unit("deg"),
        Parameter::new("lat_0", lat).with_unit("deg").with_bounds(-90.0, 90.0),
    )
}

/// Point source; its flux is shared bilinearly between the four nearest pixel centers.
#[derive(Debug, Clone)]
pub struct PointSpatialModel {
    /// Longitude in degrees
    pub lon_0: Parameter,
    /// Latitude in degrees
    pub lat_0: Parameter,
    /// Frame of `lon_0`, `lat_0`
    pub frame: Frame,
}

impl PointSpatialModel {
    /// New point source at `(lon, lat)` degrees
    pub fn new(lon: f64, lat: f64, frame: Frame) -> Self {
        let (lon_0, lat_0) = position_parameters(lon, lat);
        Self { lon_0, lat_0, frame }
    }
}

impl SpatialModel for PointSpatialModel {
    fn evaluate(&self, _direction: &SkyCoord) -> f64 {
        0.0
    }

    fn integrate_geom(&self, geom: &WcsGeom) -> Result<Array2<f64>> {
        let (nx, ny) = geom.npix();
        let mut out = Array2::zeros((ny, nx));
        let (px, py) = geom.skycoord_to_pix(&SkyCoord::new(
            self.lon_0.value(),
            self.lat_0.value(),
            self.frame,
        ));
        if !(px.is_finite() && py.is_finite()) {
            return Ok(out);
        }
        let (tx, ty) = (px - 0.5, py - 0.5);
        let (x0, y0) = (tx.floor(), ty.floor());
        let (fx, fy) = (tx - x0, ty - y0);
        for (dx, wx) in [(0i64, 1.0 - fx), (1, fx)] {
            for (dy, wy) in [(0i64, 1.0 - fy), (1, fy)] {
                let (x, y) = (x0 as i64 + dx, y0 as i64 + dy);
                if x >= 0 && y >= 0 && (x as usize) < nx && (y as usize) < ny {
                    out[[y as usize, x as usize]] += wx * wy;
                }
            }
        }
        Ok(out)
    }

    fn position(&self) -> Option<SkyCoord> {
        Some(SkyCoord::new(self.lon_0.value(), self.lat_0.value(), self.frame))
    }

    fn evaluation_radius(&self) -> Option<f64> {
        Some(0.0)
    }

    fn parameters(&self) -> Parameters {
        Parameters::new(vec![self.lon_0.clone(), self.lat_0.clone()])
    }
}

/// Symmetric 2-D Gaussian, normalized in the small-angle approximation
#[derive(Debug, Clone)]
pub struct GaussianSpatialModel {
    /// Center longitude in degrees
    pub lon_0: Parameter,
    /// Center latitude in degrees
    pub lat_0: Parameter,
    /// Width in degrees
    pub sigma: Parameter,
    /// Frame of the center
    pub frame: Frame,
}

impl GaussianSpatialModel {
    /// New Gaussian of width `sigma` degrees
    pub fn new(lon: f64, lat: f64, sigma: f64, frame: Frame) -> Self {
        let (lon_0, lat_0) = position_parameters(lon, lat);
        let sigma = Parameter::new("sigma", sigma).with_unit("deg").with_bounds(0.0, f64::INFINITY);
        Self { lon_0, lat_0, sigma, frame }
    }
}

impl SpatialModel for GaussianSpatialModel {
    fn evaluate(&self, direction: &SkyCoord) -> f64 {
        let center = SkyCoord::new(self.lon_0.value(), self.lat_0.value(), self.frame);
        let sep = center.separation(direction).to_radians();
        let sigma = self.sigma.value().to_radians();
        if sigma <= 0.0 {
            return 0.0;
        }
        (-0.5 * (sep / sigma).powi(2)).exp() / (2.0 * PI * sigma * sigma)
    }

    fn integrate_geom(&self, geom: &WcsGeom) -> Result<Array2<f64>> {
        integrate_oversampled(self, geom, self.sigma.value())
    }

    fn position(&self) -> Option<SkyCoord> {
        Some(SkyCoord::new(self.lon_0.value(), self.lat_0.value(), self.frame))
    }

    fn evaluation_radius(&self) -> Option<f64> {
        Some(5.0 * self.sigma.value())
    }

    fn parameters(&self) -> Parameters {
        Parameters::new(vec![self.lon_0.clone(), self.lat_0.clone(), self.sigma.clone()])
    }
}

/// Uniform disk of radius `r_0` degrees
#[derive(Debug, Clone)]
pub struct DiskSpatialModel {
    /// Center longitude in degrees
    pub lon_0: Parameter,
    /// Center latitude in degrees
    pub lat_0: Parameter,
    /// Radius in degrees
    pub r_0: Parameter,
    /// Frame of the center
    pub frame: Frame,
}

impl DiskSpatialModel {
    /// New disk
    pub fn new(lon: f64, lat: f64, r_0: f64, frame: Frame) -> Self {
        let (lon_0, lat_0) = position_parameters(lon, lat);
        let r_0 = Parameter::new("r_0", r_0).with_unit("deg").with_bounds(0.0, 180.0);
        Self { lon_0, lat_0, r_0, frame }
    }
}

impl SpatialModel for DiskSpatialModel {
    fn evaluate(&self, direction: &SkyCoord) -> f64 {
        let center = SkyCoord::new(self.lon_0.value(), self.lat_0.value(), self.frame);
        let r = self.r_0.value();
        if r <= 0.0 || center.separation(direction) > r {
            return 0.0;
        }
        1.0 / (2.0 * PI * (1.0 - r.to_radians().cos()))
    }

    fn integrate_geom(&self, geom: &WcsGeom) -> Result<Array2<f64>> {
        integrate_oversampled(self, geom, self.r_0.value())
    }

    fn position(&self) -> Option<SkyCoord> {
        Some(SkyCoord::new(self.lon_0.value(), self.lat_0.value(), self.frame))
    }

    fn evaluation_radius(&self) -> Option<f64> {
        Some(self.r_0.value())
    }

    fn parameters(&self) -> Parameters {
        Parameters::new(vec![self.lon_0.clone(), self.lat_0.clone(), self.r_0.clone()])
    }
}

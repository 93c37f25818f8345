//! World-coordinate transforms between sky directions and spatial pixels.
//!
//! Both projections work on a native sphere rotated so that the reference
//! direction `crval` sits at native `(0, 0)`:
//!
//! - `CAR`: intermediate coordinates are native longitude/latitude.
//! - `TAN`: gnomonic projection onto the plane tangent at `crval`.
//!
//! Pixel coordinates follow the crate convention (pixel `i` spans `[i, i+1)`).

use crate::skycoord::{Frame, lonlat_to_vec, vec_to_lonlat};
use nalgebra::{Matrix3, Vector3};
use serde::{Deserialize, Serialize};

/// Sky projection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Projection {
    /// Plate carrée
    #[serde(rename = "CAR")]
    Car,
    /// Gnomonic (tangent plane)
    #[serde(rename = "TAN")]
    Tan,
}

/// Linear pixel mapping plus a sky projection
#[derive(Debug, Clone, PartialEq)]
pub struct WcsTransform {
    frame: Frame,
    projection: Projection,
    /// Reference direction (lon, lat) in degrees
    crval: [f64; 2],
    /// Pixel coordinate of the reference direction
    crpix: [f64; 2],
    /// Degrees per pixel along x and y (x is negative for the usual sky orientation)
    cdelt: [f64; 2],
    /// World → native rotation
    rot: Matrix3<f64>,
}

fn native_rotation(lon0: f64, lat0: f64) -> Matrix3<f64> {
    let (sl, cl) = lon0.to_radians().sin_cos();
    let (sb, cb) = lat0.to_radians().sin_cos();
    let rz = Matrix3::new(cl, sl, 0.0, -sl, cl, 0.0, 0.0, 0.0, 1.0);
    let ry = Matrix3::new(cb, 0.0, sb, 0.0, 1.0, 0.0, -sb, 0.0, cb);
    ry * rz
}

impl WcsTransform {
    /// New transform
    pub fn new(
        frame: Frame,
        projection: Projection,
        crval: [f64; 2],
        crpix: [f64; 2],
        cdelt: [f64; 2],
    ) -> Self {
        Self { frame, projection, crval, crpix, cdelt, rot: native_rotation(crval[0], crval[1]) }
    }

    /// Frame of the world coordinates
    pub fn frame(&self) -> Frame {
        self.frame
    }

    /// Projection
    pub fn projection(&self) -> Projection {
        self.projection
    }

    /// Reference direction (degrees)
    pub fn crval(&self) -> [f64; 2] {
        self.crval
    }

    /// Reference pixel
    pub fn crpix(&self) -> [f64; 2] {
        self.crpix
    }

    /// Pixel scale (degrees per pixel)
    pub fn cdelt(&self) -> [f64; 2] {
        self.cdelt
    }

    /// Same projection with the reference pixel moved
    pub fn with_crpix(&self, crpix: [f64; 2]) -> Self {
        Self { crpix, ..self.clone() }
    }

    /// Same projection with a new pixel scale and reference pixel
    pub fn with_scale(&self, cdelt: [f64; 2], crpix: [f64; 2]) -> Self {
        Self { cdelt, crpix, ..self.clone() }
    }

    /// World unit vector (in this frame) → pixel; NaN where the projection is undefined
    pub fn vec_to_pix(&self, v: &Vector3<f64>) -> (f64, f64) {
        let n = self.rot * v;
        let (xi, eta) = match self.projection {
            Projection::Car => {
                let phi = n.y.atan2(n.x).to_degrees();
                let theta = (n.z / n.norm()).clamp(-1.0, 1.0).asin().to_degrees();
                (phi, theta)
            }
            Projection::Tan => {
                if n.x <= 0.0 {
                    return (f64::NAN, f64::NAN);
                }
                ((n.y / n.x).to_degrees(), (n.z / n.x).to_degrees())
            }
        };
        (self.crpix[0] + xi / self.cdelt[0], self.crpix[1] + eta / self.cdelt[1])
    }

    /// `(lon, lat)` in this frame → pixel
    pub fn world_to_pix(&self, lon: f64, lat: f64) -> (f64, f64) {
        if !(lon.is_finite() && lat.is_finite()) {
            return (f64::NAN, f64::NAN);
        }
        self.vec_to_pix(&lonlat_to_vec(lon, lat))
    }

    /// Pixel → world unit vector; `None` where the projection is undefined
    pub fn pix_to_vec(&self, x: f64, y: f64) -> Option<Vector3<f64>> {
        let xi = (x - self.crpix[0]) * self.cdelt[0];
        let eta = (y - self.crpix[1]) * self.cdelt[1];
        let native = match self.projection {
            Projection::Car => {
                if !(-90.0..=90.0).contains(&eta) || !(-180.0..=180.0).contains(&xi) {
                    return None;
                }
                lonlat_to_vec(xi, eta)
            }
            Projection::Tan => {
                if !(xi.is_finite() && eta.is_finite()) {
                    return None;
                }
                Vector3::new(1.0, xi.to_radians(), eta.to_radians()).normalize()
            }
        };
        Some(self.rot.transpose() * native)
    }

    /// Pixel → `(lon, lat)` in this frame; NaN where undefined
    pub fn pix_to_world(&self, x: f64, y: f64) -> (f64, f64) {
        match self.pix_to_vec(x, y) {
            Some(v) => vec_to_lonlat(&v),
            None => (f64::NAN, f64::NAN),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn car() -> WcsTransform {
        WcsTransform::new(Frame::Galactic, Projection::Car, [0.0, 0.0], [50.0, 50.0], [-0.1, 0.1])
    }

    #[test]
    fn test_car_reference_and_orientation() {
        let w = car();
        let (x, y) = w.world_to_pix(0.0, 0.0);
        assert_relative_eq!(x, 50.0, epsilon = 1e-10);
        assert_relative_eq!(y, 50.0, epsilon = 1e-10);
        // longitude grows to the left
        let (x, _) = w.world_to_pix(1.0, 0.0);
        assert_relative_eq!(x, 40.0, epsilon = 1e-9);
        let (x, _) = w.world_to_pix(359.0, 0.0);
        assert_relative_eq!(x, 60.0, epsilon = 1e-9);
        let (_, y) = w.world_to_pix(0.0, 2.0);
        assert_relative_eq!(y, 70.0, epsilon = 1e-9);
    }

    #[test]
    fn test_round_trip_both_projections() {
        for proj in [Projection::Car, Projection::Tan] {
            let w = WcsTransform::new(
                Frame::Icrs,
                proj,
                [83.63, 22.01],
                [20.0, 20.0],
                [-0.02, 0.02],
            );
            for &(x, y) in &[(0.5, 0.5), (13.2, 37.9), (39.5, 2.25)] {
                let (lon, lat) = w.pix_to_world(x, y);
                let (x2, y2) = w.world_to_pix(lon, lat);
                assert_relative_eq!(x, x2, epsilon = 1e-8);
                assert_relative_eq!(y, y2, epsilon = 1e-8);
            }
        }
    }

    #[test]
    fn test_tan_undefined_behind_plane() {
        let w =
            WcsTransform::new(Frame::Icrs, Projection::Tan, [0.0, 0.0], [5.0, 5.0], [-1.0, 1.0]);
        let (x, y) = w.world_to_pix(180.0, 0.0);
        assert!(x.is_nan() && y.is_nan());
    }
}

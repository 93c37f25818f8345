//! Sky directions and celestial frames.
//!
//! All angles at this level are in degrees. Frame changes use the J2000
//! equatorial → galactic rotation matrix.

use nalgebra::{Matrix3, Vector3};
use serde::{Deserialize, Serialize};

/// Celestial reference frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Frame {
    /// Equatorial (RA/Dec)
    Icrs,
    /// Galactic (l/b)
    Galactic,
}

/// Rotation taking equatorial unit vectors to galactic ones.
fn icrs_to_galactic() -> Matrix3<f64> {
    Matrix3::new(
        -0.054_875_560_416_215_4,
        -0.873_437_090_234_885,
        -0.483_835_015_548_713_2,
        0.494_109_427_875_583_7,
        -0.444_829_629_960_011_2,
        0.746_982_244_497_218_9,
        -0.867_666_149_019_004_7,
        -0.198_076_373_431_201_5,
        0.455_983_776_175_066_9,
    )
}

impl Frame {
    /// Rotation matrix from `self` to `to`
    pub fn rotation_to(self, to: Frame) -> Matrix3<f64> {
        match (self, to) {
            (Frame::Icrs, Frame::Galactic) => icrs_to_galactic(),
            (Frame::Galactic, Frame::Icrs) => icrs_to_galactic().transpose(),
            _ => Matrix3::identity(),
        }
    }
}

/// Unit vector of a `(lon, lat)` direction in degrees
#[inline]
pub fn lonlat_to_vec(lon: f64, lat: f64) -> Vector3<f64> {
    let (sl, cl) = lon.to_radians().sin_cos();
    let (sb, cb) = lat.to_radians().sin_cos();
    Vector3::new(cb * cl, cb * sl, sb)
}

/// `(lon, lat)` in degrees of a (not necessarily normalized) vector; lon in `[0, 360)`
#[inline]
pub fn vec_to_lonlat(v: &Vector3<f64>) -> (f64, f64) {
    let r = v.norm();
    let lat = (v.z / r).clamp(-1.0, 1.0).asin().to_degrees();
    let lon = v.y.atan2(v.x).to_degrees().rem_euclid(360.0);
    (lon, lat)
}

/// Angular distance between two unit vectors, in degrees
#[inline]
pub fn angle_between(a: &Vector3<f64>, b: &Vector3<f64>) -> f64 {
    a.cross(b).norm().atan2(a.dot(b)).to_degrees()
}

/// A single direction on the sky
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SkyCoord {
    /// Longitude (RA or l) in degrees
    pub lon: f64,
    /// Latitude (Dec or b) in degrees
    pub lat: f64,
    /// Reference frame
    pub frame: Frame,
}

impl SkyCoord {
    /// New direction
    pub fn new(lon: f64, lat: f64, frame: Frame) -> Self {
        Self { lon, lat, frame }
    }

    /// Galactic direction
    pub fn galactic(l: f64, b: f64) -> Self {
        Self::new(l, b, Frame::Galactic)
    }

    /// Equatorial direction
    pub fn icrs(ra: f64, dec: f64) -> Self {
        Self::new(ra, dec, Frame::Icrs)
    }

    /// Unit vector in the coordinate's own frame
    pub fn to_vec(&self) -> Vector3<f64> {
        lonlat_to_vec(self.lon, self.lat)
    }

    /// Same direction expressed in another frame
    pub fn transform_to(&self, frame: Frame) -> SkyCoord {
        if frame == self.frame {
            return *self;
        }
        let v = self.frame.rotation_to(frame) * self.to_vec();
        let (lon, lat) = vec_to_lonlat(&v);
        SkyCoord::new(lon, lat, frame)
    }

    /// Angular separation in degrees (frame-aware)
    pub fn separation(&self, other: &SkyCoord) -> f64 {
        let other = other.transform_to(self.frame);
        angle_between(&self.to_vec(), &other.to_vec())
    }
}

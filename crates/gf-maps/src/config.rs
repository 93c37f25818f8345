//! Declarative geometry configuration (YAML or JSON).
//!
//! ```yaml
//! center: { lon: 83.63, lat: 22.01, frame: icrs }
//! binsz: 0.02
//! width: [2.0, 2.0]
//! projection: TAN
//! axes:
//!   - type: energy
//!     lo: 0.1
//!     hi: 100.0
//!     nbin: 5
//!     unit: TeV
//!     per_decade: true
//! ```


use crate::axis::{Interp, MapAxis};
use crate::geom::WcsGeom;
use crate::skycoord::SkyCoord;
use crate::wcs::Projection;
use gf_core::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// One non-spatial axis
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AxisConfig {
    /// Log-spaced energy axis
    Energy {
        /// Lower edge
        lo: f64,
        /// Upper edge
        hi: f64,
        /// Number of bins, or bins per decade
        nbin: usize,
        /// Energy unit
        unit: String,
        /// Read `nbin` per decade
        #[serde(default)]
        per_decade: bool,
        /// Defaults to `energy`; use `energy_true` for exposure-like maps
        #[serde(default)]
        name: Option<String>,
    },
    /// Evenly spaced bins between two bounds
    Bounds {
        /// Axis name
        name: String,
        /// Lower edge
        lo: f64,
        /// Upper edge
        hi: f64,
        /// Number of bins
        nbin: usize,
        /// Unit string
        #[serde(default)]
        unit: String,
        /// Spacing of the edges
        #[serde(default = "default_interp")]
        interp: Interp,
    },
    /// Explicit edges
    Edges {
        /// Axis name
        name: String,
        /// Bin edges, increasing
        edges: Vec<f64>,
        /// Unit string
        #[serde(default)]
        unit: String,
        /// Interpolation between edges
        #[serde(default = "default_interp")]
        interp: Interp,
    },
}

fn default_interp() -> Interp {
    Interp::Linear
}

fn default_projection() -> Projection {
    Projection::Car
}

impl AxisConfig {
    /// Build the axis
    pub fn to_axis(&self) -> Result<MapAxis> {
        match self {
            AxisConfig::Energy { lo, hi, nbin, unit, per_decade, name } => {
                let axis = MapAxis::from_energy_bounds(*lo, *hi, *nbin, unit.as_str(), *per_decade)?;
                Ok(match name {
                    Some(n) => axis.with_name(n.as_str()),
                    None => axis,
                })
            }
            AxisConfig::Bounds { name, lo, hi, nbin, unit, interp } => {
                MapAxis::from_bounds(*lo, *hi, *nbin, *interp, name.as_str(), unit.as_str())
            }
            AxisConfig::Edges { name, edges, unit, interp } => {
                MapAxis::from_edges(edges.clone(), *interp, name.as_str(), unit.as_str())
            }
        }
    }
}

/// A WCS geometry described by its center, pixel size and width
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeomConfig {
    /// Map center
    pub center: SkyCoord,
    /// Pixel size in degrees
    pub binsz: f64,
    /// `(lon, lat)` extent in degrees
    pub width: [f64; 2],
    /// Projection, CAR by default
    #[serde(default = "default_projection")]
    pub projection: Projection,
    /// Non-spatial axes
    #[serde(default)]
    pub axes: Vec<AxisConfig>,
}

impl GeomConfig {
    /// Build the geometry
    pub fn to_geom(&self) -> Result<WcsGeom> {
        let axes = self.axes.iter().map(AxisConfig::to_axis).collect::<Result<Vec<_>>>()?;
        WcsGeom::create(self.center, self.binsz, (self.width[0], self.width[1]), self.projection, axes)
    }

    /// Parse YAML
    pub fn from_yaml_str(s: &str) -> Result<Self> {
        Ok(serde_yaml_ng::from_str(s)?)
    }

    /// Parse JSON
    pub fn from_json_str(s: &str) -> Result<Self> {
        Ok(serde_json::from_str(s)?)
    }

    /// Read a `.yaml`/`.yml` or JSON file, chosen by extension
    pub fn from_path(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => Ok(serde_yaml_ng::from_slice(&bytes)?),
            _ => Ok(serde_json::from_slice(&bytes)?),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::skycoord::Frame;

    const YAML: &str = r#"
center: { lon: 83.63, lat: 22.01, frame: icrs }
binsz: 0.02
width: [2.0, 1.0]
projection: TAN
axes:
  - type: energy
    lo: 0.1
    hi: 100.0
    nbin: 5
    unit: TeV
    per_decade: true
  - type: edges
    name: time
    edges: [0.0, 1.0, 3.0]
    unit: d
"#;

    #[test]
    fn test_yaml_geometry() {
        let cfg = GeomConfig::from_yaml_str(YAML).unwrap();
        let geom = cfg.to_geom().unwrap();
        assert_eq!(geom.npix(), (100, 50));
        assert_eq!(geom.frame(), Frame::Icrs);
        assert_eq!(geom.projection(), Projection::Tan);
        assert_eq!(geom.axes()[0].nbin(), 15);
        assert_eq!(geom.axis("time").unwrap().nbin(), 2);
    }

    #[test]
    fn test_json_defaults_and_errors() {
        let cfg = GeomConfig::from_json_str(
            r#"{"center": {"lon": 0.0, "lat": 0.0, "frame": "galactic"}, "binsz": 0.5, "width": [5.0, 5.0]}"#,
        )
        .unwrap();
        assert_eq!(cfg.projection, Projection::Car);
        assert!(cfg.to_geom().unwrap().is_image());

        let bad = GeomConfig { binsz: -1.0, ..cfg };
        assert!(bad.to_geom().is_err());
        assert!(GeomConfig::from_yaml_str("binsz: [").is_err());
    }
}

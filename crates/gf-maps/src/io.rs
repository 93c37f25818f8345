//! Self-describing JSON persistence for maps.
//!
//! A document carries the full geometry header (WCS parameters plus every
//! axis with its nodes, node type and interpolation), the unit, the data
//! shape and the flattened data in standard (row-major) order. Floats round
//! trip exactly; non-finite values are stored as `null` and read back as NaN.


use crate::axis::{Interp, MapAxis, NodeType};
use crate::geom::WcsGeom;
use crate::map::{Map, MapValue};
use crate::skycoord::Frame;
use crate::wcs::{Projection, WcsTransform};
use gf_core::{Error, Result};
use ndarray::{ArrayD, IxDyn};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

/// Format tag written into every map document
pub const MAP_FORMAT: &str = "gammafold_map_v0";

/// Serialized axis
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AxisHeader {
    /// Axis name
    pub name: String,
    /// Unit string
    pub unit: String,
    /// Interpolation of the nodes
    pub interp: Interp,
    /// Whether `nodes` are edges or centers
    pub node_type: NodeType,
    /// Edges or centers
    pub nodes: Vec<f64>,
}

impl From<&MapAxis> for AxisHeader {
    fn from(a: &MapAxis) -> Self {
        Self {
            name: a.name().to_string(),
            unit: a.unit().to_string(),
            interp: a.interp(),
            node_type: a.node_type(),
            nodes: a.nodes().to_vec(),
        }
    }
}

impl AxisHeader {
    /// Rebuild the axis, validating the nodes
    pub fn to_axis(&self) -> Result<MapAxis> {
        MapAxis::from_parts(
            self.nodes.clone(),
            self.node_type,
            self.interp,
            self.name.as_str(),
            self.unit.as_str(),
        )
        .map_err(|e| Error::Format(format!("axis '{}': {e}", self.name)))
    }
}

/// Serialized geometry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeomHeader {
    /// Celestial frame
    pub frame: Frame,
    /// Map projection
    pub projection: Projection,
    /// Reference coordinate in degrees
    pub crval: [f64; 2],
    /// Reference pixel, 1-based
    pub crpix: [f64; 2],
    /// Pixel size in degrees
    pub cdelt: [f64; 2],
    /// `(nx, ny)`
    pub npix: [usize; 2],
    /// Non-spatial axes
    #[serde(default)]
    pub axes: Vec<AxisHeader>,
}

impl From<&WcsGeom> for GeomHeader {
    fn from(g: &WcsGeom) -> Self {
        let w = g.wcs();
        let (nx, ny) = g.npix();
        Self {
            frame: w.frame(),
            projection: w.projection(),
            crval: w.crval(),
            crpix: w.crpix(),
            cdelt: w.cdelt(),
            npix: [nx, ny],
            axes: g.axes().iter().map(AxisHeader::from).collect(),
        }
    }
}

impl GeomHeader {
    /// Rebuild the geometry
    pub fn to_geom(&self) -> Result<WcsGeom> {
        let axes = self.axes.iter().map(AxisHeader::to_axis).collect::<Result<Vec<_>>>()?;
        let wcs = WcsTransform::new(self.frame, self.projection, self.crval, self.crpix, self.cdelt);
        WcsGeom::from_wcs(wcs, (self.npix[0], self.npix[1]), axes)
            .map_err(|e| Error::Format(format!("geometry header: {e}")))
    }
}

/// Element encoding inside a document
pub trait StoredValue: MapValue {
    /// JSON representation
    type Repr: Serialize + DeserializeOwned;
    /// Encode
    fn to_repr(&self) -> Self::Repr;
    /// Decode
    fn from_repr(r: Self::Repr) -> Self;
}

impl StoredValue for f64 {
    type Repr = Option<f64>;
    fn to_repr(&self) -> Option<f64> {
        self.is_finite().then_some(*self)
    }
    fn from_repr(r: Option<f64>) -> Self {
        r.unwrap_or(f64::NAN)
    }
}

impl StoredValue for bool {
    type Repr = bool;
    fn to_repr(&self) -> bool {
        *self
    }
    fn from_repr(r: bool) -> Self {
        r
    }
}

/// On-disk form of a map
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MapDocument<R> {
    /// Always [`MAP_FORMAT`]
    pub format: String,
    /// Geometry header
    pub geom: GeomHeader,
    /// Data unit
    #[serde(default)]
    pub unit: String,
    /// Data shape, outermost axis first
    pub shape: Vec<usize>,
    /// Flattened data in row-major order
    pub data: Vec<R>,
}

impl<A: StoredValue> Map<A> {
    /// Document form of this map
    pub fn to_document(&self) -> MapDocument<A::Repr> {
        MapDocument {
            format: MAP_FORMAT.to_string(),
            geom: GeomHeader::from(self.geom()),
            unit: self.unit().to_string(),
            shape: self.data().shape().to_vec(),
            data: self.data().iter().map(StoredValue::to_repr).collect(),
        }
    }

    /// Rebuild from a document; any inconsistency is a [`Error::Format`]
    pub fn from_document(doc: MapDocument<A::Repr>) -> Result<Self> {
        if doc.format != MAP_FORMAT {
            return Err(Error::Format(format!(
                "unsupported map format '{}', expected '{}'",
                doc.format, MAP_FORMAT
            )));
        }
        let geom = doc.geom.to_geom()?;
        if doc.shape != geom.data_shape() {
            return Err(Error::Format(format!(
                "data shape {:?} does not match header shape {:?}",
                doc.shape,
                geom.data_shape()
            )));
        }
        let values: Vec<A> = doc.data.into_iter().map(A::from_repr).collect();
        let data = ArrayD::from_shape_vec(IxDyn(&doc.shape), values)
            .map_err(|e| Error::Format(format!("map data: {e}")))?;
        Map::from_data(geom, data, doc.unit)
    }

    /// Serialize to a JSON string
    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.to_document())?)
    }

    /// Parse from a JSON string
    pub fn from_json_str(s: &str) -> Result<Self> {
        let doc: MapDocument<A::Repr> = serde_json::from_str(s)?;
        Self::from_document(doc)
    }

    /// Write a JSON file
    pub fn write_json(&self, path: &Path) -> Result<()> {
        let mut w = BufWriter::new(std::fs::File::create(path)?);
        serde_json::to_writer(&mut w, &self.to_document())?;
        w.flush()?;
        Ok(())
    }

    /// Read a JSON file
    pub fn read_json(path: &Path) -> Result<Self> {
        let r = BufReader::new(std::fs::File::open(path)?);
        let doc: MapDocument<A::Repr> = serde_json::from_reader(r)?;
        Self::from_document(doc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::skycoord::SkyCoord;

    fn geom() -> WcsGeom {
        let e = MapAxis::from_energy_bounds(0.1, 10.0, 3, "TeV", false).unwrap();
        let c = MapAxis::from_nodes(vec![1.0, 2.0, 4.0], Interp::Log, "rad", "deg").unwrap();
        WcsGeom::create(SkyCoord::icrs(83.63, 22.01), 0.1, (0.4, 0.3), Projection::Tan, vec![e, c])
            .unwrap()
    }

    #[test]
    fn test_exact_round_trip() {
        let g = geom();
        let data = ArrayD::from_shape_fn(IxDyn(&g.data_shape()), |ix| {
            (ix[0] as f64 + 0.1).powf(1.0 / 3.0) * std::f64::consts::PI / (ix[3] as f64 + 7.0)
        });
        let mut m = Map::from_data(g, data, "cm-2 s-1").unwrap();
        m.data_mut()[[0, 0, 0, 0]] = f64::NAN;
        let back = Map::<f64>::from_json_str(&m.to_json_string().unwrap()).unwrap();
        assert_eq!(back.geom(), m.geom());
        assert_eq!(back.unit(), "cm-2 s-1");
        assert!(back.data()[[0, 0, 0, 0]].is_nan());
        for (a, b) in m.data().iter().zip(back.data().iter()).skip(1) {
            assert_eq!(a.to_bits(), b.to_bits());
        }
    }

    #[test]
    fn test_mask_round_trip() {
        let m = Map::from_elem(geom(), 1.0, "").mask_where(|v| v > 0.5);
        let back = Map::<bool>::from_json_str(&m.to_json_string().unwrap()).unwrap();
        assert_eq!(back.count(), m.count());
    }

    #[test]
    fn test_corrupt_documents_are_rejected() {
        let m = Map::from_geom(geom(), "");
        let mut doc = m.to_document();
        doc.shape[0] += 1;
        assert!(matches!(Map::<f64>::from_document(doc), Err(Error::Format(_))));

        let mut doc = m.to_document();
        doc.format = "other".to_string();
        assert!(matches!(Map::<f64>::from_document(doc), Err(Error::Format(_))));

        let mut doc = m.to_document();
        doc.geom.axes[0].nodes = vec![3.0, 1.0];
        assert!(matches!(Map::<f64>::from_document(doc), Err(Error::Format(_))));

        assert!(matches!(Map::<f64>::from_json_str("{\"format\": 1}"), Err(Error::Json(_))));
    }
}

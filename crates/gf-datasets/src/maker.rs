//! Reduce an event list and IRFs to a binned [`MapDataset`].

use crate::dataset::MapDataset;
use crate::evaluator::ENERGY;
use crate::irf::{EDispKernel, ENERGY_TRUE, EffectiveAreaTable, PsfKernel};
use gf_core::{Error, Result};
use gf_maps::{AxisConfig, Frame, GeomConfig, Map, MapAxis, MapCoord, SkyCoord, WcsGeom};
use ndarray::{Array3, Axis};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Reconstructed events: sky position and energy (TeV)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventList {
    /// Frame of `lon`/`lat`
    pub frame: Frame,
    /// Longitudes in degrees
    pub lon: Vec<f64>,
    /// Latitudes in degrees
    pub lat: Vec<f64>,
    /// Reconstructed energies
    pub energy: Vec<f64>,
}

impl EventList {
    /// Columns must have equal length
    pub fn new(frame: Frame, lon: Vec<f64>, lat: Vec<f64>, energy: Vec<f64>) -> Result<Self> {
        if lon.len() != lat.len() || lon.len() != energy.len() {
            return Err(Error::Validation(format!(
                "event columns differ in length: lon {}, lat {}, energy {}",
                lon.len(),
                lat.len(),
                energy.len()
            )));
        }
        Ok(Self { frame, lon, lat, energy })
    }

    /// No events in `frame`
    pub fn empty(frame: Frame) -> Self {
        Self { frame, lon: Vec::new(), lat: Vec::new(), energy: Vec::new() }
    }

    /// Number of events
    pub fn len(&self) -> usize {
        self.energy.len()
    }

    /// `true` without events
    pub fn is_empty(&self) -> bool {
        self.energy.is_empty()
    }

    /// Append one event given in any frame
    pub fn push(&mut self, direction: &SkyCoord, energy: f64) {
        let c = direction.transform_to(self.frame);
        self.lon.push(c.lon);
        self.lat.push(c.lat);
        self.energy.push(energy);
    }

    /// Both event lists in this list's frame
    pub fn concat(&self, other: &EventList) -> EventList {
        let mut out = self.clone();
        for i in 0..other.len() {
            out.push(&SkyCoord::new(other.lon[i], other.lat[i], other.frame), other.energy[i]);
        }
        out
    }

    /// Events with `lo <= energy < hi`
    pub fn select_energy(&self, lo: f64, hi: f64) -> EventList {
        let keep: Vec<usize> =
            (0..self.len()).filter(|&i| self.energy[i] >= lo && self.energy[i] < hi).collect();
        EventList {
            frame: self.frame,
            lon: keep.iter().map(|&i| self.lon[i]).collect(),
            lat: keep.iter().map(|&i| self.lat[i]).collect(),
            energy: keep.iter().map(|&i| self.energy[i]).collect(),
        }
    }

    /// Coordinates with an `energy` axis, ready for histogramming
    pub fn to_coord(&self) -> MapCoord {
        MapCoord::from_lonlat(&self.lon, &self.lat, self.frame)
            .with_axis_values(ENERGY, &self.energy)
    }
}

/// Histogram events into a counts map on `geom`
pub fn make_counts(geom: &WcsGeom, events: &EventList) -> Result<Map> {
    let mut counts = Map::from_geom(geom.clone(), "");
    if !events.is_empty() {
        counts.fill_by_coord(&events.to_coord(), None)?;
    }
    Ok(counts)
}

/// Effective area at each true-energy bin center times `livetime` (s),
/// broadcast over the spatial grid.
pub fn make_exposure(aeff: &EffectiveAreaTable, geom: &WcsGeom, livetime: f64) -> Result<Map> {
    let axis = geom.axis(ENERGY_TRUE)?;
    if geom.axes().len() != 1 {
        return Err(Error::Configuration("exposure geometry must have one axis".to_string()));
    }
    let (nx, ny) = geom.npix();
    let values: Vec<f64> = axis.center().iter().map(|&e| aeff.evaluate(e) * livetime).collect();
    let planes = Array3::from_shape_fn((values.len(), ny, nx), |(e, _, _)| values[e]);
    Map::from_image_planes(geom.clone(), planes, "cm2 s")
}

/// Flat background of `rate` (s⁻¹ sr⁻¹ TeV⁻¹) integrated over pixel solid
/// angle, energy bin width and `livetime`.
pub fn make_background(geom: &WcsGeom, rate: f64, livetime: f64) -> Result<Map> {
    let axis = geom.axis(ENERGY)?;
    if geom.axes().len() != 1 {
        return Err(Error::Configuration("background geometry must have one axis".to_string()));
    }
    let omega = geom.solid_angle().mapv(|o| if o.is_finite() { o } else { 0.0 });
    let widths = axis.bin_width();
    let mut planes = Array3::zeros((widths.len(), omega.nrows(), omega.ncols()));
    for (mut plane, w) in planes.axis_iter_mut(Axis(0)).zip(&widths) {
        plane.assign(&(&omega * (rate * livetime * w)));
    }
    Map::from_image_planes(geom.clone(), planes, "")
}

/// Builds datasets on fixed counts and exposure geometries
#[derive(Debug, Clone)]
pub struct MapDatasetMaker {
    geom: WcsGeom,
    geom_true: WcsGeom,
    background_rate: f64,
}

impl MapDatasetMaker {
    /// `geom` carries the `energy` axis; `energy_true` bins the exposure
    pub fn new(geom: WcsGeom, energy_true: MapAxis) -> Result<Self> {
        geom.axis(ENERGY)?;
        if energy_true.name() != ENERGY_TRUE {
            return Err(Error::Configuration(format!(
                "true energy axis must be named '{ENERGY_TRUE}', got '{}'",
                energy_true.name()
            )));
        }
        let geom_true = geom.to_cube(vec![energy_true])?;
        Ok(Self { geom, geom_true, background_rate: 0.0 })
    }

    /// Flat background rate in s⁻¹ sr⁻¹ TeV⁻¹
    pub fn with_background_rate(mut self, rate: f64) -> Self {
        self.background_rate = rate;
        self
    }

    /// Counts geometry
    pub fn geom(&self) -> &WcsGeom {
        &self.geom
    }

    /// Exposure geometry
    pub fn geom_true(&self) -> &WcsGeom {
        &self.geom_true
    }

    /// Counts, exposure and background for one observation
    pub fn run(
        &self,
        name: &str,
        events: &EventList,
        aeff: &EffectiveAreaTable,
        livetime: f64,
        psf: Option<PsfKernel>,
        edisp: Option<EDispKernel>,
    ) -> Result<MapDataset> {
        if !(livetime.is_finite() && livetime >= 0.0) {
            return Err(Error::Configuration(format!("livetime must be >= 0, got {livetime}")));
        }
        let counts = make_counts(&self.geom, events)?;
        let exposure = make_exposure(aeff, &self.geom_true, livetime)?;
        let background = make_background(&self.geom, self.background_rate, livetime)?;
        log::debug!("dataset '{name}': {} events, {} counts in geometry", events.len(), counts.sum());
        MapDataset::new(name, counts, exposure, background, psf, edisp)
    }
}

/// Serde form of a [`MapDatasetMaker`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MakerConfig {
    /// Counts geometry with an `energy` axis
    pub geom: GeomConfig,
    /// Exposure binning, named `energy_true`
    pub energy_true: AxisConfig,
    /// Flat background rate in s⁻¹ sr⁻¹ TeV⁻¹
    #[serde(default)]
    pub background_rate: f64,
}

impl MakerConfig {
    /// Build the maker
    pub fn to_maker(&self) -> Result<MapDatasetMaker> {
        Ok(MapDatasetMaker::new(self.geom.to_geom()?, self.energy_true.to_axis()?)?
            .with_background_rate(self.background_rate))
    }

    /// Parse YAML
    pub fn from_yaml_str(s: &str) -> Result<Self> {
        Ok(serde_yaml_ng::from_str(s)?)
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

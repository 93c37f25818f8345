//! JSON persistence for datasets.
//!
//! Maps are embedded as [`MapDocument`]s, kernels through their serde form and
//! the background model as parameter states. Source models are not stored.

use crate::dataset::MapDataset;
use crate::irf::{EDispKernel, PsfKernel};
use crate::models::BackgroundModel;
use crate::onoff::MapDatasetOnOff;
use gf_core::{Error, Parameter, ParameterState, Result};
use gf_maps::Map;
use gf_maps::io::MapDocument;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

/// Format tag of a dataset document
pub const DATASET_FORMAT: &str = "gammafold_dataset_v0";

/// Format tag of an on/off dataset document
pub const DATASET_ONOFF_FORMAT: &str = "gammafold_dataset_onoff_v0";

/// Serialized [`MapDataset`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetDocument {
    /// Always [`DATASET_FORMAT`]
    pub format: String,
    /// Dataset name
    pub name: String,
    /// Observed counts
    pub counts: MapDocument<Option<f64>>,
    /// Exposure over true energy
    pub exposure: MapDocument<Option<f64>>,
    /// Background template
    pub background: MapDocument<Option<f64>>,
    /// PSF kernel, validated on load
    #[serde(default)]
    pub psf: Option<PsfKernel>,
    /// Energy dispersion kernel, validated on load
    #[serde(default)]
    pub edisp: Option<EDispKernel>,
    /// User fit mask
    #[serde(default)]
    pub mask_fit: Option<MapDocument<bool>>,
    /// Safe data range mask
    #[serde(default)]
    pub mask_safe: Option<MapDocument<bool>>,
    /// `norm`, `tilt`, `reference`
    #[serde(default)]
    pub background_model: Vec<ParameterState>,
}

/// Serialized [`MapDatasetOnOff`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OnOffDocument {
    /// Always [`DATASET_ONOFF_FORMAT`]
    pub format: String,
    /// The on-region dataset
    pub on: DatasetDocument,
    /// Off-region counts
    pub counts_off: MapDocument<Option<f64>>,
    /// On-region acceptance
    pub acceptance: MapDocument<Option<f64>>,
    /// Off-region acceptance
    pub acceptance_off: MapDocument<Option<f64>>,
}

fn check_format(found: &str, expected: &str) -> Result<()> {
    if found != expected {
        return Err(Error::Format(format!("unsupported format '{found}', expected '{expected}'")));
    }
    Ok(())
}

fn background_model_from_states(states: &[ParameterState]) -> Result<BackgroundModel> {
    let model = BackgroundModel::default();
    if states.is_empty() {
        return Ok(model);
    }
    let [norm, tilt, reference] = states else {
        return Err(Error::Format(format!(
            "background model needs 3 parameters, got {}",
            states.len()
        )));
    };
    Ok(BackgroundModel {
        norm: Parameter::from_state(norm.clone()),
        tilt: Parameter::from_state(tilt.clone()),
        reference: Parameter::from_state(reference.clone()),
    })
}

fn write_doc<T: Serialize>(doc: &T, path: &Path) -> Result<()> {
    let mut w = BufWriter::new(std::fs::File::create(path)?);
    serde_json::to_writer(&mut w, doc)?;
    w.flush()?;
    Ok(())
}

fn read_doc<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let r = BufReader::new(std::fs::File::open(path)?);
    Ok(serde_json::from_reader(r)?)
}

impl MapDataset {
    /// Document form; source models are dropped
    pub fn to_document(&self) -> DatasetDocument {
        DatasetDocument {
            format: DATASET_FORMAT.to_string(),
            name: self.name().to_string(),
            counts: self.counts().to_document(),
            exposure: self.exposure().to_document(),
            background: self.background().to_document(),
            psf: self.psf().cloned(),
            edisp: self.edisp().cloned(),
            mask_fit: self.mask_fit().map(Map::to_document),
            mask_safe: self.mask_safe().map(Map::to_document),
            background_model: self.background_model().parameters().states(),
        }
    }

    /// Rebuild and validate a dataset from its document
    pub fn from_document(doc: DatasetDocument) -> Result<Self> {
        check_format(&doc.format, DATASET_FORMAT)?;
        let mut ds = MapDataset::new(
            doc.name,
            Map::from_document(doc.counts)?,
            Map::from_document(doc.exposure)?,
            Map::from_document(doc.background)?,
            doc.psf,
            doc.edisp,
        )?;
        ds.set_mask_fit(doc.mask_fit.map(Map::from_document).transpose()?)?;
        ds.set_mask_safe(doc.mask_safe.map(Map::from_document).transpose()?)?;
        ds.set_background_model(background_model_from_states(&doc.background_model)?);
        Ok(ds)
    }

    /// Write a JSON file
    pub fn write_json(&self, path: &Path) -> Result<()> {
        write_doc(&self.to_document(), path)
    }

    /// Read a JSON file
    pub fn read_json(path: &Path) -> Result<Self> {
        Self::from_document(read_doc(path)?)
    }
}

impl MapDatasetOnOff {
    /// Document form; source models are dropped
    pub fn to_document(&self) -> OnOffDocument {
        OnOffDocument {
            format: DATASET_ONOFF_FORMAT.to_string(),
            on: self.on().to_document(),
            counts_off: self.counts_off().to_document(),
            acceptance: self.acceptance().to_document(),
            acceptance_off: self.acceptance_off().to_document(),
        }
    }

    /// Rebuild from a document
    pub fn from_document(doc: OnOffDocument) -> Result<Self> {
        check_format(&doc.format, DATASET_ONOFF_FORMAT)?;
        MapDatasetOnOff::from_dataset(
            MapDataset::from_document(doc.on)?,
            Map::from_document(doc.counts_off)?,
            Map::from_document(doc.acceptance)?,
            Map::from_document(doc.acceptance_off)?,
        )
    }

    /// Write a JSON file
    pub fn write_json(&self, path: &Path) -> Result<()> {
        write_doc(&self.to_document(), path)
    }

    /// Read a JSON file
    pub fn read_json(path: &Path) -> Result<Self> {
        Self::from_document(read_doc(path)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::irf::ENERGY_TRUE;
    use gf_maps::{MapAxis, Projection, SkyCoord, WcsGeom};

    fn dataset() -> MapDataset {
        let energy = MapAxis::from_energy_bounds(1.0, 10.0, 2, "TeV", false).unwrap();
        let g = WcsGeom::create(SkyCoord::icrs(83.6, 22.0), 0.1, (0.5, 0.3), Projection::Tan, vec![
            energy,
        ])
        .unwrap();
        let e_true = g.axes()[0].with_name(ENERGY_TRUE);
        let psf = PsfKernel::from_gauss(e_true.clone(), 0.1, &[0.1, 0.05], 0.3).unwrap();
        let mut counts = Map::from_geom(g.clone(), "");
        counts.data_mut()[[1, 2, 3]] = 7.0;
        let exposure = Map::from_elem(g.to_cube(vec![e_true]).unwrap(), 1.0 / 3.0, "cm2 s");
        let background = Map::from_elem(g.clone(), 0.1, "");
        let mask = Map::from_elem(g, true, "");
        let ds = MapDataset::new("crab", counts, exposure, background, Some(psf), None)
            .unwrap()
            .with_mask_safe(mask)
            .unwrap();
        ds.background_model().norm.set_value(1.25);
        ds
    }

    #[test]
    fn test_dataset_round_trip() {
        let ds = dataset();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ds.json");
        ds.write_json(&path).unwrap();
        let back = MapDataset::read_json(&path).unwrap();
        assert_eq!(back.name(), "crab");
        assert_eq!(back.counts().data(), ds.counts().data());
        assert_eq!(back.exposure().data(), ds.exposure().data());
        assert_eq!(back.psf().unwrap().data(), ds.psf().unwrap().data());
        assert!(back.mask_fit().is_none());
        assert_eq!(back.mask_safe().unwrap().count(), ds.mask_safe().unwrap().count());
        assert_eq!(back.background_model().norm.value(), 1.25);
        assert_eq!(back.background_model().norm.max(), f64::INFINITY);
        assert_eq!(back.background_model().tilt.min(), f64::NEG_INFINITY);
        assert_eq!(back.stat_sum().unwrap(), ds.stat_sum().unwrap());
    }

    #[test]
    fn test_format_is_checked() {
        let mut doc = dataset().to_document();
        doc.format = "other".to_string();
        assert!(matches!(MapDataset::from_document(doc), Err(Error::Format(_))));
        let mut doc = dataset().to_document();
        doc.background_model.pop();
        assert!(matches!(MapDataset::from_document(doc), Err(Error::Format(_))));
    }

    #[test]
    fn test_onoff_round_trip() {
        let ds = dataset();
        let off = Map::from_elem(ds.counts().geom_arc().clone(), 4.0, "");
        let onoff = MapDatasetOnOff::with_alpha(ds, off, 0.2).unwrap();
        let json = serde_json::to_string(&onoff.to_document()).unwrap();
        let back = MapDatasetOnOff::from_document(serde_json::from_str(&json).unwrap()).unwrap();
        assert_eq!(back.counts_off().data(), onoff.counts_off().data());
        assert_eq!(back.stat_sum().unwrap(), onoff.stat_sum().unwrap());
    }
}

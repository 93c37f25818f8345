//! Binned map dataset and its Cash likelihood.
//!
//! A [`MapDataset`] owns counts, exposure and background maps, optional PSF and
//! energy-dispersion kernels, fit/safe masks and the models it is compared
//! against. Predicted counts are cached and recomputed only when a parameter
//! value changes.

use crate::evaluator::{ENERGY, MapEvaluator, check_components, single_axis};
use crate::irf::{EDispKernel, ENERGY_TRUE, PsfKernel};
use crate::models::{BackgroundModel, SkyModel};
use crate::stats::{cash, cash_sum};
use gf_core::{Error, Parameters, Result, StatDataset};
use gf_maps::{Map, MapAxis, Mask, WcsGeom};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Lifecycle of a dataset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatasetState {
    /// Zero-filled maps, nothing stacked yet
    Empty,
    /// Holds data but no source models
    Stacking,
    /// Models assigned, nothing evaluated since the last change
    ReadyForFit,
    /// Predicted counts cached for the current parameter values
    Evaluated,
}

/// Residual definition for [`MapDataset::residuals`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResidualMethod {
    /// `counts - npred`
    #[default]
    Diff,
    /// `(counts - npred) / npred`
    DiffOverModel,
    /// `(counts - npred) / sqrt(npred)`
    DiffOverSqrtModel,
}

/// Summary numbers of a dataset, evaluated at the current parameter values
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetInfo {
    /// Dataset name
    pub name: String,
    /// Total counts
    pub counts: f64,
    /// Total predicted background
    pub background: f64,
    /// `counts - background`
    pub excess: f64,
    /// Total predicted counts
    pub npred: f64,
    /// Total predicted source counts
    pub npred_signal: f64,
    /// Smallest exposure value
    pub exposure_min: f64,
    /// Largest exposure value
    pub exposure_max: f64,
    /// Number of counts bins
    pub n_bins: usize,
    /// Number of bins entering the statistic
    pub n_fit_bins: usize,
    /// Statistic name
    pub stat_type: String,
    /// Statistic over the fit bins
    pub stat_sum: f64,
}

#[derive(Debug, Default)]
struct NpredCache {
    key: Vec<f64>,
    signal: Option<Map>,
    npred: Option<Map>,
}

/// Counts, exposure, background and IRFs on one geometry
#[derive(Debug)]
pub struct MapDataset {
    name: String,
    counts: Map,
    exposure: Arc<Map>,
    background: Map,
    psf: Option<PsfKernel>,
    edisp: Option<EDispKernel>,
    mask_fit: Option<Mask>,
    mask_safe: Option<Mask>,
    models: Vec<SkyModel>,
    background_model: BackgroundModel,
    evaluators: Vec<MapEvaluator>,
    state: Mutex<DatasetState>,
    cache: Mutex<NpredCache>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Clone for MapDataset {
    fn clone(&self) -> Self {
        let state = match self.state() {
            DatasetState::Evaluated => DatasetState::ReadyForFit,
            s => s,
        };
        Self {
            name: self.name.clone(),
            counts: self.counts.clone(),
            exposure: self.exposure.clone(),
            background: self.background.clone(),
            psf: self.psf.clone(),
            edisp: self.edisp.clone(),
            mask_fit: self.mask_fit.clone(),
            mask_safe: self.mask_safe.clone(),
            models: self.models.clone(),
            background_model: self.background_model.clone(),
            evaluators: self.evaluators.clone(),
            state: Mutex::new(state),
            cache: Mutex::new(NpredCache::default()),
        }
    }
}

impl MapDataset {
    /// Zero-filled dataset on `geom` (one `energy` axis) with exposure binned
    /// in `energy_true`.
    pub fn create(name: impl Into<String>, geom: WcsGeom, energy_true: MapAxis) -> Result<Self> {
        if energy_true.name() != ENERGY_TRUE {
            return Err(Error::Configuration(format!(
                "exposure axis must be named '{ENERGY_TRUE}', got '{}'",
                energy_true.name()
            )));
        }
        single_axis(&geom, ENERGY)?;
        let geom = Arc::new(geom);
        let exposure = Map::from_geom(geom.to_cube(vec![energy_true])?, "cm2 s");
        Ok(Self::from_parts(
            name.into(),
            Map::from_geom(geom.clone(), ""),
            Arc::new(exposure),
            Map::from_geom(geom, ""),
            None,
            None,
            DatasetState::Empty,
        ))
    }

    /// Dataset from filled maps; all geometries and kernels are checked.
    pub fn new(
        name: impl Into<String>,
        counts: Map,
        exposure: Map,
        background: Map,
        psf: Option<PsfKernel>,
        edisp: Option<EDispKernel>,
    ) -> Result<Self> {
        if !counts.geom().is_allclose(background.geom(), 1e-9) {
            return Err(Error::GeometryMismatch(
                "counts and background geometries differ".to_string(),
            ));
        }
        check_components(exposure.geom(), counts.geom(), psf.as_ref(), edisp.as_ref())?;
        Ok(Self::from_parts(
            name.into(),
            counts,
            Arc::new(exposure),
            background,
            psf,
            edisp,
            DatasetState::Stacking,
        ))
    }

    fn from_parts(
        name: String,
        counts: Map,
        exposure: Arc<Map>,
        background: Map,
        psf: Option<PsfKernel>,
        edisp: Option<EDispKernel>,
        state: DatasetState,
    ) -> Self {
        Self {
            name,
            counts,
            exposure,
            background,
            psf,
            edisp,
            mask_fit: None,
            mask_safe: None,
            models: Vec::new(),
            background_model: BackgroundModel::default(),
            evaluators: Vec::new(),
            state: Mutex::new(state),
            cache: Mutex::new(NpredCache::default()),
        }
    }

    /// Dataset name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Counts map (reconstructed energy)
    pub fn counts(&self) -> &Map {
        &self.counts
    }

    /// Exposure map (true energy)
    pub fn exposure(&self) -> &Map {
        &self.exposure
    }

    /// Background template before the background model is applied
    pub fn background(&self) -> &Map {
        &self.background
    }

    /// PSF kernel
    pub fn psf(&self) -> Option<&PsfKernel> {
        self.psf.as_ref()
    }

    /// Energy dispersion kernel
    pub fn edisp(&self) -> Option<&EDispKernel> {
        self.edisp.as_ref()
    }

    /// Counts geometry
    pub fn geom(&self) -> &WcsGeom {
        self.counts.geom()
    }

    /// Current lifecycle state
    pub fn state(&self) -> DatasetState {
        *lock(&self.state)
    }

    fn set_state(&self, state: DatasetState) {
        *lock(&self.state) = state;
    }

    fn invalidate(&self) {
        *lock(&self.cache) = NpredCache::default();
        let mut state = lock(&self.state);
        if *state == DatasetState::Evaluated {
            *state = DatasetState::ReadyForFit;
        }
    }

    fn check_mask(&self, mask: &Mask) -> Result<()> {
        if !mask.geom().is_allclose(self.counts.geom(), 1e-9) {
            return Err(Error::GeometryMismatch("mask geometry differs from counts".to_string()));
        }
        Ok(())
    }

    /// Fit mask: bins used by the statistic (all when `None`)
    pub fn mask_fit(&self) -> Option<&Mask> {
        self.mask_fit.as_ref()
    }

    /// Safe mask: bins with trustworthy IRFs (all when `None`)
    pub fn mask_safe(&self) -> Option<&Mask> {
        self.mask_safe.as_ref()
    }

    /// Replace the fit mask
    pub fn set_mask_fit(&mut self, mask: Option<Mask>) -> Result<()> {
        if let Some(m) = &mask {
            self.check_mask(m)?;
        }
        self.mask_fit = mask;
        Ok(())
    }

    /// Replace the safe mask
    pub fn set_mask_safe(&mut self, mask: Option<Mask>) -> Result<()> {
        if let Some(m) = &mask {
            self.check_mask(m)?;
        }
        self.mask_safe = mask;
        Ok(())
    }

    /// Builder form of [`MapDataset::set_mask_safe`]
    pub fn with_mask_safe(mut self, mask: Mask) -> Result<Self> {
        self.set_mask_safe(Some(mask))?;
        Ok(self)
    }

    /// Builder form of [`MapDataset::set_mask_fit`]
    pub fn with_mask_fit(mut self, mask: Mask) -> Result<Self> {
        self.set_mask_fit(Some(mask))?;
        Ok(self)
    }

    /// Combined `fit ∧ safe` mask, `None` when every bin is used
    pub fn mask(&self) -> Result<Option<Mask>> {
        match (&self.mask_fit, &self.mask_safe) {
            (Some(f), Some(s)) => Ok(Some(f.and(s)?)),
            (Some(m), None) | (None, Some(m)) => Ok(Some(m.clone())),
            (None, None) => Ok(None),
        }
    }

    /// Source models
    pub fn models(&self) -> &[SkyModel] {
        &self.models
    }

    /// Background spectral correction
    pub fn background_model(&self) -> &BackgroundModel {
        &self.background_model
    }

    /// Replace the background model
    pub fn set_background_model(&mut self, model: BackgroundModel) {
        self.background_model = model;
        self.invalidate();
    }

    /// Assign source models; one evaluator is built per model.
    pub fn set_models(&mut self, models: Vec<SkyModel>) -> Result<()> {
        self.evaluators = self.build_evaluators(&models)?;
        self.models = models;
        self.invalidate();
        self.set_state(if self.models.is_empty() {
            DatasetState::Stacking
        } else {
            DatasetState::ReadyForFit
        });
        Ok(())
    }

    /// Builder form of [`MapDataset::set_models`]
    pub fn with_models(mut self, models: Vec<SkyModel>) -> Result<Self> {
        self.set_models(models)?;
        Ok(self)
    }

    fn build_evaluators(&self, models: &[SkyModel]) -> Result<Vec<MapEvaluator>> {
        let geom = self.counts.geom_arc().clone();
        models
            .iter()
            .map(|m| {
                MapEvaluator::new(
                    m.clone(),
                    self.exposure.clone(),
                    geom.clone(),
                    self.psf.clone(),
                    self.edisp.clone(),
                )
            })
            .collect()
    }

    /// Parameters of the source models, shared handles listed once
    pub fn source_parameters(&self) -> Parameters {
        let mut p = Parameters::default();
        for m in &self.models {
            p.extend(&m.parameters());
        }
        p
    }

    /// Source then background parameters
    pub fn parameters(&self) -> Parameters {
        let mut p = self.source_parameters();
        p.extend(&self.background_model.parameters());
        p
    }

    /// Background template corrected by the background model
    pub fn npred_background(&self) -> Result<Map> {
        self.background_model.evaluate(&self.background)
    }

    fn compute_signal(&self) -> Result<Map> {
        let mut signal = Map::from_geom(self.counts.geom_arc().clone(), "");
        for ev in &self.evaluators {
            signal = signal.try_add(&ev.compute_npred()?)?;
        }
        Ok(signal)
    }

    /// Run `f` on `(signal, npred)` for the current parameter values,
    /// recomputing only when a value changed since the last call.
    fn with_npred<R>(&self, f: impl FnOnce(&Map, &Map) -> Result<R>) -> Result<R> {
        let key = self.parameters().values();
        let mut cache = lock(&self.cache);
        if cache.key != key || cache.npred.is_none() {
            let signal = self.compute_signal()?;
            let npred = signal.try_add(&self.npred_background()?)?;
            *cache = NpredCache { key, signal: Some(signal), npred: Some(npred) };
            self.set_state(DatasetState::Evaluated);
        }
        match (&cache.signal, &cache.npred) {
            (Some(s), Some(n)) => f(s, n),
            _ => Err(Error::Computation("npred cache is empty".to_string())),
        }
    }

    /// Predicted source counts summed over all models
    pub fn npred_signal(&self) -> Result<Map> {
        self.with_npred(|s, _| Ok(s.clone()))
    }

    /// Total predicted counts: sources plus corrected background
    pub fn npred(&self) -> Result<Map> {
        self.with_npred(|_, n| Ok(n.clone()))
    }

    /// Residual map of counts against the prediction
    pub fn residuals(&self, method: ResidualMethod) -> Result<Map> {
        self.with_npred(|_, npred| {
            let diff = self.counts.try_sub(npred)?;
            Ok(match method {
                ResidualMethod::Diff => diff,
                ResidualMethod::DiffOverModel => {
                    let data = ndarray::Zip::from(diff.data())
                        .and(npred.data())
                        .map_collect(|&d, &m| if m > 0.0 { d / m } else { f64::NAN });
                    diff.with_data(data)?
                }
                ResidualMethod::DiffOverSqrtModel => {
                    let data = ndarray::Zip::from(diff.data())
                        .and(npred.data())
                        .map_collect(|&d, &m| if m > 0.0 { d / m.sqrt() } else { f64::NAN });
                    diff.with_data(data)?
                }
            })
        })
    }

    /// Per-bin Cash statistic, masks not applied
    pub fn stat_array(&self) -> Result<Map> {
        self.with_npred(|_, npred| {
            let data = ndarray::Zip::from(self.counts.data())
                .and(npred.data())
                .map_collect(|&n, &mu| cash(n, mu));
            self.counts.with_data(data)
        })
    }

    /// Cash statistic summed over the `fit ∧ safe` bins
    pub fn stat_sum(&self) -> Result<f64> {
        let mask = self.mask()?;
        self.with_npred(|_, npred| {
            let n = self.counts.data();
            Ok(match &mask {
                Some(m) => cash_sum(n.iter(), npred.data().iter(), m.data().iter()),
                None => cash_sum(n.iter(), npred.data().iter(), std::iter::repeat(&true)),
            })
        })
    }

    /// Summary at the current parameter values
    pub fn info(&self) -> Result<DatasetInfo> {
        let background = self.npred_background()?.sum();
        let counts = self.counts.sum();
        let (npred, npred_signal) = self.with_npred(|s, n| Ok((n.sum(), s.sum())))?;
        let finite = self.exposure.data().iter().copied().filter(|v| v.is_finite());
        let (exposure_min, exposure_max) = finite
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| (lo.min(v), hi.max(v)));
        let n_fit_bins = match self.mask()? {
            Some(m) => m.count(),
            None => self.counts.data().len(),
        };
        Ok(DatasetInfo {
            name: self.name.clone(),
            counts,
            background,
            excess: counts - background,
            npred,
            npred_signal,
            exposure_min,
            exposure_max,
            n_bins: self.counts.data().len(),
            n_fit_bins,
            stat_type: "cash".to_string(),
            stat_sum: self.stat_sum()?,
        })
    }

    /// Add `other` into this dataset.
    ///
    /// Counts and background are added inside each dataset's safe mask,
    /// exposures are added, masks are or-ed (a missing mask covers every bin,
    /// except on an `Empty` dataset, which adopts the masks of `other`), and PSF and energy dispersion
    /// become exposure-weighted means. Models stay assigned.
    pub fn stack(&mut self, other: &MapDataset) -> Result<()> {
        let state = self.state();
        if state == DatasetState::Evaluated {
            log::warn!(
                "stacking '{}' into evaluated dataset '{}', cached predictions are discarded",
                other.name,
                self.name
            );
        }
        if !self.counts.geom().is_allclose(other.counts.geom(), 1e-9) {
            return Err(Error::Stack(format!(
                "counts geometries of '{}' and '{}' differ",
                self.name, other.name
            )));
        }
        if !self.exposure.geom().is_allclose(other.exposure.geom(), 1e-9) {
            return Err(Error::Stack(format!(
                "exposure geometries of '{}' and '{}' differ",
                self.name, other.name
            )));
        }

        let (psf, edisp) = if state == DatasetState::Empty {
            (other.psf.clone(), other.edisp.clone())
        } else {
            let w_self = exposure_weights(&self.exposure)?;
            let w_other = exposure_weights(&other.exposure)?;
            let psf = match (&self.psf, &other.psf) {
                (Some(a), Some(b)) => Some(a.weighted_mean(&w_self, b, &w_other)?),
                (None, None) => None,
                _ => return Err(Error::Stack("only one dataset has a psf kernel".to_string())),
            };
            let edisp = match (&self.edisp, &other.edisp) {
                (Some(a), Some(b)) => Some(a.weighted_mean(&w_self, b, &w_other)?),
                (None, None) => None,
                _ => {
                    return Err(Error::Stack(
                        "only one dataset has an energy dispersion kernel".to_string(),
                    ));
                }
            };
            (psf, edisp)
        };

        let counts = safe(&self.counts, &self.mask_safe)?
            .try_add(&safe(&other.counts, &other.mask_safe)?)?;
        let background = safe(&self.background, &self.mask_safe)?
            .try_add(&safe(&other.background, &other.mask_safe)?)?;
        let exposure = self.exposure.try_add(&other.exposure)?;

        self.counts = counts;
        self.background = background;
        self.exposure = Arc::new(exposure);
        self.psf = psf;
        self.edisp = edisp;
        // an empty dataset holds no valid bins, so it takes the masks of `other`
        if state == DatasetState::Empty {
            self.mask_safe = other.mask_safe.clone();
            self.mask_fit = other.mask_fit.clone();
        } else {
            self.mask_safe = or_masks(&self.mask_safe, &other.mask_safe)?;
            self.mask_fit = or_masks(&self.mask_fit, &other.mask_fit)?;
        }
        self.evaluators = self.build_evaluators(&self.models)?;
        self.invalidate();
        self.set_state(if self.models.is_empty() {
            DatasetState::Stacking
        } else {
            DatasetState::ReadyForFit
        });
        Ok(())
    }
}

pub(crate) fn safe(map: &Map, mask: &Option<Mask>) -> Result<Map> {
    match mask {
        Some(m) => map.masked(m, 0.0),
        None => Ok(map.clone()),
    }
}

/// Union of two masks where `None` selects every bin
pub(crate) fn or_masks(a: &Option<Mask>, b: &Option<Mask>) -> Result<Option<Mask>> {
    match (a, b) {
        (Some(a), Some(b)) => Ok(Some(a.or(b)?)),
        _ => Ok(None),
    }
}

/// Spatially summed exposure per true-energy bin
fn exposure_weights(exposure: &Map) -> Result<Vec<f64>> {
    let planes = exposure.image_planes()?;
    Ok(planes.outer_iter().map(|p| p.iter().filter(|v| v.is_finite()).sum()).collect())
}

impl StatDataset for MapDataset {
    fn name(&self) -> &str {
        &self.name
    }

    fn parameters(&self) -> Parameters {
        MapDataset::parameters(self)
    }

    fn stat_sum(&self) -> Result<f64> {
        MapDataset::stat_sum(self)
    }
}

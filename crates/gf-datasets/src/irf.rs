//! Instrument response inputs: effective area, energy dispersion and PSF kernels.
//!
//! All three are binned in true energy on an axis named `energy_true`.

use gf_core::{Error, Result};
use gf_maps::{MapAxis, WcsGeom};
use ndarray::{Array2, Array3, Axis};
use serde::{Deserialize, Serialize};
use statrs::function::erf::erf;

/// Name of the true-energy axis
pub const ENERGY_TRUE: &str = "energy_true";

/// Tolerance for the PSF normalization and edisp row sums
pub const NORM_TOLERANCE: f64 = 1e-6;

fn require_true_axis(axis: &MapAxis) -> Result<()> {
    if axis.name() != ENERGY_TRUE {
        return Err(Error::Configuration(format!(
            "expected an '{}' axis, got '{}'",
            ENERGY_TRUE,
            axis.name()
        )));
    }
    Ok(())
}

/// Effective area per true-energy bin (cm²)
#[derive(Debug, Clone)]
pub struct EffectiveAreaTable {
    axis: MapAxis,
    values: Vec<f64>,
}

impl EffectiveAreaTable {
    /// Area values at the bin centers of `axis`
    pub fn new(axis: MapAxis, values: Vec<f64>) -> Result<Self> {
        require_true_axis(&axis)?;
        if values.len() != axis.nbin() {
            return Err(Error::Configuration(format!(
                "{} effective area values for {} energy bins",
                values.len(),
                axis.nbin()
            )));
        }
        if let Some(v) = values.iter().find(|v| !(v.is_finite() && **v >= 0.0)) {
            return Err(Error::Configuration(format!("effective area must be >= 0, got {v}")));
        }
        Ok(Self { axis, values })
    }

    /// Same area in every bin
    pub fn constant(axis: MapAxis, area: f64) -> Result<Self> {
        let n = axis.nbin();
        Self::new(axis, vec![area; n])
    }

    /// True-energy axis
    pub fn axis(&self) -> &MapAxis {
        &self.axis
    }

    /// Tabulated values
    pub fn values(&self) -> &[f64] {
        &self.values
    }

    /// Area at `energy`, linear in `ln E` between bin centers, 0 outside the edges
    pub fn evaluate(&self, energy: f64) -> f64 {
        let (lo, hi) = self.axis.bounds();
        if !(energy >= lo && energy <= hi) {
            return 0.0;
        }
        let c = self.axis.center();
        let n = c.len();
        if n == 1 || energy <= c[0] {
            return self.values[0];
        }
        if energy >= c[n - 1] {
            return self.values[n - 1];
        }
        let j = c.partition_point(|&x| x <= energy).saturating_sub(1).min(n - 2);
        let t = (energy.ln() - c[j].ln()) / (c[j + 1].ln() - c[j].ln());
        self.values[j] * (1.0 - t) + self.values[j + 1] * t
    }
}

/// Energy dispersion matrix: `data[t, r]` is the probability that an event of
/// true-energy bin `t` is reconstructed in bin `r`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "EDispKernelRepr", into = "EDispKernelRepr")]
pub struct EDispKernel {
    axis_true: MapAxis,
    axis_reco: MapAxis,
    data: Array2<f64>,
}

/// Stored form of [`EDispKernel`]; loading goes through [`EDispKernel::new`]
#[derive(Serialize, Deserialize)]
struct EDispKernelRepr {
    #[serde(with = "axis_serde")]
    axis_true: MapAxis,
    #[serde(with = "axis_serde")]
    axis_reco: MapAxis,
    data: Array2<f64>,
}

impl TryFrom<EDispKernelRepr> for EDispKernel {
    type Error = Error;

    fn try_from(r: EDispKernelRepr) -> Result<Self> {
        Self::new(r.axis_true, r.axis_reco, r.data)
    }
}

impl From<EDispKernel> for EDispKernelRepr {
    fn from(k: EDispKernel) -> Self {
        Self { axis_true: k.axis_true, axis_reco: k.axis_reco, data: k.data }
    }
}

impl EDispKernel {
    /// Validate shape, non-negativity and row sums `<= 1`
    pub fn new(axis_true: MapAxis, axis_reco: MapAxis, data: Array2<f64>) -> Result<Self> {
        require_true_axis(&axis_true)?;
        if data.dim() != (axis_true.nbin(), axis_reco.nbin()) {
            return Err(Error::Configuration(format!(
                "edisp shape {:?} does not match axes ({}, {})",
                data.dim(),
                axis_true.nbin(),
                axis_reco.nbin()
            )));
        }
        for (t, row) in data.axis_iter(Axis(0)).enumerate() {
            if row.iter().any(|v| !(v.is_finite() && *v >= 0.0)) {
                return Err(Error::Configuration(format!("edisp row {t} has negative entries")));
            }
            let s = row.sum();
            if s > 1.0 + NORM_TOLERANCE {
                return Err(Error::Configuration(format!("edisp row {t} sums to {s} > 1")));
            }
        }
        Ok(Self { axis_true, axis_reco, data })
    }

    /// Gaussian migration: reconstructed energy ~ `N(E (1 + bias), E sigma)`
    pub fn from_gauss(axis_true: MapAxis, axis_reco: MapAxis, sigma: f64, bias: f64) -> Result<Self> {
        if !(sigma.is_finite() && sigma > 0.0) {
            return Err(Error::Configuration(format!("edisp sigma must be > 0, got {sigma}")));
        }
        let cdf = |x: f64, mu: f64, s: f64| 0.5 * (1.0 + erf((x - mu) / (s * std::f64::consts::SQRT_2)));
        let centers = axis_true.center().to_vec();
        let (lo, hi) = (axis_reco.edges_min().to_vec(), axis_reco.edges_max().to_vec());
        let data = Array2::from_shape_fn((axis_true.nbin(), axis_reco.nbin()), |(t, r)| {
            let e = centers[t];
            let (mu, s) = (e * (1.0 + bias), e * sigma);
            (cdf(hi[r], mu, s) - cdf(lo[r], mu, s)).max(0.0)
        });
        Self::new(axis_true, axis_reco, data)
    }

    /// Perfect resolution: each true bin goes to the reco bin containing its center
    pub fn from_diagonal(axis_true: MapAxis, axis_reco: MapAxis) -> Result<Self> {
        let mut data = Array2::zeros((axis_true.nbin(), axis_reco.nbin()));
        for (t, &e) in axis_true.center().iter().enumerate() {
            let r = axis_reco.coord_to_idx(e);
            if r >= 0 {
                data[[t, r as usize]] = 1.0;
            }
        }
        Self::new(axis_true, axis_reco, data)
    }

    /// True-energy axis
    pub fn axis_true(&self) -> &MapAxis {
        &self.axis_true
    }

    /// Reconstructed-energy axis
    pub fn axis_reco(&self) -> &MapAxis {
        &self.axis_reco
    }

    /// Migration matrix `(n_true, n_reco)`
    pub fn data(&self) -> &Array2<f64> {
        &self.data
    }

    /// Row-wise weighted mean of two kernels on the same axes
    pub fn weighted_mean(&self, w_self: &[f64], other: &EDispKernel, w_other: &[f64]) -> Result<Self> {
        if !(self.axis_true == other.axis_true && self.axis_reco == other.axis_reco) {
            return Err(Error::Stack("energy dispersion axes differ".to_string()));
        }
        let data = weighted_rows(&self.data, w_self, &other.data, w_other)?;
        Ok(Self { axis_true: self.axis_true.clone(), axis_reco: self.axis_reco.clone(), data })
    }
}

fn weighted_rows(a: &Array2<f64>, wa: &[f64], b: &Array2<f64>, wb: &[f64]) -> Result<Array2<f64>> {
    let n = a.nrows();
    if wa.len() != n || wb.len() != n {
        return Err(Error::Stack(format!("expected {n} weights per kernel")));
    }
    let mut out = a.clone();
    for t in 0..n {
        let total = wa[t] + wb[t];
        let mut row = out.row_mut(t);
        if total > 0.0 {
            row.zip_mut_with(&b.row(t), |x, &y| *x = (wa[t] * *x + wb[t] * y) / total);
        }
    }
    Ok(out)
}

/// PSF kernel cube `(n_true, ny, nx)`, one normalized kernel per true-energy bin
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "PsfKernelRepr", into = "PsfKernelRepr")]
pub struct PsfKernel {
    axis_true: MapAxis,
    /// Pixel size of the kernel in degrees
    binsz: f64,
    data: Array3<f64>,
}

/// Stored form of [`PsfKernel`]; loading goes through [`PsfKernel::new`]
#[derive(Serialize, Deserialize)]
struct PsfKernelRepr {
    #[serde(with = "axis_serde")]
    axis_true: MapAxis,
    binsz: f64,
    data: Array3<f64>,
}

impl TryFrom<PsfKernelRepr> for PsfKernel {
    type Error = Error;

    fn try_from(r: PsfKernelRepr) -> Result<Self> {
        Self::new(r.axis_true, r.binsz, r.data)
    }
}

impl From<PsfKernel> for PsfKernelRepr {
    fn from(k: PsfKernel) -> Self {
        Self { axis_true: k.axis_true, binsz: k.binsz, data: k.data }
    }
}

impl PsfKernel {
    /// Validate odd spatial shape and unit normalization of every slice
    pub fn new(axis_true: MapAxis, binsz: f64, data: Array3<f64>) -> Result<Self> {
        require_true_axis(&axis_true)?;
        let (n, ny, nx) = data.dim();
        if n != axis_true.nbin() {
            return Err(Error::Configuration(format!(
                "psf kernel has {n} slices for {} energy bins",
                axis_true.nbin()
            )));
        }
        if ny % 2 == 0 || nx % 2 == 0 {
            return Err(Error::Configuration(format!("psf kernel shape must be odd, got ({ny}, {nx})")));
        }
        if !(binsz.is_finite() && binsz > 0.0) {
            return Err(Error::Configuration(format!("psf binsz must be > 0, got {binsz}")));
        }
        for (i, slice) in data.outer_iter().enumerate() {
            let s = slice.sum();
            if (s - 1.0).abs() > NORM_TOLERANCE {
                return Err(Error::Configuration(format!(
                    "psf kernel slice {i} sums to {s}, expected 1 within {NORM_TOLERANCE}"
                )));
            }
        }
        Ok(Self { axis_true, binsz, data })
    }

    /// Gaussian kernels with per-energy widths `sigma` (degrees), truncated at `max_radius`
    pub fn from_gauss(axis_true: MapAxis, binsz: f64, sigma: &[f64], max_radius: f64) -> Result<Self> {
        if sigma.len() != axis_true.nbin() {
            return Err(Error::Configuration(format!(
                "{} psf widths for {} energy bins",
                sigma.len(),
                axis_true.nbin()
            )));
        }
        if let Some(s) = sigma.iter().find(|s| !(s.is_finite() && **s > 0.0)) {
            return Err(Error::Configuration(format!("psf sigma must be > 0, got {s}")));
        }
        if !(binsz > 0.0 && max_radius > 0.0) {
            return Err(Error::Configuration("psf binsz and max_radius must be > 0".to_string()));
        }
        let half = (max_radius / binsz).ceil() as usize;
        let size = 2 * half + 1;
        const SUB: usize = 4;
        let mut data = Array3::zeros((sigma.len(), size, size));
        for (e, &s) in sigma.iter().enumerate() {
            let sp = s / binsz;
            let mut slice = data.index_axis_mut(Axis(0), e);
            for ((i, j), v) in slice.indexed_iter_mut() {
                let mut acc = 0.0;
                for si in 0..SUB {
                    for sj in 0..SUB {
                        let y = i as f64 - half as f64 - 0.5 + (si as f64 + 0.5) / SUB as f64;
                        let x = j as f64 - half as f64 - 0.5 + (sj as f64 + 0.5) / SUB as f64;
                        acc += (-(x * x + y * y) / (2.0 * sp * sp)).exp();
                    }
                }
                *v = acc;
            }
            let total = slice.sum();
            slice.mapv_inplace(|v| v / total);
        }
        Self::new(axis_true, binsz, data)
    }

    /// True-energy axis
    pub fn axis_true(&self) -> &MapAxis {
        &self.axis_true
    }

    /// Kernel pixel size in degrees
    pub fn binsz(&self) -> f64 {
        self.binsz
    }

    /// Kernel cube
    pub fn data(&self) -> &Array3<f64> {
        &self.data
    }

    /// Angular half-width of the kernel in degrees
    pub fn radius(&self) -> f64 {
        let (_, ny, nx) = self.data.dim();
        (ny.max(nx) / 2) as f64 * self.binsz
    }

    /// Kernel pixel size must equal the map pixel size
    pub fn check_geom(&self, geom: &WcsGeom) -> Result<()> {
        if (geom.binsz() - self.binsz).abs() > 1e-9 * self.binsz {
            return Err(Error::Configuration(format!(
                "psf kernel pixel size {} differs from map pixel size {}",
                self.binsz,
                geom.binsz()
            )));
        }
        Ok(())
    }

    /// Per-energy weighted mean of two kernels of the same shape
    pub fn weighted_mean(&self, w_self: &[f64], other: &PsfKernel, w_other: &[f64]) -> Result<Self> {
        if self.axis_true != other.axis_true
            || self.data.dim() != other.data.dim()
            || (self.binsz - other.binsz).abs() > 1e-9 * self.binsz
        {
            return Err(Error::Stack("psf kernels have different binning".to_string()));
        }
        let n = self.axis_true.nbin();
        if w_self.len() != n || w_other.len() != n {
            return Err(Error::Stack(format!("expected {n} weights per kernel")));
        }
        let mut data = self.data.clone();
        for e in 0..n {
            let total = w_self[e] + w_other[e];
            if total > 0.0 {
                let mut slice = data.index_axis_mut(Axis(0), e);
                slice.zip_mut_with(&other.data.index_axis(Axis(0), e), |x, &y| {
                    *x = (w_self[e] * *x + w_other[e] * y) / total
                });
            }
        }
        Ok(Self { axis_true: self.axis_true.clone(), binsz: self.binsz, data })
    }
}

/// Serde adapter storing an axis through its header form
mod axis_serde {
    use gf_maps::MapAxis;
    use gf_maps::io::AxisHeader;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(axis: &MapAxis, s: S) -> Result<S::Ok, S::Error> {
        AxisHeader::from(axis).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<MapAxis, D::Error> {
        let header = AxisHeader::deserialize(d)?;
        header.to_axis().map_err(serde::de::Error::custom)
    }
}

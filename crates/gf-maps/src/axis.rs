//! One-dimensional binning of a physical quantity.
//!
//! Pixel convention used throughout the crate: bin `i` covers the continuous
//! pixel interval `[i, i + 1)`. Edge `k` sits at pixel `k` and the center of
//! bin `i` sits at pixel `i + 0.5`, for both node types.

use gf_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::ops::Range;

/// Sentinel returned for coordinates that fall outside a binning
pub const INVALID_INDEX: i64 = -1;

/// Interpolation space of an axis
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Interp {
    /// Linear in value
    Linear,
    /// Linear in `ln(value)`
    Log,
}

impl Interp {
    #[inline]
    fn fwd(self, v: f64) -> f64 {
        match self {
            Interp::Linear => v,
            Interp::Log => {
                if v > 0.0 {
                    v.ln()
                } else {
                    f64::NAN
                }
            }
        }
    }

    #[inline]
    fn inv(self, v: f64) -> f64 {
        match self {
            Interp::Linear => v,
            Interp::Log => v.exp(),
        }
    }
}

/// Whether the stored nodes are bin edges or bin centers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    /// Nodes are the `nbin + 1` bin edges
    Edges,
    /// Nodes are the `nbin` bin centers
    Center,
}

impl NodeType {
    fn pix_offset(self) -> f64 {
        match self {
            NodeType::Edges => 0.0,
            NodeType::Center => 0.5,
        }
    }
}

/// Immutable 1-D binning (energy, time, ...)
#[derive(Debug, Clone)]
pub struct MapAxis {
    name: String,
    unit: String,
    interp: Interp,
    node_type: NodeType,
    nodes: Vec<f64>,
    edges: Vec<f64>,
    center: Vec<f64>,
}

impl MapAxis {
    fn build(
        nodes: Vec<f64>,
        node_type: NodeType,
        interp: Interp,
        name: impl Into<String>,
        unit: impl Into<String>,
    ) -> Result<Self> {
        let name = name.into();
        if nodes.len() < 2 {
            return Err(Error::InvalidRange(format!(
                "axis '{}' requires at least 2 nodes, got {}",
                name,
                nodes.len()
            )));
        }
        for (i, &v) in nodes.iter().enumerate() {
            if !v.is_finite() {
                return Err(Error::InvalidRange(format!(
                    "axis '{name}' node[{i}] must be finite, got {v}"
                )));
            }
            if interp == Interp::Log && v <= 0.0 {
                return Err(Error::InvalidRange(format!(
                    "axis '{name}' uses log interpolation but node[{i}] = {v} <= 0"
                )));
            }
            if i > 0 && nodes[i - 1] >= v {
                return Err(Error::InvalidRange(format!(
                    "axis '{}' nodes must be strictly increasing, got node[{}]={} and node[{}]={}",
                    name,
                    i - 1,
                    nodes[i - 1],
                    i,
                    v
                )));
            }
        }

        let scaled: Vec<f64> = nodes.iter().map(|&v| interp.fwd(v)).collect();
        let (edges, center) = match node_type {
            NodeType::Edges => {
                let center =
                    scaled.windows(2).map(|w| interp.inv(0.5 * (w[0] + w[1]))).collect();
                (nodes.clone(), center)
            }
            NodeType::Center => {
                let n = scaled.len();
                let mut edges = Vec::with_capacity(n + 1);
                edges.push(interp.inv(scaled[0] - 0.5 * (scaled[1] - scaled[0])));
                for w in scaled.windows(2) {
                    edges.push(interp.inv(0.5 * (w[0] + w[1])));
                }
                edges.push(interp.inv(scaled[n - 1] + 0.5 * (scaled[n - 1] - scaled[n - 2])));
                (edges, nodes.clone())
            }
        };

        Ok(Self { name, unit: unit.into(), interp, node_type, nodes, edges, center })
    }

    /// `nbin` bins between `lo` and `hi`, evenly spaced in the interpolation space.
    pub fn from_bounds(
        lo: f64,
        hi: f64,
        nbin: usize,
        interp: Interp,
        name: impl Into<String>,
        unit: impl Into<String>,
    ) -> Result<Self> {
        if lo.is_nan() || hi.is_nan() || lo >= hi {
            return Err(Error::InvalidRange(format!("lo ({lo}) must be < hi ({hi})")));
        }
        if interp == Interp::Log && lo <= 0.0 {
            return Err(Error::InvalidRange(format!(
                "log interpolation requires lo > 0, got {lo}"
            )));
        }
        if nbin == 0 {
            return Err(Error::InvalidRange("nbin must be > 0".to_string()));
        }
        let (a, b) = (interp.fwd(lo), interp.fwd(hi));
        let mut edges: Vec<f64> =
            (0..=nbin).map(|i| interp.inv(a + (b - a) * i as f64 / nbin as f64)).collect();
        // Pin the outer edges to the requested bounds.
        edges[0] = lo;
        edges[nbin] = hi;
        Self::build(edges, NodeType::Edges, interp, name, unit)
    }

    /// Log-spaced energy axis named `energy`.
    ///
    /// With `per_decade` the number of bins is `ceil(nbin * log10(hi / lo))`.
    pub fn from_energy_bounds(
        lo: f64,
        hi: f64,
        nbin: usize,
        unit: impl Into<String>,
        per_decade: bool,
    ) -> Result<Self> {
        let nbin = if per_decade {
            if !(lo > 0.0 && lo < hi) {
                return Err(Error::InvalidRange(format!("invalid energy range [{lo}, {hi}]")));
            }
            (nbin as f64 * (hi / lo).log10()).ceil() as usize
        } else {
            nbin
        };
        Self::from_bounds(lo, hi, nbin, Interp::Log, "energy", unit)
    }

    /// Wrap explicit, strictly increasing bin edges.
    pub fn from_edges(
        edges: Vec<f64>,
        interp: Interp,
        name: impl Into<String>,
        unit: impl Into<String>,
    ) -> Result<Self> {
        Self::build(edges, NodeType::Edges, interp, name, unit)
    }

    /// Wrap explicit, strictly increasing bin centers.
    pub fn from_nodes(
        nodes: Vec<f64>,
        interp: Interp,
        name: impl Into<String>,
        unit: impl Into<String>,
    ) -> Result<Self> {
        Self::build(nodes, NodeType::Center, interp, name, unit)
    }

    /// Rebuild from raw nodes (used by the persistence layer).
    pub fn from_parts(
        nodes: Vec<f64>,
        node_type: NodeType,
        interp: Interp,
        name: impl Into<String>,
        unit: impl Into<String>,
    ) -> Result<Self> {
        Self::build(nodes, node_type, interp, name, unit)
    }

    /// Same binning under a different name
    pub fn with_name(&self, name: impl Into<String>) -> Self {
        let mut out = self.clone();
        out.name = name.into();
        out
    }

    /// Axis name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Unit string
    pub fn unit(&self) -> &str {
        &self.unit
    }

    /// Interpolation mode
    pub fn interp(&self) -> Interp {
        self.interp
    }

    /// Node type
    pub fn node_type(&self) -> NodeType {
        self.node_type
    }

    /// Stored nodes (edges or centers depending on node type)
    pub fn nodes(&self) -> &[f64] {
        &self.nodes
    }

    /// Number of bins
    pub fn nbin(&self) -> usize {
        self.center.len()
    }

    /// Bin edges (`nbin + 1` values)
    pub fn edges(&self) -> &[f64] {
        &self.edges
    }

    /// Bin centers (`nbin` values)
    pub fn center(&self) -> &[f64] {
        &self.center
    }

    /// Lower edges
    pub fn edges_min(&self) -> &[f64] {
        &self.edges[..self.nbin()]
    }

    /// Upper edges
    pub fn edges_max(&self) -> &[f64] {
        &self.edges[1..]
    }

    /// Bin widths in value space
    pub fn bin_width(&self) -> Vec<f64> {
        self.edges.windows(2).map(|w| w[1] - w[0]).collect()
    }

    /// `(edges[0], edges[nbin])`
    pub fn bounds(&self) -> (f64, f64) {
        (self.edges[0], self.edges[self.nbin()])
    }

    /// Continuous pixel coordinate of a value.
    ///
    /// Interpolates between nodes linearly in the axis interpolation space and
    /// extrapolates linearly beyond the outermost nodes. Returns NaN for NaN
    /// input and for non-positive values on a log axis.
    pub fn coord_to_pix(&self, value: f64) -> f64 {
        let x = self.interp.fwd(value);
        if x.is_nan() {
            return f64::NAN;
        }
        let n = self.nodes.len();
        let j = self.nodes.partition_point(|&v| v <= value).saturating_sub(1).min(n - 2);
        let s0 = self.interp.fwd(self.nodes[j]);
        let s1 = self.interp.fwd(self.nodes[j + 1]);
        j as f64 + self.node_type.pix_offset() + (x - s0) / (s1 - s0)
    }

    /// Value at a continuous pixel coordinate (inverse of [`MapAxis::coord_to_pix`]).
    pub fn pix_to_coord(&self, pix: f64) -> f64 {
        if pix.is_nan() {
            return f64::NAN;
        }
        let n = self.nodes.len();
        let p = pix - self.node_type.pix_offset();
        let j = (p.floor().max(0.0) as usize).min(n - 2);
        let s0 = self.interp.fwd(self.nodes[j]);
        let s1 = self.interp.fwd(self.nodes[j + 1]);
        self.interp.inv(s0 + (p - j as f64) * (s1 - s0))
    }

    /// Index of the bin containing `value`, [`INVALID_INDEX`] outside
    /// `[edges[0], edges[nbin]]` (both ends inclusive).
    pub fn coord_to_idx(&self, value: f64) -> i64 {
        let (lo, hi) = self.bounds();
        if !(value >= lo && value <= hi) {
            return INVALID_INDEX;
        }
        let i = self.edges.partition_point(|&e| e <= value).saturating_sub(1);
        i.min(self.nbin() - 1) as i64
    }

    /// Integer bin index of a continuous pixel coordinate
    pub fn pix_to_idx(&self, pix: f64) -> i64 {
        if pix >= 0.0 && pix < self.nbin() as f64 {
            pix.floor() as i64
        } else {
            INVALID_INDEX
        }
    }

    /// Sub-axis over a range of bins
    pub fn slice(&self, range: Range<usize>) -> Result<Self> {
        if range.start >= range.end || range.end > self.nbin() {
            return Err(Error::InvalidRange(format!(
                "slice {}..{} out of range for axis '{}' with {} bins",
                range.start,
                range.end,
                self.name,
                self.nbin()
            )));
        }
        match self.node_type {
            NodeType::Edges => Self::build(
                self.edges[range.start..=range.end].to_vec(),
                NodeType::Edges,
                self.interp,
                &self.name,
                &self.unit,
            ),
            NodeType::Center if range.len() >= 2 => Self::build(
                self.center[range].to_vec(),
                NodeType::Center,
                self.interp,
                &self.name,
                &self.unit,
            ),
            // A single center cannot synthesize its own edges; keep the parent's.
            NodeType::Center => Self::build(
                self.edges[range.start..=range.end].to_vec(),
                NodeType::Edges,
                self.interp,
                &self.name,
                &self.unit,
            ),
        }
    }

    /// One bin spanning the whole axis
    pub fn squash(&self) -> Self {
        let (lo, hi) = self.bounds();
        Self {
            name: self.name.clone(),
            unit: self.unit.clone(),
            interp: self.interp,
            node_type: NodeType::Edges,
            nodes: vec![lo, hi],
            edges: vec![lo, hi],
            center: vec![self.interp.inv(0.5 * (self.interp.fwd(lo) + self.interp.fwd(hi)))],
        }
    }

    /// Merge groups of `factor` adjacent bins; a trailing partial group is kept.
    pub fn downsample(&self, factor: usize) -> Result<Self> {
        if factor == 0 {
            return Err(Error::InvalidRange("downsample factor must be > 0".to_string()));
        }
        let mut edges: Vec<f64> = self.edges.iter().step_by(factor).copied().collect();
        if (self.edges.len() - 1) % factor != 0 {
            edges.push(self.edges[self.nbin()]);
        }
        Self::build(edges, NodeType::Edges, self.interp, &self.name, &self.unit)
    }

    /// Split every bin into `factor` bins, evenly in the interpolation space.
    pub fn upsample(&self, factor: usize) -> Result<Self> {
        if factor == 0 {
            return Err(Error::InvalidRange("upsample factor must be > 0".to_string()));
        }
        let mut edges = Vec::with_capacity(self.nbin() * factor + 1);
        for w in self.edges.windows(2) {
            let (a, b) = (self.interp.fwd(w[0]), self.interp.fwd(w[1]));
            for k in 0..factor {
                edges.push(self.interp.inv(a + (b - a) * k as f64 / factor as f64));
            }
        }
        edges.push(self.edges[self.nbin()]);
        Self::build(edges, NodeType::Edges, self.interp, &self.name, &self.unit)
    }

    /// Same name, unit, node type, interpolation and nodes within `rtol`
    pub fn is_allclose(&self, other: &MapAxis, rtol: f64) -> bool {
        self.name == other.name
            && self.unit == other.unit
            && self.node_type == other.node_type
            && self.interp == other.interp
            && self.nodes.len() == other.nodes.len()
            && self
                .nodes
                .iter()
                .zip(&other.nodes)
                .all(|(a, b)| (a - b).abs() <= rtol * a.abs().max(b.abs()).max(f64::MIN_POSITIVE))
    }
}

impl PartialEq for MapAxis {
    fn eq(&self, other: &Self) -> bool {
        self.is_allclose(other, 1e-9)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use proptest::prelude::*;

    fn energy_axis() -> MapAxis {
        MapAxis::from_edges(vec![1.0, 10.0, 100.0], Interp::Log, "energy", "TeV").unwrap()
    }

    #[test]
    fn test_from_bounds_rejects_bad_ranges() {
        assert!(matches!(
            MapAxis::from_bounds(10.0, 1.0, 3, Interp::Linear, "x", ""),
            Err(Error::InvalidRange(_))
        ));
        assert!(matches!(
            MapAxis::from_bounds(1.0, 1.0, 3, Interp::Linear, "x", ""),
            Err(Error::InvalidRange(_))
        ));
        assert!(matches!(
            MapAxis::from_bounds(0.0, 10.0, 3, Interp::Log, "energy", "TeV"),
            Err(Error::InvalidRange(_))
        ));
        assert!(MapAxis::from_bounds(1.0, 10.0, 0, Interp::Linear, "x", "").is_err());
    }

    #[test]
    fn test_from_edges_rejects_non_monotonic() {
        assert!(MapAxis::from_edges(vec![1.0, 3.0, 2.0], Interp::Linear, "x", "").is_err());
        assert!(MapAxis::from_edges(vec![1.0], Interp::Linear, "x", "").is_err());
        assert!(MapAxis::from_edges(vec![-1.0, 2.0], Interp::Log, "x", "").is_err());
    }

    #[test]
    fn test_log_midpoint_law() {
        let axis = energy_axis();
        assert_relative_eq!(axis.coord_to_pix(10f64.sqrt()), 0.5, epsilon = 1e-12);
        assert_relative_eq!(axis.coord_to_pix(10.0), 1.0, epsilon = 1e-12);
        assert_relative_eq!(axis.center()[0], 10f64.sqrt(), max_relative = 1e-12);
    }

    #[test]
    fn test_linear_pix() {
        let axis = MapAxis::from_bounds(0.0, 10.0, 10, Interp::Linear, "x", "").unwrap();
        assert_relative_eq!(axis.coord_to_pix(2.5), 2.5, epsilon = 1e-12);
        assert_relative_eq!(axis.pix_to_coord(7.25), 7.25, epsilon = 1e-12);
        // extrapolation
        assert_relative_eq!(axis.coord_to_pix(-1.0), -1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_coord_to_idx_sentinel() {
        let axis = energy_axis();
        assert_eq!(axis.coord_to_idx(0.5), INVALID_INDEX);
        assert_eq!(axis.coord_to_idx(200.0), INVALID_INDEX);
        assert_eq!(axis.coord_to_idx(f64::NAN), INVALID_INDEX);
        assert_eq!(axis.coord_to_idx(1.0), 0);
        assert_eq!(axis.coord_to_idx(100.0), 1);
        assert_eq!(axis.coord_to_idx(10.0), 1);
    }

    #[test]
    fn test_center_nodes_synthesize_edges() {
        let axis = MapAxis::from_nodes(vec![1.0, 10.0, 100.0], Interp::Log, "energy", "TeV")
            .unwrap();
        assert_eq!(axis.nbin(), 3);
        let edges = axis.edges();
        assert_relative_eq!(edges[0], 10f64.powf(-0.5), max_relative = 1e-12);
        assert_relative_eq!(edges[1], 10f64.sqrt(), max_relative = 1e-12);
        assert_relative_eq!(edges[3], 10f64.powf(2.5), max_relative = 1e-12);
        assert_relative_eq!(axis.coord_to_pix(10.0), 1.5, epsilon = 1e-12);

        let lin = MapAxis::from_nodes(vec![0.0, 1.0, 3.0], Interp::Linear, "x", "").unwrap();
        assert_eq!(lin.edges(), &[-0.5, 0.5, 2.0, 4.0]);
    }

    #[test]
    fn test_slice_squash_resample() {
        let axis = MapAxis::from_energy_bounds(1.0, 100.0, 4, "TeV", false).unwrap();
        let sub = axis.slice(1..3).unwrap();
        assert_eq!(sub.nbin(), 2);
        assert_eq!(sub.edges()[0], axis.edges()[1]);
        assert!(axis.slice(3..5).is_err());

        let sq = axis.squash();
        assert_eq!(sq.nbin(), 1);
        assert_eq!(sq.bounds(), (1.0, 100.0));

        let down = axis.downsample(2).unwrap();
        assert_eq!(down.nbin(), 2);
        let up = axis.upsample(3).unwrap();
        assert_eq!(up.nbin(), 12);
        assert_relative_eq!(up.edges()[3], axis.edges()[1], max_relative = 1e-12);
    }

    #[test]
    fn test_per_decade() {
        let axis = MapAxis::from_energy_bounds(0.1, 100.0, 5, "TeV", true).unwrap();
        assert_eq!(axis.nbin(), 15);
        assert_eq!(axis.name(), "energy");
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 64, .. ProptestConfig::default() })]

        #[test]
        fn prop_center_round_trip(
            lo in 0.01f64..10.0,
            ratio in 1.5f64..1e4,
            nbin in 1usize..40,
            log in proptest::bool::ANY,
        ) {
            let interp = if log { Interp::Log } else { Interp::Linear };
            let axis = MapAxis::from_bounds(lo, lo * ratio, nbin, interp, "energy", "TeV").unwrap();
            for (i, &c) in axis.center().iter().enumerate() {
                prop_assert_eq!(axis.coord_to_idx(c), i as i64);
            }
            let rebuilt =
                MapAxis::from_edges(axis.edges().to_vec(), interp, "energy", "TeV").unwrap();
            prop_assert_eq!(rebuilt.edges(), axis.edges());
        }
    }
}

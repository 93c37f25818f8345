//! On/off dataset: the background is measured in control regions and
//! profiled out of the likelihood (WSTAT).

use crate::dataset::{DatasetInfo, MapDataset, safe};
use crate::stats::{wstat, wstat_mu_bkg};
use gf_core::{Error, Parameters, Result, StatDataset};
use gf_maps::Map;
use ndarray::Zip;

/// A [`MapDataset`] for the on region plus off counts and acceptances.
///
/// The on dataset's background template and background model are not used.
#[derive(Debug, Clone)]
pub struct MapDatasetOnOff {
    on: MapDataset,
    counts_off: Map,
    acceptance: Map,
    acceptance_off: Map,
}

impl MapDatasetOnOff {
    /// Attach off counts and acceptances to an on dataset
    pub fn from_dataset(
        dataset: MapDataset,
        counts_off: Map,
        acceptance: Map,
        acceptance_off: Map,
    ) -> Result<Self> {
        for (what, m) in [
            ("counts_off", &counts_off),
            ("acceptance", &acceptance),
            ("acceptance_off", &acceptance_off),
        ] {
            if !m.geom().is_allclose(dataset.geom(), 1e-9) {
                return Err(Error::GeometryMismatch(format!(
                    "{what} geometry differs from the on counts"
                )));
            }
        }
        Ok(Self { on: dataset, counts_off, acceptance, acceptance_off })
    }

    /// Same acceptance ratio `alpha` in every bin
    pub fn with_alpha(dataset: MapDataset, counts_off: Map, alpha: f64) -> Result<Self> {
        if !(alpha.is_finite() && alpha >= 0.0) {
            return Err(Error::Configuration(format!("alpha must be >= 0, got {alpha}")));
        }
        let geom = dataset.counts().geom_arc().clone();
        let acceptance = Map::from_elem(geom.clone(), alpha, "");
        let acceptance_off = Map::from_elem(geom, 1.0, "");
        Self::from_dataset(dataset, counts_off, acceptance, acceptance_off)
    }

    /// Dataset name
    pub fn name(&self) -> &str {
        self.on.name()
    }

    /// On-region dataset
    pub fn on(&self) -> &MapDataset {
        &self.on
    }

    /// Mutable on-region dataset, e.g. to assign models or masks
    pub fn on_mut(&mut self) -> &mut MapDataset {
        &mut self.on
    }

    /// Off counts
    pub fn counts_off(&self) -> &Map {
        &self.counts_off
    }

    /// On acceptance
    pub fn acceptance(&self) -> &Map {
        &self.acceptance
    }

    /// Off acceptance
    pub fn acceptance_off(&self) -> &Map {
        &self.acceptance_off
    }

    /// `acceptance / acceptance_off`, 0 where the off acceptance vanishes
    pub fn alpha(&self) -> Result<Map> {
        let data = Zip::from(self.acceptance.data())
            .and(self.acceptance_off.data())
            .map_collect(|&a, &b| if b > 0.0 { a / b } else { 0.0 });
        Map::from_data(self.acceptance.geom_arc().clone(), data, "")
    }

    /// Predicted source counts
    pub fn npred_signal(&self) -> Result<Map> {
        self.on.npred_signal()
    }

    /// Profiled background in the on region, `alpha * mu_bkg`
    pub fn npred_background(&self) -> Result<Map> {
        let signal = self.npred_signal()?;
        let alpha = self.alpha()?;
        let data = Zip::from(self.on.counts().data())
            .and(self.counts_off.data())
            .and(alpha.data())
            .and(signal.data())
            .map_collect(|&n_on, &n_off, &a, &mu| a * wstat_mu_bkg(n_on, n_off, a, mu));
        signal.with_data(data)
    }

    /// `alpha * n_off`
    pub fn background(&self) -> Result<Map> {
        self.alpha()?.try_mul(&self.counts_off)
    }

    /// Source plus profiled background
    pub fn npred(&self) -> Result<Map> {
        self.npred_signal()?.try_add(&self.npred_background()?)
    }

    /// Per-bin WSTAT, masks not applied
    pub fn stat_array(&self) -> Result<Map> {
        let signal = self.npred_signal()?;
        let alpha = self.alpha()?;
        let data = Zip::from(self.on.counts().data())
            .and(self.counts_off.data())
            .and(alpha.data())
            .and(signal.data())
            .map_collect(|&n_on, &n_off, &a, &mu| wstat(n_on, n_off, a, mu));
        signal.with_data(data)
    }

    /// WSTAT summed over the `fit ∧ safe` bins
    pub fn stat_sum(&self) -> Result<f64> {
        let stat = self.stat_array()?;
        Ok(match self.on.mask()? {
            Some(m) => stat.data().iter().zip(m.data()).filter(|(_, m)| **m).map(|(v, _)| v).sum(),
            None => stat.data().sum(),
        })
    }

    /// Summary at the current parameter values
    pub fn info(&self) -> Result<DatasetInfo> {
        let counts = self.on.counts().sum();
        let background = self.background()?.sum();
        let npred_signal = self.npred_signal()?.sum();
        let npred = self.npred()?.sum();
        let exposure = self.on.exposure().data();
        let finite = exposure.iter().copied().filter(|v| v.is_finite());
        let (exposure_min, exposure_max) = finite
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| (lo.min(v), hi.max(v)));
        let n_bins = self.on.counts().data().len();
        Ok(DatasetInfo {
            name: self.name().to_string(),
            counts,
            background,
            excess: counts - background,
            npred,
            npred_signal,
            exposure_min,
            exposure_max,
            n_bins,
            n_fit_bins: self.on.mask()?.map_or(n_bins, |m| m.count()),
            stat_type: "wstat".to_string(),
            stat_sum: self.stat_sum()?,
        })
    }

    /// Add `other` into this dataset.
    ///
    /// Off counts and acceptances add up; the off acceptance is rescaled so
    /// that the stacked `alpha * n_off` equals the sum of the individual
    /// backgrounds.
    pub fn stack(&mut self, other: &MapDatasetOnOff) -> Result<()> {
        let bkg = safe(&self.background()?, &self.on.mask_safe().cloned())?
            .try_add(&safe(&other.background()?, &other.on.mask_safe().cloned())?)?;
        let counts_off = safe(&self.counts_off, &self.on.mask_safe().cloned())?
            .try_add(&safe(&other.counts_off, &other.on.mask_safe().cloned())?)?;
        let acceptance = self.acceptance.try_add(&other.acceptance)?;
        let data = Zip::from(acceptance.data())
            .and(counts_off.data())
            .and(bkg.data())
            .map_collect(|&acc, &n_off, &b| if b > 0.0 { acc * n_off / b } else { 0.0 });
        let acceptance_off = acceptance.with_data(data)?;

        self.on.stack(&other.on)?;
        self.counts_off = counts_off;
        self.acceptance = acceptance;
        self.acceptance_off = acceptance_off;
        Ok(())
    }
}

impl StatDataset for MapDatasetOnOff {
    fn name(&self) -> &str {
        self.on.name()
    }

    /// Source parameters only; the background is profiled
    fn parameters(&self) -> Parameters {
        self.on.source_parameters()
    }

    fn stat_sum(&self) -> Result<f64> {
        MapDatasetOnOff::stat_sum(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::irf::ENERGY_TRUE;
    use approx::assert_relative_eq;
    use gf_maps::{MapAxis, Projection, SkyCoord, WcsGeom};

    fn on_dataset(counts: f64) -> MapDataset {
        let energy = MapAxis::from_energy_bounds(1.0, 10.0, 2, "TeV", false).unwrap();
        let g = WcsGeom::create(SkyCoord::galactic(0.0, 0.0), 1.0, (2.0, 2.0), Projection::Car, vec![
            energy,
        ])
        .unwrap();
        let e_true = g.axes()[0].with_name(ENERGY_TRUE);
        let exposure = Map::from_elem(g.to_cube(vec![e_true]).unwrap(), 1e12, "cm2 s");
        MapDataset::new(
            "on",
            Map::from_elem(g.clone(), counts, ""),
            exposure,
            Map::from_geom(g, ""),
            None,
            None,
        )
        .unwrap()
    }

    #[test]
    fn test_background_only_matches_data() {
        // n_on = alpha * n_off: the profiled background explains the on counts
        let on = on_dataset(5.0);
        let off = Map::from_elem(on.counts().geom_arc().clone(), 50.0, "");
        let ds = MapDatasetOnOff::with_alpha(on, off, 0.1).unwrap();
        assert_relative_eq!(ds.stat_sum().unwrap(), 0.0, epsilon = 1e-9);
        assert_relative_eq!(ds.npred_background().unwrap().sum(), 5.0 * 8.0, max_relative = 1e-9);
        assert_relative_eq!(ds.info().unwrap().excess, 0.0, epsilon = 1e-9);
        assert_eq!(StatDataset::parameters(&ds).len(), 0);
    }

    #[test]
    fn test_stack_preserves_background() {
        let on = on_dataset(5.0);
        let g = on.counts().geom_arc().clone();
        let mut a = MapDatasetOnOff::with_alpha(on, Map::from_elem(g.clone(), 50.0, ""), 0.1).unwrap();
        let b = MapDatasetOnOff::with_alpha(on_dataset(3.0), Map::from_elem(g, 10.0, ""), 0.5)
            .unwrap();
        let expected = a.background().unwrap().sum() + b.background().unwrap().sum();
        a.stack(&b).unwrap();
        assert_relative_eq!(a.background().unwrap().sum(), expected, max_relative = 1e-12);
        assert_relative_eq!(a.counts_off().sum(), 60.0 * 8.0);
        assert_relative_eq!(a.on().counts().sum(), 8.0 * 8.0);
        // stacked alpha is the off-count weighted mean
        let alpha = a.alpha().unwrap();
        assert_relative_eq!(alpha.data()[[0, 0, 0]], 10.0 / 60.0, max_relative = 1e-12);
    }
}

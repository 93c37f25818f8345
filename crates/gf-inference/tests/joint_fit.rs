use approx::assert_relative_eq;
use gf_core::StatDataset;
use gf_datasets::irf::ENERGY_TRUE;
use gf_datasets::models::{PointSpatialModel, PowerLaw};
use gf_datasets::{MapDataset, MapDatasetOnOff, SkyModel};
use gf_inference::Fit;
use gf_maps::{Frame, Map, MapAxis, Projection, SkyCoord, WcsGeom};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Poisson};
use std::sync::Arc;

const INDEX: f64 = 2.3;
const AMPLITUDE: f64 = 1e-11;

fn geom() -> WcsGeom {
    let energy = MapAxis::from_energy_bounds(1.0, 10.0, 4, "TeV", false).unwrap();
    WcsGeom::create(SkyCoord::galactic(0.0, 0.0), 0.2, (2.0, 2.0), Projection::Car, vec![energy])
        .unwrap()
}

/// Point source at a fixed position with a free power law
fn source() -> (SkyModel, PowerLaw) {
    let spectral = PowerLaw::new(INDEX, AMPLITUDE, 1.0);
    let spatial = PointSpatialModel::new(0.05, 0.05, Frame::Galactic);
    spatial.lon_0.set_frozen(true);
    spatial.lat_0.set_frozen(true);
    let model = SkyModel::new("src", Arc::new(spectral.clone()), Arc::new(spatial));
    (model, spectral)
}

/// Dataset whose counts equal the prediction of `model` at its current values
fn asimov(name: &str, exposure: f64, model: &SkyModel) -> MapDataset {
    let g = geom();
    let e_true = g.axes()[0].with_name(ENERGY_TRUE);
    let exposure = Map::from_elem(g.to_cube(vec![e_true]).unwrap(), exposure, "cm2 s");
    let background = Map::from_elem(g.clone(), 0.2, "");
    let template =
        MapDataset::new(name, Map::from_geom(g, ""), exposure.clone(), background.clone(), None, None)
            .unwrap()
            .with_models(vec![model.clone()])
            .unwrap();
    let counts = template.npred().unwrap();
    MapDataset::new(name, counts, exposure, background, None, None)
        .unwrap()
        .with_models(vec![model.clone()])
        .unwrap()
}

#[test]
fn test_joint_fit_recovers_shared_spectrum() {
    let (model, pl) = source();
    let a = asimov("a", 5e13, &model);
    let b = asimov("b", 2e13, &model);

    pl.index.set_value(2.0);
    pl.amplitude.set_value(1.5e-11);
    let result = Fit::default().run(&[&a, &b]).unwrap();

    // index, amplitude and one background norm per dataset
    assert_eq!(result.parameters.len(), 4);
    assert_relative_eq!(pl.index.value(), INDEX, epsilon = 1e-3);
    assert_relative_eq!(pl.amplitude.value(), AMPLITUDE, max_relative = 1e-3);
    assert_relative_eq!(a.background_model().norm.value(), 1.0, max_relative = 1e-3);
    assert_relative_eq!(b.background_model().norm.value(), 1.0, max_relative = 1e-3);
    assert!(result.total_stat < 1e-3, "stat at the truth: {}", result.total_stat);

    let cov = result.covariance.as_ref().expect("covariance");
    let n = result.parameters.len();
    for i in 0..n {
        assert!(result.uncertainties[i] > 0.0);
        for j in 0..n {
            assert_relative_eq!(cov[i * n + j], cov[j * n + i], max_relative = 1e-9);
        }
    }
    let index_pos = result.parameter_names.iter().position(|n| n == "index").unwrap();
    let amp_pos = result.parameter_names.iter().position(|n| n == "amplitude").unwrap();
    let rho = result.correlation(index_pos, amp_pos).unwrap();
    assert!(rho.abs() < 1.0);
    assert_relative_eq!(pl.index.error(), result.uncertainties[index_pos]);
}

#[test]
fn test_poisson_toy_within_errors() {
    let (model, pl) = source();
    let truth = asimov("truth", 5e13, &model);
    let mut rng = StdRng::seed_from_u64(42);
    let sampled = truth.counts().data().mapv(|mu| Poisson::new(mu).unwrap().sample(&mut rng));
    let counts = truth.counts().with_data(sampled).unwrap();
    let ds = MapDataset::new(
        "toy",
        counts,
        truth.exposure().clone(),
        truth.background().clone(),
        None,
        None,
    )
    .unwrap()
    .with_models(vec![model])
    .unwrap();

    let fit = Fit::default();
    let result = fit.run(&[&ds]).unwrap();
    let sigma = result.uncertainty("index").unwrap();
    assert!((result.value("index").unwrap() - INDEX).abs() < 4.0 * sigma);
    let sigma_amp = result.uncertainty("amplitude").unwrap();
    assert!((result.value("amplitude").unwrap() - AMPLITUDE).abs() < 4.0 * sigma_amp);

    // profile errors close to the parabolic ones for a few hundred counts
    let ci = fit.confidence(&[&ds], &pl.amplitude, 1.0).unwrap();
    assert!(ci.success, "{}", ci.message);
    assert_relative_eq!(ci.errp, sigma_amp, max_relative = 0.3);
    assert_relative_eq!(ci.errn, sigma_amp, max_relative = 0.3);
    assert_relative_eq!(pl.amplitude.value(), result.value("amplitude").unwrap());
}

#[test]
fn test_onoff_and_cash_share_parameters() {
    let (model, pl) = source();
    let cash = asimov("cash", 3e13, &model);

    let on = asimov("on", 4e13, &model);
    let signal = on.npred_signal().unwrap();
    let on_counts = signal.with_data(signal.data().mapv(|s| s + 0.8)).unwrap();
    let on = MapDataset::new(
        "on",
        on_counts,
        on.exposure().clone(),
        on.background().clone(),
        None,
        None,
    )
    .unwrap()
    .with_models(vec![model.clone()])
    .unwrap();
    let off = Map::from_elem(on.counts().geom_arc().clone(), 3.2, "");
    let onoff = MapDatasetOnOff::with_alpha(on, off, 0.25).unwrap();
    assert_relative_eq!(onoff.stat_sum().unwrap(), 0.0, epsilon = 1e-6);

    pl.index.set_value(2.6);
    pl.amplitude.set_value(0.7e-11);
    let result = Fit::default().run(&[&cash, &onoff]).unwrap();
    // the on/off background is profiled, only the Cash dataset adds a norm
    assert_eq!(result.parameters.len(), 3);
    assert_relative_eq!(pl.index.value(), INDEX, epsilon = 1e-3);
    assert_relative_eq!(pl.amplitude.value(), AMPLITUDE, max_relative = 1e-3);
}

#[test]
fn test_index_profile_has_minimum_at_truth() {
    let (model, pl) = source();
    let ds = asimov("scan", 5e13, &model);
    let fit = Fit::default();
    let values = [2.1, 2.2, 2.3, 2.4, 2.5];
    let scan = fit.stat_profile(&[&ds], &pl.index, &values, false).unwrap();
    let best = scan
        .stat
        .iter()
        .enumerate()
        .min_by(|x, y| x.1.total_cmp(y.1))
        .map(|(i, _)| i)
        .unwrap();
    assert_eq!(best, 2);
    assert_relative_eq!(scan.stat[2], 0.0, epsilon = 1e-9);

    // re-fitting the amplitude flattens the profile
    let profiled = fit.stat_profile(&[&ds], &pl.index, &values, true).unwrap();
    for (p, s) in profiled.stat.iter().zip(&scan.stat) {
        assert!(*p <= s + 1e-4);
    }
    assert_eq!(pl.index.value(), INDEX);
    // frozen position and reference parameters are listed but not fitted
    assert_eq!(StatDataset::parameters(&ds).len(), 8);
}

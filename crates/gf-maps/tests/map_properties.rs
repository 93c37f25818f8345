use approx::assert_relative_eq;
use gf_maps::{
    CutoutMode, Frame, InterpOptions, Map, MapAxis, MapCoord, Projection, SkyCoord, SliceIdx,
    WcsGeom,
};
use gf_core::Error;
use ndarray::{ArrayD, IxDyn};
use proptest::prelude::*;
use std::sync::Arc;

fn galactic_geom(width: f64, binsz: f64, axes: Vec<MapAxis>) -> WcsGeom {
    WcsGeom::create(SkyCoord::galactic(0.0, 0.0), binsz, (width, width), Projection::Car, axes)
        .unwrap()
}

#[test]
fn containment_of_a_ten_degree_field() {
    let geom = galactic_geom(10.0, 0.1, vec![]);
    let coord = MapCoord::from_lonlat(&[5.5, 4.9, 355.1, 0.0], &[0.0, 0.0, 0.0, -5.2], Frame::Galactic);
    let inside = geom.contains(&coord).unwrap();
    assert_eq!(inside.iter().copied().collect::<Vec<_>>(), vec![false, true, true, false]);

    // the same positions expressed in ICRS
    let icrs = coord.to_frame(Frame::Icrs).unwrap();
    assert_eq!(geom.contains(&icrs).unwrap(), inside);
}

#[test]
fn reprojection_conserves_the_sum() {
    let energy = MapAxis::from_energy_bounds(1.0, 10.0, 2, "TeV", false).unwrap();
    let src = Arc::new(
        WcsGeom::create(SkyCoord::galactic(0.3, -0.2), 0.05, (2.0, 2.0), Projection::Car, vec![
            energy.clone(),
        ])
        .unwrap(),
    );
    let data = ArrayD::from_shape_fn(IxDyn(&src.data_shape()), |ix| {
        1.0 + (ix[0] * 7 + ix[1] * 3 + ix[2]) as f64 % 11.0
    });
    let map = Map::from_data(src, data, "").unwrap();

    for (projection, binsz, center) in [
        (Projection::Car, 0.1, SkyCoord::galactic(0.0, 0.0)),
        (Projection::Tan, 0.037, SkyCoord::galactic(0.5, 0.1)),
        (Projection::Tan, 0.08, SkyCoord::galactic(0.0, 0.0).transform_to(Frame::Icrs)),
    ] {
        let target =
            WcsGeom::create(center, binsz, (6.0, 6.0), projection, vec![energy.clone()]).unwrap();
        let out = map.reproject(target).unwrap();
        assert_relative_eq!(out.sum(), map.sum(), max_relative = 1e-6);
    }
}

#[test]
fn reprojection_requires_matching_axes() {
    let energy = MapAxis::from_energy_bounds(1.0, 10.0, 2, "TeV", false).unwrap();
    let map = Map::from_geom(galactic_geom(2.0, 0.1, vec![energy]), "");
    let target = galactic_geom(2.0, 0.2, vec![]);
    assert!(matches!(map.reproject(target), Err(Error::GeometryMismatch(_))));
}

#[test]
fn slicing_a_dropped_axis_fails() {
    let energy = MapAxis::from_energy_bounds(1.0, 10.0, 4, "TeV", false).unwrap();
    let map = Map::from_elem(galactic_geom(1.0, 0.5, vec![energy]), 1.0, "");
    let image = map.slice_by_idx(&[("energy", SliceIdx::Index(2))]).unwrap();
    assert!(image.geom().is_image());
    let err = image.slice_by_idx(&[("energy", SliceIdx::Index(0))]).unwrap_err();
    assert!(matches!(err, Error::UnknownAxis(_)));
}

#[test]
fn file_round_trip() {
    let energy = MapAxis::from_energy_bounds(0.5, 50.0, 3, "TeV", false).unwrap();
    let geom = galactic_geom(1.0, 0.25, vec![energy]);
    let data = ArrayD::from_shape_fn(IxDyn(&geom.data_shape()), |ix| {
        (ix[0] as f64 + 1.0).ln() / (ix[1] as f64 + 3.0) + ix[2] as f64 * 1e-17
    });
    let map = Map::from_data(geom, data, "ct").unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("counts.json");
    map.write_json(&path).unwrap();
    let back = Map::<f64>::read_json(&path).unwrap();
    assert_eq!(back.geom(), map.geom());
    assert_eq!(back.data(), map.data());

    assert!(matches!(Map::<f64>::read_json(&dir.path().join("missing.json")), Err(Error::Io(_))));
}

#[test]
fn cutout_then_interp_agrees_with_parent() {
    let geom = Arc::new(galactic_geom(4.0, 0.1, vec![]));
    let (lon, lat) = geom.image_lonlat();
    let data = ndarray::Zip::from(&lon)
        .and(&lat)
        .map_collect(|&l, &b| {
            let l = if l > 180.0 { l - 360.0 } else { l };
            2.0 * l + b
        })
        .into_dyn();
    let map = Map::from_data(geom, data, "").unwrap();
    let cut = map.cutout(&SkyCoord::galactic(0.5, 0.5), (1.0, 1.0), CutoutMode::Trim).unwrap();

    let point = MapCoord::from_lonlat(&[0.33, 0.71], &[0.41, 0.27], Frame::Galactic);
    let a = map.interp_by_coord(&point, &InterpOptions::default()).unwrap();
    let b = cut.interp_by_coord(&point, &InterpOptions::default()).unwrap();
    for (x, y) in a.iter().zip(b.iter()) {
        assert_relative_eq!(x, y, epsilon = 1e-9);
    }
    // the plane is linear, so interpolation is exact
    assert_relative_eq!(a[[0]], 2.0 * 0.33 + 0.41, epsilon = 1e-6);
}

proptest! {
    #![proptest_config(ProptestConfig { cases: 32, .. ProptestConfig::default() })]

    #[test]
    fn pixel_centers_map_to_their_own_index(ix in 0usize..40, iy in 0usize..40) {
        let geom = WcsGeom::create(
            SkyCoord::icrs(83.63, 22.01), 0.05, (2.0, 2.0), Projection::Tan, vec![],
        ).unwrap();
        let pix = [
            ArrayD::from_elem(IxDyn(&[]), ix as f64 + 0.5),
            ArrayD::from_elem(IxDyn(&[]), iy as f64 + 0.5),
        ];
        let coord = geom.pix_to_coord(&pix).unwrap();
        let idx = geom.coord_to_idx(&coord).unwrap();
        prop_assert_eq!(idx[0][IxDyn(&[])], ix as i64);
        prop_assert_eq!(idx[1][IxDyn(&[])], iy as i64);
    }

    #[test]
    fn solid_angle_sums_to_field_area(width in 1.0f64..20.0) {
        let geom = galactic_geom(width, width / 20.0, vec![]);
        let w = geom.width();
        let expected = w.0.to_radians() * 2.0 * (w.1 / 2.0).to_radians().sin();
        prop_assert!((geom.solid_angle().sum() - expected).abs() / expected < 1e-4);
    }
}

//! WCS geometry: a projected spatial pixel grid plus named non-spatial axes.
//!
//! Index and pixel tuples are ordered `(x, y, axis_0, axis_1, ..)`. The data
//! arrays of maps on this geometry use the reverse order,
//! `[.., axis_1, axis_0, y, x]`, see [`WcsGeom::data_shape`].

use crate::axis::{INVALID_INDEX, MapAxis};
use crate::coord::{MapCoord, broadcast_views};
use crate::skycoord::{Frame, SkyCoord, angle_between, lonlat_to_vec};
use crate::wcs::{Projection, WcsTransform};
use gf_core::{Error, Result};
use nalgebra::Vector3;
use ndarray::{Array2, ArrayD, IxDyn};
use std::ops::Range;

/// Selection along one non-spatial axis
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SliceIdx {
    /// Single bin; the axis is dropped
    Index(usize),
    /// Bin range; the axis is kept
    Range(Range<usize>),
}

/// How a cutout treats the parts that fall outside the parent geometry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CutoutMode {
    /// Shrink the cutout to the overlap with the parent
    #[default]
    Trim,
    /// Keep the requested size; the non-overlapping part is padded
    Partial,
}

/// Pixel ranges of a cutout, in the parent's pixel indices
///
/// In [`CutoutMode::Partial`] the ranges may extend past the parent grid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CutoutSlices {
    /// Column range
    pub x: Range<i64>,
    /// Row range
    pub y: Range<i64>,
}

impl CutoutSlices {
    /// Part of the ranges inside a parent of size `(nx, ny)`
    pub fn overlap(&self, nx: usize, ny: usize) -> Option<(Range<usize>, Range<usize>)> {
        let x0 = self.x.start.max(0);
        let x1 = self.x.end.min(nx as i64);
        let y0 = self.y.start.max(0);
        let y1 = self.y.end.min(ny as i64);
        if x0 >= x1 || y0 >= y1 {
            return None;
        }
        Some((x0 as usize..x1 as usize, y0 as usize..y1 as usize))
    }
}

/// Projected pixel grid with zero or more non-spatial axes
#[derive(Debug, Clone)]
pub struct WcsGeom {
    wcs: WcsTransform,
    npix: (usize, usize),
    axes: Vec<MapAxis>,
}

impl WcsGeom {
    /// Create a geometry centered on `skydir`.
    ///
    /// `binsz` is the pixel size and `width` the `(lon, lat)` extent, both in
    /// degrees. The frame is taken from `skydir`.
    pub fn create(
        skydir: SkyCoord,
        binsz: f64,
        width: (f64, f64),
        projection: Projection,
        axes: Vec<MapAxis>,
    ) -> Result<Self> {
        if !(binsz.is_finite() && binsz > 0.0) {
            return Err(Error::Configuration(format!("binsz must be > 0, got {binsz}")));
        }
        if !(width.0.is_finite() && width.0 > 0.0 && width.1.is_finite() && width.1 > 0.0) {
            return Err(Error::Configuration(format!(
                "width must be > 0, got ({}, {})",
                width.0, width.1
            )));
        }
        let nx = ((width.0 / binsz).round() as usize).max(1);
        let ny = ((width.1 / binsz).round() as usize).max(1);
        Self::from_npix(skydir, binsz, (nx, ny), projection, axes)
    }

    /// Create a geometry of `npix = (nx, ny)` pixels centered on `skydir`.
    pub fn from_npix(
        skydir: SkyCoord,
        binsz: f64,
        npix: (usize, usize),
        projection: Projection,
        axes: Vec<MapAxis>,
    ) -> Result<Self> {
        if !(binsz.is_finite() && binsz > 0.0) {
            return Err(Error::Configuration(format!("binsz must be > 0, got {binsz}")));
        }
        if npix.0 == 0 || npix.1 == 0 {
            return Err(Error::Configuration(format!("npix must be > 0, got {:?}", npix)));
        }
        let wcs = WcsTransform::new(
            skydir.frame,
            projection,
            [skydir.lon, skydir.lat],
            [npix.0 as f64 / 2.0, npix.1 as f64 / 2.0],
            [-binsz, binsz],
        );
        Self::from_wcs(wcs, npix, axes)
    }

    /// Wrap an explicit transform
    pub fn from_wcs(wcs: WcsTransform, npix: (usize, usize), axes: Vec<MapAxis>) -> Result<Self> {
        if npix.0 == 0 || npix.1 == 0 {
            return Err(Error::Configuration(format!("npix must be > 0, got {:?}", npix)));
        }
        let cdelt = wcs.cdelt();
        if !(cdelt[0].is_finite() && cdelt[0] != 0.0 && cdelt[1].is_finite() && cdelt[1] > 0.0) {
            return Err(Error::Configuration(format!("invalid pixel scale {:?}", cdelt)));
        }
        for (i, a) in axes.iter().enumerate() {
            if axes[..i].iter().any(|b| b.name() == a.name()) {
                return Err(Error::Configuration(format!("duplicate axis name '{}'", a.name())));
            }
            if a.name() == "lon" || a.name() == "lat" {
                return Err(Error::Configuration(format!(
                    "axis name '{}' is reserved for the sky coordinates",
                    a.name()
                )));
            }
        }
        Ok(Self { wcs, npix, axes })
    }

    /// World-coordinate transform
    pub fn wcs(&self) -> &WcsTransform {
        &self.wcs
    }

    /// Frame of the sky coordinates
    pub fn frame(&self) -> Frame {
        self.wcs.frame()
    }

    /// Projection
    pub fn projection(&self) -> Projection {
        self.wcs.projection()
    }

    /// `(nx, ny)`
    pub fn npix(&self) -> (usize, usize) {
        self.npix
    }

    /// Pixel size in degrees (absolute value along y)
    pub fn binsz(&self) -> f64 {
        self.wcs.cdelt()[1]
    }

    /// Angular extent `(nx * |cdelt_x|, ny * cdelt_y)` in degrees
    pub fn width(&self) -> (f64, f64) {
        let c = self.wcs.cdelt();
        (self.npix.0 as f64 * c[0].abs(), self.npix.1 as f64 * c[1])
    }

    /// Non-spatial axes in order
    pub fn axes(&self) -> &[MapAxis] {
        &self.axes
    }

    /// Position of a named axis
    pub fn axis_index(&self, name: &str) -> Result<usize> {
        self.axes
            .iter()
            .position(|a| a.name() == name)
            .ok_or_else(|| Error::UnknownAxis(format!("geometry has no axis named '{name}'")))
    }

    /// A named axis
    pub fn axis(&self, name: &str) -> Result<&MapAxis> {
        Ok(&self.axes[self.axis_index(name)?])
    }

    /// `true` without non-spatial axes
    pub fn is_image(&self) -> bool {
        self.axes.is_empty()
    }

    /// `2 + number of axes`
    pub fn ndim(&self) -> usize {
        2 + self.axes.len()
    }

    /// Bin counts in pixel-tuple order `(nx, ny, n_0, n_1, ..)`
    pub fn shape(&self) -> Vec<usize> {
        let mut s = vec![self.npix.0, self.npix.1];
        s.extend(self.axes.iter().map(MapAxis::nbin));
        s
    }

    /// Array shape `[.., n_1, n_0, ny, nx]`
    pub fn data_shape(&self) -> Vec<usize> {
        let mut s: Vec<usize> = self.axes.iter().rev().map(MapAxis::nbin).collect();
        s.push(self.npix.1);
        s.push(self.npix.0);
        s
    }

    /// Total number of bins
    pub fn size(&self) -> usize {
        self.data_shape().iter().product()
    }

    /// Sky direction of the grid center
    pub fn center_skydir(&self) -> SkyCoord {
        let (lon, lat) =
            self.wcs.pix_to_world(self.npix.0 as f64 / 2.0, self.npix.1 as f64 / 2.0);
        SkyCoord::new(lon, lat, self.frame())
    }

    /// Same spatial grid without non-spatial axes
    pub fn to_image(&self) -> WcsGeom {
        WcsGeom { wcs: self.wcs.clone(), npix: self.npix, axes: Vec::new() }
    }

    /// Same spatial grid with the given axes
    pub fn to_cube(&self, axes: Vec<MapAxis>) -> Result<WcsGeom> {
        WcsGeom::from_wcs(self.wcs.clone(), self.npix, axes)
    }

    /// Replace one axis (matched by name)
    pub fn replace_axis(&self, axis: MapAxis) -> Result<WcsGeom> {
        let idx = self.axis_index(axis.name())?;
        let mut axes = self.axes.clone();
        axes[idx] = axis;
        self.to_cube(axes)
    }

    /// Same grid and axes up to `rtol`
    pub fn is_allclose(&self, other: &WcsGeom, rtol: f64) -> bool {
        let close = |a: f64, b: f64| (a - b).abs() <= rtol * a.abs().max(b.abs()).max(1.0);
        let (w1, w2) = (&self.wcs, &other.wcs);
        self.npix == other.npix
            && w1.frame() == w2.frame()
            && w1.projection() == w2.projection()
            && (0..2).all(|i| {
                close(w1.crval()[i], w2.crval()[i])
                    && close(w1.crpix()[i], w2.crpix()[i])
                    && close(w1.cdelt()[i], w2.cdelt()[i])
            })
            && self.axes.len() == other.axes.len()
            && self.axes.iter().zip(&other.axes).all(|(a, b)| a.is_allclose(b, rtol))
    }

    /// Spatial grid equal up to `rtol`, axes ignored
    pub fn is_image_allclose(&self, other: &WcsGeom, rtol: f64) -> bool {
        self.to_image().is_allclose(&other.to_image(), rtol)
    }

    /// Spatial pixel of a sky position given in any frame
    pub fn skycoord_to_pix(&self, c: &SkyCoord) -> (f64, f64) {
        let c = c.transform_to(self.frame());
        self.wcs.world_to_pix(c.lon, c.lat)
    }

    /// Continuous pixel coordinates of `coord`, in pixel-tuple order.
    ///
    /// Values outside the grid are returned as-is (they may be negative or
    /// exceed the bin count); undefined projections yield NaN.
    pub fn coord_to_pix(&self, coord: &MapCoord) -> Result<Vec<ArrayD<f64>>> {
        let (lon, lat) = coord.skycoord_in(self.frame())?;
        let mut arrays: Vec<&ArrayD<f64>> = vec![&lon, &lat];
        for axis in &self.axes {
            arrays.push(coord.require_axis(axis.name())?);
        }
        let (shape, views) = broadcast_views(&arrays)?;
        let dim = IxDyn(&shape);

        let mut px = ArrayD::zeros(dim.clone());
        let mut py = ArrayD::zeros(dim.clone());
        ndarray::Zip::from(&mut px).and(&mut py).and(&views[0]).and(&views[1]).for_each(
            |x, y, &l, &b| {
                let (xx, yy) = self.wcs.world_to_pix(l, b);
                *x = xx;
                *y = yy;
            },
        );

        let mut out = vec![px, py];
        for (axis, view) in self.axes.iter().zip(&views[2..]) {
            out.push(view.mapv(|v| axis.coord_to_pix(v)));
        }
        Ok(out)
    }

    /// Bin indices of `coord`; every component is [`INVALID_INDEX`] for points
    /// not contained in the geometry.
    pub fn coord_to_idx(&self, coord: &MapCoord) -> Result<Vec<ArrayD<i64>>> {
        let pix = self.coord_to_pix(coord)?;
        let mut idx = self.pix_to_idx(&pix)?;
        // Axis bins use the edges directly so that values on bin edges are exact.
        for (k, axis) in self.axes.iter().enumerate() {
            let values = coord.require_axis(axis.name())?;
            let values = values.broadcast(idx[2 + k].raw_dim()).ok_or_else(|| {
                Error::Validation(format!("cannot broadcast axis '{}' values", axis.name()))
            })?;
            let recomputed = values.mapv(|v| axis.coord_to_idx(v));
            idx[2 + k] = recomputed;
        }
        invalidate_partial(&mut idx);
        Ok(idx)
    }

    /// Integer indices of continuous pixel coordinates; out-of-grid → [`INVALID_INDEX`]
    pub fn pix_to_idx(&self, pix: &[ArrayD<f64>]) -> Result<Vec<ArrayD<i64>>> {
        let shape = self.shape();
        if pix.len() != shape.len() {
            return Err(Error::Validation(format!(
                "expected {} pixel arrays, got {}",
                shape.len(),
                pix.len()
            )));
        }
        let refs: Vec<&ArrayD<f64>> = pix.iter().collect();
        let (_, views) = broadcast_views(&refs)?;
        let mut idx: Vec<ArrayD<i64>> = views
            .iter()
            .zip(&shape)
            .map(|(v, &n)| {
                v.mapv(|p| if p >= 0.0 && p < n as f64 { p.floor() as i64 } else { INVALID_INDEX })
            })
            .collect();
        invalidate_partial(&mut idx);
        Ok(idx)
    }

    /// Coordinates of continuous pixel positions
    pub fn pix_to_coord(&self, pix: &[ArrayD<f64>]) -> Result<MapCoord> {
        if pix.len() != self.ndim() {
            return Err(Error::Validation(format!(
                "expected {} pixel arrays, got {}",
                self.ndim(),
                pix.len()
            )));
        }
        let refs: Vec<&ArrayD<f64>> = pix.iter().collect();
        let (shape, views) = broadcast_views(&refs)?;
        let mut lon = ArrayD::zeros(IxDyn(&shape));
        let mut lat = ArrayD::zeros(IxDyn(&shape));
        ndarray::Zip::from(&mut lon).and(&mut lat).and(&views[0]).and(&views[1]).for_each(
            |l, b, &x, &y| {
                let (ll, bb) = self.wcs.pix_to_world(x, y);
                *l = ll;
                *b = bb;
            },
        );
        let mut coord = MapCoord::new(lon, lat, self.frame());
        for (axis, view) in self.axes.iter().zip(&views[2..]) {
            coord = coord.with_axis(axis.name(), view.mapv(|p| axis.pix_to_coord(p)));
        }
        Ok(coord)
    }

    /// Broadcast shape used for the lazily expanded grid arrays of axis `k`
    fn axis_broadcast_shape(&self, k: usize) -> Vec<usize> {
        let n = self.axes.len();
        let mut shape = vec![1usize; n + 2];
        shape[n - 1 - k] = self.axes[k].nbin();
        shape
    }

    /// Pixel centers of the full grid, as broadcast-compatible arrays.
    pub fn get_pix(&self) -> Vec<ArrayD<f64>> {
        let n = self.axes.len();
        let (nx, ny) = self.npix;
        let mut sky_shape = vec![1usize; n];
        sky_shape.extend([ny, nx]);
        let x = ArrayD::from_shape_fn(IxDyn(&sky_shape), |ix| ix[n + 1] as f64 + 0.5);
        let y = ArrayD::from_shape_fn(IxDyn(&sky_shape), |ix| ix[n] as f64 + 0.5);
        let mut out = vec![x, y];
        for k in 0..n {
            let pos = n - 1 - k;
            out.push(ArrayD::from_shape_fn(IxDyn(&self.axis_broadcast_shape(k)), |ix| {
                ix[pos] as f64 + 0.5
            }));
        }
        out
    }

    /// Integer indices of the full grid, as broadcast-compatible arrays.
    pub fn get_idx(&self) -> Vec<ArrayD<i64>> {
        self.get_pix().into_iter().map(|p| p.mapv(|v| v.floor() as i64)).collect()
    }

    /// Sky longitude/latitude of every spatial pixel center, shape `(ny, nx)`
    pub fn image_lonlat(&self) -> (Array2<f64>, Array2<f64>) {
        let (nx, ny) = self.npix;
        let mut lon = Array2::zeros((ny, nx));
        let mut lat = Array2::zeros((ny, nx));
        for iy in 0..ny {
            for ix in 0..nx {
                let (l, b) = self.wcs.pix_to_world(ix as f64 + 0.5, iy as f64 + 0.5);
                lon[[iy, ix]] = l;
                lat[[iy, ix]] = b;
            }
        }
        (lon, lat)
    }

    /// Coordinates of every bin center.
    ///
    /// Sky arrays have shape `[1, .., 1, ny, nx]` and the array of axis `k`
    /// has its bin count at position `naxes - 1 - k`; broadcasting them
    /// together yields [`WcsGeom::data_shape`].
    pub fn get_coord(&self) -> MapCoord {
        let n = self.axes.len();
        let (lon, lat) = self.image_lonlat();
        let mut sky_shape = vec![1usize; n];
        sky_shape.extend([self.npix.1, self.npix.0]);
        let lon = ArrayD::from_shape_fn(IxDyn(&sky_shape), |ix| lon[[ix[n], ix[n + 1]]]);
        let lat = ArrayD::from_shape_fn(IxDyn(&sky_shape), |ix| lat[[ix[n], ix[n + 1]]]);
        let mut coord = MapCoord::new(lon, lat, self.frame());
        for (k, axis) in self.axes.iter().enumerate() {
            let pos = n - 1 - k;
            let centers = axis.center();
            let values = ArrayD::from_shape_fn(IxDyn(&self.axis_broadcast_shape(k)), |ix| {
                centers[ix[pos]]
            });
            coord = coord.with_axis(axis.name(), values);
        }
        coord
    }

    /// Lazily visit every bin as `(data_index, lon, lat, axis values)` without
    /// allocating the full coordinate grid.
    pub fn iter_coords(&self) -> impl Iterator<Item = (Vec<usize>, f64, f64, Vec<f64>)> + '_ {
        let (lon, lat) = self.image_lonlat();
        let shape = self.data_shape();
        let size: usize = shape.iter().product();
        let n = self.axes.len();
        (0..size).map(move |flat| {
            let mut rem = flat;
            let mut index = vec![0usize; shape.len()];
            for d in (0..shape.len()).rev() {
                index[d] = rem % shape[d];
                rem /= shape[d];
            }
            let (iy, ix) = (index[n], index[n + 1]);
            let values =
                (0..n).map(|k| self.axes[k].center()[index[n - 1 - k]]).collect::<Vec<_>>();
            (index, lon[[iy, ix]], lat[[iy, ix]], values)
        })
    }

    /// Containment test for every coordinate
    pub fn contains(&self, coord: &MapCoord) -> Result<ArrayD<bool>> {
        let idx = self.coord_to_idx(coord)?;
        Ok(idx[0].mapv(|i| i != INVALID_INDEX))
    }

    /// Solid angle of every spatial pixel in steradian, shape `(ny, nx)`.
    ///
    /// Each pixel is split along a diagonal into two spherical triangles whose
    /// spherical excess is summed; NaN where a corner is undefined.
    pub fn solid_angle(&self) -> Array2<f64> {
        let (nx, ny) = self.npix;
        let corners: Vec<Option<Vector3<f64>>> = (0..=ny)
            .flat_map(|iy| (0..=nx).map(move |ix| (ix, iy)))
            .map(|(ix, iy)| self.wcs.pix_to_vec(ix as f64, iy as f64))
            .collect();
        let corner = |ix: usize, iy: usize| corners[iy * (nx + 1) + ix];

        let mut out = Array2::zeros((ny, nx));
        for iy in 0..ny {
            for ix in 0..nx {
                out[[iy, ix]] = match (
                    corner(ix, iy),
                    corner(ix + 1, iy),
                    corner(ix + 1, iy + 1),
                    corner(ix, iy + 1),
                ) {
                    (Some(a), Some(b), Some(c), Some(d)) => {
                        spherical_excess(&a, &b, &c) + spherical_excess(&a, &c, &d)
                    }
                    _ => f64::NAN,
                };
            }
        }
        out
    }

    /// Angular distance of every spatial pixel center to `center`, degrees, shape `(ny, nx)`
    pub fn separation(&self, center: &SkyCoord) -> Array2<f64> {
        let c = center.transform_to(self.frame()).to_vec();
        let (lon, lat) = self.image_lonlat();
        ndarray::Zip::from(&lon).and(&lat).map_collect(|&l, &b| {
            if l.is_nan() { f64::NAN } else { angle_between(&c, &lonlat_to_vec(l, b)) }
        })
    }

    /// Finer spatial grid: every pixel split into `factor × factor`
    pub fn upsample(&self, factor: usize) -> Result<WcsGeom> {
        if factor == 0 {
            return Err(Error::Configuration("upsample factor must be > 0".to_string()));
        }
        let f = factor as f64;
        let c = self.wcs.cdelt();
        let p = self.wcs.crpix();
        let wcs = self.wcs.with_scale([c[0] / f, c[1] / f], [p[0] * f, p[1] * f]);
        WcsGeom::from_wcs(wcs, (self.npix.0 * factor, self.npix.1 * factor), self.axes.clone())
    }

    /// Coarser spatial grid; both pixel counts must be divisible by `factor`
    pub fn downsample(&self, factor: usize) -> Result<WcsGeom> {
        if factor == 0 {
            return Err(Error::Configuration("downsample factor must be > 0".to_string()));
        }
        if self.npix.0 % factor != 0 || self.npix.1 % factor != 0 {
            return Err(Error::Configuration(format!(
                "npix {:?} not divisible by downsample factor {}",
                self.npix, factor
            )));
        }
        let f = factor as f64;
        let c = self.wcs.cdelt();
        let p = self.wcs.crpix();
        let wcs = self.wcs.with_scale([c[0] * f, c[1] * f], [p[0] / f, p[1] / f]);
        WcsGeom::from_wcs(wcs, (self.npix.0 / factor, self.npix.1 / factor), self.axes.clone())
    }

    /// Spatial cutout around `position` with angular `width` `(lon, lat)` in degrees.
    ///
    /// Returns the new geometry together with the parent pixel ranges it covers.
    pub fn cutout(
        &self,
        position: &SkyCoord,
        width: (f64, f64),
        mode: CutoutMode,
    ) -> Result<(WcsGeom, CutoutSlices)> {
        if !(width.0 > 0.0 && width.1 > 0.0) {
            return Err(Error::Configuration(format!(
                "cutout width must be > 0, got ({}, {})",
                width.0, width.1
            )));
        }
        let (px, py) = self.skycoord_to_pix(position);
        if !(px.is_finite() && py.is_finite()) {
            return Err(Error::Configuration(format!(
                "cutout position ({}, {}) cannot be projected",
                position.lon, position.lat
            )));
        }
        let c = self.wcs.cdelt();
        let nx = ((width.0 / c[0].abs()).round() as i64).max(1);
        let ny = ((width.1 / c[1]).round() as i64).max(1);
        let x0 = (px - nx as f64 / 2.0).round() as i64;
        let y0 = (py - ny as f64 / 2.0).round() as i64;
        let mut slices = CutoutSlices { x: x0..x0 + nx, y: y0..y0 + ny };

        if mode == CutoutMode::Trim {
            let (xr, yr) = slices.overlap(self.npix.0, self.npix.1).ok_or_else(|| {
                Error::Configuration("cutout does not overlap the geometry".to_string())
            })?;
            slices = CutoutSlices {
                x: xr.start as i64..xr.end as i64,
                y: yr.start as i64..yr.end as i64,
            };
        }

        let p = self.wcs.crpix();
        let wcs = self.wcs.with_crpix([p[0] - slices.x.start as f64, p[1] - slices.y.start as f64]);
        let npix = ((slices.x.end - slices.x.start) as usize, (slices.y.end - slices.y.start) as usize);
        let geom = WcsGeom::from_wcs(wcs, npix, self.axes.clone())?;
        Ok((geom, slices))
    }

    /// New geometry with the selected axes sliced (ranges) or dropped (indices)
    pub fn slice_by_idx(&self, slices: &[(&str, SliceIdx)]) -> Result<WcsGeom> {
        let mut axes: Vec<Option<MapAxis>> = self.axes.iter().cloned().map(Some).collect();
        for (i, (name, _)) in slices.iter().enumerate() {
            if slices[..i].iter().any(|(n, _)| n == name) {
                return Err(Error::Configuration(format!("axis '{name}' sliced twice")));
            }
        }
        for (name, s) in slices {
            let k = self.axis_index(name)?;
            let axis = &self.axes[k];
            match s {
                SliceIdx::Index(i) => {
                    if *i >= axis.nbin() {
                        return Err(Error::InvalidRange(format!(
                            "index {} out of range for axis '{}' with {} bins",
                            i,
                            name,
                            axis.nbin()
                        )));
                    }
                    axes[k] = None;
                }
                SliceIdx::Range(r) => axes[k] = Some(axis.slice(r.clone())?),
            }
        }
        WcsGeom::from_wcs(self.wcs.clone(), self.npix, axes.into_iter().flatten().collect())
    }
}

impl PartialEq for WcsGeom {
    fn eq(&self, other: &Self) -> bool {
        self.is_allclose(other, 1e-9)
    }
}

/// If any component of a point is invalid, invalidate all of them.
fn invalidate_partial(idx: &mut [ArrayD<i64>]) {
    if idx.is_empty() {
        return;
    }
    let bad = {
        let mut bad = ArrayD::from_elem(idx[0].raw_dim(), false);
        for a in idx.iter() {
            ndarray::Zip::from(&mut bad).and(a).for_each(|b, &i| *b |= i == INVALID_INDEX);
        }
        bad
    };
    for a in idx.iter_mut() {
        ndarray::Zip::from(a).and(&bad).for_each(|i, &b| {
            if b {
                *i = INVALID_INDEX;
            }
        });
    }
}

/// Spherical excess of the triangle spanned by three unit vectors
fn spherical_excess(a: &Vector3<f64>, b: &Vector3<f64>, c: &Vector3<f64>) -> f64 {
    let num = a.dot(&b.cross(c)).abs();
    let den = 1.0 + a.dot(b) + b.dot(c) + c.dot(a);
    2.0 * num.atan2(den)
}

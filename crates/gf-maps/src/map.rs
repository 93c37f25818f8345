//! Dense maps bound to a [`WcsGeom`].
//!
//! A [`Map`] owns an `ndarray` of shape [`WcsGeom::data_shape`] and shares its
//! geometry through an `Arc`. Index-based reads outside the grid yield
//! [`MapValue::missing`]; writes outside the grid are dropped.

use crate::convolve::{SmoothKernel, convolve2d_same, make_kernel};
use crate::coord::{MapCoord, broadcast_shape, broadcast_views};
use crate::geom::{CutoutMode, SliceIdx, WcsGeom};
use crate::skycoord::SkyCoord;
use gf_core::{Error, Result};
use ndarray::{Array2, Array3, ArrayD, Axis, IxDyn, Slice, s};
use std::collections::HashMap;
use std::ops::{Add, Div, Mul, Neg, Sub};
use std::sync::Arc;

/// Element types a map can hold
pub trait MapValue: Clone + Default + Send + Sync + 'static {
    /// Value returned for reads outside the grid
    fn missing() -> Self;
}

impl MapValue for f64 {
    fn missing() -> Self {
        f64::NAN
    }
}

impl MapValue for f32 {
    fn missing() -> Self {
        f32::NAN
    }
}

impl MapValue for bool {
    fn missing() -> Self {
        false
    }
}

/// Interpolation scheme for [`Map::interp_by_coord`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InterpMethod {
    /// Value of the containing pixel
    Nearest,
    /// Multilinear between pixel centers
    #[default]
    Linear,
}

/// Options for [`Map::interp_by_coord`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InterpOptions {
    /// Interpolation scheme
    pub method: InterpMethod,
    /// Value for points outside the geometry
    pub fill_value: f64,
    /// Extrapolate instead of returning `fill_value`
    pub extrapolate: bool,
}

impl Default for InterpOptions {
    fn default() -> Self {
        Self { method: InterpMethod::Linear, fill_value: f64::NAN, extrapolate: false }
    }
}

impl InterpOptions {
    /// Nearest-pixel lookup
    pub fn nearest() -> Self {
        Self { method: InterpMethod::Nearest, ..Self::default() }
    }

    /// Builder: fill value for points outside the geometry
    pub fn with_fill_value(mut self, fill_value: f64) -> Self {
        self.fill_value = fill_value;
        self
    }

    /// Builder: extrapolate outside the geometry
    pub fn with_extrapolate(mut self, extrapolate: bool) -> Self {
        self.extrapolate = extrapolate;
        self
    }
}

/// Dense n-dimensional map
#[derive(Debug, Clone)]
pub struct Map<A = f64> {
    geom: Arc<WcsGeom>,
    data: ArrayD<A>,
    unit: String,
}

/// Boolean map used as a bin selection
pub type Mask = Map<bool>;

/// Visit broadcast points of several index/pixel arrays; returns the broadcast shape.
fn for_each_point<T: Copy>(arrays: &[ArrayD<T>], mut f: impl FnMut(&[T])) -> Result<Vec<usize>> {
    let refs: Vec<&ArrayD<T>> = arrays.iter().collect();
    let (shape, views) = broadcast_views(&refs)?;
    let mut iters: Vec<_> = views.iter().map(|v| v.iter()).collect();
    let n: usize = shape.iter().product();
    let mut point = Vec::with_capacity(arrays.len());
    for _ in 0..n {
        point.clear();
        for it in iters.iter_mut() {
            match it.next() {
                Some(&v) => point.push(v),
                None => {
                    return Err(Error::Computation("broadcast iteration ended early".into()));
                }
            }
        }
        f(&point);
    }
    Ok(shape)
}

fn shape_error(e: ndarray::ShapeError) -> Error {
    Error::Computation(format!("array reshape failed: {e}"))
}

fn same_geom(a: &Arc<WcsGeom>, b: &Arc<WcsGeom>) -> bool {
    Arc::ptr_eq(a, b) || **a == **b
}

impl<A: MapValue> Map<A> {
    /// Map with every bin set to `value`
    pub fn from_elem(geom: impl Into<Arc<WcsGeom>>, value: A, unit: impl Into<String>) -> Self {
        let geom = geom.into();
        let data = ArrayD::from_elem(IxDyn(&geom.data_shape()), value);
        Self { geom, data, unit: unit.into() }
    }

    /// Wrap an existing array; its shape must equal `geom.data_shape()`.
    pub fn from_data(
        geom: impl Into<Arc<WcsGeom>>,
        data: ArrayD<A>,
        unit: impl Into<String>,
    ) -> Result<Self> {
        let geom = geom.into();
        let expected = geom.data_shape();
        if data.shape() != expected.as_slice() {
            return Err(Error::GeometryMismatch(format!(
                "data shape {:?} does not match geometry shape {:?}",
                data.shape(),
                expected
            )));
        }
        Ok(Self { geom, data, unit: unit.into() })
    }

    /// Build from stacked image planes of shape `(m, ny, nx)`, `m` = product of axis bins
    pub fn from_image_planes(
        geom: impl Into<Arc<WcsGeom>>,
        planes: Array3<A>,
        unit: impl Into<String>,
    ) -> Result<Self> {
        let geom = geom.into();
        let shape = geom.data_shape();
        let data = planes.into_dyn().into_shape_with_order(IxDyn(&shape)).map_err(shape_error)?;
        Self::from_data(geom, data, unit)
    }

    /// Shared geometry
    pub fn geom(&self) -> &WcsGeom {
        &self.geom
    }

    /// Geometry handle
    pub fn geom_arc(&self) -> &Arc<WcsGeom> {
        &self.geom
    }

    /// Data array
    pub fn data(&self) -> &ArrayD<A> {
        &self.data
    }

    /// Mutable data array; its shape cannot change through this handle
    pub fn data_mut(&mut self) -> ndarray::ArrayViewMutD<'_, A> {
        self.data.view_mut()
    }

    /// Consume into the data array
    pub fn into_data(self) -> ArrayD<A> {
        self.data
    }

    /// Unit string
    pub fn unit(&self) -> &str {
        &self.unit
    }

    /// Replace the unit string
    pub fn set_unit(&mut self, unit: impl Into<String>) {
        self.unit = unit.into();
    }

    /// Builder form of [`Map::set_unit`]
    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = unit.into();
        self
    }

    /// Same geometry, element-wise transformed data
    pub fn map_values<B: MapValue>(&self, f: impl FnMut(&A) -> B) -> Map<B> {
        Map { geom: self.geom.clone(), data: self.data.map(f), unit: self.unit.clone() }
    }

    /// Same geometry and unit, new data of the same shape
    pub fn with_data<B: MapValue>(&self, data: ArrayD<B>) -> Result<Map<B>> {
        Map::from_data(self.geom.clone(), data, self.unit.clone())
    }

    /// Data as `(m, ny, nx)` image planes (standard layout copy)
    pub fn image_planes(&self) -> Result<Array3<A>> {
        let (nx, ny) = self.geom.npix();
        let m = self.data.len() / (nx * ny);
        self.data
            .as_standard_layout()
            .into_owned()
            .into_shape_with_order((m, ny, nx))
            .map_err(shape_error)
    }

    /// Data index (reverse of the index tuple) for an in-range index tuple
    fn data_index(&self, idx: &[i64]) -> Option<Vec<usize>> {
        let shape = self.data.shape();
        let nd = shape.len();
        if idx.len() != nd {
            return None;
        }
        let mut out = vec![0usize; nd];
        for (k, &i) in idx.iter().enumerate() {
            let d = nd - 1 - k;
            if i < 0 || i as usize >= shape[d] {
                return None;
            }
            out[d] = i as usize;
        }
        Some(out)
    }

    fn check_ndim(&self, n: usize) -> Result<()> {
        if n != self.geom.ndim() {
            return Err(Error::Validation(format!(
                "expected {} index arrays, got {}",
                self.geom.ndim(),
                n
            )));
        }
        Ok(())
    }

    /// Values at index tuples `(x, y, axis_0, ..)`; out of range → [`MapValue::missing`]
    pub fn get_by_idx(&self, idx: &[ArrayD<i64>]) -> Result<ArrayD<A>> {
        self.check_ndim(idx.len())?;
        let mut out = Vec::new();
        let shape = for_each_point(idx, |p| {
            out.push(match self.data_index(p) {
                Some(ix) => self.data[&ix[..]].clone(),
                None => A::missing(),
            })
        })?;
        ArrayD::from_shape_vec(IxDyn(&shape), out).map_err(shape_error)
    }

    /// Data indices for a broadcast set of index arrays, `None` where out of range
    fn resolve(&self, idx: &[ArrayD<i64>]) -> Result<(Vec<usize>, Vec<Option<Vec<usize>>>)> {
        self.check_ndim(idx.len())?;
        let mut out = Vec::new();
        let shape = for_each_point(idx, |p| out.push(self.data_index(p)))?;
        Ok((shape, out))
    }

    /// Assign values at index tuples; out-of-range entries are ignored.
    ///
    /// `values` is broadcast against the index arrays. With duplicate indices
    /// the last write wins.
    pub fn set_by_idx(&mut self, idx: &[ArrayD<i64>], values: &ArrayD<A>) -> Result<()> {
        let (shape, targets) = self.resolve(idx)?;
        let full = broadcast_shape(&[&shape, values.shape()])?;
        if full != shape {
            return Err(Error::Validation(format!(
                "values of shape {:?} do not broadcast to index shape {:?}",
                values.shape(),
                shape
            )));
        }
        let values = values.broadcast(IxDyn(&shape)).ok_or_else(|| {
            Error::Validation(format!("cannot broadcast values to {:?}", shape))
        })?;
        for (target, v) in targets.iter().zip(values.iter()) {
            if let Some(ix) = target {
                self.data[&ix[..]] = v.clone();
            }
        }
        Ok(())
    }

    /// Values at the bins containing `coord`
    pub fn get_by_coord(&self, coord: &MapCoord) -> Result<ArrayD<A>> {
        let idx = self.geom.coord_to_idx(coord)?;
        self.get_by_idx(&idx)
    }

    /// Values at the bins containing continuous pixel positions
    pub fn get_by_pix(&self, pix: &[ArrayD<f64>]) -> Result<ArrayD<A>> {
        let idx = self.geom.pix_to_idx(pix)?;
        self.get_by_idx(&idx)
    }

    /// Assign values at the bins containing `coord`
    pub fn set_by_coord(&mut self, coord: &MapCoord, values: &ArrayD<A>) -> Result<()> {
        let idx = self.geom.coord_to_idx(coord)?;
        self.set_by_idx(&idx, values)
    }

    /// Sub-map with the selected axes sliced (ranges) or dropped (indices)
    pub fn slice_by_idx(&self, slices: &[(&str, SliceIdx)]) -> Result<Map<A>> {
        let geom = self.geom.slice_by_idx(slices)?;
        let n = self.geom.axes().len();
        let mut view = self.data.view();
        let mut drops = Vec::new();
        for (name, s) in slices {
            let d = n - 1 - self.geom.axis_index(name)?;
            match s {
                SliceIdx::Range(r) => view.slice_axis_inplace(Axis(d), Slice::from(r.clone())),
                SliceIdx::Index(i) => drops.push((d, *i)),
            }
        }
        drops.sort_unstable_by(|a, b| b.0.cmp(&a.0));
        for (d, i) in drops {
            view = view.index_axis_move(Axis(d), i);
        }
        Map::from_data(geom, view.to_owned(), self.unit.clone())
    }

    /// Spatial cutout; bins outside the parent are set to `fill`.
    pub fn cutout_with_fill(
        &self,
        position: &SkyCoord,
        width: (f64, f64),
        mode: CutoutMode,
        fill: A,
    ) -> Result<Map<A>> {
        let (geom, slices) = self.geom.cutout(position, width, mode)?;
        let planes = self.image_planes()?;
        let (cx, cy) = geom.npix();
        let mut out = Array3::from_elem((planes.shape()[0], cy, cx), fill);
        let (nx, ny) = self.geom.npix();
        if let Some((xr, yr)) = slices.overlap(nx, ny) {
            let ox = (xr.start as i64 - slices.x.start) as usize;
            let oy = (yr.start as i64 - slices.y.start) as usize;
            out.slice_mut(s![.., oy..oy + yr.len(), ox..ox + xr.len()])
                .assign(&planes.slice(s![.., yr.clone(), xr.clone()]));
        }
        Map::from_image_planes(geom, out, self.unit.clone())
    }
}

impl Map<f64> {
    /// Zero-filled map
    pub fn from_geom(geom: impl Into<Arc<WcsGeom>>, unit: impl Into<String>) -> Self {
        Self::from_elem(geom, 0.0, unit)
    }

    /// Sum of all finite bins
    pub fn sum(&self) -> f64 {
        self.data.iter().filter(|v| v.is_finite()).sum()
    }

    /// Accumulate `weights` (1 when `None`) into the bins at the index tuples.
    ///
    /// Out-of-range entries are ignored; duplicate indices accumulate.
    pub fn fill_by_idx(&mut self, idx: &[ArrayD<i64>], weights: Option<&ArrayD<f64>>) -> Result<()> {
        let (shape, targets) = self.resolve(idx)?;
        match weights {
            None => {
                for ix in targets.iter().flatten() {
                    self.data[&ix[..]] += 1.0;
                }
            }
            Some(w) => {
                let w = w.broadcast(IxDyn(&shape)).ok_or_else(|| {
                    Error::Validation(format!(
                        "weights of shape {:?} do not broadcast to {:?}",
                        w.shape(),
                        shape
                    ))
                })?;
                for (target, &wt) in targets.iter().zip(w.iter()) {
                    if let Some(ix) = target {
                        self.data[&ix[..]] += wt;
                    }
                }
            }
        }
        Ok(())
    }

    /// Histogram `coord` into the map
    pub fn fill_by_coord(&mut self, coord: &MapCoord, weights: Option<&ArrayD<f64>>) -> Result<()> {
        let idx = self.geom.coord_to_idx(coord)?;
        self.fill_by_idx(&idx, weights)
    }

    /// Interpolated values at `coord`.
    ///
    /// Linear interpolation is multilinear between pixel centers over all
    /// dimensions. Points inside the geometry but beyond the outermost centers
    /// take the edge value; points outside return `fill_value` unless
    /// `extrapolate` is set.
    pub fn interp_by_coord(&self, coord: &MapCoord, opts: &InterpOptions) -> Result<ArrayD<f64>> {
        let pix = self.geom.coord_to_pix(coord)?;
        self.interp_by_pix(&pix, opts)
    }

    /// Interpolated values at continuous pixel positions
    pub fn interp_by_pix(&self, pix: &[ArrayD<f64>], opts: &InterpOptions) -> Result<ArrayD<f64>> {
        self.check_ndim(pix.len())?;
        let shape = self.geom.shape();
        let mut out = Vec::new();
        let out_shape = for_each_point(pix, |p| out.push(self.interp_point(p, &shape, opts)))?;
        ArrayD::from_shape_vec(IxDyn(&out_shape), out).map_err(shape_error)
    }

    fn interp_point(&self, p: &[f64], shape: &[usize], opts: &InterpOptions) -> f64 {
        if p.iter().any(|x| x.is_nan()) {
            return opts.fill_value;
        }
        let inside = p.iter().zip(shape).all(|(&x, &n)| x >= 0.0 && x <= n as f64);
        if !inside && !opts.extrapolate {
            return opts.fill_value;
        }
        let nd = p.len();
        match opts.method {
            InterpMethod::Nearest => {
                let idx: Vec<i64> = p
                    .iter()
                    .zip(shape)
                    .map(|(&x, &n)| (x.floor() as i64).clamp(0, n as i64 - 1))
                    .collect();
                self.data_index(&idx).map_or(opts.fill_value, |ix| self.data[&ix[..]])
            }
            InterpMethod::Linear => {
                let mut lo = vec![0i64; nd];
                let mut frac = vec![0.0; nd];
                for d in 0..nd {
                    let n = shape[d];
                    if n == 1 {
                        continue;
                    }
                    let t = p[d] - 0.5;
                    let i0 = (t.floor() as i64).clamp(0, n as i64 - 2);
                    let f = t - i0 as f64;
                    lo[d] = i0;
                    frac[d] = if opts.extrapolate { f } else { f.clamp(0.0, 1.0) };
                }
                let mut acc = 0.0;
                let mut corner = vec![0i64; nd];
                for mask in 0..(1usize << nd) {
                    let mut w = 1.0;
                    for d in 0..nd {
                        let up = (mask >> d) & 1 == 1;
                        corner[d] = lo[d] + i64::from(up);
                        w *= if up { frac[d] } else { 1.0 - frac[d] };
                    }
                    if w == 0.0 {
                        continue;
                    }
                    match self.data_index(&corner) {
                        Some(ix) => acc += w * self.data[&ix[..]],
                        None => return opts.fill_value,
                    }
                }
                acc
            }
        }
    }

    /// Values resampled onto another geometry by interpolation at its bin centers
    pub fn interp_to_geom(
        &self,
        target: impl Into<Arc<WcsGeom>>,
        opts: &InterpOptions,
    ) -> Result<Map<f64>> {
        let target = target.into();
        let values = self.interp_by_coord(&target.get_coord(), opts)?;
        let shape = target.data_shape();
        let values = values
            .broadcast(IxDyn(&shape))
            .ok_or_else(|| {
                Error::GeometryMismatch(format!(
                    "interpolated shape {:?} does not cover target shape {:?}",
                    values.shape(),
                    shape
                ))
            })?
            .to_owned();
        Map::from_data(target, values, self.unit.clone())
    }

    /// Flux-conserving reprojection onto another spatial grid.
    ///
    /// Each source pixel is split into `k × k` sub-pixels (k between 2 and 16,
    /// chosen from the pixel-size ratio) whose share of the content is added to
    /// the target pixel containing the sub-pixel center. Non-spatial axes must
    /// match.
    pub fn reproject(&self, target: impl Into<Arc<WcsGeom>>) -> Result<Map<f64>> {
        let target = target.into();
        let src = self.geom.as_ref();
        if src.axes().len() != target.axes().len()
            || src.axes().iter().zip(target.axes()).any(|(a, b)| !a.is_allclose(b, 1e-9))
        {
            return Err(Error::GeometryMismatch(
                "reprojection requires identical non-spatial axes".to_string(),
            ));
        }
        let k = ((2.0 * src.binsz() / target.binsz()).ceil() as usize).clamp(2, 16);
        let (nx, ny) = src.npix();
        let (tx, ty) = target.npix();
        let rot = src.frame().rotation_to(target.frame());
        let share = 1.0 / (k * k) as f64;
        log::debug!("reproject {nx}x{ny} -> {tx}x{ty} pixels with {k}x{k} sub-pixels");

        // Per source pixel: (target flat index, weight).
        let mut weights: Vec<Vec<(usize, f64)>> = Vec::with_capacity(nx * ny);
        let mut acc: HashMap<usize, f64> = HashMap::new();
        for iy in 0..ny {
            for ix in 0..nx {
                acc.clear();
                for sy in 0..k {
                    for sx in 0..k {
                        let x = ix as f64 + (sx as f64 + 0.5) / k as f64;
                        let y = iy as f64 + (sy as f64 + 0.5) / k as f64;
                        let Some(v) = src.wcs().pix_to_vec(x, y) else { continue };
                        let (px, py) = target.wcs().vec_to_pix(&(rot * v));
                        if px >= 0.0 && px < tx as f64 && py >= 0.0 && py < ty as f64 {
                            let t = py.floor() as usize * tx + px.floor() as usize;
                            *acc.entry(t).or_insert(0.0) += share;
                        }
                    }
                }
                weights.push(acc.iter().map(|(&t, &w)| (t, w)).collect());
            }
        }

        let planes = self.image_planes()?;
        let m = planes.shape()[0];
        let mut out = Array3::<f64>::zeros((m, ty, tx));
        for p in 0..m {
            let plane = planes.index_axis(Axis(0), p);
            let mut dst = out.index_axis_mut(Axis(0), p);
            let dst = dst.as_slice_mut().ok_or_else(|| {
                Error::Computation("reprojection buffer is not contiguous".to_string())
            })?;
            for ((iy, ix), &v) in plane.indexed_iter() {
                if !v.is_finite() || v == 0.0 {
                    continue;
                }
                for &(t, w) in &weights[iy * nx + ix] {
                    dst[t] += v * w;
                }
            }
        }
        Map::from_image_planes(target, out, self.unit.clone())
    }

    /// Smooth every image plane with a kernel of angular `width` (degrees).
    pub fn smooth(&self, width: f64, kernel: SmoothKernel) -> Result<Map<f64>> {
        let k = make_kernel(kernel, width / self.geom.binsz())?;
        self.convolve(&k)
    }

    /// Convolve every image plane with the same pixel kernel
    pub fn convolve(&self, kernel: &Array2<f64>) -> Result<Map<f64>> {
        let mut planes = self.image_planes()?;
        for mut plane in planes.outer_iter_mut() {
            let smoothed = convolve2d_same(&plane.view(), &kernel.view())?;
            plane.assign(&smoothed);
        }
        Map::from_image_planes(self.geom.clone(), planes, self.unit.clone())
    }

    /// Sum over all non-spatial axes.
    ///
    /// With `keepdims` the axes are squashed to a single bin; otherwise the
    /// result is an image.
    pub fn sum_over_axes(&self, keepdims: bool) -> Result<Map<f64>> {
        let planes = self.image_planes()?;
        let image = planes.sum_axis(Axis(0));
        if keepdims {
            let axes = self.geom.axes().iter().map(|a| a.squash()).collect();
            let geom = self.geom.to_cube(axes)?;
            let (ny, nx) = image.dim();
            let planes = image.into_shape_with_order((1, ny, nx)).map_err(shape_error)?;
            Map::from_image_planes(geom, planes, self.unit.clone())
        } else {
            Map::from_data(self.geom.to_image(), image.into_dyn(), self.unit.clone())
        }
    }

    /// Spatial cutout; bins outside the parent are NaN in [`CutoutMode::Partial`].
    pub fn cutout(&self, position: &SkyCoord, width: (f64, f64), mode: CutoutMode) -> Result<Map<f64>> {
        self.cutout_with_fill(position, width, mode, f64::NAN)
    }

    /// Add a cutout back into this map at its pixel position.
    ///
    /// The cutout must share the projection and pixel scale with an integer
    /// pixel offset; parts outside this map and non-finite values are skipped.
    pub fn paste(&mut self, cutout: &Map<f64>) -> Result<()> {
        let (ox, oy) = self.cutout_offset(cutout.geom())?;
        let src = cutout.image_planes()?;
        let mut dst = self.image_planes()?;
        let (nx, ny) = self.geom.npix();
        for ((p, iy, ix), &v) in src.indexed_iter() {
            let (x, y) = (ix as i64 + ox, iy as i64 + oy);
            if v.is_finite() && x >= 0 && y >= 0 && (x as usize) < nx && (y as usize) < ny {
                dst[[p, y as usize, x as usize]] += v;
            }
        }
        *self = Map::from_image_planes(self.geom.clone(), dst, self.unit.clone())?;
        Ok(())
    }

    /// Integer pixel offset of `other`'s grid inside this one
    fn cutout_offset(&self, other: &WcsGeom) -> Result<(i64, i64)> {
        let (a, b) = (self.geom.wcs(), other.wcs());
        let close = |x: f64, y: f64| (x - y).abs() <= 1e-9 * x.abs().max(y.abs()).max(1.0);
        let aligned = a.frame() == b.frame()
            && a.projection() == b.projection()
            && (0..2).all(|i| close(a.crval()[i], b.crval()[i]) && close(a.cdelt()[i], b.cdelt()[i]))
            && self.geom.axes().len() == other.axes().len()
            && self.geom.axes().iter().zip(other.axes()).all(|(p, q)| p.is_allclose(q, 1e-9));
        if !aligned {
            return Err(Error::GeometryMismatch(
                "cutout is not aligned with the target geometry".to_string(),
            ));
        }
        let dx = a.crpix()[0] - b.crpix()[0];
        let dy = a.crpix()[1] - b.crpix()[1];
        if (dx - dx.round()).abs() > 1e-6 || (dy - dy.round()).abs() > 1e-6 {
            return Err(Error::GeometryMismatch(format!(
                "cutout offset ({dx}, {dy}) is not an integer number of pixels"
            )));
        }
        Ok((dx.round() as i64, dy.round() as i64))
    }

    /// Merge `factor × factor` pixel blocks; sums with `preserve_counts`, means otherwise.
    pub fn downsample(&self, factor: usize, preserve_counts: bool) -> Result<Map<f64>> {
        let geom = self.geom.downsample(factor)?;
        let planes = self.image_planes()?;
        let (cx, cy) = geom.npix();
        let norm = if preserve_counts { 1.0 } else { 1.0 / (factor * factor) as f64 };
        let mut out = Array3::<f64>::zeros((planes.shape()[0], cy, cx));
        for ((p, iy, ix), &v) in planes.indexed_iter() {
            out[[p, iy / factor, ix / factor]] += v * norm;
        }
        Map::from_image_planes(geom, out, self.unit.clone())
    }

    /// Split pixels into `factor × factor` blocks; content is divided with `preserve_counts`.
    pub fn upsample(&self, factor: usize, preserve_counts: bool) -> Result<Map<f64>> {
        let geom = self.geom.upsample(factor)?;
        let planes = self.image_planes()?;
        let (fx, fy) = geom.npix();
        let norm = if preserve_counts { 1.0 / (factor * factor) as f64 } else { 1.0 };
        let out = Array3::from_shape_fn((planes.shape()[0], fy, fx), |(p, iy, ix)| {
            planes[[p, iy / factor, ix / factor]] * norm
        });
        Map::from_image_planes(geom, out, self.unit.clone())
    }

    fn zip_with(
        &self,
        other: &Map<f64>,
        unit: String,
        f: impl Fn(f64, f64) -> f64,
    ) -> Result<Map<f64>> {
        if !same_geom(&self.geom, &other.geom) {
            return Err(Error::GeometryMismatch(
                "map arithmetic requires identical geometries".to_string(),
            ));
        }
        let data = ndarray::Zip::from(&self.data).and(&other.data).map_collect(|&a, &b| f(a, b));
        Ok(Map { geom: self.geom.clone(), data, unit })
    }

    fn additive_unit(&self, other: &Map<f64>) -> Result<String> {
        match (self.unit.as_str(), other.unit.as_str()) {
            (a, b) if a == b => Ok(a.to_string()),
            ("", b) => Ok(b.to_string()),
            (a, "") => Ok(a.to_string()),
            (a, b) => Err(Error::Validation(format!("incompatible units '{a}' and '{b}'"))),
        }
    }

    /// Element-wise sum
    pub fn try_add(&self, other: &Map<f64>) -> Result<Map<f64>> {
        let unit = self.additive_unit(other)?;
        self.zip_with(other, unit, |a, b| a + b)
    }

    /// Element-wise difference
    pub fn try_sub(&self, other: &Map<f64>) -> Result<Map<f64>> {
        let unit = self.additive_unit(other)?;
        self.zip_with(other, unit, |a, b| a - b)
    }

    /// Element-wise product
    pub fn try_mul(&self, other: &Map<f64>) -> Result<Map<f64>> {
        let unit = match (self.unit.as_str(), other.unit.as_str()) {
            ("", b) => b.to_string(),
            (a, "") => a.to_string(),
            (a, b) => format!("{a} {b}"),
        };
        self.zip_with(other, unit, |a, b| a * b)
    }

    /// Element-wise quotient
    pub fn try_div(&self, other: &Map<f64>) -> Result<Map<f64>> {
        let unit = match (self.unit.as_str(), other.unit.as_str()) {
            (a, b) if a == b => String::new(),
            (a, "") => a.to_string(),
            (a, b) => format!("{a} / ({b})"),
        };
        self.zip_with(other, unit, |a, b| a / b)
    }

    /// Boolean map from a predicate
    pub fn mask_where(&self, f: impl Fn(f64) -> bool) -> Mask {
        self.map_values(|&v| f(v))
    }

    /// Same map with bins outside `mask` set to `fill`
    pub fn masked(&self, mask: &Mask, fill: f64) -> Result<Map<f64>> {
        if !same_geom(&self.geom, &mask.geom) {
            return Err(Error::GeometryMismatch("mask geometry differs from map".to_string()));
        }
        let data = ndarray::Zip::from(&self.data)
            .and(&mask.data)
            .map_collect(|&v, &m| if m { v } else { fill });
        Ok(Map { geom: self.geom.clone(), data, unit: self.unit.clone() })
    }
}

impl Map<bool> {
    /// Logical and of two masks
    pub fn and(&self, other: &Mask) -> Result<Mask> {
        if !same_geom(&self.geom, &other.geom) {
            return Err(Error::GeometryMismatch("mask geometries differ".to_string()));
        }
        let data = ndarray::Zip::from(&self.data).and(&other.data).map_collect(|&a, &b| a && b);
        Ok(Map { geom: self.geom.clone(), data, unit: String::new() })
    }

    /// Logical or of two masks
    pub fn or(&self, other: &Mask) -> Result<Mask> {
        if !same_geom(&self.geom, &other.geom) {
            return Err(Error::GeometryMismatch("mask geometries differ".to_string()));
        }
        let data = ndarray::Zip::from(&self.data).and(&other.data).map_collect(|&a, &b| a || b);
        Ok(Map { geom: self.geom.clone(), data, unit: String::new() })
    }

    /// Logical negation
    pub fn inverted(&self) -> Mask {
        self.map_values(|&v| !v)
    }

    /// Number of selected bins
    pub fn count(&self) -> usize {
        self.data.iter().filter(|&&v| v).count()
    }
}

impl Add<&Map<f64>> for &Map<f64> {
    type Output = Result<Map<f64>>;
    fn add(self, rhs: &Map<f64>) -> Self::Output {
        self.try_add(rhs)
    }
}

impl Sub<&Map<f64>> for &Map<f64> {
    type Output = Result<Map<f64>>;
    fn sub(self, rhs: &Map<f64>) -> Self::Output {
        self.try_sub(rhs)
    }
}

impl Mul<&Map<f64>> for &Map<f64> {
    type Output = Result<Map<f64>>;
    fn mul(self, rhs: &Map<f64>) -> Self::Output {
        self.try_mul(rhs)
    }
}

impl Div<&Map<f64>> for &Map<f64> {
    type Output = Result<Map<f64>>;
    fn div(self, rhs: &Map<f64>) -> Self::Output {
        self.try_div(rhs)
    }
}

impl Add<f64> for &Map<f64> {
    type Output = Map<f64>;
    fn add(self, rhs: f64) -> Map<f64> {
        self.map_values(|&v| v + rhs)
    }
}

impl Sub<f64> for &Map<f64> {
    type Output = Map<f64>;
    fn sub(self, rhs: f64) -> Map<f64> {
        self.map_values(|&v| v - rhs)
    }
}

impl Mul<f64> for &Map<f64> {
    type Output = Map<f64>;
    fn mul(self, rhs: f64) -> Map<f64> {
        self.map_values(|&v| v * rhs)
    }
}

impl Div<f64> for &Map<f64> {
    type Output = Map<f64>;
    fn div(self, rhs: f64) -> Map<f64> {
        self.map_values(|&v| v / rhs)
    }
}

impl Neg for &Map<f64> {
    type Output = Map<f64>;
    fn neg(self) -> Map<f64> {
        self.map_values(|&v| -v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::axis::MapAxis;
    use crate::skycoord::Frame;
    use crate::wcs::Projection;
    use approx::assert_relative_eq;
    use ndarray::arr1;

    fn cube() -> Arc<WcsGeom> {
        let energy = MapAxis::from_energy_bounds(1.0, 100.0, 2, "TeV", false).unwrap();
        Arc::new(
            WcsGeom::create(
                SkyCoord::galactic(0.0, 0.0),
                1.0,
                (4.0, 3.0),
                Projection::Car,
                vec![energy],
            )
            .unwrap(),
        )
    }

    fn idx(v: &[i64]) -> ArrayD<i64> {
        arr1(v).into_dyn()
    }

    #[test]
    fn test_from_data_checks_shape() {
        let g = cube();
        assert!(Map::from_data(g.clone(), ArrayD::<f64>::zeros(IxDyn(&[2, 3, 4])), "").is_ok());
        assert!(matches!(
            Map::from_data(g, ArrayD::<f64>::zeros(IxDyn(&[3, 4, 2])), ""),
            Err(Error::GeometryMismatch(_))
        ));
    }

    #[test]
    fn test_idx_access_and_sentinels() {
        let mut m = Map::from_geom(cube(), "");
        let i = [idx(&[1, 3, 9]), idx(&[2, 0, 0]), idx(&[1, 0, 0])];
        m.set_by_idx(&i, &arr1(&[5.0, 7.0, 9.0]).into_dyn()).unwrap();
        assert_eq!(m.data()[[1, 2, 1]], 5.0);
        assert_eq!(m.data()[[0, 0, 3]], 7.0);
        let got = m.get_by_idx(&i).unwrap();
        assert_eq!(got[[0]], 5.0);
        assert!(got[[2]].is_nan());

        let neg = [idx(&[-1]), idx(&[0]), idx(&[0])];
        assert!(m.get_by_idx(&neg).unwrap()[[0]].is_nan());
        assert!(m.get_by_idx(&neg[..2]).is_err());
    }

    #[test]
    fn test_fill_accumulates() {
        let mut m = Map::from_geom(cube(), "");
        let i = [idx(&[0, 0, 0, 50]), idx(&[0, 0, 1, 0]), idx(&[0, 0, 0, 0])];
        m.fill_by_idx(&i, None).unwrap();
        assert_eq!(m.data()[[0, 0, 0]], 2.0);
        assert_eq!(m.data()[[0, 1, 0]], 1.0);
        assert_eq!(m.sum(), 3.0);

        let w = arr1(&[0.5]).into_dyn();
        m.fill_by_idx(&[idx(&[0]), idx(&[0]), idx(&[0])], Some(&w)).unwrap();
        assert_eq!(m.data()[[0, 0, 0]], 2.5);
    }

    #[test]
    fn test_fill_by_coord_histogram() {
        let mut m = Map::from_geom(cube(), "");
        let coord = MapCoord::from_lonlat(&[0.5, 0.5, 10.0], &[0.2, 0.2, 0.0], Frame::Galactic)
            .with_axis_values("energy", &[3.0, 30.0, 3.0]);
        m.fill_by_coord(&coord, None).unwrap();
        assert_eq!(m.sum(), 2.0);
        let back = m.get_by_coord(&coord).unwrap();
        assert_eq!(back[[0]], 1.0);
        assert!(back[[2]].is_nan());
    }

    #[test]
    fn test_interp_linear_and_edges() {
        let g = Arc::new(g_image(4, 1));
        let data = ArrayD::from_shape_vec(IxDyn(&[1, 4]), vec![0.0, 1.0, 2.0, 3.0]).unwrap();
        let m = Map::from_data(g, data, "").unwrap();
        let pix = [arr1(&[1.0, 0.2, 3.9, 4.5]).into_dyn(), arr1(&[0.5]).into_dyn()];
        let v = m.interp_by_pix(&pix, &InterpOptions::default()).unwrap();
        assert_relative_eq!(v[[0]], 0.5);
        // inside the grid but beyond the outermost center: edge value
        assert_relative_eq!(v[[1]], 0.0);
        assert_relative_eq!(v[[2]], 3.0);
        assert!(v[[3]].is_nan());

        let opts = InterpOptions::default().with_extrapolate(true);
        let v = m.interp_by_pix(&pix, &opts).unwrap();
        assert_relative_eq!(v[[3]], 4.0);

        let v = m.interp_by_pix(&pix, &InterpOptions::nearest().with_fill_value(-1.0)).unwrap();
        assert_eq!(v[[0]], 1.0);
        assert_eq!(v[[3]], -1.0);
    }

    fn g_image(nx: usize, ny: usize) -> WcsGeom {
        WcsGeom::from_npix(SkyCoord::galactic(0.0, 0.0), 0.5, (nx, ny), Projection::Car, vec![])
            .unwrap()
    }

    #[test]
    fn test_slice_drops_and_keeps() {
        let m = Map::from_elem(cube(), 1.0, "cm-2");
        let kept = m.slice_by_idx(&[("energy", SliceIdx::Range(1..2))]).unwrap();
        assert_eq!(kept.data().shape(), &[1, 3, 4]);
        let dropped = m.slice_by_idx(&[("energy", SliceIdx::Index(0))]).unwrap();
        assert_eq!(dropped.data().shape(), &[3, 4]);
        assert_eq!(dropped.unit(), "cm-2");
        assert!(matches!(
            dropped.slice_by_idx(&[("energy", SliceIdx::Index(0))]),
            Err(Error::UnknownAxis(_))
        ));
    }

    #[test]
    fn test_sum_over_axes() {
        let m = Map::from_elem(cube(), 2.0, "");
        let img = m.sum_over_axes(false).unwrap();
        assert!(img.geom().is_image());
        assert_eq!(img.data()[[0, 0]], 4.0);
        let kd = m.sum_over_axes(true).unwrap();
        assert_eq!(kd.data().shape(), &[1, 3, 4]);
        assert_eq!(kd.geom().axes()[0].bounds(), (1.0, 100.0));
    }

    #[test]
    fn test_arithmetic() {
        let a = Map::from_elem(cube(), 2.0, "ct");
        let b = Map::from_elem(cube(), 3.0, "ct");
        assert_eq!((&a + &b).unwrap().data()[[0, 0, 0]], 5.0);
        assert_eq!((&a - &b).unwrap().data()[[0, 0, 0]], -1.0);
        assert_eq!((&a * &b).unwrap().unit(), "ct ct");
        assert_eq!((&a * 4.0).data()[[1, 2, 3]], 8.0);

        let other = Map::from_elem(g_image(4, 3), 1.0, "ct");
        assert!(matches!(a.try_add(&other), Err(Error::GeometryMismatch(_))));
        let wrong_unit = Map::from_elem(cube(), 1.0, "s");
        assert!(a.try_add(&wrong_unit).is_err());
    }

    #[test]
    fn test_masks() {
        let mut m = Map::from_geom(cube(), "");
        m.data_mut()[[0, 1, 1]] = 4.0;
        let mask = m.mask_where(|v| v > 1.0);
        assert_eq!(mask.count(), 1);
        assert_eq!(mask.inverted().count(), 23);
        assert_eq!(mask.and(&mask.inverted()).unwrap().count(), 0);
        assert_eq!(mask.or(&mask.inverted()).unwrap().count(), 24);
        let masked = m.masked(&mask.inverted(), 0.0).unwrap();
        assert_eq!(masked.sum(), 0.0);
    }

    #[test]
    fn test_cutout_and_paste() {
        let g = Arc::new(
            WcsGeom::create(SkyCoord::galactic(0.0, 0.0), 0.5, (5.0, 5.0), Projection::Car, vec![])
                .unwrap(),
        );
        let mut m = Map::from_geom(g.clone(), "");
        m.data_mut()[[5, 5]] = 1.0;
        let cut = m.cutout(&SkyCoord::galactic(0.0, 0.0), (2.0, 2.0), CutoutMode::Trim).unwrap();
        assert_eq!(cut.geom().npix(), (4, 4));
        assert_eq!(cut.sum(), 1.0);

        let mut total = Map::from_geom(g, "");
        total.paste(&cut).unwrap();
        total.paste(&cut).unwrap();
        assert_eq!(total.data()[[5, 5]], 2.0);

        let partial =
            m.cutout(&SkyCoord::galactic(2.4, 0.0), (2.0, 2.0), CutoutMode::Partial).unwrap();
        assert_eq!(partial.geom().npix(), (4, 4));
        assert!(partial.data().iter().any(|v| v.is_nan()));
    }

    #[test]
    fn test_resampling_preserves_counts() {
        let g = Arc::new(g_image(4, 4));
        let m = Map::from_elem(g, 1.0, "");
        let down = m.downsample(2, true).unwrap();
        assert_eq!(down.data()[[0, 0]], 4.0);
        assert_eq!(down.sum(), 16.0);
        let mean = m.downsample(2, false).unwrap();
        assert_eq!(mean.data()[[1, 1]], 1.0);
        let up = m.upsample(2, true).unwrap();
        assert_relative_eq!(up.sum(), 16.0);
        assert!(m.downsample(3, true).is_err());
    }

    #[test]
    fn test_smooth_conserves_interior_flux() {
        let g = Arc::new(
            WcsGeom::create(SkyCoord::galactic(0.0, 0.0), 0.1, (5.0, 5.0), Projection::Car, vec![])
                .unwrap(),
        );
        let mut m = Map::from_geom(g, "");
        m.data_mut()[[25, 25]] = 100.0;
        for kernel in [SmoothKernel::Gauss, SmoothKernel::Disk, SmoothKernel::Box] {
            let s = m.smooth(0.3, kernel).unwrap();
            assert_relative_eq!(s.sum(), 100.0, epsilon = 1e-9);
            assert!(s.data()[[25, 25]] < 100.0);
        }
    }

    #[test]
    fn test_interp_to_geom_identity() {
        let g = cube();
        let m = Map::from_data(
            g.clone(),
            ArrayD::from_shape_fn(IxDyn(&g.data_shape()), |ix| (ix[0] * 100 + ix[1] * 10 + ix[2]) as f64),
            "",
        )
        .unwrap();
        let same = m.interp_to_geom(g, &InterpOptions::default()).unwrap();
        for (a, b) in m.data().iter().zip(same.data().iter()) {
            assert_relative_eq!(a, b, epsilon = 1e-9);
        }
    }
}

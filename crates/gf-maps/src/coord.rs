//! Map coordinates: sky positions plus one value array per non-spatial axis.
//!
//! Arrays follow NumPy broadcasting rules. A [`MapCoord`] produced by
//! [`crate::WcsGeom::get_coord`] keeps the sky arrays shaped `[1, .., ny, nx]`
//! and each axis array shaped `[.., n_k, .., 1, 1]`, so the full grid is only
//! ever visited through broadcast views.

use crate::skycoord::{Frame, SkyCoord, lonlat_to_vec, vec_to_lonlat};
use gf_core::{Error, Result};
use ndarray::{Array1, ArrayD, ArrayViewD, IxDyn};

/// Common broadcast shape of several array shapes
pub fn broadcast_shape(shapes: &[&[usize]]) -> Result<Vec<usize>> {
    let ndim = shapes.iter().map(|s| s.len()).max().unwrap_or(0);
    let mut out = vec![1usize; ndim];
    for shape in shapes {
        let offset = ndim - shape.len();
        for (i, &n) in shape.iter().enumerate() {
            let o = &mut out[offset + i];
            if *o == 1 {
                *o = n;
            } else if n != 1 && n != *o {
                return Err(Error::Validation(format!(
                    "shapes {:?} cannot be broadcast together",
                    shapes
                )));
            }
        }
    }
    Ok(out)
}

/// Broadcast every array to the common shape, as views
pub fn broadcast_views<'a, A>(
    arrays: &[&'a ArrayD<A>],
) -> Result<(Vec<usize>, Vec<ArrayViewD<'a, A>>)> {
    let shapes: Vec<&[usize]> = arrays.iter().map(|a| a.shape()).collect();
    let shape = broadcast_shape(&shapes)?;
    let views = arrays
        .iter()
        .map(|a| {
            a.broadcast(IxDyn(&shape)).ok_or_else(|| {
                Error::Validation(format!("cannot broadcast {:?} to {:?}", a.shape(), shape))
            })
        })
        .collect::<Result<Vec<_>>>()?;
    Ok((shape, views))
}

/// Coordinates for a map lookup
#[derive(Debug, Clone)]
pub struct MapCoord {
    /// Frame of `lon`/`lat`
    pub frame: Frame,
    /// Longitudes in degrees
    pub lon: ArrayD<f64>,
    /// Latitudes in degrees
    pub lat: ArrayD<f64>,
    /// Non-spatial axis values, keyed by axis name
    pub axes: Vec<(String, ArrayD<f64>)>,
}

impl MapCoord {
    /// Sky-only coordinates
    pub fn new(lon: ArrayD<f64>, lat: ArrayD<f64>, frame: Frame) -> Self {
        Self { frame, lon, lat, axes: Vec::new() }
    }

    /// 1-D coordinates from slices of equal length
    pub fn from_lonlat(lon: &[f64], lat: &[f64], frame: Frame) -> Self {
        Self::new(Array1::from(lon.to_vec()).into_dyn(), Array1::from(lat.to_vec()).into_dyn(), frame)
    }

    /// A single sky position (0-d arrays)
    pub fn from_skycoord(c: &SkyCoord) -> Self {
        Self::new(ArrayD::from_elem(IxDyn(&[]), c.lon), ArrayD::from_elem(IxDyn(&[]), c.lat), c.frame)
    }

    /// Builder: add or replace an axis array
    pub fn with_axis(mut self, name: impl Into<String>, values: ArrayD<f64>) -> Self {
        let name = name.into();
        match self.axes.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = values,
            None => self.axes.push((name, values)),
        }
        self
    }

    /// Builder: add a 1-D axis array from a slice
    pub fn with_axis_values(self, name: impl Into<String>, values: &[f64]) -> Self {
        self.with_axis(name, Array1::from(values.to_vec()).into_dyn())
    }

    /// Builder: add a scalar axis value broadcast against everything else
    pub fn with_axis_scalar(self, name: impl Into<String>, value: f64) -> Self {
        self.with_axis(name, ArrayD::from_elem(IxDyn(&[]), value))
    }

    /// Values of a named axis
    pub fn axis(&self, name: &str) -> Option<&ArrayD<f64>> {
        self.axes.iter().find(|(n, _)| n == name).map(|(_, a)| a)
    }

    /// Values of a named axis or an [`Error::UnknownAxis`]
    pub fn require_axis(&self, name: &str) -> Result<&ArrayD<f64>> {
        self.axis(name).ok_or_else(|| Error::UnknownAxis(format!("coordinate has no '{name}' axis")))
    }

    /// Broadcast shape over sky and axis arrays
    pub fn shape(&self) -> Result<Vec<usize>> {
        let mut shapes: Vec<&[usize]> = vec![self.lon.shape(), self.lat.shape()];
        shapes.extend(self.axes.iter().map(|(_, a)| a.shape()));
        broadcast_shape(&shapes)
    }

    /// Sky positions broadcast against each other, converted to `frame`
    pub fn skycoord_in(&self, frame: Frame) -> Result<(ArrayD<f64>, ArrayD<f64>)> {
        let (shape, views) = broadcast_views(&[&self.lon, &self.lat])?;
        if frame == self.frame {
            return Ok((views[0].to_owned(), views[1].to_owned()));
        }
        let rot = self.frame.rotation_to(frame);
        let mut lon = ArrayD::zeros(IxDyn(&shape));
        let mut lat = ArrayD::zeros(IxDyn(&shape));
        for ((o_lon, o_lat), (&l, &b)) in
            lon.iter_mut().zip(lat.iter_mut()).zip(views[0].iter().zip(views[1].iter()))
        {
            let (l2, b2) = vec_to_lonlat(&(rot * lonlat_to_vec(l, b)));
            *o_lon = l2;
            *o_lat = b2;
        }
        Ok((lon, lat))
    }

    /// Same coordinates with the sky part expressed in another frame
    pub fn to_frame(&self, frame: Frame) -> Result<MapCoord> {
        let (lon, lat) = self.skycoord_in(frame)?;
        Ok(MapCoord { frame, lon, lat, axes: self.axes.clone() })
    }
}

//! # gf-maps
//!
//! Binned sky data for gamma-ray analysis.
//!
//! - [`MapAxis`]: 1-D binning of a physical quantity (energy, time, ...).
//! - [`WcsGeom`]: projected spatial pixel grid plus non-spatial axes.
//! - [`MapCoord`]: broadcastable coordinate arrays for lookups.
//! - [`Map`]: dense array bound to a geometry, with interpolation,
//!   reprojection, smoothing, slicing, cutouts and arithmetic.
//!
//! Pixel convention: bin `i` covers the continuous pixel interval `[i, i + 1)`.
//! Index tuples are ordered `(x, y, axis_0, ..)`, data arrays the reverse.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod axis;
pub mod config;
pub mod convolve;
pub mod coord;
pub mod geom;
pub mod io;
pub mod map;
pub mod skycoord;
pub mod wcs;

pub use axis::{INVALID_INDEX, Interp, MapAxis, NodeType};
pub use config::{AxisConfig, GeomConfig};
pub use convolve::SmoothKernel;
pub use coord::MapCoord;
pub use geom::{CutoutMode, CutoutSlices, SliceIdx, WcsGeom};
pub use map::{InterpMethod, InterpOptions, Map, MapValue, Mask};
pub use skycoord::{Frame, SkyCoord};
pub use wcs::{Projection, WcsTransform};

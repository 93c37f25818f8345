//! Direct 2-D convolution and smoothing kernels.
//!
//! Kernels are odd-sized so that their central pixel is well defined. All
//! kernels built here are normalized to unit sum.

use gf_core::{Error, Result};
use ndarray::{Array2, ArrayView2};
use serde::{Deserialize, Serialize};

/// Shape of a smoothing kernel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SmoothKernel {
    /// Gaussian; the width is the standard deviation
    #[default]
    Gauss,
    /// Top-hat disk; the width is the radius
    Disk,
    /// Square box; the width is the full side length
    Box,
}

fn check_odd(kernel: &ArrayView2<f64>) -> Result<()> {
    let (r, c) = kernel.dim();
    if r % 2 == 0 || c % 2 == 0 {
        return Err(Error::Configuration(format!("kernel shape must be odd, got ({r}, {c})")));
    }
    Ok(())
}

/// Convolve `image` with `kernel`, zero-padded, output of the image's size.
///
/// This is a true convolution (the kernel is flipped), so asymmetric kernels
/// shift flux in the direction of their mass.
pub fn convolve2d_same(image: &ArrayView2<f64>, kernel: &ArrayView2<f64>) -> Result<Array2<f64>> {
    check_odd(kernel)?;
    let (img_rows, img_cols) = image.dim();
    let (ker_rows, ker_cols) = kernel.dim();
    let pad_rows = (ker_rows / 2) as isize;
    let pad_cols = (ker_cols / 2) as isize;

    let mut output = Array2::zeros((img_rows, img_cols));
    // Scatter form: skip zero pixels, which dominate sparse model images.
    for ((i, j), &v) in image.indexed_iter() {
        if v == 0.0 {
            continue;
        }
        for ki in 0..ker_rows {
            let row = i as isize + ki as isize - pad_rows;
            if row < 0 || row >= img_rows as isize {
                continue;
            }
            for kj in 0..ker_cols {
                let col = j as isize + kj as isize - pad_cols;
                if col < 0 || col >= img_cols as isize {
                    continue;
                }
                output[[row as usize, col as usize]] += v * kernel[[ki, kj]];
            }
        }
    }
    Ok(output)
}

fn normalized(mut kernel: Array2<f64>) -> Array2<f64> {
    let sum = kernel.sum();
    if sum > 0.0 {
        kernel.mapv_inplace(|x| x / sum);
    }
    kernel
}

/// Gaussian kernel with standard deviation `sigma` pixels, truncated at `4 sigma`
pub fn gaussian_kernel(sigma: f64) -> Result<Array2<f64>> {
    if !(sigma.is_finite() && sigma > 0.0) {
        return Err(Error::Configuration(format!("gaussian sigma must be > 0, got {sigma}")));
    }
    let half = (4.0 * sigma).ceil() as usize;
    let size = 2 * half + 1;
    let c = half as f64;
    let kernel = Array2::from_shape_fn((size, size), |(i, j)| {
        let (y, x) = (i as f64 - c, j as f64 - c);
        (-(x * x + y * y) / (2.0 * sigma * sigma)).exp()
    });
    Ok(normalized(kernel))
}

/// Disk kernel of `radius` pixels with fractional edge coverage by 4×4 sub-sampling
pub fn disk_kernel(radius: f64) -> Result<Array2<f64>> {
    if !(radius.is_finite() && radius > 0.0) {
        return Err(Error::Configuration(format!("disk radius must be > 0, got {radius}")));
    }
    let half = radius.ceil() as usize;
    let size = 2 * half + 1;
    let c = half as f64;
    const SUB: usize = 4;
    let kernel = Array2::from_shape_fn((size, size), |(i, j)| {
        let mut inside = 0usize;
        for si in 0..SUB {
            for sj in 0..SUB {
                let y = i as f64 - c - 0.5 + (si as f64 + 0.5) / SUB as f64;
                let x = j as f64 - c - 0.5 + (sj as f64 + 0.5) / SUB as f64;
                if x * x + y * y <= radius * radius {
                    inside += 1;
                }
            }
        }
        inside as f64 / (SUB * SUB) as f64
    });
    Ok(normalized(kernel))
}

/// Box kernel of `width` pixels, rounded to the nearest odd size
pub fn box_kernel(width: f64) -> Result<Array2<f64>> {
    if !(width.is_finite() && width > 0.0) {
        return Err(Error::Configuration(format!("box width must be > 0, got {width}")));
    }
    let half = ((width - 1.0) / 2.0).round().max(0.0) as usize;
    let size = 2 * half + 1;
    Ok(normalized(Array2::ones((size, size))))
}

/// Kernel of the given shape and width in pixels
pub fn make_kernel(kind: SmoothKernel, width: f64) -> Result<Array2<f64>> {
    match kind {
        SmoothKernel::Gauss => gaussian_kernel(width),
        SmoothKernel::Disk => disk_kernel(width),
        SmoothKernel::Box => box_kernel(width),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;

    #[test]
    fn test_convolve_same_identity_and_shift() {
        let image = array![[1.0, 2.0, 3.0], [4.0, 5.0, 6.0], [7.0, 8.0, 9.0]];
        let delta = array![[0.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 0.0]];
        let out = convolve2d_same(&image.view(), &delta.view()).unwrap();
        assert_eq!(out, image);

        // mass to the right of center moves flux to the right
        let right = array![[0.0, 0.0, 0.0], [0.0, 0.0, 1.0], [0.0, 0.0, 0.0]];
        let out = convolve2d_same(&image.view(), &right.view()).unwrap();
        assert_eq!(out, array![[0.0, 1.0, 2.0], [0.0, 4.0, 5.0], [0.0, 7.0, 8.0]]);
    }

    #[test]
    fn test_even_kernel_rejected() {
        let image = Array2::<f64>::zeros((4, 4));
        let k = Array2::<f64>::ones((2, 2));
        assert!(matches!(convolve2d_same(&image.view(), &k.view()), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_kernels_are_normalized() {
        for kind in [SmoothKernel::Gauss, SmoothKernel::Disk, SmoothKernel::Box] {
            let k = make_kernel(kind, 2.0).unwrap();
            assert_eq!(k.nrows() % 2, 1);
            assert_relative_eq!(k.sum(), 1.0, epsilon = 1e-12);
        }
        assert_eq!(box_kernel(3.0).unwrap().dim(), (3, 3));
        assert!(gaussian_kernel(0.0).is_err());
    }

    #[test]
    fn test_interior_flux_is_conserved() {
        let mut image = Array2::zeros((41, 41));
        image[[20, 20]] = 10.0;
        let k = gaussian_kernel(2.0).unwrap();
        let out = convolve2d_same(&image.view(), &k.view()).unwrap();
        assert_relative_eq!(out.sum(), 10.0, epsilon = 1e-10);
        assert!(out[[20, 20]] > out[[20, 22]]);
    }
}

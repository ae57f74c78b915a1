//! Annular integration of detector bins.

use std::ops::Range;

use ndarray::{s, Array2, ArrayView3};

/// Detector bins covered by `[min, max)` radians at `step` radians per bin.
///
/// The range is clamped to `bins`.
#[must_use]
pub fn bin_range(angles: [f64; 2], step: f64, bins: usize) -> Range<usize> {
    let to_bin = |angle: f64| -> usize {
        let bin = (angle / step).floor();
        if bin.is_nan() || bin <= 0.0 {
            0
        } else {
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let bin = bin as usize;
            bin.min(bins)
        }
    };
    let lo = to_bin(angles[0]);
    let hi = to_bin(angles[1]).max(lo);
    lo..hi
}

/// Sums the bins in `range` of a `[x, y, bin]` detector cube.
#[must_use]
pub fn integrate_bins(cube: ArrayView3<'_, f32>, range: Range<usize>) -> Array2<f32> {
    cube.slice(s![.., .., range]).sum_axis(ndarray::Axis(2))
}

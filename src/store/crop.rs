//! Frequency-axis windows for the 4-D datacubes.
//!
//! Three cases:
//!
//! - cropped: the first `k` samples strictly below `q_max = crop_4d_amax / λ`
//!   are counted from index zero; the data keeps the `2k` samples centred on
//!   the zero frequency of the fft-shifted axis, while the scale is labelled
//!   from offset zero;
//! - uncropped PRISM: the full axis;
//! - uncropped multislice: half the probe extent, starting a quarter of the
//!   way into the fft-shifted axis.

use ndarray::{Array4, Axis};
use tracing::warn;

use crate::error::StoreError;
use crate::meta::{Algorithm, SimulationMetadata};

/// Number of leading samples strictly below `q_max`.
///
/// Counting stops at the first sample that is not below the limit.
#[must_use]
pub fn count_below(axis: &[f32], q_max: f32) -> usize {
    axis.iter().take_while(|&&q| q < q_max).count()
}

/// Rotates `values` so the zero frequency moves to the centre.
#[must_use]
pub fn fftshift<T: Clone>(values: &[T]) -> Vec<T> {
    let n = values.len();
    let k = n / 2;
    values[n - k..].iter().chain(&values[..n - k]).cloned().collect()
}

/// Window applied to one frequency axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrequencyWindow {
    /// First stored sample.
    pub offset: usize,
    /// Number of stored samples.
    pub extent: usize,
    /// Whether the axis is fft-shifted before windowing.
    pub shifted: bool,
    /// Whether the scale is labelled from the first unshifted sample rather
    /// than from the stored samples.
    pub scale_from_zero: bool,
}

impl FrequencyWindow {
    /// Chooses the window for an axis of spatial frequencies.
    ///
    /// # Errors
    /// Returns `StoreError::InvalidDeclaration` if the window does not fit
    /// the axis.
    pub fn for_axis(
        meta: &SimulationMetadata,
        axis: &[f32],
        probe_extent: usize,
    ) -> Result<Self, StoreError> {
        let window = if meta.crop_4d_output {
            #[allow(clippy::cast_possible_truncation)]
            let q_max = (meta.crop_4d_amax / meta.wavelength()) as f32;
            let k = count_below(axis, q_max);
            let offset = (axis.len() / 2).checked_sub(k).ok_or_else(|| StoreError::InvalidDeclaration {
                kind: "Datacube".to_string(),
                reason: format!("{k} samples below q_max exceed half of axis length {}", axis.len()),
            })?;
            // TODO: label the cropped scale from the window offset instead of sample 0.
            warn!(q_max, "cropped datacube scale uses a zero frequency offset");
            Self {
                offset,
                extent: 2 * k,
                shifted: true,
                scale_from_zero: true,
            }
        } else {
            match meta.algorithm {
                Algorithm::Multislice => Self {
                    offset: probe_extent / 4,
                    extent: probe_extent / 2,
                    shifted: true,
                    scale_from_zero: false,
                },
                Algorithm::Prism => Self {
                    offset: 0,
                    extent: axis.len(),
                    shifted: false,
                    scale_from_zero: false,
                },
            }
        };

        if window.offset + window.extent > axis.len() {
            return Err(StoreError::InvalidDeclaration {
                kind: "Datacube".to_string(),
                reason: format!(
                    "frequency window {}+{} exceeds axis length {}",
                    window.offset,
                    window.extent,
                    axis.len()
                ),
            });
        }
        Ok(window)
    }

    /// Source positions in the unshifted axis of length `n`.
    #[must_use]
    pub fn source_indices(&self, n: usize) -> Vec<usize> {
        let shift = if self.shifted { n - n / 2 } else { 0 };
        (self.offset..self.offset + self.extent)
            .map(|i| (i + shift) % n.max(1))
            .collect()
    }

    /// Coordinates stored in the axis scale.
    #[must_use]
    pub fn scale(&self, axis: &[f32]) -> Vec<f32> {
        if self.scale_from_zero {
            return axis.iter().take(self.extent).copied().collect();
        }
        self.source_indices(axis.len())
            .into_iter()
            .map(|i| axis[i])
            .collect()
    }
}

/// Extracts the windowed region of a `[x, y, q_y, q_x]` datacube.
#[must_use]
pub fn crop_datacube(
    cube: &Array4<f32>,
    window_x: &FrequencyWindow,
    window_y: &FrequencyWindow,
) -> Array4<f32> {
    let (_, _, ny, nx) = cube.dim();
    cube.select(Axis(2), &window_y.source_indices(ny))
        .select(Axis(3), &window_x.source_indices(nx))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[allow(clippy::cast_precision_loss, clippy::cast_possible_wrap)]
    fn fft_axis(n: usize, dq: f32) -> Vec<f32> {
        (0..n)
            .map(|i| {
                let i = i as i64;
                let n = n as i64;
                let k = if i < (n + 1) / 2 { i } else { i - n };
                k as f32 * dq
            })
            .collect()
    }

    #[test]
    fn test_count_below_stops_at_first_failure() {
        assert_eq!(count_below(&[0.0, 0.1, 0.2, 0.5, 0.1], 0.3), 3);
        assert_eq!(count_below(&[1.0, 0.0], 0.3), 0);
        assert_eq!(count_below(&[], 0.3), 0);
    }

    #[test]
    fn test_fftshift() {
        assert_eq!(fftshift(&[0, 1, 2, -2, -1]), vec![-2, -1, 0, 1, 2]);
        assert_eq!(fftshift(&[0, 1, -2, -1]), vec![-2, -1, 0, 1]);
        assert!(fftshift::<i32>(&[]).is_empty());
    }

    #[test]
    fn test_crop_doubles_count() {
        let meta = SimulationMetadata {
            crop_4d_output: true,
            crop_4d_amax: 0.1,
            ..SimulationMetadata::default()
        };
        #[allow(clippy::cast_possible_truncation)]
        let q_max = (meta.crop_4d_amax / meta.wavelength()) as f32;
        let dq = q_max / 4.5;
        // Samples 0..=4 lie below q_max, so five count.
        let axis = fft_axis(32, dq);
        assert_eq!(count_below(&axis, q_max), 5);

        let window = FrequencyWindow::for_axis(&meta, &axis, 32).unwrap();
        assert_eq!(
            window,
            FrequencyWindow { offset: 11, extent: 10, shifted: true, scale_from_zero: true }
        );
        assert_eq!(window.scale(&axis), axis[..10].to_vec());
    }

    #[test]
    fn test_cropped_data_keeps_frequencies_around_zero() {
        let axis = fft_axis(10, 1.0);
        // 0, 1, 2 lie below 2.5
        let window = FrequencyWindow {
            offset: 10 / 2 - count_below(&axis, 2.5),
            extent: 2 * count_below(&axis, 2.5),
            shifted: true,
            scale_from_zero: true,
        };
        let kept: Vec<f32> = window.source_indices(10).into_iter().map(|i| axis[i]).collect();
        assert_eq!(kept, vec![-3.0, -2.0, -1.0, 0.0, 1.0, 2.0]);

        let cube = Array4::from_shape_fn((1, 1, 10, 10), |(_, _, y, x)| axis[y] * 100.0 + axis[x]);
        let out = crop_datacube(&cube, &window, &window);
        assert_eq!(out.dim(), (1, 1, 6, 6));
        assert_eq!(out[[0, 0, 3, 3]], 0.0);
        assert_eq!(out[[0, 0, 1, 4]], -199.0);
        assert!(out.iter().all(|v| v.abs() < 400.0));
    }

    #[test]
    fn test_crop_wider_than_half_axis_rejected() {
        let meta = SimulationMetadata {
            crop_4d_output: true,
            crop_4d_amax: 1.0e6,
            ..SimulationMetadata::default()
        };
        let axis = fft_axis(8, 1.0);
        assert!(FrequencyWindow::for_axis(&meta, &axis, 8).is_err());
    }

    #[test]
    fn test_uncropped_prism_keeps_full_axis() {
        let meta = SimulationMetadata::default();
        let axis = fft_axis(16, 0.1);
        let window = FrequencyWindow::for_axis(&meta, &axis, 64).unwrap();
        assert_eq!(window.extent, 16);
        assert_eq!(window.scale(&axis), axis);
    }

    #[test]
    fn test_uncropped_multislice_recentres() {
        let meta = SimulationMetadata {
            algorithm: Algorithm::Multislice,
            ..SimulationMetadata::default()
        };
        let axis = fft_axis(8, 1.0);
        let window = FrequencyWindow::for_axis(&meta, &axis, 8).unwrap();
        assert_eq!(
            window,
            FrequencyWindow { offset: 2, extent: 4, shifted: true, scale_from_zero: false }
        );
        // shifted axis: -4 -3 -2 -1 0 1 2 3
        assert_eq!(window.scale(&axis), vec![-2.0, -1.0, 0.0, 1.0]);
    }

    #[test]
    fn test_window_too_large_rejected() {
        let meta = SimulationMetadata {
            algorithm: Algorithm::Multislice,
            ..SimulationMetadata::default()
        };
        let axis = fft_axis(4, 1.0);
        assert!(FrequencyWindow::for_axis(&meta, &axis, 16).is_err());
    }

    #[test]
    fn test_crop_datacube_selects_window() {
        let cube = Array4::from_shape_fn((1, 1, 4, 4), |(_, _, y, x)| (y * 10 + x) as f32);
        let wx = FrequencyWindow { offset: 1, extent: 2, shifted: false, scale_from_zero: false };
        let wy = FrequencyWindow { offset: 0, extent: 2, shifted: true, scale_from_zero: false };
        let out = crop_datacube(&cube, &wx, &wy);
        assert_eq!(out.dim(), (1, 1, 2, 2));
        // y sources after shift: 2, 3
        assert_eq!(out[[0, 0, 0, 0]], 21.0);
        assert_eq!(out[[0, 0, 1, 1]], 32.0);
    }
}

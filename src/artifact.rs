//! Stage artifacts.
//!
//! Array layouts follow the computational order produced by the kernels:
//!
//! - potential: `[z, y, x]`
//! - compact operator: `[beam, y, x]`
//! - output: `[depth, x, y, detector_bin]`
//! - secondary (DPC centre of mass): `[depth, x, y, 2]`
//! - datacubes: one `[x, y, q_y, q_x]` array per depth, frequency axes unshifted

use ndarray::{Array3, Array4};
use num_complex::Complex32;

use crate::cache::StageId;
use crate::error::StageComputeError;

/// Sampling grids that accompany the output tensors.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct OutputGeometry {
    /// Probe positions along x (Å).
    pub xp: Vec<f32>,
    /// Probe positions along y (Å).
    pub yp: Vec<f32>,
    /// Spatial frequencies along x (Å⁻¹), unshifted FFT order.
    pub qx: Vec<f32>,
    /// Spatial frequencies along y (Å⁻¹), unshifted FFT order.
    pub qy: Vec<f32>,
    /// Outer angle of each detector bin (rad).
    pub detector_angles: Vec<f32>,
    /// Depth of each output plane (Å).
    pub depths: Vec<f32>,
    /// Extent of the initial probe array `[x, y]`.
    pub probe_extent: [usize; 2],
}

/// Tensors produced by the output stage.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputTensors {
    /// Detector-binned intensity.
    pub output: Array4<f32>,
    /// Centre-of-mass tensor, averaged by magnitude across passes.
    pub secondary: Option<Array4<f32>>,
    /// Full diffraction cubes, one per depth.
    pub datacubes: Vec<Array4<f32>>,
    /// Sampling grids.
    pub geometry: OutputGeometry,
}

impl OutputTensors {
    /// Checks tensor shapes against the geometry.
    ///
    /// # Errors
    /// Returns `StageComputeError::InvalidGeometry` on the first mismatch.
    pub fn check_shapes(&self) -> Result<(), StageComputeError> {
        let g = &self.geometry;
        let expected = [g.depths.len(), g.xp.len(), g.yp.len(), g.detector_angles.len()];
        if self.output.shape() != expected {
            return Err(shape_error("output", &expected, self.output.shape()));
        }

        if let Some(secondary) = &self.secondary {
            let expected = [g.depths.len(), g.xp.len(), g.yp.len(), 2];
            if secondary.shape() != expected {
                return Err(shape_error("secondary", &expected, secondary.shape()));
            }
        }

        if !self.datacubes.is_empty() {
            if self.datacubes.len() != g.depths.len() {
                return Err(StageComputeError::InvalidGeometry {
                    stage: StageId::Output,
                    reason: format!(
                        "{} datacubes for {} depths",
                        self.datacubes.len(),
                        g.depths.len()
                    ),
                });
            }
            let expected = [g.xp.len(), g.yp.len(), g.qy.len(), g.qx.len()];
            for cube in &self.datacubes {
                if cube.shape() != expected {
                    return Err(shape_error("datacube", &expected, cube.shape()));
                }
            }
        }

        Ok(())
    }
}

fn shape_error(what: &str, expected: &[usize], actual: &[usize]) -> StageComputeError {
    StageComputeError::InvalidGeometry {
        stage: StageId::Output,
        reason: format!("{what} has shape {actual:?}, expected {expected:?}"),
    }
}

/// The array(s) produced by one stage.
#[derive(Debug, Clone, PartialEq)]
pub enum StageArtifact {
    /// Potential volume `[z, y, x]`.
    Potential(Array3<f32>),
    /// Compact operator `[beam, y, x]`.
    CompactOperator(Array3<Complex32>),
    /// Final output tensors.
    Output(OutputTensors),
}

impl StageArtifact {
    /// The stage that produces this kind of artifact.
    #[must_use]
    pub const fn stage(&self) -> StageId {
        match self {
            Self::Potential(_) => StageId::Potential,
            Self::CompactOperator(_) => StageId::CompactOperator,
            Self::Output(_) => StageId::Output,
        }
    }

    /// Returns the potential volume, if this is one.
    #[must_use]
    pub const fn as_potential(&self) -> Option<&Array3<f32>> {
        match self {
            Self::Potential(v) => Some(v),
            _ => None,
        }
    }

    /// Returns the compact operator, if this is one.
    #[must_use]
    pub const fn as_operator(&self) -> Option<&Array3<Complex32>> {
        match self {
            Self::CompactOperator(v) => Some(v),
            _ => None,
        }
    }

    /// Returns the output tensors, if this is one.
    #[must_use]
    pub const fn as_output(&self) -> Option<&OutputTensors> {
        match self {
            Self::Output(v) => Some(v),
            _ => None,
        }
    }
}

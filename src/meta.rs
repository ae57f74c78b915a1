//! Simulation metadata.
//!
//! `SimulationMetadata` describes every parameter that influences a stage's
//! result. It is compared by value to decide whether a cached stage artifact
//! is still valid, and a blake3 fingerprint of its serialised form is kept
//! alongside the cached copy.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{StemError, StemResult, ValidationError};

/// Electron rest mass (kg).
const ELECTRON_MASS: f64 = 9.109_383e-31;
/// Elementary charge (C).
const ELEMENTARY_CHARGE: f64 = 1.602_177e-19;
/// Speed of light (m/s).
const SPEED_OF_LIGHT: f64 = 299_792_458.0;
/// Planck constant (J s).
const PLANCK: f64 = 6.626_07e-34;

/// Simulation algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    /// Potential, compact operator, then output.
    Prism,
    /// Potential, then output. No compact operator.
    Multislice,
}

impl Algorithm {
    /// Single-letter code used in the persisted parameter dump.
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::Prism => "p",
            Self::Multislice => "m",
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Prism => write!(f, "prism"),
            Self::Multislice => write!(f, "multislice"),
        }
    }
}

/// Content hash of a metadata value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MetadataFingerprint(blake3::Hash);

impl MetadataFingerprint {
    /// Hex form of the hash.
    #[must_use]
    pub fn to_hex(&self) -> String {
        self.0.to_hex().to_string()
    }
}

impl fmt::Display for MetadataFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &self.to_hex()[..16])
    }
}

/// Every parameter that influences a stage result.
///
/// Angles are in radians, lengths in Ångström and the beam energy in eV.
/// The persisted parameter dump converts angles to mrad and energy to keV.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationMetadata {
    pub output_path: PathBuf,
    pub algorithm: Algorithm,
    pub atoms_file: String,

    pub realspace_pixel_size: [f64; 2],
    pub potential_bound: f64,
    pub slice_thickness: f64,
    pub num_slices: u32,
    pub z_start_output: f64,
    pub interpolation_factor: [u32; 2],

    pub energy: f64,
    pub alpha_beam_max: f64,
    pub probe_step: [f64; 2],
    pub probe_defocus: f64,
    pub c3: f64,
    pub c5: f64,
    pub probe_semiangle: f64,
    pub detector_angle_step: f64,
    pub probe_tilt: [f64; 2],

    pub cell_dim: [f64; 3],
    pub tile: [u32; 3],
    pub scan_window_x: [f64; 2],
    pub scan_window_y: [f64; 2],
    pub scan_window_x_real: Option<[f64; 2]>,
    pub scan_window_y_real: Option<[f64; 2]>,
    pub integration_angles: Option<[f64; 2]>,

    pub include_thermal_effects: bool,
    pub include_occupancy: bool,
    pub nyquist_sampling: bool,

    pub save_2d_output: bool,
    pub save_3d_output: bool,
    pub save_4d_output: bool,
    pub save_dpc_com: bool,
    pub save_potential_slices: bool,
    pub save_smatrix: bool,
    pub crop_4d_output: bool,
    pub crop_4d_amax: f64,

    pub num_passes: u32,
    pub pass_index: u32,
    pub random_seed: u64,
}

impl Default for SimulationMetadata {
    fn default() -> Self {
        Self {
            output_path: PathBuf::from("output.h5"),
            algorithm: Algorithm::Prism,
            atoms_file: String::new(),
            realspace_pixel_size: [0.1, 0.1],
            potential_bound: 3.0,
            slice_thickness: 2.0,
            num_slices: 0,
            z_start_output: 0.0,
            interpolation_factor: [4, 4],
            energy: 80e3,
            alpha_beam_max: 0.024,
            probe_step: [0.25, 0.25],
            probe_defocus: 0.0,
            c3: 0.0,
            c5: 0.0,
            probe_semiangle: 0.020,
            detector_angle_step: 0.001,
            probe_tilt: [0.0, 0.0],
            cell_dim: [20.0, 20.0, 20.0],
            tile: [1, 1, 1],
            scan_window_x: [0.0, 0.99999],
            scan_window_y: [0.0, 0.99999],
            scan_window_x_real: None,
            scan_window_y_real: None,
            integration_angles: None,
            include_thermal_effects: true,
            include_occupancy: true,
            nyquist_sampling: false,
            save_2d_output: false,
            save_3d_output: true,
            save_4d_output: false,
            save_dpc_com: false,
            save_potential_slices: false,
            save_smatrix: false,
            crop_4d_output: false,
            crop_4d_amax: 0.1,
            num_passes: 1,
            pass_index: 0,
            random_seed: 0,
        }
    }
}

impl SimulationMetadata {
    /// Loads metadata from a JSON file and validates it.
    ///
    /// Missing fields take their default values.
    ///
    /// # Errors
    /// Returns `ValidationError::Unreadable` if the file cannot be read or
    /// parsed, or any validation error from [`SimulationMetadata::validate`].
    pub fn load(path: impl AsRef<Path>) -> StemResult<Self> {
        let path = path.as_ref();
        let bytes = fs::read(path).map_err(|e| ValidationError::Unreadable {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        let meta: Self = serde_json::from_slice(&bytes).map_err(|e| ValidationError::Unreadable {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        meta.validate()
    }

    /// Validates the physical and bookkeeping parameters.
    ///
    /// # Errors
    /// Returns the first failing check as a `ValidationError`.
    pub fn validate(self) -> StemResult<Self> {
        if self.num_passes == 0 {
            return Err(ValidationError::ZeroPasses.into());
        }

        let positive = [
            ("energy", self.energy),
            ("realspace_pixel_size.x", self.realspace_pixel_size[0]),
            ("realspace_pixel_size.y", self.realspace_pixel_size[1]),
            ("slice_thickness", self.slice_thickness),
            ("probe_step.x", self.probe_step[0]),
            ("probe_step.y", self.probe_step[1]),
            ("detector_angle_step", self.detector_angle_step),
        ];
        for (field, value) in positive {
            if value.is_nan() || value <= 0.0 {
                return Err(ValidationError::NotPositive { field, value }.into());
            }
        }

        if self.crop_4d_output && (self.crop_4d_amax.is_nan() || self.crop_4d_amax <= 0.0) {
            return Err(ValidationError::NotPositive {
                field: "crop_4d_amax",
                value: self.crop_4d_amax,
            }
            .into());
        }

        for (field, [min, max]) in [
            ("scan_window_x", self.scan_window_x),
            ("scan_window_y", self.scan_window_y),
        ] {
            if min > max {
                return Err(ValidationError::InvalidRange { field, min, max }.into());
            }
        }

        if let Some([min, max]) = self.integration_angles {
            if min > max {
                return Err(ValidationError::InvalidRange {
                    field: "integration_angles",
                    min,
                    max,
                }
                .into());
            }
        }

        Ok(self)
    }

    /// Relativistic electron wavelength in Ångström.
    #[must_use]
    pub fn wavelength(&self) -> f64 {
        let e0 = self.energy;
        PLANCK / (2.0 * ELECTRON_MASS * ELEMENTARY_CHARGE * e0).sqrt()
            / (1.0 + ELEMENTARY_CHARGE * e0 / 2.0 / ELECTRON_MASS / SPEED_OF_LIGHT / SPEED_OF_LIGHT)
                .sqrt()
            * 1e10
    }

    /// Blake3 hash of the JSON serialisation.
    ///
    /// # Errors
    /// Returns `StemError::Internal` if serialisation fails.
    pub fn fingerprint(&self) -> StemResult<MetadataFingerprint> {
        let mut hasher = blake3::Hasher::new();
        serde_json::to_writer(&mut hasher, self)
            .map_err(|e| StemError::internal(format!("metadata serialisation failed: {e}")))?;
        Ok(MetadataFingerprint(hasher.finalize()))
    }

    /// Returns a copy for frozen pass `pass_index` with the given seed.
    #[must_use]
    pub fn for_pass(&self, pass_index: u32, random_seed: u64) -> Self {
        Self {
            pass_index,
            random_seed,
            ..self.clone()
        }
    }
}

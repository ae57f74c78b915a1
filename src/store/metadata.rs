//! Parameter dump and run log.
//!
//! Every parameter lands as one attribute on
//! `metadata/metadata_0/original/simulation_parameters`, under the short
//! names used by the file format. Angles are written in mrad and the beam
//! energy in keV.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::StoreError;
use crate::meta::SimulationMetadata;

use super::container::AttrValue;
use super::schema::{LOG, SIMULATION_PARAMETERS};
use super::StructuredStore;

/// One recorded run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunRecord {
    /// Unique id of the run.
    pub run_id: Uuid,
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// Number of frozen passes averaged.
    pub passes: u32,
    /// Hex fingerprint of the base metadata.
    pub fingerprint: String,
    /// Named comparison metrics, one attribute each.
    pub metrics: Vec<(String, f64)>,
}

fn flag(value: bool) -> AttrValue {
    AttrValue::Int(i64::from(value))
}

fn int(value: u32) -> AttrValue {
    AttrValue::Int(i64::from(value))
}

fn pair(values: [f64; 2]) -> AttrValue {
    AttrValue::FloatVec(values.to_vec())
}

/// Attribute list for `meta`, in write order.
#[must_use]
pub fn parameter_attributes(meta: &SimulationMetadata) -> Vec<(&'static str, AttrValue)> {
    let mut attrs = vec![
        ("i", AttrValue::Text(meta.atoms_file.clone())),
        ("a", AttrValue::Text(meta.algorithm.code().to_string())),
        ("fx", int(meta.interpolation_factor[0])),
        ("fy", int(meta.interpolation_factor[1])),
        ("F", int(meta.num_passes)),
        ("ns", int(meta.num_slices)),
        ("te", flag(meta.include_thermal_effects)),
        ("oc", flag(meta.include_occupancy)),
        ("3D", flag(meta.save_3d_output)),
        ("4D", flag(meta.save_4d_output)),
        ("DPC", flag(meta.save_dpc_com)),
        ("ps", flag(meta.save_potential_slices)),
        ("nqs", flag(meta.nyquist_sampling)),
        ("px", AttrValue::Float(meta.realspace_pixel_size[0])),
        ("py", AttrValue::Float(meta.realspace_pixel_size[1])),
        ("P", AttrValue::Float(meta.potential_bound)),
        ("s", AttrValue::Float(meta.slice_thickness)),
        ("zs", AttrValue::Float(meta.z_start_output)),
        ("rx", AttrValue::Float(meta.probe_step[0])),
        ("ry", AttrValue::Float(meta.probe_step[1])),
        ("df", AttrValue::Float(meta.probe_defocus)),
        ("C3", AttrValue::Float(meta.c3)),
        ("C5", AttrValue::Float(meta.c5)),
        ("tx", AttrValue::Float(meta.probe_tilt[0] * 1e3)),
        ("ty", AttrValue::Float(meta.probe_tilt[1] * 1e3)),
        ("E", AttrValue::Float(meta.energy / 1e3)),
        ("A", AttrValue::Float(meta.alpha_beam_max * 1e3)),
        ("sa", AttrValue::Float(meta.probe_semiangle * 1e3)),
        ("d", AttrValue::Float(meta.detector_angle_step * 1e3)),
        ("c", AttrValue::FloatVec(meta.cell_dim.to_vec())),
        (
            "t",
            AttrValue::IntVec(meta.tile.iter().map(|&t| i64::from(t)).collect()),
        ),
        ("wx", pair(meta.scan_window_x)),
        ("wy", pair(meta.scan_window_y)),
    ];

    if let Some(w) = meta.scan_window_x_real {
        attrs.push(("wxr", pair(w)));
    }
    if let Some(w) = meta.scan_window_y_real {
        attrs.push(("wyr", pair(w)));
    }
    if let Some([min, max]) = meta.integration_angles {
        attrs.push(("2D", pair([min * 1e3, max * 1e3])));
    }
    attrs
}

impl StructuredStore {
    /// Writes the flat parameter dump for `meta`.
    ///
    /// # Errors
    /// Returns a container error if the layout is missing.
    pub fn write_simulation_parameters(&self, meta: &SimulationMetadata) -> Result<(), StoreError> {
        let _guard = self.lock_writes("store.write_simulation_parameters")?;
        if !self.container.exists(SIMULATION_PARAMETERS)? {
            self.container.create_group(SIMULATION_PARAMETERS)?;
        }
        for (name, value) in parameter_attributes(meta) {
            self.container.set_attr(SIMULATION_PARAMETERS, name, value)?;
        }
        self.container.flush()
    }

    /// Records a run on the log group.
    ///
    /// # Errors
    /// Returns a container error if the layout is missing.
    pub fn write_run_log(&self, record: &RunRecord) -> Result<(), StoreError> {
        let _guard = self.lock_writes("store.write_run_log")?;
        self.container
            .set_attr(LOG, "run_id", AttrValue::Text(record.run_id.to_string()))?;
        self.container
            .set_attr(LOG, "timestamp", AttrValue::Text(record.started_at.to_rfc3339()))?;
        self.container.set_attr(LOG, "passes", int(record.passes))?;
        self.container
            .set_attr(LOG, "fingerprint", AttrValue::Text(record.fingerprint.clone()))?;
        for (name, value) in &record.metrics {
            self.container.set_attr(LOG, name, AttrValue::Float(*value))?;
        }
        self.container.flush()
    }
}

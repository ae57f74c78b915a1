//! Fixed output layout and dataset declaration.
//!
//! ```text
//! 4DSTEM_simulation                (emd_group_type = 2, version 0.5)
//! ├── data
//! │   ├── datacubes                CBED_array_depthNNNN/datacube
//! │   ├── diffractionslices
//! │   ├── realslices               virtual_detector_depthNNNN, annular_detector_depthNNNN,
//! │   │                            DPC_CoM_depthNNNN, smatrix_fpNNNN, ppotential_fpNNNN
//! │   ├── pointlists
//! │   ├── pointlistarrays
//! │   └── supergroups              vd_depth_series
//! ├── log
//! └── metadata
//!     └── metadata_0
//!         ├── original/{shortlist, all, simulation_parameters}
//!         └── microscope, sample, user, calibration, comments
//! ```
//!
//! Every data group carries `emd_group_type = 1` and `metadata = 0`. Axis
//! scales are sibling datasets `dim1..dimN` with `name` and `units`
//! attributes.

use crate::error::StoreError;

use super::container::{AttrValue, Container, DataType, Values};

/// Root group of the output file.
pub const ROOT: &str = "4DSTEM_simulation";
/// Parent of the 4-D datacube groups.
pub const DATACUBES: &str = "4DSTEM_simulation/data/datacubes";
/// Parent of diffraction-slice groups (unused, kept for format compatibility).
pub const DIFFRACTION_SLICES: &str = "4DSTEM_simulation/data/diffractionslices";
/// Parent of the real-space slice groups.
pub const REALSLICES: &str = "4DSTEM_simulation/data/realslices";
/// Parent of point lists (unused, kept for format compatibility).
pub const POINTLISTS: &str = "4DSTEM_simulation/data/pointlists";
/// Parent of point list arrays (unused, kept for format compatibility).
pub const POINTLIST_ARRAYS: &str = "4DSTEM_simulation/data/pointlistarrays";
/// Parent of supergroups built by stitching.
pub const SUPERGROUPS: &str = "4DSTEM_simulation/data/supergroups";
/// Metadata root.
pub const METADATA: &str = "4DSTEM_simulation/metadata";
/// Run log.
pub const LOG: &str = "4DSTEM_simulation/log";
/// Node holding the flat parameter dump.
pub const SIMULATION_PARAMETERS: &str =
    "4DSTEM_simulation/metadata/metadata_0/original/simulation_parameters";

/// Format version written on the root group.
pub const VERSION_MAJOR: i64 = 0;
/// Format version written on the root group.
pub const VERSION_MINOR: i64 = 5;

/// `emd_group_type` of a data group.
pub const GROUP_TYPE_DATA: i64 = 1;
/// `emd_group_type` of the root group.
pub const GROUP_TYPE_ROOT: i64 = 2;
/// `emd_group_type` of a supergroup.
pub const GROUP_TYPE_SUPERGROUP: i64 = 3;

const LAYOUT_GROUPS: [&str; 19] = [
    ROOT,
    "4DSTEM_simulation/data",
    DATACUBES,
    DIFFRACTION_SLICES,
    REALSLICES,
    POINTLISTS,
    POINTLIST_ARRAYS,
    SUPERGROUPS,
    LOG,
    METADATA,
    "4DSTEM_simulation/metadata/metadata_0",
    "4DSTEM_simulation/metadata/metadata_0/original",
    "4DSTEM_simulation/metadata/metadata_0/original/shortlist",
    "4DSTEM_simulation/metadata/metadata_0/original/all",
    "4DSTEM_simulation/metadata/metadata_0/microscope",
    "4DSTEM_simulation/metadata/metadata_0/sample",
    "4DSTEM_simulation/metadata/metadata_0/user",
    "4DSTEM_simulation/metadata/metadata_0/calibration",
    "4DSTEM_simulation/metadata/metadata_0/comments",
];

/// Creates the fixed group layout and root attributes.
///
/// # Errors
/// Fails if any group already exists.
pub fn setup_layout(container: &dyn Container) -> Result<(), StoreError> {
    for group in LAYOUT_GROUPS {
        container.create_group(group)?;
    }
    container.set_attr(ROOT, "version_major", AttrValue::Int(VERSION_MAJOR))?;
    container.set_attr(ROOT, "version_minor", AttrValue::Int(VERSION_MINOR))?;
    container.set_attr(ROOT, "emd_group_type", AttrValue::Int(GROUP_TYPE_ROOT))?;
    Ok(())
}

/// Kind of an output dataset, fixed at declaration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DatasetKind {
    /// `[R_x, R_y, Q_x, Q_y]` diffraction cube per depth.
    Datacube,
    /// `[R_x, R_y, bin_outer_angle]` detector cube per depth.
    DetectorCube,
    /// `[R_x, R_y]` annular-integrated slice per depth.
    AnnularSlice,
    /// `[R_x, R_y, component]` centre-of-mass slice per depth.
    DipoleSlice,
    /// `[R_x, R_y, beam_number]` complex compact operator per pass.
    OperatorSlice,
    /// `[R_x, R_y, R_z]` potential slices per pass.
    PotentialSlices,
}

impl DatasetKind {
    /// All kinds.
    pub const ALL: [Self; 6] = [
        Self::Datacube,
        Self::DetectorCube,
        Self::AnnularSlice,
        Self::DipoleSlice,
        Self::OperatorSlice,
        Self::PotentialSlices,
    ];

    /// Number of axes.
    #[must_use]
    pub const fn rank(self) -> usize {
        match self {
            Self::Datacube => 4,
            Self::AnnularSlice => 2,
            Self::DetectorCube | Self::DipoleSlice | Self::OperatorSlice | Self::PotentialSlices => 3,
        }
    }

    /// Group holding datasets of this kind.
    #[must_use]
    pub const fn parent(self) -> &'static str {
        match self {
            Self::Datacube => DATACUBES,
            _ => REALSLICES,
        }
    }

    /// Group name prefix; the group index follows as four digits.
    #[must_use]
    pub const fn base_name(self) -> &'static str {
        match self {
            Self::Datacube => "CBED_array_depth",
            Self::DetectorCube => "virtual_detector_depth",
            Self::AnnularSlice => "annular_detector_depth",
            Self::DipoleSlice => "DPC_CoM_depth",
            Self::OperatorSlice => "smatrix_fp",
            Self::PotentialSlices => "ppotential_fp",
        }
    }

    /// Name of the payload dataset inside the group.
    #[must_use]
    pub const fn dataset_name(self) -> &'static str {
        match self {
            Self::Datacube => "datacube",
            _ => "realslice",
        }
    }

    /// Element type of the payload.
    #[must_use]
    pub const fn dtype(self) -> DataType {
        match self {
            Self::OperatorSlice => DataType::Complex32,
            _ => DataType::Float32,
        }
    }

    /// Group path for index `index`.
    #[must_use]
    pub fn group_path(self, index: usize) -> String {
        format!("{}/{}{}", self.parent(), self.base_name(), digit_string(index))
    }
}

/// Four-digit zero-padded index.
#[must_use]
pub fn digit_string(index: usize) -> String {
    format!("{index:04}")
}

/// Coordinates of one axis.
#[derive(Debug, Clone, PartialEq)]
pub enum AxisScale {
    /// Numeric coordinates.
    Values(Vec<f32>),
    /// Labelled components.
    Labels(Vec<String>),
}

impl AxisScale {
    /// Number of coordinates.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Values(v) => v.len(),
            Self::Labels(v) => v.len(),
        }
    }

    /// Returns true if there are no coordinates.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn to_values(&self) -> Values {
        match self {
            Self::Values(v) => Values::Float32(v.clone()),
            Self::Labels(v) => Values::Text(v.clone()),
        }
    }
}

/// Name, units and coordinates of one axis (a dimension scale).
#[derive(Debug, Clone, PartialEq)]
pub struct AxisDescriptor {
    /// Axis name, e.g. `R_x`.
    pub name: String,
    /// Units, e.g. `[n_m]`.
    pub units: String,
    /// Coordinates.
    pub scale: AxisScale,
}

impl AxisDescriptor {
    /// Numeric axis.
    #[must_use]
    pub fn values(name: &str, units: &str, values: Vec<f32>) -> Self {
        Self {
            name: name.to_string(),
            units: units.to_string(),
            scale: AxisScale::Values(values),
        }
    }

    /// Labelled axis; units are empty.
    #[must_use]
    pub fn labels(name: &str, labels: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            units: String::new(),
            scale: AxisScale::Labels(labels.iter().map(|s| (*s).to_string()).collect()),
        }
    }

    /// Number of coordinates.
    #[must_use]
    pub fn len(&self) -> usize {
        self.scale.len()
    }

    /// Returns true if there are no coordinates.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.scale.is_empty()
    }
}

/// A declared dataset.
#[derive(Debug, Clone, PartialEq)]
pub struct DatasetDescriptor {
    /// Kind chosen at declaration.
    pub kind: DatasetKind,
    /// Group index (depth or pass).
    pub index: usize,
    /// Path of the data group.
    pub group: String,
    /// Path of the payload dataset.
    pub path: String,
    /// Payload shape.
    pub shape: Vec<usize>,
    /// One descriptor per axis.
    pub axes: Vec<AxisDescriptor>,
}

impl DatasetDescriptor {
    /// Number of payload elements.
    #[must_use]
    pub fn len(&self) -> usize {
        self.shape.iter().product()
    }

    /// Returns true if the payload has no elements.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Writes a `dimN` scale dataset with `name` and `units` attributes.
pub(crate) fn write_axis_scale(
    container: &dyn Container,
    path: &str,
    axis: &AxisDescriptor,
) -> Result<(), StoreError> {
    let values = axis.scale.to_values();
    container.create_dataset(path, &[axis.len()], values.dtype())?;
    container.write_all(path, values)?;
    container.set_attr(path, "name", AttrValue::Text(axis.name.clone()))?;
    container.set_attr(path, "units", AttrValue::Text(axis.units.clone()))?;
    Ok(())
}

/// Declares a dataset: creates its group, tag attributes, zero-filled
/// payload and axis scales.
///
/// `output_depth` is recorded on depth-indexed kinds.
///
/// # Errors
/// Returns `StoreError::InvalidDeclaration` if the rank or an axis length
/// does not match `shape`, and any container error.
pub fn declare_dataset(
    container: &dyn Container,
    kind: DatasetKind,
    index: usize,
    shape: &[usize],
    axes: Vec<AxisDescriptor>,
    output_depth: Option<f64>,
) -> Result<DatasetDescriptor, StoreError> {
    let invalid = |reason: String| StoreError::InvalidDeclaration {
        kind: format!("{kind:?}"),
        reason,
    };

    if shape.len() != kind.rank() {
        return Err(invalid(format!(
            "rank {} given, {} expected",
            shape.len(),
            kind.rank()
        )));
    }
    if axes.len() != shape.len() {
        return Err(invalid(format!(
            "{} axis descriptors for rank {}",
            axes.len(),
            shape.len()
        )));
    }
    for (i, (axis, &extent)) in axes.iter().zip(shape).enumerate() {
        if axis.len() != extent {
            return Err(invalid(format!(
                "axis {} ({}) has {} coordinates for extent {extent}",
                i + 1,
                axis.name,
                axis.len()
            )));
        }
    }
    if kind == DatasetKind::DipoleSlice && shape[2] != 2 {
        return Err(invalid(format!("component axis has extent {}, expected 2", shape[2])));
    }

    let group = kind.group_path(index);
    container.create_group(&group)?;
    container.set_attr(&group, "emd_group_type", AttrValue::Int(GROUP_TYPE_DATA))?;
    container.set_attr(&group, "metadata", AttrValue::Int(0))?;
    if kind == DatasetKind::AnnularSlice {
        container.set_attr(&group, "depth", AttrValue::Int(1))?;
    }
    if let Some(depth) = output_depth {
        container.set_attr(&group, "output_depth", AttrValue::Float(depth))?;
    }

    let path = format!("{group}/{}", kind.dataset_name());
    container.create_dataset(&path, shape, kind.dtype())?;

    for (i, axis) in axes.iter().enumerate() {
        write_axis_scale(container, &format!("{group}/dim{}", i + 1), axis)?;
    }

    Ok(DatasetDescriptor {
        kind,
        index,
        group,
        path,
        shape: shape.to_vec(),
        axes,
    })
}

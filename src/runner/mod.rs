//! Simulation runs.
//!
//! A run is one full calculation sequence from pre-flight to the depth
//! series:
//!
//! ```text
//!   pre-flight ─► calculation lock ─► store ─► passes ─► averaged outputs
//!   (no locks)                                   │              │
//!                                                ▼              ▼
//!                                    4-D cubes accumulated   3-D, 2-D, DPC
//!                                    in the store per pass   written once
//!                                                               │
//!                                    parameters, run log, depth series
//! ```

pub mod integrate;
#[cfg(feature = "persistent")]
pub mod runtime;

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use ndarray::{s, Array4};
use tracing::{info, warn};
use uuid::Uuid;

use crate::artifact::{OutputGeometry, StageArtifact};
use crate::cache::StageId;
use crate::config::StoreConfig;
use crate::error::{StageComputeError, StemResult};
use crate::meta::{Algorithm, SimulationMetadata};
use crate::metrics::compare_algorithm_probes;
use crate::pipeline::{
    AveragedOutput, CalculationGuard, CalculationPipeline, FrozenPassAccumulator, PassOutcome,
    RandomSeedMutator,
};
use crate::store::{
    crop_datacube, restride_zyx, AxisDescriptor, DatasetDescriptor, DatasetKind,
    FrequencyWindow, RunRecord, StructuredStore, Values, VirtualMapping,
};

#[cfg(feature = "persistent")]
use crate::pipeline::{prepare_output, OverwriteConfirm};

pub use integrate::{bin_range, integrate_bins};
#[cfg(feature = "persistent")]
pub use runtime::{RunHandle, SimulationRuntime};

const SCAN_UNITS: &str = "[n_m]";
const FREQUENCY_UNITS: &str = "[n_m^-1]";

/// What a finished run wrote.
#[derive(Debug, Clone)]
pub struct RunSummary {
    /// Id recorded in the run log.
    pub run_id: Uuid,
    /// Output file.
    pub output_path: PathBuf,
    /// Frozen passes averaged.
    pub passes: u32,
    /// Hex fingerprint of the base metadata.
    pub fingerprint: String,
    /// Payload paths of every declared dataset, in declaration order.
    pub datasets: Vec<String>,
    /// Depth-series supergroup, if 3-D output was saved.
    pub depth_series: Option<VirtualMapping>,
    /// Probe comparison metrics recorded in the run log.
    pub metrics: Vec<(String, f64)>,
}

/// Runs full simulations through one pipeline.
#[derive(Debug)]
pub struct Simulation {
    pipeline: Arc<CalculationPipeline>,
    store_config: StoreConfig,
}

impl Simulation {
    /// Creates a runner over `pipeline`.
    #[must_use]
    pub fn new(pipeline: Arc<CalculationPipeline>, store_config: StoreConfig) -> Self {
        Self {
            pipeline,
            store_config,
        }
    }

    /// The underlying pipeline.
    #[must_use]
    pub fn pipeline(&self) -> &Arc<CalculationPipeline> {
        &self.pipeline
    }

    /// Runs a simulation into a new file at `meta.output_path`.
    ///
    /// The output path is checked before any lock is taken; an existing file
    /// is replaced only if `confirm` accepts.
    ///
    /// # Errors
    /// Returns an `OutputPathError` from the pre-flight, a
    /// `StageComputeError` from any pass, or a store error. Store content
    /// flushed before a failure stays on disk.
    #[cfg(feature = "persistent")]
    pub fn run(&self, meta: SimulationMetadata, confirm: &dyn OverwriteConfirm) -> StemResult<RunSummary> {
        let meta = meta.validate()?;
        prepare_output(&meta.output_path, confirm)?;

        let guard = self.pipeline.lock()?;
        let store = StructuredStore::create_file(&meta.output_path, self.store_config.clone())?;
        self.execute(&guard, &meta, &store)
    }

    /// Runs a simulation into an existing store with the layout set up.
    ///
    /// # Errors
    /// See [`Simulation::run`]; no pre-flight is performed.
    pub fn run_with_store(&self, meta: SimulationMetadata, store: &StructuredStore) -> StemResult<RunSummary> {
        let meta = meta.validate()?;
        let guard = self.pipeline.lock()?;
        self.execute(&guard, &meta, store)
    }

    fn execute(
        &self,
        guard: &CalculationGuard<'_>,
        meta: &SimulationMetadata,
        store: &StructuredStore,
    ) -> StemResult<RunSummary> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let fingerprint = meta.fingerprint()?;
        let reporter = guard.reporter();
        info!(
            %run_id,
            path = %meta.output_path.display(),
            algorithm = %meta.algorithm,
            stages = ?StageId::chain(meta.algorithm),
            passes = meta.num_passes,
            %fingerprint,
            "simulation started"
        );
        reporter.describe(&format!("running {} frozen passes", meta.num_passes));

        let mut datasets = Vec::new();
        let mut datacubes: Vec<DatasetDescriptor> = Vec::new();
        let mut windows: Option<(FrequencyWindow, FrequencyWindow)> = None;
        let mut geometry: Option<OutputGeometry> = None;

        let mut frozen = FrozenPassAccumulator::new(RandomSeedMutator::from_seed(meta.random_seed));
        let averaged = frozen.run(guard, meta, |pass| {
            if pass.index == 0 {
                geometry = Some(pass.tensors.geometry.clone());
                if meta.save_4d_output {
                    let (wx, wy, descs) = declare_datacubes(store, meta, &pass)?;
                    datasets.extend(descs.iter().map(|d| d.path.clone()));
                    datacubes = descs;
                    windows = Some((wx, wy));
                }
            }

            if let Some((wx, wy)) = &windows {
                for (desc, cube) in datacubes.iter().zip(&pass.tensors.datacubes) {
                    let cropped = crop_datacube(cube, wx, wy);
                    store.accumulate_datacube(desc, [0, 0], &cropped, meta.num_passes)?;
                }
            }

            if meta.save_potential_slices {
                let desc = write_potential_slices(guard, store, &pass)?;
                datasets.push(desc.path);
            }
            if meta.save_smatrix && meta.algorithm == Algorithm::Prism {
                let desc = write_operator(guard, store, &pass)?;
                datasets.push(desc.path);
            }

            #[allow(clippy::cast_precision_loss)]
            let fraction = (pass.index + 1) as f32 / meta.num_passes.max(1) as f32;
            reporter.progress(fraction);
            Ok(())
        })?;

        let geometry = geometry.unwrap_or_default();
        datasets.extend(write_averaged(store, meta, &geometry, &averaged)?);

        let metrics = compare_algorithm_probes(guard, meta)?;

        store.write_simulation_parameters(meta)?;
        store.write_run_log(&RunRecord {
            run_id,
            started_at,
            passes: averaged.passes,
            fingerprint: fingerprint.to_hex(),
            metrics: metrics.clone(),
        })?;

        let depth_series = if meta.save_3d_output {
            store.depth_series()?
        } else {
            None
        };

        info!(%run_id, datasets = datasets.len(), "simulation finished");
        reporter.describe("simulation finished");
        Ok(RunSummary {
            run_id,
            output_path: meta.output_path.clone(),
            passes: averaged.passes,
            fingerprint: fingerprint.to_hex(),
            datasets,
            depth_series,
            metrics,
        })
    }
}

fn scan_axes(g: &OutputGeometry) -> Vec<AxisDescriptor> {
    vec![
        AxisDescriptor::values("R_x", SCAN_UNITS, g.xp.clone()),
        AxisDescriptor::values("R_y", SCAN_UNITS, g.yp.clone()),
    ]
}

fn missing(reason: &str) -> StageComputeError {
    StageComputeError::InvalidGeometry {
        stage: StageId::Output,
        reason: reason.to_string(),
    }
}

fn declare_datacubes(
    store: &StructuredStore,
    meta: &SimulationMetadata,
    pass: &PassOutcome<'_>,
) -> StemResult<(FrequencyWindow, FrequencyWindow, Vec<DatasetDescriptor>)> {
    let g = &pass.tensors.geometry;
    if pass.tensors.datacubes.is_empty() {
        return Err(missing("4-D output requested but the kernel produced no datacubes").into());
    }
    let wx = FrequencyWindow::for_axis(meta, &g.qx, g.probe_extent[0])?;
    let wy = FrequencyWindow::for_axis(meta, &g.qy, g.probe_extent[1])?;
    let shape = [g.xp.len(), g.yp.len(), wx.extent, wy.extent];

    let mut descs = Vec::with_capacity(g.depths.len());
    for (d, &depth) in g.depths.iter().enumerate() {
        let mut axes = scan_axes(g);
        axes.push(AxisDescriptor::values("Q_x", FREQUENCY_UNITS, wx.scale(&g.qx)));
        axes.push(AxisDescriptor::values("Q_y", FREQUENCY_UNITS, wy.scale(&g.qy)));
        descs.push(store.declare_dataset(
            DatasetKind::Datacube,
            d,
            &shape,
            axes,
            Some(f64::from(depth)),
        )?);
    }
    Ok((wx, wy, descs))
}

#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
fn grid(n: usize, step: f64) -> Vec<f32> {
    (0..n).map(|i| (i as f64 * step) as f32).collect()
}

fn write_potential_slices(
    guard: &CalculationGuard<'_>,
    store: &StructuredStore,
    pass: &PassOutcome<'_>,
) -> StemResult<DatasetDescriptor> {
    let artifact = guard.run_stage(StageId::Potential, pass.meta)?;
    let StageArtifact::Potential(volume) = artifact.as_ref() else {
        return Err(missing("potential stage returned another artifact").into());
    };
    let (nz, ny, nx) = volume.dim();
    let m = pass.meta;
    let axes = vec![
        AxisDescriptor::values("R_x", SCAN_UNITS, grid(nx, m.realspace_pixel_size[0])),
        AxisDescriptor::values("R_y", SCAN_UNITS, grid(ny, m.realspace_pixel_size[1])),
        AxisDescriptor::values("R_z", SCAN_UNITS, grid(nz, m.slice_thickness)),
    ];
    let desc = store.declare_dataset(
        DatasetKind::PotentialSlices,
        pass.index as usize,
        &[nx, ny, nz],
        axes,
        None,
    )?;
    store.write_dense(&desc, Values::Float32(restride_zyx(volume)))?;
    Ok(desc)
}

fn write_operator(
    guard: &CalculationGuard<'_>,
    store: &StructuredStore,
    pass: &PassOutcome<'_>,
) -> StemResult<DatasetDescriptor> {
    let artifact = guard.run_stage(StageId::CompactOperator, pass.meta)?;
    let StageArtifact::CompactOperator(operator) = artifact.as_ref() else {
        return Err(missing("compact-operator stage returned another artifact").into());
    };
    let (beams, ny, nx) = operator.dim();
    let m = pass.meta;
    let axes = vec![
        AxisDescriptor::values("R_x", "[Å]", grid(nx, m.realspace_pixel_size[0])),
        AxisDescriptor::values("R_y", "[Å]", grid(ny, m.realspace_pixel_size[1])),
        AxisDescriptor::values("beam_number", "[none]", grid(beams, 1.0)),
    ];
    let desc = store.declare_dataset(
        DatasetKind::OperatorSlice,
        pass.index as usize,
        &[nx, ny, beams],
        axes,
        None,
    )?;
    store.write_dense(&desc, Values::Complex32(restride_zyx(operator)))?;
    Ok(desc)
}

fn depth_slice(tensor: &Array4<f32>, d: usize) -> Vec<f32> {
    tensor.slice(s![d, .., .., ..]).iter().copied().collect()
}

fn write_averaged(
    store: &StructuredStore,
    meta: &SimulationMetadata,
    g: &OutputGeometry,
    averaged: &AveragedOutput,
) -> StemResult<Vec<String>> {
    let mut paths = Vec::new();
    let bins = g.detector_angles.len();
    let secondary = match (&averaged.secondary, meta.save_dpc_com) {
        (Some(s), true) => Some(s),
        (None, true) => {
            warn!("centre-of-mass output requested but the kernel produced none");
            None
        }
        (_, false) => None,
    };

    for (d, &depth) in g.depths.iter().enumerate() {
        let depth = Some(f64::from(depth));

        if meta.save_3d_output {
            let mut axes = scan_axes(g);
            axes.push(AxisDescriptor::values(
                "bin_outer_angle",
                "[mrad]",
                g.detector_angles.iter().map(|a| a * 1e3).collect(),
            ));
            let desc = store.declare_dataset(
                DatasetKind::DetectorCube,
                d,
                &[g.xp.len(), g.yp.len(), bins],
                axes,
                depth,
            )?;
            store.write_dense(&desc, Values::Float32(depth_slice(&averaged.output, d)))?;
            paths.push(desc.path);
        }

        if meta.save_2d_output {
            let angles = meta.integration_angles.unwrap_or([0.0, f64::INFINITY]);
            let range = bin_range(angles, meta.detector_angle_step, bins);
            let image = integrate_bins(averaged.output.slice(s![d, .., .., ..]), range);
            let desc = store.declare_dataset(
                DatasetKind::AnnularSlice,
                d,
                &[g.xp.len(), g.yp.len()],
                scan_axes(g),
                depth,
            )?;
            store.write_dense(&desc, Values::Float32(image.iter().copied().collect()))?;
            paths.push(desc.path);
        }

        if let Some(secondary) = secondary {
            let mut axes = scan_axes(g);
            axes.push(AxisDescriptor::labels("DPC_CoM", &["DPC_CoM_x", "DPC_CoM_y"]));
            let desc = store.declare_dataset(
                DatasetKind::DipoleSlice,
                d,
                &[g.xp.len(), g.yp.len(), 2],
                axes,
                depth,
            )?;
            store.write_dense(&desc, Values::Float32(depth_slice(secondary, d)))?;
            paths.push(desc.path);
        }
    }
    Ok(paths)
}

//! Frozen-pass averaging end to end through an in-memory store.

mod common;

use std::sync::Arc;

use common::{pipeline, ScriptedKernel, BINS, FREQ, SCAN};
use stemflow::store::schema::LOG;
use stemflow::store::AttrValue;
use stemflow::{
    DatasetKind, Simulation, SimulationMetadata, StageId, StoreConfig, StructuredStore,
};

fn simulation(kernel: &Arc<ScriptedKernel>) -> Simulation {
    Simulation::new(Arc::new(pipeline(kernel)), StoreConfig::default())
}

fn meta(passes: u32) -> SimulationMetadata {
    SimulationMetadata {
        num_passes: passes,
        save_3d_output: true,
        save_4d_output: true,
        save_dpc_com: true,
        ..SimulationMetadata::default()
    }
}

fn read(store: &StructuredStore, kind: DatasetKind, index: usize) -> Vec<f32> {
    let path = format!("{}/{}", kind.group_path(index), kind.dataset_name());
    store.read(&path).unwrap().into_f32().unwrap()
}

fn assert_all_close(values: &[f32], expected: f32) {
    assert!(!values.is_empty());
    for v in values {
        assert!((v - expected).abs() < 1e-5, "got {v}, expected {expected}");
    }
}

/// Averaging identical passes reproduces a single pass.
#[test]
fn test_identical_passes_average_to_single_pass() {
    let single_kernel = Arc::new(ScriptedKernel::default());
    let single_store = StructuredStore::in_memory().unwrap();
    simulation(&single_kernel)
        .run_with_store(meta(1), &single_store)
        .unwrap();

    let kernel = Arc::new(ScriptedKernel::default());
    let store = StructuredStore::in_memory().unwrap();
    let summary = simulation(&kernel).run_with_store(meta(3), &store).unwrap();

    assert_eq!(summary.passes, 3);
    assert_eq!(kernel.calls(StageId::Output), 3);
    for kind in [DatasetKind::Datacube, DatasetKind::DetectorCube, DatasetKind::DipoleSlice] {
        let averaged = read(&store, kind, 0);
        let single = read(&single_store, kind, 0);
        assert_eq!(averaged.len(), single.len());
        for (a, s) in averaged.iter().zip(&single) {
            assert!((a - s).abs() < 1e-5, "{kind:?}: {a} vs {s}");
        }
    }
}

/// Passes with values 1..=N average to (N + 1) / 2.
#[test]
fn test_distinct_passes_average_to_mean() {
    let kernel = Arc::new(ScriptedKernel {
        vary_by_pass: true,
        ..ScriptedKernel::default()
    });
    let store = StructuredStore::in_memory().unwrap();
    simulation(&kernel).run_with_store(meta(4), &store).unwrap();

    let detector = read(&store, DatasetKind::DetectorCube, 0);
    assert_eq!(detector.len(), SCAN * SCAN * BINS);
    assert_all_close(&detector, 2.5);

    let cube = read(&store, DatasetKind::Datacube, 0);
    assert_eq!(cube.len(), SCAN * SCAN * FREQ * FREQ);
    assert_all_close(&cube, 2.5);
}

/// The secondary tensor averages magnitudes, so alternating signs do not
/// cancel.
#[test]
fn test_secondary_averages_magnitudes() {
    let kernel = Arc::new(ScriptedKernel {
        vary_by_pass: true,
        ..ScriptedKernel::default()
    });
    let store = StructuredStore::in_memory().unwrap();
    simulation(&kernel).run_with_store(meta(4), &store).unwrap();

    // |1| + |-2| + |3| + |-4| over 4 passes
    assert_all_close(&read(&store, DatasetKind::DipoleSlice, 0), 2.5);
}

/// Every depth gets its own averaged groups.
#[test]
fn test_each_depth_is_written() {
    let kernel = Arc::new(ScriptedKernel {
        depths: 3,
        ..ScriptedKernel::default()
    });
    let store = StructuredStore::in_memory().unwrap();
    let summary = simulation(&kernel).run_with_store(meta(2), &store).unwrap();

    for d in 0..3 {
        #[allow(clippy::cast_precision_loss)]
        let expected = (d + 1) as f32;
        assert_all_close(&read(&store, DatasetKind::Datacube, d), expected);
        assert_all_close(&read(&store, DatasetKind::DetectorCube, d), 1.0);
    }
    let series = summary.depth_series.unwrap();
    assert_eq!(series.shape, vec![SCAN, SCAN, BINS, 3]);
}

/// A failing pass aborts the run; blocks accumulated by earlier passes stay
/// in the store and no averaged output is written.
#[test]
fn test_mid_run_failure_is_fatal_and_keeps_earlier_blocks() {
    let kernel = Arc::new(ScriptedKernel {
        vary_by_pass: true,
        fail_on_pass: Some(2),
        ..ScriptedKernel::default()
    });
    let store = StructuredStore::in_memory().unwrap();
    let err = simulation(&kernel)
        .run_with_store(meta(4), &store)
        .unwrap_err();
    assert!(err.is_stage_compute());

    // passes 0 and 1 contributed (1 + 2) / 4
    assert_all_close(&read(&store, DatasetKind::Datacube, 0), 0.75);
    let detector_group = DatasetKind::DetectorCube.group_path(0);
    assert!(!store.container().exists(&detector_group).unwrap());
}

/// Probe metrics from both algorithms land in the summary and the run log.
#[test]
fn test_probe_metrics_recorded_in_run_log() {
    let kernel = Arc::new(ScriptedKernel {
        probes: true,
        ..ScriptedKernel::default()
    });
    let store = StructuredStore::in_memory().unwrap();
    let summary = simulation(&kernel).run_with_store(meta(1), &store).unwrap();

    let names: Vec<&str> = summary.metrics.iter().map(|(n, _)| n.as_str()).collect();
    assert_eq!(
        names,
        vec![
            "real.pearson_correlation",
            "real.r_factor",
            "reciprocal.pearson_correlation",
            "reciprocal.r_factor"
        ]
    );
    for (name, value) in &summary.metrics {
        let logged = store.container().attr(LOG, name).unwrap();
        assert_eq!(logged, Some(AttrValue::Float(*value)));
    }
    // Scaled probes normalise to the same image.
    assert!((summary.metrics[0].1 - 1.0).abs() < 1e-9);
    assert!(summary.metrics[1].1.abs() < 1e-6);
}

/// Kernels without probes leave the run log free of metrics.
#[test]
fn test_no_probe_metrics_without_probes() {
    let kernel = Arc::new(ScriptedKernel::default());
    let store = StructuredStore::in_memory().unwrap();
    let summary = simulation(&kernel).run_with_store(meta(1), &store).unwrap();
    assert!(summary.metrics.is_empty());
    assert_eq!(store.container().attr(LOG, "real.r_factor").unwrap(), None);
}

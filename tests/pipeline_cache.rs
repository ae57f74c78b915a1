//! Stage cache behaviour through the calculation pipeline.

mod common;

use std::sync::Arc;
use std::thread;

use crossbeam_channel::{bounded, Receiver, Sender};
use ndarray::Array3;
use serde_json::{json, Value};

use common::{pipeline, pipeline_with_reporter, ScriptedKernel};
use stemflow::{
    Algorithm, CacheEvent, CacheEventKind, CalculationPipeline, ChannelReporter, NullReporter,
    PriorArtifacts, ProgressEvent, SimulationMetadata, StageArtifact, StageCache,
    StageComputeError, StageId, StageKernel,
};

fn cache_events(reporter: &ChannelReporter) -> Vec<CacheEvent> {
    reporter
        .drain()
        .into_iter()
        .filter_map(|e| match e {
            ProgressEvent::Cache(event) => Some(event),
            _ => None,
        })
        .collect()
}

const fn event(stage: StageId, kind: CacheEventKind) -> CacheEvent {
    CacheEvent { stage, kind }
}

/// Two runs with equal metadata call each kernel once.
#[test]
fn test_sequential_identical_runs_compute_once() {
    let kernel = Arc::new(ScriptedKernel::default());
    let pipeline = pipeline(&kernel);
    let meta = SimulationMetadata::default();

    let first = pipeline.run_stage(StageId::Output, &meta).unwrap();
    let second = pipeline.run_stage(StageId::Output, &meta).unwrap();

    assert!(Arc::ptr_eq(&first, &second));
    for stage in StageId::ALL {
        assert_eq!(kernel.calls(stage), 1, "{stage} computed more than once");
    }
}

/// Changing metadata recomputes and clears readiness downstream of the
/// first stage that ran.
#[test]
fn test_changed_metadata_recomputes_and_invalidates_downstream() {
    let kernel = Arc::new(ScriptedKernel::default());
    let reporter = Arc::new(ChannelReporter::new(256));
    let pipeline = pipeline_with_reporter(&kernel, reporter.clone());

    let m1 = SimulationMetadata::default();
    let m2 = SimulationMetadata {
        probe_defocus: 25.0,
        ..m1.clone()
    };

    pipeline.run_stage(StageId::Output, &m1).unwrap();
    reporter.drain();

    pipeline.run_stage(StageId::Potential, &m2).unwrap();
    assert_eq!(kernel.calls(StageId::Potential), 2);
    let cache = pipeline.cache();
    assert!(cache.is_ready(StageId::Potential).unwrap());
    assert!(!cache.is_ready(StageId::CompactOperator).unwrap());
    assert!(!cache.is_ready(StageId::Output).unwrap());

    let events = cache_events(&reporter);
    assert_eq!(
        events,
        vec![
            event(StageId::Potential, CacheEventKind::Invalidated),
            event(StageId::CompactOperator, CacheEventKind::Invalidated),
            event(StageId::Output, CacheEventKind::Invalidated),
            event(StageId::Potential, CacheEventKind::Computed),
        ]
    );
}

/// A different value of the same type for one serialised field.
fn perturb(key: &str, value: &Value) -> Value {
    match value {
        Value::Bool(b) => Value::Bool(!b),
        Value::Number(n) => n
            .as_u64()
            .map_or_else(|| json!(n.as_f64().unwrap_or(0.0) + 0.5), |u| json!(u + 1)),
        Value::String(s) if key == "algorithm" => {
            json!(if s == "prism" { "multislice" } else { "prism" })
        }
        Value::String(s) => Value::String(format!("{s}.alt")),
        Value::Array(items) => {
            let mut items = items.clone();
            items[0] = perturb(key, &items[0]);
            Value::Array(items)
        }
        Value::Null => json!([0.0, 0.05]),
        Value::Object(_) => panic!("unexpected nested field {key}"),
    }
}

/// Any single field change is enough to miss the cache.
#[test]
fn test_every_field_participates_in_equality() {
    let base = SimulationMetadata::default();
    let base_fingerprint = base.fingerprint().unwrap();
    let Value::Object(fields) = serde_json::to_value(&base).unwrap() else {
        panic!("metadata serialises as an object");
    };
    assert!(fields.len() > 30);

    let kernel = Arc::new(ScriptedKernel::default());
    let pipeline = pipeline(&kernel);

    for (key, value) in &fields {
        let mut changed = fields.clone();
        changed.insert(key.clone(), perturb(key, value));
        let variant: SimulationMetadata = serde_json::from_value(Value::Object(changed)).unwrap();
        assert_ne!(variant, base, "{key}");
        let fingerprint = variant.fingerprint().unwrap();
        assert_ne!(fingerprint, base_fingerprint, "{key}");

        pipeline.run_stage(StageId::Potential, &base).unwrap();
        let before = kernel.calls(StageId::Potential);
        let hit = pipeline
            .cache()
            .lookup(StageId::Potential, &variant, &fingerprint)
            .unwrap();
        assert!(hit.is_none(), "{key} did not miss the cache");

        pipeline.run_stage(StageId::Potential, &variant).unwrap();
        assert_eq!(kernel.calls(StageId::Potential), before + 1, "{key} was not recomputed");
    }
}

/// A repeated request after a change back reuses nothing stale.
#[test]
fn test_switching_back_recomputes() {
    let kernel = Arc::new(ScriptedKernel::default());
    let pipeline = pipeline(&kernel);
    let m1 = SimulationMetadata::default();
    let m2 = SimulationMetadata { c3: 1e-3, ..m1.clone() };

    pipeline.run_stage(StageId::Output, &m1).unwrap();
    pipeline.run_stage(StageId::Output, &m2).unwrap();
    pipeline.run_stage(StageId::Output, &m1).unwrap();
    assert_eq!(kernel.calls(StageId::Output), 3);

    let snapshot = pipeline.cache().snapshot().unwrap();
    assert_eq!(snapshot.metadata(StageId::Output), Some(&m1));
}

#[test]
fn test_multislice_chain_skips_operator() {
    let kernel = Arc::new(ScriptedKernel::default());
    let pipeline = pipeline(&kernel);
    let meta = SimulationMetadata {
        algorithm: Algorithm::Multislice,
        ..SimulationMetadata::default()
    };
    pipeline.run_stage(StageId::Output, &meta).unwrap();
    assert_eq!(kernel.calls(StageId::CompactOperator), 0);
    assert_eq!(kernel.calls(StageId::Potential), 1);
}

/// Kernel that announces each call and blocks until released.
struct GateKernel {
    started: Sender<()>,
    release: Receiver<()>,
}

impl StageKernel for GateKernel {
    #[allow(clippy::cast_precision_loss)]
    fn compute(
        &self,
        _stage: StageId,
        meta: &SimulationMetadata,
        _prior: &PriorArtifacts,
    ) -> Result<StageArtifact, StageComputeError> {
        let _ = self.started.send(());
        let _ = self.release.recv();
        Ok(StageArtifact::Potential(Array3::from_elem(
            (1, 1, 1),
            meta.probe_defocus as f32,
        )))
    }
}

/// Readers see the previous artifact, marked not ready, while the stage is
/// being recomputed.
#[test]
fn test_observer_sees_previous_snapshot_during_compute() {
    let (started_tx, started_rx) = bounded(4);
    let (release_tx, release_rx) = bounded(4);
    let pipeline = Arc::new(CalculationPipeline::new(
        Arc::new(GateKernel {
            started: started_tx,
            release: release_rx,
        }),
        Arc::new(StageCache::new()),
        Arc::new(NullReporter),
    ));

    let m1 = SimulationMetadata {
        probe_defocus: 1.0,
        ..SimulationMetadata::default()
    };
    release_tx.send(()).unwrap();
    pipeline.run_stage(StageId::Potential, &m1).unwrap();
    started_rx.recv().unwrap();

    let worker = {
        let pipeline = Arc::clone(&pipeline);
        thread::spawn(move || {
            let m2 = SimulationMetadata {
                probe_defocus: 2.0,
                ..SimulationMetadata::default()
            };
            pipeline.run_stage(StageId::Potential, &m2).unwrap()
        })
    };

    started_rx.recv().unwrap();
    let cache = pipeline.cache();
    assert!(!cache.is_ready(StageId::Potential).unwrap());
    let previous = cache.artifact(StageId::Potential).unwrap().unwrap();
    assert_eq!(previous.as_potential().unwrap()[[0, 0, 0]], 1.0);

    release_tx.send(()).unwrap();
    let fresh = worker.join().unwrap();
    assert_eq!(fresh.as_potential().unwrap()[[0, 0, 0]], 2.0);
    assert!(cache.is_ready(StageId::Potential).unwrap());
}

/// A kernel failure leaves the stage not ready and the lock free.
#[test]
fn test_failure_leaves_stage_not_ready() {
    let kernel = Arc::new(ScriptedKernel {
        fail_on_pass: Some(0),
        ..ScriptedKernel::default()
    });
    let pipeline = pipeline(&kernel);
    let meta = SimulationMetadata::default();

    let err = pipeline.run_stage(StageId::Output, &meta).unwrap_err();
    assert!(err.is_stage_compute());
    assert!(pipeline.cache().is_ready(StageId::CompactOperator).unwrap());
    assert!(!pipeline.cache().is_ready(StageId::Output).unwrap());
    assert!(pipeline.lock().is_ok());
}

//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use ndarray::{Array2, Array3, Array4};
use num_complex::Complex32;

use stemflow::{
    Algorithm, CalculationPipeline, NullReporter, OutputGeometry, OutputTensors, PriorArtifacts,
    ProbePair, ProgressReporter, SimulationMetadata, StageArtifact, StageCache, StageComputeError,
    StageId, StageKernel,
};

/// Scan positions per axis.
pub const SCAN: usize = 2;
/// Default frequency samples per axis.
pub const FREQ: usize = 4;
/// Detector bins.
pub const BINS: usize = 3;

/// Spatial frequencies of an `n`-point transform in unshifted order.
#[allow(clippy::cast_precision_loss, clippy::cast_possible_wrap)]
pub fn fft_axis(n: usize, dq: f32) -> Vec<f32> {
    let n = n as i64;
    (0..n)
        .map(|i| if i < (n + 1) / 2 { i } else { i - n })
        .map(|k| k as f32 * dq)
        .collect()
}

/// A kernel with deterministic output that records how it was driven.
///
/// Output values are `pass_index + 1` when `vary_by_pass` is set and `1.0`
/// otherwise. The secondary tensor alternates sign between passes.
pub struct ScriptedKernel {
    pub calls: [AtomicUsize; 3],
    pub in_flight: AtomicBool,
    pub overlapped: AtomicBool,
    pub delay: Duration,
    pub depths: usize,
    pub freq: usize,
    pub dq: f32,
    pub vary_by_pass: bool,
    pub fail_on_pass: Option<u32>,
    /// Expose probes; the multislice probe is the PRISM probe scaled by two.
    pub probes: bool,
}

impl Default for ScriptedKernel {
    fn default() -> Self {
        Self {
            calls: Default::default(),
            in_flight: AtomicBool::new(false),
            overlapped: AtomicBool::new(false),
            delay: Duration::ZERO,
            depths: 1,
            freq: FREQ,
            dq: 1.0,
            vary_by_pass: false,
            fail_on_pass: None,
            probes: false,
        }
    }
}

impl ScriptedKernel {
    pub fn calls(&self, stage: StageId) -> usize {
        self.calls[stage.index()].load(Ordering::SeqCst)
    }

    pub fn total_calls(&self) -> usize {
        StageId::ALL.iter().map(|&s| self.calls(s)).sum()
    }

    /// True if two `compute` calls were ever in progress at once.
    pub fn overlapped(&self) -> bool {
        self.overlapped.load(Ordering::SeqCst)
    }

    #[allow(clippy::cast_precision_loss)]
    fn fill(&self, meta: &SimulationMetadata) -> f32 {
        if self.vary_by_pass {
            (meta.pass_index + 1) as f32
        } else {
            1.0
        }
    }

    #[allow(clippy::cast_precision_loss)]
    pub fn geometry(&self) -> OutputGeometry {
        OutputGeometry {
            xp: vec![0.0, 0.25],
            yp: vec![0.0, 0.25],
            qx: fft_axis(self.freq, self.dq),
            qy: fft_axis(self.freq, self.dq),
            detector_angles: vec![0.001, 0.002, 0.003],
            depths: (0..self.depths).map(|d| (d + 1) as f32 * 10.0).collect(),
            probe_extent: [self.freq, self.freq],
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn output(&self, meta: &SimulationMetadata) -> OutputTensors {
        let fill = self.fill(meta);
        let sign = if meta.pass_index % 2 == 0 { 1.0 } else { -1.0 };
        OutputTensors {
            output: Array4::from_elem((self.depths, SCAN, SCAN, BINS), fill),
            secondary: Some(Array4::from_elem((self.depths, SCAN, SCAN, 2), sign * fill)),
            datacubes: (0..self.depths)
                .map(|d| Array4::from_elem((SCAN, SCAN, self.freq, self.freq), fill * (d + 1) as f32))
                .collect(),
            geometry: self.geometry(),
        }
    }
}

impl StageKernel for ScriptedKernel {
    fn compute(
        &self,
        stage: StageId,
        meta: &SimulationMetadata,
        prior: &PriorArtifacts,
    ) -> Result<StageArtifact, StageComputeError> {
        if self.in_flight.swap(true, Ordering::SeqCst) {
            self.overlapped.store(true, Ordering::SeqCst);
        }
        self.calls[stage.index()].fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }

        let result = match stage {
            StageId::Potential => Ok(StageArtifact::Potential(Array3::from_elem(
                (2, SCAN, SCAN),
                self.fill(meta),
            ))),
            StageId::CompactOperator => prior.potential(stage).map(|_| {
                StageArtifact::CompactOperator(Array3::from_elem((1, SCAN, SCAN), Complex32::new(1.0, 0.0)))
            }),
            StageId::Output if self.fail_on_pass == Some(meta.pass_index) => {
                Err(StageComputeError::ResourceExhausted {
                    stage,
                    reason: "scripted failure".to_string(),
                })
            }
            StageId::Output => Ok(StageArtifact::Output(self.output(meta))),
        };

        self.in_flight.store(false, Ordering::SeqCst);
        result
    }

    #[allow(clippy::cast_precision_loss)]
    fn probe(
        &self,
        algorithm: Algorithm,
        _meta: &SimulationMetadata,
    ) -> Result<Option<ProbePair>, StageComputeError> {
        if !self.probes {
            return Ok(None);
        }
        let scale = match algorithm {
            Algorithm::Prism => 1.0,
            Algorithm::Multislice => 2.0,
        };
        let real = Array2::from_shape_fn((SCAN, SCAN), |(i, j)| {
            Complex32::new(scale * (i * SCAN + j + 1) as f32, 0.0)
        });
        let reciprocal = real.t().to_owned();
        Ok(Some((real, reciprocal)))
    }
}

/// A pipeline over `kernel` with a fresh cache and no progress sink.
pub fn pipeline(kernel: &Arc<ScriptedKernel>) -> CalculationPipeline {
    pipeline_with_reporter(kernel, Arc::new(NullReporter))
}

pub fn pipeline_with_reporter(
    kernel: &Arc<ScriptedKernel>,
    reporter: Arc<dyn ProgressReporter>,
) -> CalculationPipeline {
    let kernel: Arc<dyn StageKernel> = kernel.clone();
    CalculationPipeline::new(kernel, Arc::new(StageCache::new()), reporter)
}

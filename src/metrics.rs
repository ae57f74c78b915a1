//! Probe comparison metrics.
//!
//! Two probe images (one per algorithm) are compared after each is
//! normalised by the sum of its magnitudes.

use ndarray::Array2;
use num_complex::Complex32;
use tracing::warn;

use crate::cache::StageId;
use crate::error::{StageComputeError, StemResult};
use crate::meta::{Algorithm, SimulationMetadata};
use crate::pipeline::{CalculationGuard, ProgressReporter};

/// Pearson correlation coefficient of two equally long samples.
///
/// Returns `None` when either sample is empty, the lengths differ, or a
/// sample has zero variance.
#[must_use]
pub fn pearson_correlation(a: &[f64], b: &[f64]) -> Option<f64> {
    if a.is_empty() || a.len() != b.len() {
        return None;
    }
    #[allow(clippy::cast_precision_loss)]
    let n = a.len() as f64;
    let mean_a = a.iter().sum::<f64>() / n;
    let mean_b = b.iter().sum::<f64>() / n;

    let (mut cov, mut var_a, mut var_b) = (0.0, 0.0, 0.0);
    for (&x, &y) in a.iter().zip(b) {
        let dx = x - mean_a;
        let dy = y - mean_b;
        cov += dx * dy;
        var_a += dx * dx;
        var_b += dy * dy;
    }
    let denom = (var_a * var_b).sqrt();
    (denom > 0.0).then(|| cov / denom)
}

/// R-factor `Σ|a - b| / Σ|a|`.
///
/// Returns `None` when the lengths differ or `a` sums to zero.
#[must_use]
pub fn r_factor(a: &[f64], b: &[f64]) -> Option<f64> {
    if a.len() != b.len() {
        return None;
    }
    let reference: f64 = a.iter().map(|v| v.abs()).sum();
    if reference <= 0.0 {
        return None;
    }
    let diff: f64 = a.iter().zip(b).map(|(x, y)| (x - y).abs()).sum();
    Some(diff / reference)
}

/// Metrics between two probes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProbeComparison {
    /// Pearson correlation of normalised magnitudes.
    pub pearson: f64,
    /// R-factor of normalised magnitudes.
    pub r_factor: f64,
}

fn normalised_magnitudes(probe: &Array2<Complex32>) -> Vec<f64> {
    let mags: Vec<f64> = probe.iter().map(|c| f64::from(c.norm())).collect();
    let total: f64 = mags.iter().sum();
    if total > 0.0 {
        mags.into_iter().map(|m| m / total).collect()
    } else {
        mags
    }
}

/// Compares two probe images and reports both metrics under `label`.
///
/// # Errors
/// Returns `StageComputeError::InvalidGeometry` if the probes differ in
/// shape or a metric is undefined for them.
pub fn compare_probes(
    label: &str,
    reference: &Array2<Complex32>,
    candidate: &Array2<Complex32>,
    reporter: &dyn ProgressReporter,
) -> StemResult<ProbeComparison> {
    let undefined = |reason: String| StageComputeError::InvalidGeometry {
        stage: StageId::Output,
        reason,
    };
    if reference.dim() != candidate.dim() {
        return Err(undefined(format!(
            "probe shapes differ: {:?} vs {:?}",
            reference.dim(),
            candidate.dim()
        ))
        .into());
    }

    let a = normalised_magnitudes(reference);
    let b = normalised_magnitudes(candidate);
    let pearson = pearson_correlation(&a, &b)
        .ok_or_else(|| undefined("pearson correlation undefined for flat probe".to_string()))?;
    let r = r_factor(&a, &b).ok_or_else(|| undefined("r-factor undefined for empty probe".to_string()))?;

    reporter.metric(&format!("{label}.pearson_correlation"), pearson);
    reporter.metric(&format!("{label}.r_factor"), r);
    Ok(ProbeComparison { pearson, r_factor: r })
}

/// Compares the probes both algorithms form under `meta`, in real and in
/// reciprocal space.
///
/// Returns the reported metrics as `(name, value)` pairs, empty when the
/// kernel exposes no probes. A comparison that is undefined for the probes
/// is logged and left out.
///
/// # Errors
/// Returns the kernel's error if it fails to form a probe.
pub fn compare_algorithm_probes(
    guard: &CalculationGuard<'_>,
    meta: &SimulationMetadata,
) -> StemResult<Vec<(String, f64)>> {
    let kernel = guard.kernel();
    let prism = kernel.probe(Algorithm::Prism, meta)?;
    let multislice = kernel.probe(Algorithm::Multislice, meta)?;
    let (Some(prism), Some(multislice)) = (prism, multislice) else {
        return Ok(Vec::new());
    };

    let mut metrics = Vec::with_capacity(4);
    let pairs = [
        ("real", &prism.0, &multislice.0),
        ("reciprocal", &prism.1, &multislice.1),
    ];
    for (label, reference, candidate) in pairs {
        match compare_probes(label, reference, candidate, guard.reporter().as_ref()) {
            Ok(cmp) => {
                metrics.push((format!("{label}.pearson_correlation"), cmp.pearson));
                metrics.push((format!("{label}.r_factor"), cmp.r_factor));
            }
            Err(err) => warn!(label, %err, "probe comparison skipped"),
        }
    }
    Ok(metrics)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::artifact::StageArtifact;
    use crate::cache::StageCache;
    use crate::pipeline::{
        CalculationPipeline, ChannelReporter, NullReporter, PriorArtifacts, ProbePair,
        ProgressEvent, StageKernel,
    };

    struct ProbeKernel {
        flat_reciprocal: bool,
    }

    impl StageKernel for ProbeKernel {
        fn compute(
            &self,
            stage: StageId,
            _meta: &SimulationMetadata,
            _prior: &PriorArtifacts,
        ) -> Result<StageArtifact, StageComputeError> {
            Err(StageComputeError::ResourceExhausted {
                stage,
                reason: "not used".to_string(),
            })
        }

        fn probe(
            &self,
            algorithm: Algorithm,
            _meta: &SimulationMetadata,
        ) -> Result<Option<ProbePair>, StageComputeError> {
            let scale = if algorithm == Algorithm::Prism { 1.0 } else { 2.0 };
            let real = Array2::from_shape_fn((2, 2), |(i, j)| Complex32::new(scale * (i + 2 * j + 1) as f32, 0.0));
            let reciprocal = if self.flat_reciprocal {
                Array2::from_elem((2, 2), Complex32::new(1.0, 0.0))
            } else {
                real.clone()
            };
            Ok(Some((real, reciprocal)))
        }
    }

    #[test]
    fn test_algorithm_probes_compared_in_both_spaces() {
        let pipeline = CalculationPipeline::new(
            Arc::new(ProbeKernel { flat_reciprocal: false }),
            Arc::new(StageCache::new()),
            Arc::new(NullReporter),
        );
        let guard = pipeline.lock().unwrap();
        let metrics = compare_algorithm_probes(&guard, &SimulationMetadata::default()).unwrap();
        let names: Vec<&str> = metrics.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "real.pearson_correlation",
                "real.r_factor",
                "reciprocal.pearson_correlation",
                "reciprocal.r_factor"
            ]
        );
        assert!((metrics[0].1 - 1.0).abs() < 1e-9);
        assert!(metrics[1].1.abs() < 1e-9);
    }

    #[test]
    fn test_undefined_comparison_is_skipped() {
        let pipeline = CalculationPipeline::new(
            Arc::new(ProbeKernel { flat_reciprocal: true }),
            Arc::new(StageCache::new()),
            Arc::new(NullReporter),
        );
        let guard = pipeline.lock().unwrap();
        let metrics = compare_algorithm_probes(&guard, &SimulationMetadata::default()).unwrap();
        assert_eq!(metrics.len(), 2);
        assert!(metrics.iter().all(|(n, _)| n.starts_with("real.")));
    }

    #[test]
    fn test_kernel_without_probes_reports_nothing() {
        struct Silent;
        impl StageKernel for Silent {
            fn compute(
                &self,
                stage: StageId,
                _meta: &SimulationMetadata,
                _prior: &PriorArtifacts,
            ) -> Result<StageArtifact, StageComputeError> {
                Err(StageComputeError::ResourceExhausted {
                    stage,
                    reason: "not used".to_string(),
                })
            }
        }
        let pipeline = CalculationPipeline::new(Arc::new(Silent), Arc::new(StageCache::new()), Arc::new(NullReporter));
        let guard = pipeline.lock().unwrap();
        assert!(compare_algorithm_probes(&guard, &SimulationMetadata::default())
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_pearson_perfect_and_inverse() {
        let a = [1.0, 2.0, 3.0, 4.0];
        let b = [2.0, 4.0, 6.0, 8.0];
        let c = [4.0, 3.0, 2.0, 1.0];
        assert!((pearson_correlation(&a, &b).unwrap() - 1.0).abs() < 1e-12);
        assert!((pearson_correlation(&a, &c).unwrap() + 1.0).abs() < 1e-12);
        assert!(pearson_correlation(&a, &[1.0, 1.0, 1.0, 1.0]).is_none());
        assert!(pearson_correlation(&a, &b[..2]).is_none());
    }

    #[test]
    fn test_r_factor() {
        assert_eq!(r_factor(&[1.0, 1.0], &[1.0, 1.0]), Some(0.0));
        assert_eq!(r_factor(&[2.0, 2.0], &[1.0, 3.0]), Some(0.5));
        assert!(r_factor(&[0.0], &[1.0]).is_none());
    }

    #[test]
    fn test_compare_probes_is_scale_invariant() {
        let a = Array2::from_shape_fn((2, 2), |(i, j)| Complex32::new((i + 2 * j + 1) as f32, 0.0));
        let b = a.mapv(|c| c * 3.0);
        let reporter = ChannelReporter::new(8);
        let cmp = compare_probes("real", &a, &b, &reporter).unwrap();
        assert!((cmp.pearson - 1.0).abs() < 1e-9);
        assert!(cmp.r_factor.abs() < 1e-9);

        let names: Vec<String> = reporter
            .drain()
            .into_iter()
            .filter_map(|e| match e {
                ProgressEvent::Metric { name, .. } => Some(name),
                _ => None,
            })
            .collect();
        assert_eq!(names, vec!["real.pearson_correlation", "real.r_factor"]);
    }

    #[test]
    fn test_compare_probes_shape_mismatch() {
        let a = Array2::<Complex32>::zeros((2, 2));
        let b = Array2::<Complex32>::zeros((2, 3));
        let err = compare_probes("k", &a, &b, &crate::pipeline::NullReporter).unwrap_err();
        assert!(err.is_stage_compute());
    }
}

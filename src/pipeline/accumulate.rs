//! Frozen-pass accumulation.
//!
//! Pass 0 runs with the base metadata and seeds the running sums. Every
//! later pass runs with a freshly seeded copy, which always differs from the
//! previous metadata and so forces the potential stage to recompute. The
//! primary tensor is averaged as is; the secondary tensor is averaged by
//! magnitude.

use ndarray::{Array4, Zip};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::info;

use crate::artifact::{OutputTensors, StageArtifact};
use crate::cache::StageId;
use crate::error::{StageComputeError, StemResult};
use crate::meta::SimulationMetadata;

use super::CalculationGuard;

/// Derives the metadata for the next pass.
pub trait PassMutator: Send {
    /// Returns metadata for `pass_index`, differing from `previous` only in
    /// its stochastic fields.
    fn next_pass(&mut self, previous: &SimulationMetadata, pass_index: u32) -> SimulationMetadata;
}

/// Draws a new random seed for every pass.
#[derive(Debug)]
pub struct RandomSeedMutator {
    rng: StdRng,
}

impl RandomSeedMutator {
    const SEED_RANGE: u64 = 100_000;

    /// Deterministic seed sequence.
    #[must_use]
    pub fn from_seed(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Seed sequence from OS entropy.
    #[must_use]
    pub fn from_entropy() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }
}

impl PassMutator for RandomSeedMutator {
    fn next_pass(&mut self, previous: &SimulationMetadata, pass_index: u32) -> SimulationMetadata {
        let mut seed = self.rng.gen_range(0..Self::SEED_RANGE);
        while seed == previous.random_seed {
            seed = self.rng.gen_range(0..Self::SEED_RANGE);
        }
        previous.for_pass(pass_index, seed)
    }
}

/// Averaged result of all passes.
#[derive(Debug, Clone, PartialEq)]
pub struct AveragedOutput {
    /// Elementwise mean of the primary tensor.
    pub output: Array4<f32>,
    /// Elementwise mean of secondary magnitudes.
    pub secondary: Option<Array4<f32>>,
    /// Passes averaged.
    pub passes: u32,
}

/// Running sums over frozen passes.
#[derive(Debug, Clone)]
pub struct PassAccumulator {
    sum: Array4<f32>,
    secondary: Option<Array4<f32>>,
    passes: u32,
}

impl PassAccumulator {
    /// Seeds the sums with the first pass.
    #[must_use]
    pub fn new(first: &OutputTensors) -> Self {
        Self {
            sum: first.output.clone(),
            secondary: first.secondary.as_ref().map(|s| s.mapv(f32::abs)),
            passes: 1,
        }
    }

    /// Adds one more pass.
    ///
    /// # Errors
    /// Returns `StageComputeError::InvalidGeometry` if the pass's tensors do
    /// not match the running sums.
    pub fn fold(&mut self, tensors: &OutputTensors) -> Result<(), StageComputeError> {
        if tensors.output.shape() != self.sum.shape() {
            return Err(StageComputeError::InvalidGeometry {
                stage: StageId::Output,
                reason: format!(
                    "pass output has shape {:?}, accumulator holds {:?}",
                    tensors.output.shape(),
                    self.sum.shape()
                ),
            });
        }
        match (&mut self.secondary, &tensors.secondary) {
            (Some(acc), Some(s)) if acc.shape() == s.shape() => {
                Zip::from(acc).and(s).for_each(|a, &v| *a += v.abs());
            }
            (None, None) => {}
            _ => {
                return Err(StageComputeError::InvalidGeometry {
                    stage: StageId::Output,
                    reason: "secondary tensor changed between passes".to_string(),
                });
            }
        }
        self.sum += &tensors.output;
        self.passes += 1;
        Ok(())
    }

    /// Passes folded so far.
    #[must_use]
    pub const fn passes(&self) -> u32 {
        self.passes
    }

    /// Divides every sum by the pass count.
    #[must_use]
    pub fn finish(self) -> AveragedOutput {
        #[allow(clippy::cast_precision_loss)]
        let n = self.passes as f32;
        AveragedOutput {
            output: self.sum / n,
            secondary: self.secondary.map(|s| s / n),
            passes: self.passes,
        }
    }
}

/// One completed pass, handed to the caller before it is folded in.
#[derive(Debug)]
pub struct PassOutcome<'a> {
    /// Zero-based pass index.
    pub index: u32,
    /// Metadata the pass ran with.
    pub meta: &'a SimulationMetadata,
    /// Output tensors of the pass.
    pub tensors: &'a OutputTensors,
}

/// Runs `num_passes` full calculations and averages their outputs.
#[derive(Debug)]
pub struct FrozenPassAccumulator<M: PassMutator> {
    mutator: M,
}

impl<M: PassMutator> FrozenPassAccumulator<M> {
    /// Creates an accumulator drawing pass metadata from `mutator`.
    pub const fn new(mutator: M) -> Self {
        Self { mutator }
    }

    /// Runs every pass under `guard`.
    ///
    /// `on_pass` sees each pass's output before it is folded in; this is where
    /// per-pass persistence happens. The first failure from a kernel or from
    /// `on_pass` aborts the run without producing an average.
    ///
    /// # Errors
    /// Propagates the first stage or callback failure.
    pub fn run<F>(
        &mut self,
        guard: &CalculationGuard<'_>,
        base: &SimulationMetadata,
        mut on_pass: F,
    ) -> StemResult<AveragedOutput>
    where
        F: FnMut(PassOutcome<'_>) -> StemResult<()>,
    {
        let total = base.num_passes.max(1);
        let mut meta = base.clone();
        let mut acc: Option<PassAccumulator> = None;

        for index in 0..total {
            if index > 0 {
                meta = self.mutator.next_pass(&meta, index);
            }
            info!(pass = index + 1, total, seed = meta.random_seed, "running frozen pass");

            let artifact = guard.run_chain(&meta)?;
            let tensors = match artifact.as_ref() {
                StageArtifact::Output(t) => t,
                other => {
                    return Err(StageComputeError::WrongArtifact {
                        stage: StageId::Output,
                        produced: other.stage(),
                    }
                    .into())
                }
            };

            on_pass(PassOutcome {
                index,
                meta: &meta,
                tensors,
            })?;

            match acc.as_mut() {
                None => acc = Some(PassAccumulator::new(tensors)),
                Some(acc) => acc.fold(tensors)?,
            }
        }

        acc.map(PassAccumulator::finish)
            .ok_or_else(|| crate::error::StemError::internal("no frozen pass ran"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::OutputGeometry;

    fn tensors(output: Vec<f32>, secondary: Option<Vec<f32>>) -> OutputTensors {
        let n = output.len();
        OutputTensors {
            output: Array4::from_shape_vec((1, 1, 1, n), output).unwrap(),
            secondary: secondary.map(|s| Array4::from_shape_vec((1, 1, 1, s.len()), s).unwrap()),
            datacubes: Vec::new(),
            geometry: OutputGeometry::default(),
        }
    }

    #[test]
    fn test_identical_passes_average_to_single() {
        let t = tensors(vec![1.0, 2.0, 4.0], None);
        let mut acc = PassAccumulator::new(&t);
        acc.fold(&t).unwrap();
        acc.fold(&t).unwrap();
        let avg = acc.finish();
        assert_eq!(avg.passes, 3);
        assert_eq!(avg.output, t.output);
    }

    #[test]
    fn test_mean_of_distinct_passes() {
        let mut acc = PassAccumulator::new(&tensors(vec![1.0, 0.0], None));
        acc.fold(&tensors(vec![2.0, 4.0], None)).unwrap();
        acc.fold(&tensors(vec![3.0, 8.0], None)).unwrap();
        let avg = acc.finish();
        assert_eq!(avg.output.into_raw_vec(), vec![2.0, 4.0]);
    }

    #[test]
    fn test_secondary_averages_magnitudes() {
        let mut acc = PassAccumulator::new(&tensors(vec![0.0], Some(vec![1.0, -2.0])));
        acc.fold(&tensors(vec![0.0], Some(vec![-1.0, 2.0]))).unwrap();
        let avg = acc.finish();
        // mean of |s| is 1 and 2; |mean of s| would be 0 and 0
        assert_eq!(avg.secondary.unwrap().into_raw_vec(), vec![1.0, 2.0]);
    }

    #[test]
    fn test_shape_change_rejected() {
        let mut acc = PassAccumulator::new(&tensors(vec![0.0, 1.0], None));
        assert!(acc.fold(&tensors(vec![0.0], None)).is_err());
        assert!(acc.fold(&tensors(vec![0.0, 1.0], Some(vec![1.0, 1.0]))).is_err());
        assert_eq!(acc.passes(), 1);
    }

    #[test]
    fn test_mutator_always_changes_seed() {
        let mut mutator = RandomSeedMutator::from_seed(3);
        let mut meta = SimulationMetadata::default();
        for i in 1..50 {
            let next = mutator.next_pass(&meta, i);
            assert_ne!(next.random_seed, meta.random_seed);
            assert_eq!(next.pass_index, i);
            assert!(next.random_seed < 100_000);
            assert_eq!(next.energy, meta.energy);
            meta = next;
        }
    }
}

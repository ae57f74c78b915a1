//! Calculation pipeline.
//!
//! Locks, coarsest to finest:
//!
//! 1. the calculation lock, owned by the shared [`StageCache`] so every
//!    pipeline over one cache is serialised, held for an entire run through
//!    a [`CalculationGuard`];
//! 2. the cache-state lock inside [`StageCache`], held for one decide or
//!    store step;
//! 3. the store write lock inside `StructuredStore`.
//!
//! Kernel calls happen with only the calculation lock held. Cache events are
//! dispatched to the reporter after the cache-state lock is released.

pub mod accumulate;
pub mod kernel;
pub mod preflight;
pub mod reporter;

use std::sync::{Arc, MutexGuard};

use tracing::debug;

use crate::artifact::StageArtifact;
use crate::cache::{CacheEvent, CacheState, StageCache, StageId};
use crate::error::{StageComputeError, StemResult};
use crate::meta::SimulationMetadata;

pub use accumulate::{
    AveragedOutput, FrozenPassAccumulator, PassAccumulator, PassMutator, PassOutcome,
    RandomSeedMutator,
};
pub use kernel::{PriorArtifacts, ProbePair, StageKernel};
pub use preflight::{
    check_output_path, prepare_output, AlwaysOverwrite, NeverOverwrite, OverwriteConfirm,
    PathStatus,
};
pub use reporter::{ChannelReporter, NullReporter, ProgressEvent, ProgressReporter};

/// Stage kernel, cache and reporter behind one calculation lock.
pub struct CalculationPipeline {
    kernel: Arc<dyn StageKernel>,
    cache: Arc<StageCache>,
    reporter: Arc<dyn ProgressReporter>,
}

impl std::fmt::Debug for CalculationPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CalculationPipeline")
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}

impl CalculationPipeline {
    /// Creates a pipeline over an explicitly owned cache.
    pub fn new(
        kernel: Arc<dyn StageKernel>,
        cache: Arc<StageCache>,
        reporter: Arc<dyn ProgressReporter>,
    ) -> Self {
        Self {
            kernel,
            cache,
            reporter,
        }
    }

    /// The cache, readable without the calculation lock.
    #[must_use]
    pub fn cache(&self) -> &Arc<StageCache> {
        &self.cache
    }

    /// The progress reporter.
    #[must_use]
    pub fn reporter(&self) -> &Arc<dyn ProgressReporter> {
        &self.reporter
    }

    /// Takes the cache's calculation lock, blocking until any other
    /// calculation over the same cache finishes.
    ///
    /// # Errors
    /// Returns `StemError::Internal` if a previous holder panicked.
    pub fn lock(&self) -> StemResult<CalculationGuard<'_>> {
        let guard = self.cache.lock_calculation()?;
        Ok(CalculationGuard {
            pipeline: self,
            _guard: guard,
        })
    }

    /// Runs one stage under a fresh calculation lock.
    ///
    /// # Errors
    /// See [`CalculationGuard::run_stage`].
    pub fn run_stage(&self, stage: StageId, meta: &SimulationMetadata) -> StemResult<Arc<StageArtifact>> {
        self.lock()?.run_stage(stage, meta)
    }

    fn dispatch(&self, events: &[CacheEvent]) {
        for &event in events {
            debug!(stage = %event.stage, kind = ?event.kind, "cache event");
            self.reporter.cache_event(event);
        }
    }
}

/// Proof that the calculation lock is held.
///
/// Dropping the guard releases the lock, including on early return through
/// `?`.
pub struct CalculationGuard<'a> {
    pipeline: &'a CalculationPipeline,
    _guard: MutexGuard<'a, ()>,
}

impl std::fmt::Debug for CalculationGuard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CalculationGuard").finish_non_exhaustive()
    }
}

impl CalculationGuard<'_> {
    /// Returns the artifact for `stage` under `meta`, computing it and any
    /// stale prerequisite first.
    ///
    /// A ready stage whose stored metadata equals `meta` is returned without
    /// calling the kernel. Otherwise the stage and every downstream stage are
    /// invalidated before the kernel runs.
    ///
    /// # Errors
    /// Returns the kernel's `StageComputeError`, or
    /// `StageComputeError::WrongArtifact` if the kernel returned an artifact
    /// for another stage.
    pub fn run_stage(&self, stage: StageId, meta: &SimulationMetadata) -> StemResult<Arc<StageArtifact>> {
        let fingerprint = meta.fingerprint()?;
        let pipeline = self.pipeline;

        let mut prior = PriorArtifacts::empty();
        if let Some(upstream) = stage.prerequisite(meta.algorithm) {
            prior.push(self.run_stage(upstream, meta)?);
        }

        if let Some(hit) = pipeline.cache.lookup(stage, meta, &fingerprint)? {
            pipeline.dispatch(&[CacheState::reused(stage)]);
            return Ok(hit);
        }

        let invalidated = pipeline.cache.invalidate_from(stage)?;
        pipeline.dispatch(&invalidated);

        pipeline.reporter.describe(&format!("computing {stage}"));
        let artifact = pipeline.kernel.compute(stage, meta, &prior)?;
        if artifact.stage() != stage {
            return Err(StageComputeError::WrongArtifact {
                stage,
                produced: artifact.stage(),
            }
            .into());
        }
        if let StageArtifact::Output(tensors) = &artifact {
            tensors.check_shapes()?;
        }

        let artifact = Arc::new(artifact);
        let computed = pipeline
            .cache
            .store(stage, meta.clone(), fingerprint, Arc::clone(&artifact))?;
        pipeline.dispatch(&[computed]);
        pipeline.reporter.artifact_ready(stage);
        Ok(artifact)
    }

    /// Runs the full stage chain for `meta.algorithm` and returns the output
    /// artifact.
    ///
    /// # Errors
    /// See [`CalculationGuard::run_stage`].
    pub fn run_chain(&self, meta: &SimulationMetadata) -> StemResult<Arc<StageArtifact>> {
        self.run_stage(StageId::Output, meta)
    }

    /// The pipeline's cache.
    #[must_use]
    pub fn cache(&self) -> &Arc<StageCache> {
        &self.pipeline.cache
    }

    /// The stage kernel; only callable while the calculation lock is held.
    #[must_use]
    pub fn kernel(&self) -> &Arc<dyn StageKernel> {
        &self.pipeline.kernel
    }

    /// The pipeline's reporter.
    #[must_use]
    pub fn reporter(&self) -> &Arc<dyn ProgressReporter> {
        &self.pipeline.reporter
    }
}

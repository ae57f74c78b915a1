//! Stage kernel contract.

use std::sync::Arc;

use ndarray::{Array2, Array3};
use num_complex::Complex32;

use crate::artifact::StageArtifact;
use crate::cache::StageId;
use crate::error::StageComputeError;
use crate::meta::{Algorithm, SimulationMetadata};

/// A probe image in real space and in reciprocal space.
pub type ProbePair = (Array2<Complex32>, Array2<Complex32>);

/// Computes one stage from the metadata and upstream artifacts.
///
/// Implementations are opaque to the pipeline. A kernel must be a pure
/// function of its inputs for caching to be sound.
pub trait StageKernel: Send + Sync {
    /// Produces the artifact for `stage`.
    ///
    /// # Errors
    /// Any failure is fatal to the calculation that requested the stage.
    fn compute(
        &self,
        stage: StageId,
        meta: &SimulationMetadata,
        prior: &PriorArtifacts,
    ) -> Result<StageArtifact, StageComputeError>;

    /// The probe `algorithm` forms under `meta`.
    ///
    /// A run compares the probes of both algorithms when the kernel returns
    /// them; the default returns `None` and the comparison is skipped.
    ///
    /// # Errors
    /// Any failure is fatal to the run.
    fn probe(
        &self,
        _algorithm: Algorithm,
        _meta: &SimulationMetadata,
    ) -> Result<Option<ProbePair>, StageComputeError> {
        Ok(None)
    }
}

/// Upstream artifacts handed to a kernel, each current for the same
/// metadata.
#[derive(Debug, Clone, Default)]
pub struct PriorArtifacts {
    entries: Vec<Arc<StageArtifact>>,
}

impl PriorArtifacts {
    /// No upstream artifacts.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    pub(crate) fn push(&mut self, artifact: Arc<StageArtifact>) {
        self.entries.push(artifact);
    }

    /// The artifact produced by `stage`, if present.
    #[must_use]
    pub fn get(&self, stage: StageId) -> Option<&StageArtifact> {
        self.entries
            .iter()
            .map(AsRef::as_ref)
            .find(|a| a.stage() == stage)
    }

    /// The potential volume required by `consumer`.
    ///
    /// # Errors
    /// Returns `StageComputeError::MissingPrerequisite` if absent.
    pub fn potential(&self, consumer: StageId) -> Result<&Array3<f32>, StageComputeError> {
        self.get(StageId::Potential)
            .and_then(StageArtifact::as_potential)
            .ok_or(StageComputeError::MissingPrerequisite {
                stage: consumer,
                missing: StageId::Potential,
            })
    }

    /// The compact operator required by `consumer`.
    ///
    /// # Errors
    /// Returns `StageComputeError::MissingPrerequisite` if absent.
    pub fn operator(&self, consumer: StageId) -> Result<&Array3<Complex32>, StageComputeError> {
        self.get(StageId::CompactOperator)
            .and_then(StageArtifact::as_operator)
            .ok_or(StageComputeError::MissingPrerequisite {
                stage: consumer,
                missing: StageId::CompactOperator,
            })
    }

    /// Number of artifacts.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if no upstream artifact is present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

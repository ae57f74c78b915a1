//! Error types for stemflow.
//!
//! All errors are strongly typed using thiserror. Each family maps to one
//! failure mode of a run: the output-path pre-flight, a stage kernel, the
//! output store, and virtual-dataset stitching. None of them are retried
//! internally; callers decide whether to retry, abort or prompt a user.

use std::path::PathBuf;

use thiserror::Error;

use crate::cache::StageId;

/// Validation errors for configuration and simulation metadata.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Field '{field}' must be positive (got {value})")]
    NotPositive {
        field: &'static str,
        value: f64,
    },

    #[error("Frozen-phonon pass count must be at least 1")]
    ZeroPasses,

    #[error("Field '{field}' must be at least {min} (got {actual})")]
    BelowMinimum {
        field: &'static str,
        min: u64,
        actual: u64,
    },

    #[error("Invalid range for '{field}': {min} must not exceed {max}")]
    InvalidRange {
        field: &'static str,
        min: f64,
        max: f64,
    },

    #[error("Failed to read metadata from {path}: {reason}")]
    Unreadable {
        path: PathBuf,
        reason: String,
    },
}

/// Output-path pre-flight failures.
///
/// These are raised before any lock is taken.
#[derive(Debug, Error)]
pub enum OutputPathError {
    #[error("Output path {path} is not writable: {reason}")]
    NotWritable {
        path: PathBuf,
        reason: String,
    },

    #[error("Output path {path} already exists and overwrite was not confirmed")]
    ExistsNeedsConfirmation {
        path: PathBuf,
    },

    #[error("Output path {path} is inaccessible: {reason}")]
    Inaccessible {
        path: PathBuf,
        reason: String,
    },
}

/// Failures reported by a stage kernel.
#[derive(Debug, Error)]
pub enum StageComputeError {
    #[error("Stage {stage} rejected the input geometry: {reason}")]
    InvalidGeometry {
        stage: StageId,
        reason: String,
    },

    #[error("Stage {stage} ran out of resources: {reason}")]
    ResourceExhausted {
        stage: StageId,
        reason: String,
    },

    #[error("Stage {stage} requires the {missing} artifact, which is not available")]
    MissingPrerequisite {
        stage: StageId,
        missing: StageId,
    },

    #[error("Stage {stage} produced a {produced} artifact")]
    WrongArtifact {
        stage: StageId,
        produced: StageId,
    },
}

/// Virtual-dataset stitching failures.
#[derive(Debug, Error)]
pub enum SchemaMismatchError {
    #[error("Cannot stitch an empty list of source datasets")]
    NoSources,

    #[error("Got {sources} sources but {indices} index tuples")]
    IndexCountMismatch {
        sources: usize,
        indices: usize,
    },

    #[error("Index tuple for {path} has {actual} entries, expected {expected}")]
    IndexArity {
        path: String,
        expected: usize,
        actual: usize,
    },

    #[error("Source {path} has shape {actual:?}, expected {expected:?}")]
    ShapeMismatch {
        path: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("Source {path} has element type {actual}, expected {expected}")]
    TypeMismatch {
        path: String,
        expected: String,
        actual: String,
    },

    #[error("Sources {first} and {second} both map to index {index:?}")]
    IndexCollision {
        index: Vec<usize>,
        first: String,
        second: String,
    },
}

/// Errors raised by the hierarchical output container.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Node not found: {0}")]
    NotFound(String),

    #[error("Node already exists: {0}")]
    AlreadyExists(String),

    #[error("Parent group missing for {0}")]
    MissingParent(String),

    #[error("{path} is not a {expected}")]
    WrongNodeKind {
        path: String,
        expected: &'static str,
    },

    #[error("Dataset {path} holds {actual} values, got {expected}")]
    WrongElementType {
        path: String,
        expected: String,
        actual: String,
    },

    #[error("Hyperslab {offset:?}+{extent:?} does not fit dataset {path} of shape {shape:?}")]
    OutOfBounds {
        path: String,
        offset: Vec<usize>,
        extent: Vec<usize>,
        shape: Vec<usize>,
    },

    #[error("Buffer for {path} has {actual} elements, expected {expected}")]
    LengthMismatch {
        path: String,
        expected: usize,
        actual: usize,
    },

    #[error("Dataset declaration for {kind} is invalid: {reason}")]
    InvalidDeclaration {
        kind: String,
        reason: String,
    },

    #[error("Storage I/O error: {message}")]
    Io {
        message: String,
    },

    #[error("Stored container is corrupted: {message}")]
    Corrupted {
        message: String,
    },

    #[error("Container {path} would encode to {size} bytes, over the {limit} byte limit")]
    TooLarge {
        path: String,
        size: u64,
        limit: u64,
    },

    #[error("Poisoned lock: {context}")]
    Poisoned {
        context: &'static str,
    },
}

impl StoreError {
    /// Wraps an I/O failure with a short context string.
    #[must_use]
    pub fn io(context: &str, err: &std::io::Error) -> Self {
        Self::Io {
            message: format!("{context}: {err}"),
        }
    }
}

/// Worker runtime failures.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("Run queue is full (capacity: {capacity})")]
    QueueFull {
        capacity: usize,
    },

    #[error("Runtime disconnected")]
    Disconnected,

    #[error("Failed to spawn worker {name}: {reason}")]
    Spawn {
        name: String,
        reason: String,
    },
}

/// Top-level error type for stemflow.
#[derive(Debug, Error)]
pub enum StemError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Output path error: {0}")]
    OutputPath(#[from] OutputPathError),

    #[error("Stage compute error: {0}")]
    StageCompute(#[from] StageComputeError),

    #[error("Schema mismatch: {0}")]
    SchemaMismatch(#[from] SchemaMismatchError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    #[error("Internal error: {message}")]
    Internal {
        message: String,
    },
}

impl StemError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true if this is an output-path pre-flight error.
    #[must_use]
    pub const fn is_output_path(&self) -> bool {
        matches!(self, Self::OutputPath(_))
    }

    /// Returns true if a stage kernel failed.
    #[must_use]
    pub const fn is_stage_compute(&self) -> bool {
        matches!(self, Self::StageCompute(_))
    }

    /// Returns true if stitching rejected its sources.
    #[must_use]
    pub const fn is_schema_mismatch(&self) -> bool {
        matches!(self, Self::SchemaMismatch(_))
    }

    /// Returns true if the output store failed.
    #[must_use]
    pub const fn is_store(&self) -> bool {
        matches!(self, Self::Store(_))
    }

    /// Returns true if the run was stopped because the output exists and the
    /// overwrite was declined.
    #[must_use]
    pub const fn is_overwrite_declined(&self) -> bool {
        matches!(
            self,
            Self::OutputPath(OutputPathError::ExistsNeedsConfirmation { .. })
        )
    }

    /// Always false: no failure is retried internally.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        false
    }
}

/// Result type alias for stemflow operations.
pub type StemResult<T> = Result<T, StemError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_path_error_display() {
        let err = OutputPathError::ExistsNeedsConfirmation {
            path: PathBuf::from("/tmp/out.h5"),
        };
        let msg = format!("{err}");
        assert!(msg.contains("/tmp/out.h5"));
        assert!(msg.contains("overwrite"));
    }

    #[test]
    fn test_stage_compute_error_names_stage() {
        let err = StageComputeError::InvalidGeometry {
            stage: StageId::CompactOperator,
            reason: "cell is empty".to_string(),
        };
        let msg = format!("{err}");
        assert!(msg.contains("compact-operator"));
        assert!(msg.contains("cell is empty"));
    }

    #[test]
    fn test_schema_mismatch_display() {
        let err = SchemaMismatchError::ShapeMismatch {
            path: "data/realslices/a".to_string(),
            expected: vec![8, 8, 3],
            actual: vec![8, 4, 3],
        };
        let msg = format!("{err}");
        assert!(msg.contains("[8, 4, 3]"));
    }

    #[test]
    fn test_stem_error_predicates() {
        let err: StemError = OutputPathError::ExistsNeedsConfirmation {
            path: PathBuf::from("x"),
        }
        .into();
        assert!(err.is_output_path());
        assert!(err.is_overwrite_declined());
        assert!(!err.is_retryable());

        let err: StemError = StageComputeError::ResourceExhausted {
            stage: StageId::Potential,
            reason: "oom".to_string(),
        }
        .into();
        assert!(err.is_stage_compute());
        assert!(!err.is_overwrite_declined());

        let err: StemError = SchemaMismatchError::NoSources.into();
        assert!(err.is_schema_mismatch());

        let err: StemError = StoreError::NotFound("metadata".to_string()).into();
        assert!(err.is_store());
    }

    #[test]
    fn test_internal_error() {
        let err = StemError::internal("unexpected state");
        assert!(!err.is_retryable());
        assert!(format!("{err}").contains("unexpected state"));
    }
}

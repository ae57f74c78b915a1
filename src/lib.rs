//! # stemflow - staged STEM simulation pipeline
//!
//! stemflow drives a three-stage scanning transmission electron microscopy
//! simulation (potential, compact operator, output), caches each stage's
//! artifact against the metadata it was computed from, averages repeated
//! frozen-phonon passes, and persists results into a hierarchical container
//! with a fixed, versioned layout.
//!
//! ## Core Concepts
//!
//! - **Stage**: one step of the calculation; recomputing a stage invalidates
//!   every stage after it
//! - **StageKernel**: the opaque physics behind a stage
//! - **Frozen pass**: one full calculation with its own random seed; passes
//!   are averaged into the persisted result
//! - **StructuredStore**: the output container, with accumulating 4-D writes
//!   and virtual datasets stitched across depths
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use stemflow::{CalculationPipeline, NullReporter, Simulation, SimulationMetadata, StageCache};
//! use stemflow::{AlwaysOverwrite, StoreConfig};
//!
//! let pipeline = CalculationPipeline::new(
//!     Arc::new(my_kernel),
//!     Arc::new(StageCache::new()),
//!     Arc::new(NullReporter),
//! );
//! let sim = Simulation::new(Arc::new(pipeline), StoreConfig::default());
//! let meta = SimulationMetadata::load("params.json")?;
//! let summary = sim.run(meta, &AlwaysOverwrite)?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Core types
pub mod artifact;
pub mod config;
pub mod error;
pub mod meta;

// Calculation
pub mod cache;
pub mod metrics;
pub mod pipeline;

// Output
pub mod runner;
pub mod store;

pub use artifact::{OutputGeometry, OutputTensors, StageArtifact};
pub use cache::{CacheEvent, CacheEventKind, CacheState, StageCache, StageId};
pub use config::{PipelineConfig, StoreConfig};
pub use error::{
    OutputPathError, RuntimeError, SchemaMismatchError, StageComputeError, StemError, StemResult,
    StoreError, ValidationError,
};
pub use meta::{Algorithm, MetadataFingerprint, SimulationMetadata};
pub use metrics::{
    compare_algorithm_probes, compare_probes, pearson_correlation, r_factor, ProbeComparison,
};
pub use pipeline::{
    AlwaysOverwrite, AveragedOutput, CalculationGuard, CalculationPipeline, ChannelReporter,
    FrozenPassAccumulator, NeverOverwrite, NullReporter, OverwriteConfirm, PassAccumulator,
    PassMutator, PriorArtifacts, ProbePair, ProgressEvent, ProgressReporter, RandomSeedMutator,
    StageKernel,
};
pub use runner::{RunSummary, Simulation};
#[cfg(feature = "persistent")]
pub use runner::{RunHandle, SimulationRuntime};
pub use store::{
    AxisDescriptor, CollisionPolicy, Container, DatasetDescriptor, DatasetKind, Hyperslab,
    MemoryContainer, StructuredStore, Values, VirtualMapping,
};
#[cfg(feature = "persistent")]
pub use store::FileContainer;

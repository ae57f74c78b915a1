//! Stage identifiers and the fixed stage order.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::meta::Algorithm;

/// One stage of the calculation.
///
/// Order is fixed: potential, compact operator, output. Recomputing a stage
/// invalidates every stage after it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum StageId {
    /// Projected potential slices.
    Potential,
    /// Compact scattering operator (PRISM only).
    CompactOperator,
    /// Final output tensors.
    Output,
}

impl StageId {
    /// All stages in order.
    pub const ALL: [Self; 3] = [Self::Potential, Self::CompactOperator, Self::Output];

    /// Position in the fixed stage order.
    #[must_use]
    pub const fn index(self) -> usize {
        match self {
            Self::Potential => 0,
            Self::CompactOperator => 1,
            Self::Output => 2,
        }
    }

    /// Stages invalidated when this one is recomputed.
    #[must_use]
    pub fn downstream(self) -> &'static [Self] {
        &Self::ALL[self.index() + 1..]
    }

    /// The stage whose artifact this one consumes under `algorithm`.
    #[must_use]
    pub const fn prerequisite(self, algorithm: Algorithm) -> Option<Self> {
        match (self, algorithm) {
            (Self::Potential, _) => None,
            (Self::CompactOperator, _) | (Self::Output, Algorithm::Multislice) => {
                Some(Self::Potential)
            }
            (Self::Output, Algorithm::Prism) => Some(Self::CompactOperator),
        }
    }

    /// Stages that run for `algorithm`, in order.
    #[must_use]
    pub fn chain(algorithm: Algorithm) -> &'static [Self] {
        match algorithm {
            Algorithm::Prism => &Self::ALL,
            Algorithm::Multislice => &[Self::Potential, Self::Output],
        }
    }

    /// Short lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Potential => "potential",
            Self::CompactOperator => "compact-operator",
            Self::Output => "output",
        }
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

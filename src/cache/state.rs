//! Cache state and its pure transitions.
//!
//! `CacheState` is plain data: every transition takes `&mut self`, performs
//! no I/O and returns the events it produced. The caller owns locking and
//! dispatches the events after releasing the lock.

use std::sync::Arc;

use crate::artifact::StageArtifact;
use crate::meta::{MetadataFingerprint, SimulationMetadata};

use super::stage::StageId;

/// What happened to a stage's cache slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheEventKind {
    /// The stored artifact matched and was returned as is.
    Reused,
    /// The kernel ran and its artifact was stored.
    Computed,
    /// A ready slot was marked stale.
    Invalidated,
}

/// A single cache transition, reported after the state lock is released.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheEvent {
    /// Affected stage.
    pub stage: StageId,
    /// Transition.
    pub kind: CacheEventKind,
}

impl CacheEvent {
    const fn new(stage: StageId, kind: CacheEventKind) -> Self {
        Self { stage, kind }
    }
}

#[derive(Debug, Clone)]
struct Slot {
    meta: SimulationMetadata,
    fingerprint: MetadataFingerprint,
    artifact: Arc<StageArtifact>,
}

/// Last metadata, readiness and artifact per stage.
///
/// A slot keeps its artifact after invalidation so observers can still read
/// the last completed result; only the readiness flag is cleared.
#[derive(Debug, Clone, Default)]
pub struct CacheState {
    slots: [Option<Slot>; 3],
    ready: [bool; 3],
}

impl CacheState {
    /// Returns the stored artifact if `stage` is ready and was computed from
    /// metadata equal to `meta`.
    #[must_use]
    pub fn lookup(
        &self,
        stage: StageId,
        meta: &SimulationMetadata,
        fingerprint: &MetadataFingerprint,
    ) -> Option<Arc<StageArtifact>> {
        let i = stage.index();
        if !self.ready[i] {
            return None;
        }
        let slot = self.slots[i].as_ref()?;
        (slot.fingerprint == *fingerprint && slot.meta == *meta).then(|| Arc::clone(&slot.artifact))
    }

    /// Clears readiness of `stage` and everything after it.
    pub fn invalidate_from(&mut self, stage: StageId) -> Vec<CacheEvent> {
        std::iter::once(stage)
            .chain(stage.downstream().iter().copied())
            .filter_map(|s| {
                let was_ready = std::mem::replace(&mut self.ready[s.index()], false);
                was_ready.then(|| CacheEvent::new(s, CacheEventKind::Invalidated))
            })
            .collect()
    }

    /// Stores a freshly computed artifact and marks the stage ready.
    pub fn store(
        &mut self,
        stage: StageId,
        meta: SimulationMetadata,
        fingerprint: MetadataFingerprint,
        artifact: Arc<StageArtifact>,
    ) -> CacheEvent {
        let i = stage.index();
        self.slots[i] = Some(Slot {
            meta,
            fingerprint,
            artifact,
        });
        self.ready[i] = true;
        CacheEvent::new(stage, CacheEventKind::Computed)
    }

    /// Records a cache hit.
    #[must_use]
    pub const fn reused(stage: StageId) -> CacheEvent {
        CacheEvent::new(stage, CacheEventKind::Reused)
    }

    /// Whether `stage` holds a current artifact.
    #[must_use]
    pub const fn is_ready(&self, stage: StageId) -> bool {
        self.ready[stage.index()]
    }

    /// Last completed artifact for `stage`, ready or not.
    #[must_use]
    pub fn artifact(&self, stage: StageId) -> Option<Arc<StageArtifact>> {
        self.slots[stage.index()]
            .as_ref()
            .map(|slot| Arc::clone(&slot.artifact))
    }

    /// Metadata the last artifact for `stage` was computed from.
    #[must_use]
    pub fn metadata(&self, stage: StageId) -> Option<&SimulationMetadata> {
        self.slots[stage.index()].as_ref().map(|slot| &slot.meta)
    }
}

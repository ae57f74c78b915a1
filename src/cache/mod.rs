//! Stage cache.
//!
//! ```text
//!   potential ──► compact-operator ──► output
//!       │                │                │
//!       └── invalidating a stage clears readiness of every stage to its right
//! ```
//!
//! `StageCache` is the single shared state object of a calculation. It owns
//! both locks around it:
//!
//! - the calculation lock, taken once per run by every pipeline sharing the
//!   cache, so at most one calculation sequence touches it at a time;
//! - the narrow cache-state lock around [`CacheState`], held only for one
//!   decide or store step and never across a kernel call, so readers see the
//!   last completed artifacts while a calculation runs.

mod stage;
mod state;

use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use crate::artifact::StageArtifact;
use crate::error::{StemError, StemResult};
use crate::meta::{MetadataFingerprint, SimulationMetadata};

pub use stage::StageId;
pub use state::{CacheEvent, CacheEventKind, CacheState};

fn lock_err(context: &'static str) -> StemError {
    StemError::internal(format!("cache state lock poisoned: {context}"))
}

/// Shared, lock-guarded cache state.
#[derive(Debug, Default)]
pub struct StageCache {
    calculation: Mutex<()>,
    state: RwLock<CacheState>,
}

impl StageCache {
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks until no other calculation holds the cache.
    ///
    /// # Errors
    /// Returns `StemError::Internal` if a previous holder panicked.
    pub(crate) fn lock_calculation(&self) -> StemResult<MutexGuard<'_, ()>> {
        self.calculation
            .lock()
            .map_err(|_| StemError::internal("calculation lock poisoned"))
    }

    /// Returns the artifact for `stage` if it is current for `meta`.
    ///
    /// # Errors
    /// Returns `StemError::Internal` if the lock is poisoned.
    pub fn lookup(
        &self,
        stage: StageId,
        meta: &SimulationMetadata,
        fingerprint: &MetadataFingerprint,
    ) -> StemResult<Option<Arc<StageArtifact>>> {
        let state = self.state.read().map_err(|_| lock_err("cache.lookup"))?;
        Ok(state.lookup(stage, meta, fingerprint))
    }

    /// Clears readiness of `stage` and its downstream stages.
    ///
    /// # Errors
    /// Returns `StemError::Internal` if the lock is poisoned.
    pub fn invalidate_from(&self, stage: StageId) -> StemResult<Vec<CacheEvent>> {
        let mut state = self.state.write().map_err(|_| lock_err("cache.invalidate"))?;
        Ok(state.invalidate_from(stage))
    }

    /// Stores a computed artifact.
    ///
    /// # Errors
    /// Returns `StemError::Internal` if the lock is poisoned.
    pub fn store(
        &self,
        stage: StageId,
        meta: SimulationMetadata,
        fingerprint: MetadataFingerprint,
        artifact: Arc<StageArtifact>,
    ) -> StemResult<CacheEvent> {
        let mut state = self.state.write().map_err(|_| lock_err("cache.store"))?;
        Ok(state.store(stage, meta, fingerprint, artifact))
    }

    /// Whether `stage` holds a current artifact.
    ///
    /// # Errors
    /// Returns `StemError::Internal` if the lock is poisoned.
    pub fn is_ready(&self, stage: StageId) -> StemResult<bool> {
        let state = self.state.read().map_err(|_| lock_err("cache.is_ready"))?;
        Ok(state.is_ready(stage))
    }

    /// Last completed artifact for `stage`.
    ///
    /// # Errors
    /// Returns `StemError::Internal` if the lock is poisoned.
    pub fn artifact(&self, stage: StageId) -> StemResult<Option<Arc<StageArtifact>>> {
        let state = self.state.read().map_err(|_| lock_err("cache.artifact"))?;
        Ok(state.artifact(stage))
    }

    /// Copy of the whole state.
    ///
    /// # Errors
    /// Returns `StemError::Internal` if the lock is poisoned.
    pub fn snapshot(&self) -> StemResult<CacheState> {
        let state = self.state.read().map_err(|_| lock_err("cache.snapshot"))?;
        Ok(state.clone())
    }

    /// Drops every slot.
    ///
    /// # Errors
    /// Returns `StemError::Internal` if the lock is poisoned.
    pub fn reset(&self) -> StemResult<()> {
        let mut state = self.state.write().map_err(|_| lock_err("cache.reset"))?;
        *state = CacheState::default();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    #[test]
    fn test_reader_sees_previous_artifact_during_recompute() {
        let cache = StageCache::new();
        let meta = SimulationMetadata::default();
        let fp = meta.fingerprint().unwrap();
        let art = Arc::new(StageArtifact::Potential(Array3::zeros((1, 1, 1))));
        cache.store(StageId::Potential, meta, fp, Arc::clone(&art)).unwrap();

        cache.invalidate_from(StageId::Potential).unwrap();
        assert!(!cache.is_ready(StageId::Potential).unwrap());
        let seen = cache.artifact(StageId::Potential).unwrap().unwrap();
        assert!(Arc::ptr_eq(&seen, &art));
    }

    #[test]
    fn test_calculation_lock_is_exclusive() {
        let cache = StageCache::new();
        let held = cache.lock_calculation().unwrap();
        assert!(cache.calculation.try_lock().is_err());
        // The state stays readable while a calculation holds the cache.
        assert!(!cache.is_ready(StageId::Potential).unwrap());
        drop(held);
        assert!(cache.calculation.try_lock().is_ok());
    }

    #[test]
    fn test_reset() {
        let cache = StageCache::new();
        let meta = SimulationMetadata::default();
        let fp = meta.fingerprint().unwrap();
        let art = Arc::new(StageArtifact::Potential(Array3::zeros((1, 1, 1))));
        cache.store(StageId::Potential, meta, fp, art).unwrap();
        cache.reset().unwrap();
        assert!(cache.snapshot().unwrap().artifact(StageId::Potential).is_none());
    }
}

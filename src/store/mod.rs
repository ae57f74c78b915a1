//! Structured output store.
//!
//! `StructuredStore` owns a [`Container`] and a store-wide write lock. The
//! lock serialises every write path, and in particular is held across the
//! whole read-add-write-flush of an accumulating datacube write.
//!
//! # Components
//!
//! - [`container`]: the abstract hierarchical container trait and value types
//! - [`memory`]: in-memory container
//! - [`persistent`]: file-backed container (feature `persistent`)
//! - [`schema`]: fixed layout and dataset declaration
//! - [`crop`]: frequency windows for datacubes
//! - `write`, `metadata`, `stitch`: write paths on `StructuredStore`

pub mod container;
pub mod crop;
pub mod memory;
pub mod metadata;
#[cfg(feature = "persistent")]
pub mod persistent;
pub mod schema;
pub mod slab;
pub mod stitch;
pub mod write;

#[cfg(feature = "persistent")]
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

#[cfg(feature = "persistent")]
use crate::config::StoreConfig;
use crate::error::{StemResult, StoreError};

pub use container::{
    AttrValue, Container, DataType, Hyperslab, NodeInfo, NodeKind, Values, VirtualSource,
};
pub use crop::{count_below, crop_datacube, fftshift, FrequencyWindow};
pub use memory::MemoryContainer;
pub use metadata::{parameter_attributes, RunRecord};
#[cfg(feature = "persistent")]
pub use persistent::FileContainer;
pub use schema::{
    declare_dataset, setup_layout, AxisDescriptor, AxisScale, DatasetDescriptor, DatasetKind,
};
pub use stitch::{CollisionPolicy, VirtualMapping, DEPTH_SERIES};
pub use write::{restride_trailing, restride_zyx};

/// The output store: a container plus the store write lock.
#[derive(Debug)]
pub struct StructuredStore {
    container: Arc<dyn Container>,
    write_lock: Mutex<()>,
}

impl StructuredStore {
    /// Wraps an existing container without touching its layout.
    #[must_use]
    pub fn new(container: Arc<dyn Container>) -> Self {
        Self {
            container,
            write_lock: Mutex::new(()),
        }
    }

    /// An in-memory store with the fixed layout already created.
    ///
    /// # Errors
    /// Returns a container error if the layout cannot be created.
    pub fn in_memory() -> StemResult<Self> {
        let store = Self::new(Arc::new(MemoryContainer::new()));
        store.setup_layout()?;
        Ok(store)
    }

    /// Creates (truncating) a file-backed store at `path` with the fixed
    /// layout.
    ///
    /// # Errors
    /// Returns a container error if the file cannot be locked or written.
    #[cfg(feature = "persistent")]
    pub fn create_file(path: impl AsRef<Path>, config: StoreConfig) -> StemResult<Self> {
        let config = config.validate()?;
        let container = FileContainer::create(path, config)?;
        let store = Self::new(Arc::new(container));
        store.setup_layout()?;
        Ok(store)
    }

    /// Opens an existing file-backed store.
    ///
    /// # Errors
    /// Returns a container error if the file cannot be locked, read or
    /// verified.
    #[cfg(feature = "persistent")]
    pub fn open_file(path: impl AsRef<Path>, config: StoreConfig) -> StemResult<Self> {
        let config = config.validate()?;
        let container = FileContainer::open(path, config)?;
        Ok(Self::new(Arc::new(container)))
    }

    /// Creates the fixed group layout and root attributes.
    ///
    /// # Errors
    /// Fails if the layout already exists.
    pub fn setup_layout(&self) -> Result<(), StoreError> {
        let _guard = self.lock_writes("store.setup_layout")?;
        schema::setup_layout(&*self.container)?;
        self.container.flush()
    }

    /// Declares a dataset of `kind` at group index `index`.
    ///
    /// # Errors
    /// See [`schema::declare_dataset`].
    pub fn declare_dataset(
        &self,
        kind: DatasetKind,
        index: usize,
        shape: &[usize],
        axes: Vec<AxisDescriptor>,
        output_depth: Option<f64>,
    ) -> Result<DatasetDescriptor, StoreError> {
        let _guard = self.lock_writes("store.declare_dataset")?;
        schema::declare_dataset(&*self.container, kind, index, shape, axes, output_depth)
    }

    /// Reads a whole dense or virtual dataset.
    ///
    /// # Errors
    /// Returns a container error if `path` is missing or a group.
    pub fn read(&self, path: &str) -> Result<Values, StoreError> {
        self.container.read_all(path)
    }

    /// Reads a slab of a dense or virtual dataset.
    ///
    /// # Errors
    /// Returns a container error if the slab does not fit.
    pub fn read_slab(&self, path: &str, slab: &Hyperslab) -> Result<Values, StoreError> {
        self.container.read_slab(path, slab)
    }

    /// Flushes the container.
    ///
    /// # Errors
    /// Returns a container error if the flush fails.
    pub fn flush(&self) -> Result<(), StoreError> {
        let _guard = self.lock_writes("store.flush")?;
        self.container.flush()
    }

    /// The underlying container.
    #[must_use]
    pub fn container(&self) -> &Arc<dyn Container> {
        &self.container
    }

    pub(crate) fn lock_writes(&self, context: &'static str) -> Result<MutexGuard<'_, ()>, StoreError> {
        self.write_lock
            .lock()
            .map_err(|_| StoreError::Poisoned { context })
    }
}

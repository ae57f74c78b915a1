//! File-backed container.
//!
//! The node tree lives in memory and is written whole on every flush that
//! follows a change, to a temporary sibling that is then renamed over the
//! target. A flush whose encoding exceeds `max_file_size` is refused, so
//! every committed file can be reopened.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Result as IoResult, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use uuid::Uuid;

use crate::config::StoreConfig;
use crate::error::StoreError;
use crate::store::container::{
    AttrValue, Container, DataType, Hyperslab, NodeInfo, Values, VirtualSource,
};
use crate::store::memory::{MemoryContainer, Tree};

use super::codec;
use super::output_lock::OutputLock;

/// Container persisted to a single file.
///
/// The output stays claimed by this container until it is dropped.
#[derive(Debug)]
pub struct FileContainer {
    inner: MemoryContainer,
    path: PathBuf,
    config: StoreConfig,
    dirty: AtomicBool,
    lock: OutputLock,
}

impl FileContainer {
    /// Creates (or truncates) the file at `path` holding only the root group.
    ///
    /// # Errors
    /// Returns `StoreError::Io` if the lock is held elsewhere or the file
    /// cannot be written.
    pub fn create(path: impl AsRef<Path>, config: StoreConfig) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let lock = OutputLock::acquire(&path).map_err(|e| StoreError::io("lock output file", &e))?;
        let container = Self {
            inner: MemoryContainer::new(),
            path,
            config,
            dirty: AtomicBool::new(true),
            lock,
        };
        container.flush()?;
        Ok(container)
    }

    /// Opens an existing container file.
    ///
    /// # Errors
    /// Returns `StoreError::Io` if the file cannot be read or locked, and
    /// `StoreError::Corrupted` if the frame fails verification.
    pub fn open(path: impl AsRef<Path>, config: StoreConfig) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let lock = OutputLock::acquire(&path).map_err(|e| StoreError::io("lock output file", &e))?;
        let file = File::open(&path).map_err(|e| StoreError::io("open output file", &e))?;
        let mut reader = BufReader::new(file);
        let tree: Tree = codec::read_frame(&mut reader, config.max_file_size).map_err(|e| {
            StoreError::Corrupted {
                message: format!("{}: {e}", path.display()),
            }
        })?;
        Ok(Self {
            inner: MemoryContainer::from_tree(tree),
            path,
            config,
            dirty: AtomicBool::new(false),
            lock,
        })
    }

    /// Path of the container file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path of the lock file held while the container is open.
    #[must_use]
    pub fn lock_path(&self) -> &Path {
        self.lock.path()
    }

    fn changed<T>(&self, result: Result<T, StoreError>) -> Result<T, StoreError> {
        if result.is_ok() {
            self.dirty.store(true, Ordering::SeqCst);
        }
        result
    }

    fn write_out(&self) -> Result<(), StoreError> {
        let tree = self.inner.snapshot()?;
        let body = codec::encode_body(&tree).map_err(|e| StoreError::io("encode output file", &e))?;
        let size = body.len() as u64;
        if size > self.config.max_file_size {
            return Err(StoreError::TooLarge {
                path: self.path.display().to_string(),
                size,
                limit: self.config.max_file_size,
            });
        }
        let writer = AtomicFileWriter::new(self.path.clone())
            .map_err(|e| StoreError::io("create temporary output file", &e))?;
        writer
            .commit(&body, self.config.sync_on_flush)
            .map_err(|e| StoreError::io("write output file", &e))
    }
}

impl Container for FileContainer {
    fn create_group(&self, path: &str) -> Result<(), StoreError> {
        self.changed(self.inner.create_group(path))
    }

    fn create_dataset(&self, path: &str, shape: &[usize], dtype: DataType) -> Result<(), StoreError> {
        self.changed(self.inner.create_dataset(path, shape, dtype))
    }

    fn create_virtual(
        &self,
        path: &str,
        shape: &[usize],
        dtype: DataType,
        sources: Vec<VirtualSource>,
    ) -> Result<(), StoreError> {
        self.changed(self.inner.create_virtual(path, shape, dtype, sources))
    }

    fn set_attr(&self, path: &str, name: &str, value: AttrValue) -> Result<(), StoreError> {
        self.changed(self.inner.set_attr(path, name, value))
    }

    fn attrs(&self, path: &str) -> Result<BTreeMap<String, AttrValue>, StoreError> {
        self.inner.attrs(path)
    }

    fn info(&self, path: &str) -> Result<NodeInfo, StoreError> {
        self.inner.info(path)
    }

    fn children(&self, path: &str) -> Result<Vec<String>, StoreError> {
        self.inner.children(path)
    }

    fn exists(&self, path: &str) -> Result<bool, StoreError> {
        self.inner.exists(path)
    }

    fn write_slab(&self, path: &str, slab: &Hyperslab, values: Values) -> Result<(), StoreError> {
        self.changed(self.inner.write_slab(path, slab, values))
    }

    fn read_slab(&self, path: &str, slab: &Hyperslab) -> Result<Values, StoreError> {
        self.inner.read_slab(path, slab)
    }

    fn flush(&self) -> Result<(), StoreError> {
        if !self.dirty.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let result = self.write_out();
        if result.is_err() {
            self.dirty.store(true, Ordering::SeqCst);
        }
        result
    }
}

/// Writes a temporary sibling and renames it over the target on commit.
///
/// The temporary file is removed if the writer is dropped uncommitted.
struct AtomicFileWriter {
    temp_path: Option<PathBuf>,
    final_path: PathBuf,
    writer: Option<BufWriter<File>>,
}

impl AtomicFileWriter {
    fn new(final_path: PathBuf) -> IoResult<Self> {
        let mut name = final_path.file_name().unwrap_or_default().to_os_string();
        name.push(format!(".tmp.{}", Uuid::new_v4()));
        let temp_path = final_path.with_file_name(name);

        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&temp_path)?;

        Ok(Self {
            temp_path: Some(temp_path),
            final_path,
            writer: Some(BufWriter::new(file)),
        })
    }

    fn commit(mut self, body: &[u8], sync: bool) -> IoResult<()> {
        let (Some(mut writer), Some(temp_path)) = (self.writer.take(), self.temp_path.take())
        else {
            return Err(std::io::Error::other("writer already consumed"));
        };
        // Put the path back so Drop cleans up on failure below.
        self.temp_path = Some(temp_path.clone());

        codec::write_frame(&mut writer, body)?;
        writer.flush()?;
        if sync {
            writer.get_ref().sync_all()?;
        }
        drop(writer);

        fs::rename(&temp_path, &self.final_path)?;
        self.temp_path = None;
        Ok(())
    }
}

impl Drop for AtomicFileWriter {
    fn drop(&mut self) {
        self.writer.take();
        if let Some(ref temp_path) = self.temp_path {
            if temp_path.exists() {
                let _ = fs::remove_file(temp_path);
            }
        }
    }
}

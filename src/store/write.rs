//! Dense and accumulating dataset writes.
//!
//! Datacubes are written incrementally: each frozen pass adds its share
//! (`block / num_passes`) to the stored region under the store write lock.
//! The kernels emit frequency axes as `[q_y, q_x]`; storage order is
//! `[q_x, q_y]`, so every trailing 2-D block is transposed on the way in.

use ndarray::{Array3, Array4};
use tracing::debug;

use crate::error::StoreError;

use super::container::{Hyperslab, Values};
use super::schema::{DatasetDescriptor, DatasetKind};
use super::StructuredStore;

/// Transposes the trailing two axes of a row-major buffer.
///
/// `rows` and `cols` describe the incoming trailing block; the output block
/// is `cols x rows`.
#[must_use]
pub fn restride_trailing<T: Copy>(buffer: &[T], rows: usize, cols: usize) -> Vec<T> {
    let block = rows * cols;
    if block == 0 {
        return Vec::new();
    }
    let mut out = Vec::with_capacity(buffer.len());
    for chunk in buffer.chunks(block) {
        for i in 0..cols {
            for j in 0..rows {
                out.push(chunk[j * cols + i]);
            }
        }
    }
    out
}

/// Flattens a `[z, y, x]` volume in `[x, y, z]` order.
#[must_use]
pub fn restride_zyx<T: Clone>(volume: &Array3<T>) -> Vec<T> {
    volume.view().permuted_axes([2, 1, 0]).iter().cloned().collect()
}

impl StructuredStore {
    /// Writes a whole payload under the store write lock.
    ///
    /// # Errors
    /// Returns a container error if the payload does not match the
    /// declaration.
    pub fn write_dense(&self, desc: &DatasetDescriptor, values: Values) -> Result<(), StoreError> {
        let _guard = self.lock_writes("store.write_dense")?;
        self.container.write_all(&desc.path, values)?;
        self.container.flush()
    }

    /// Adds one pass's share of a datacube block to the stored region.
    ///
    /// `block` is `[x, y, q_y, q_x]` and lands at scan offset `scan_offset`
    /// covering the full frequency extent. The store write lock is held
    /// across the read, add, write and flush.
    ///
    /// # Errors
    /// Returns `StoreError::InvalidDeclaration` if `desc` is not a datacube,
    /// `StoreError::OutOfBounds` if the block does not fit, and any container
    /// error.
    pub fn accumulate_datacube(
        &self,
        desc: &DatasetDescriptor,
        scan_offset: [usize; 2],
        block: &Array4<f32>,
        num_passes: u32,
    ) -> Result<(), StoreError> {
        if desc.kind != DatasetKind::Datacube {
            return Err(StoreError::InvalidDeclaration {
                kind: format!("{:?}", desc.kind),
                reason: "accumulating writes only apply to datacubes".to_string(),
            });
        }
        let (bx, by, qy, qx) = block.dim();
        let slab = Hyperslab::new(
            vec![scan_offset[0], scan_offset[1], 0, 0],
            vec![bx, by, qx, qy],
        );
        if !slab.fits(&desc.shape) {
            return Err(StoreError::OutOfBounds {
                path: desc.path.clone(),
                offset: slab.offset,
                extent: slab.extent,
                shape: desc.shape.clone(),
            });
        }

        #[allow(clippy::cast_precision_loss)]
        let passes = num_passes.max(1) as f32;
        let scaled: Vec<f32> = block.iter().map(|v| v / passes).collect();
        let mut incoming = restride_trailing(&scaled, qy, qx);

        let _guard = self.lock_writes("store.accumulate_datacube")?;
        let existing = self
            .container
            .read_slab(&desc.path, &slab)?
            .into_f32()
            .ok_or_else(|| StoreError::WrongElementType {
                path: desc.path.clone(),
                expected: "float32".to_string(),
                actual: "other".to_string(),
            })?;
        for (acc, old) in incoming.iter_mut().zip(&existing) {
            *acc += old;
        }
        self.container
            .write_slab(&desc.path, &slab, Values::Float32(incoming))?;
        self.container.flush()?;
        debug!(path = %desc.path, ?scan_offset, "accumulated datacube block");
        Ok(())
    }
}

//! Row-major slab addressing.

use super::container::Hyperslab;

/// Flat row-major indices of every element of `slab` inside `shape`.
///
/// The slab must fit the shape; check with [`Hyperslab::fits`] first.
#[must_use]
pub fn slab_indices(shape: &[usize], slab: &Hyperslab) -> Vec<usize> {
    let rank = shape.len();
    let count = slab.len();
    if count == 0 {
        return Vec::new();
    }
    if rank == 0 {
        return vec![0];
    }

    let mut strides = vec![1usize; rank];
    for axis in (0..rank - 1).rev() {
        strides[axis] = strides[axis + 1] * shape[axis + 1];
    }

    let mut out = Vec::with_capacity(count);
    let mut cursor = vec![0usize; rank];
    loop {
        let flat: usize = cursor
            .iter()
            .zip(&slab.offset)
            .zip(&strides)
            .map(|((&c, &o), &s)| (c + o) * s)
            .sum();
        out.push(flat);

        // Odometer step, last axis fastest.
        let mut axis = rank;
        loop {
            if axis == 0 {
                return out;
            }
            axis -= 1;
            cursor[axis] += 1;
            if cursor[axis] < slab.extent[axis] {
                break;
            }
            cursor[axis] = 0;
        }
    }
}

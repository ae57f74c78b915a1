//! Abstract hierarchical container.
//!
//! A container holds named groups, typed multi-dimensional datasets, virtual
//! datasets that map other datasets into a larger shape, and scalar or vector
//! attributes on any node. Paths are `/`-separated; the root is `""`.

use std::collections::BTreeMap;
use std::fmt;

use num_complex::Complex32;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// Element type of a dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    /// 32-bit float.
    Float32,
    /// 64-bit float.
    Float64,
    /// 32-bit signed integer.
    Int32,
    /// Complex record with `r` and `i` float members.
    Complex32,
    /// Fixed-width text.
    Text,
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Float32 => "float32",
            Self::Float64 => "float64",
            Self::Int32 => "int32",
            Self::Complex32 => "complex32",
            Self::Text => "text",
        };
        f.write_str(name)
    }
}

/// A flat, row-major buffer of dataset elements.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "values")]
pub enum Values {
    Float32(Vec<f32>),
    Float64(Vec<f64>),
    Int32(Vec<i32>),
    Complex32(Vec<Complex32>),
    Text(Vec<String>),
}

impl Values {
    /// A zero-filled buffer.
    #[must_use]
    pub fn zeros(dtype: DataType, len: usize) -> Self {
        match dtype {
            DataType::Float32 => Self::Float32(vec![0.0; len]),
            DataType::Float64 => Self::Float64(vec![0.0; len]),
            DataType::Int32 => Self::Int32(vec![0; len]),
            DataType::Complex32 => Self::Complex32(vec![Complex32::new(0.0, 0.0); len]),
            DataType::Text => Self::Text(vec![String::new(); len]),
        }
    }

    /// Element type.
    #[must_use]
    pub const fn dtype(&self) -> DataType {
        match self {
            Self::Float32(_) => DataType::Float32,
            Self::Float64(_) => DataType::Float64,
            Self::Int32(_) => DataType::Int32,
            Self::Complex32(_) => DataType::Complex32,
            Self::Text(_) => DataType::Text,
        }
    }

    /// Number of elements.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Float32(v) => v.len(),
            Self::Float64(v) => v.len(),
            Self::Int32(v) => v.len(),
            Self::Complex32(v) => v.len(),
            Self::Text(v) => v.len(),
        }
    }

    /// Returns true if there are no elements.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copies out the elements at `indices`.
    #[must_use]
    pub fn gather(&self, indices: &[usize]) -> Self {
        match self {
            Self::Float32(v) => Self::Float32(indices.iter().map(|&i| v[i]).collect()),
            Self::Float64(v) => Self::Float64(indices.iter().map(|&i| v[i]).collect()),
            Self::Int32(v) => Self::Int32(indices.iter().map(|&i| v[i]).collect()),
            Self::Complex32(v) => Self::Complex32(indices.iter().map(|&i| v[i]).collect()),
            Self::Text(v) => Self::Text(indices.iter().map(|&i| v[i].clone()).collect()),
        }
    }

    /// Writes `src` element `k` to position `indices[k]`.
    ///
    /// Returns false without writing if the element types differ.
    pub fn scatter(&mut self, indices: &[usize], src: &Self) -> bool {
        match (self, src) {
            (Self::Float32(dst), Self::Float32(src)) => scatter_into(dst, indices, src),
            (Self::Float64(dst), Self::Float64(src)) => scatter_into(dst, indices, src),
            (Self::Int32(dst), Self::Int32(src)) => scatter_into(dst, indices, src),
            (Self::Complex32(dst), Self::Complex32(src)) => scatter_into(dst, indices, src),
            (Self::Text(dst), Self::Text(src)) => scatter_into(dst, indices, src),
            _ => return false,
        }
        true
    }

    /// Borrows 32-bit float elements.
    #[must_use]
    pub fn as_f32(&self) -> Option<&[f32]> {
        match self {
            Self::Float32(v) => Some(v),
            _ => None,
        }
    }

    /// Takes 32-bit float elements.
    #[must_use]
    pub fn into_f32(self) -> Option<Vec<f32>> {
        match self {
            Self::Float32(v) => Some(v),
            _ => None,
        }
    }

    /// Borrows complex elements.
    #[must_use]
    pub fn as_complex32(&self) -> Option<&[Complex32]> {
        match self {
            Self::Complex32(v) => Some(v),
            _ => None,
        }
    }

    /// Borrows text elements.
    #[must_use]
    pub fn as_text(&self) -> Option<&[String]> {
        match self {
            Self::Text(v) => Some(v),
            _ => None,
        }
    }
}

fn scatter_into<T: Clone>(dst: &mut [T], indices: &[usize], src: &[T]) {
    for (&i, v) in indices.iter().zip(src) {
        dst[i] = v.clone();
    }
}

/// Attribute value.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum AttrValue {
    Int(i64),
    Float(f64),
    Text(String),
    IntVec(Vec<i64>),
    FloatVec(Vec<f64>),
}

impl AttrValue {
    /// Integer value, if this is one.
    #[must_use]
    pub const fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Float value, if this is one.
    #[must_use]
    pub const fn as_float(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(*v),
            _ => None,
        }
    }

    /// Text value, if this is one.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(v) => Some(v),
            _ => None,
        }
    }
}

impl From<i64> for AttrValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for AttrValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for AttrValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

/// A rectangular region of a dataset.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Hyperslab {
    /// Start index per axis.
    pub offset: Vec<usize>,
    /// Count per axis.
    pub extent: Vec<usize>,
}

impl Hyperslab {
    /// A slab from `offset` spanning `extent`.
    #[must_use]
    pub fn new(offset: Vec<usize>, extent: Vec<usize>) -> Self {
        Self { offset, extent }
    }

    /// The whole of a dataset with `shape`.
    #[must_use]
    pub fn full(shape: &[usize]) -> Self {
        Self {
            offset: vec![0; shape.len()],
            extent: shape.to_vec(),
        }
    }

    /// Number of elements covered.
    #[must_use]
    pub fn len(&self) -> usize {
        self.extent.iter().product()
    }

    /// Returns true if the slab covers no elements.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns true if the slab lies inside `shape`.
    #[must_use]
    pub fn fits(&self, shape: &[usize]) -> bool {
        self.offset.len() == shape.len()
            && self.extent.len() == shape.len()
            && self
                .offset
                .iter()
                .zip(&self.extent)
                .zip(shape)
                .all(|((&o, &e), &s)| o.checked_add(e).is_some_and(|end| end <= s))
    }
}

/// One source of a virtual dataset.
///
/// The full extent of `source` fills the region `offset + extent` of the
/// virtual dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VirtualSource {
    /// Path of the source dataset.
    pub source: String,
    /// Region of the virtual dataset filled by the source.
    pub region: Hyperslab,
}

/// Kind of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// Group.
    Group,
    /// Dense dataset.
    Dataset,
    /// Virtual dataset.
    Virtual,
}

/// Shape and type information for a node.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeInfo {
    /// Kind of node.
    pub kind: NodeKind,
    /// Dataset shape; empty for groups.
    pub shape: Vec<usize>,
    /// Element type; `None` for groups.
    pub dtype: Option<DataType>,
}

/// A writable hierarchical container.
///
/// Parents must exist before children are created. Reads through a virtual
/// dataset resolve its sources at read time; regions no source covers read
/// as zero.
pub trait Container: Send + Sync + fmt::Debug {
    /// Creates a group.
    fn create_group(&self, path: &str) -> Result<(), StoreError>;

    /// Creates a zero-filled dataset.
    fn create_dataset(&self, path: &str, shape: &[usize], dtype: DataType) -> Result<(), StoreError>;

    /// Creates a virtual dataset over existing sources.
    fn create_virtual(
        &self,
        path: &str,
        shape: &[usize],
        dtype: DataType,
        sources: Vec<VirtualSource>,
    ) -> Result<(), StoreError>;

    /// Sets (or replaces) an attribute.
    fn set_attr(&self, path: &str, name: &str, value: AttrValue) -> Result<(), StoreError>;

    /// All attributes of a node.
    fn attrs(&self, path: &str) -> Result<BTreeMap<String, AttrValue>, StoreError>;

    /// Shape and type of a node.
    fn info(&self, path: &str) -> Result<NodeInfo, StoreError>;

    /// Names of the direct children of a group, sorted.
    fn children(&self, path: &str) -> Result<Vec<String>, StoreError>;

    /// Returns true if a node exists at `path`.
    fn exists(&self, path: &str) -> Result<bool, StoreError>;

    /// Writes `values` into the slab of a dense dataset.
    fn write_slab(&self, path: &str, slab: &Hyperslab, values: Values) -> Result<(), StoreError>;

    /// Reads the slab of a dense or virtual dataset.
    fn read_slab(&self, path: &str, slab: &Hyperslab) -> Result<Values, StoreError>;

    /// Makes written content durable.
    fn flush(&self) -> Result<(), StoreError>;

    /// Reads one attribute.
    fn attr(&self, path: &str, name: &str) -> Result<Option<AttrValue>, StoreError> {
        Ok(self.attrs(path)?.remove(name))
    }

    /// Reads a whole dataset.
    fn read_all(&self, path: &str) -> Result<Values, StoreError> {
        let info = self.info(path)?;
        self.read_slab(path, &Hyperslab::full(&info.shape))
    }

    /// Writes a whole dataset.
    fn write_all(&self, path: &str, values: Values) -> Result<(), StoreError> {
        let info = self.info(path)?;
        self.write_slab(path, &Hyperslab::full(&info.shape), values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hyperslab_fits() {
        let shape = [4, 3];
        assert!(Hyperslab::new(vec![1, 0], vec![3, 3]).fits(&shape));
        assert!(!Hyperslab::new(vec![2, 0], vec![3, 3]).fits(&shape));
        assert!(!Hyperslab::new(vec![0], vec![4]).fits(&shape));
        assert!(!Hyperslab::new(vec![usize::MAX, 0], vec![2, 1]).fits(&shape));
    }

    #[test]
    fn test_gather_scatter() {
        let mut dst = Values::zeros(DataType::Int32, 5);
        assert!(dst.scatter(&[4, 0], &Values::Int32(vec![7, 9])));
        assert_eq!(dst, Values::Int32(vec![9, 0, 0, 0, 7]));
        assert_eq!(dst.gather(&[4, 4, 0]), Values::Int32(vec![7, 7, 9]));
    }

    #[test]
    fn test_scatter_rejects_type_mismatch() {
        let mut dst = Values::zeros(DataType::Float32, 2);
        assert!(!dst.scatter(&[0], &Values::Int32(vec![1])));
        assert_eq!(dst, Values::Float32(vec![0.0, 0.0]));
    }
}

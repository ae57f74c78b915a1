//! In-memory container.
//!
//! The node tree is a path-keyed `BTreeMap` behind an `RwLock`. The
//! file-backed container persists the same tree.

use std::collections::BTreeMap;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use crate::error::StoreError;

use super::container::{
    AttrValue, Container, DataType, Hyperslab, NodeInfo, NodeKind, Values, VirtualSource,
};
use super::slab::slab_indices;

fn lock_err(context: &'static str) -> StoreError {
    StoreError::Poisoned { context }
}

fn normalize(path: &str) -> &str {
    path.trim_matches('/')
}

fn parent_of(path: &str) -> &str {
    path.rsplit_once('/').map_or("", |(parent, _)| parent)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "node")]
enum Node {
    Group {
        attrs: BTreeMap<String, AttrValue>,
    },
    Dataset {
        attrs: BTreeMap<String, AttrValue>,
        shape: Vec<usize>,
        data: Values,
    },
    Virtual {
        attrs: BTreeMap<String, AttrValue>,
        shape: Vec<usize>,
        dtype: DataType,
        sources: Vec<VirtualSource>,
    },
}

impl Node {
    fn attrs(&self) -> &BTreeMap<String, AttrValue> {
        match self {
            Self::Group { attrs } | Self::Dataset { attrs, .. } | Self::Virtual { attrs, .. } => {
                attrs
            }
        }
    }

    fn attrs_mut(&mut self) -> &mut BTreeMap<String, AttrValue> {
        match self {
            Self::Group { attrs } | Self::Dataset { attrs, .. } | Self::Virtual { attrs, .. } => {
                attrs
            }
        }
    }

    fn info(&self) -> NodeInfo {
        match self {
            Self::Group { .. } => NodeInfo {
                kind: NodeKind::Group,
                shape: Vec::new(),
                dtype: None,
            },
            Self::Dataset { shape, data, .. } => NodeInfo {
                kind: NodeKind::Dataset,
                shape: shape.clone(),
                dtype: Some(data.dtype()),
            },
            Self::Virtual { shape, dtype, .. } => NodeInfo {
                kind: NodeKind::Virtual,
                shape: shape.clone(),
                dtype: Some(*dtype),
            },
        }
    }
}

/// The node tree shared by both container implementations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct Tree {
    nodes: BTreeMap<String, Node>,
}

impl Default for Tree {
    fn default() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(
            String::new(),
            Node::Group {
                attrs: BTreeMap::new(),
            },
        );
        Self { nodes }
    }
}

impl Tree {
    fn node(&self, path: &str) -> Result<&Node, StoreError> {
        self.nodes
            .get(path)
            .ok_or_else(|| StoreError::NotFound(path.to_string()))
    }

    fn insert(&mut self, path: &str, node: Node) -> Result<(), StoreError> {
        if path.is_empty() || self.nodes.contains_key(path) {
            return Err(StoreError::AlreadyExists(path.to_string()));
        }
        match self.nodes.get(parent_of(path)) {
            Some(Node::Group { .. }) => {}
            Some(_) => {
                return Err(StoreError::WrongNodeKind {
                    path: parent_of(path).to_string(),
                    expected: "group",
                })
            }
            None => return Err(StoreError::MissingParent(path.to_string())),
        }
        self.nodes.insert(path.to_string(), node);
        Ok(())
    }

    fn create_group(&mut self, path: &str) -> Result<(), StoreError> {
        self.insert(
            path,
            Node::Group {
                attrs: BTreeMap::new(),
            },
        )
    }

    fn create_dataset(&mut self, path: &str, shape: &[usize], dtype: DataType) -> Result<(), StoreError> {
        let len = shape.iter().product();
        self.insert(
            path,
            Node::Dataset {
                attrs: BTreeMap::new(),
                shape: shape.to_vec(),
                data: Values::zeros(dtype, len),
            },
        )
    }

    fn create_virtual(
        &mut self,
        path: &str,
        shape: &[usize],
        dtype: DataType,
        sources: Vec<VirtualSource>,
    ) -> Result<(), StoreError> {
        for src in &sources {
            let info = self.node(&src.source)?.info();
            if info.kind == NodeKind::Group {
                return Err(StoreError::WrongNodeKind {
                    path: src.source.clone(),
                    expected: "dataset",
                });
            }
            if info.dtype != Some(dtype) {
                return Err(StoreError::WrongElementType {
                    path: src.source.clone(),
                    expected: dtype.to_string(),
                    actual: info.dtype.map_or_else(String::new, |d| d.to_string()),
                });
            }
            let count: usize = info.shape.iter().product();
            if !src.region.fits(shape) || src.region.len() != count {
                return Err(StoreError::OutOfBounds {
                    path: path.to_string(),
                    offset: src.region.offset.clone(),
                    extent: src.region.extent.clone(),
                    shape: shape.to_vec(),
                });
            }
        }
        self.insert(
            path,
            Node::Virtual {
                attrs: BTreeMap::new(),
                shape: shape.to_vec(),
                dtype,
                sources,
            },
        )
    }

    fn set_attr(&mut self, path: &str, name: &str, value: AttrValue) -> Result<(), StoreError> {
        let node = self
            .nodes
            .get_mut(path)
            .ok_or_else(|| StoreError::NotFound(path.to_string()))?;
        node.attrs_mut().insert(name.to_string(), value);
        Ok(())
    }

    fn children(&self, path: &str) -> Result<Vec<String>, StoreError> {
        match self.node(path)? {
            Node::Group { .. } => {}
            _ => {
                return Err(StoreError::WrongNodeKind {
                    path: path.to_string(),
                    expected: "group",
                })
            }
        }
        let prefix = if path.is_empty() {
            String::new()
        } else {
            format!("{path}/")
        };
        Ok(self
            .nodes
            .range(prefix.clone()..)
            .map(|(k, _)| k)
            .take_while(|k| k.starts_with(&prefix))
            .filter_map(|k| {
                let rest = &k[prefix.len()..];
                (!rest.is_empty() && !rest.contains('/')).then(|| rest.to_string())
            })
            .collect())
    }

    fn write_slab(&mut self, path: &str, slab: &Hyperslab, values: &Values) -> Result<(), StoreError> {
        let node = self
            .nodes
            .get_mut(path)
            .ok_or_else(|| StoreError::NotFound(path.to_string()))?;
        let Node::Dataset { shape, data, .. } = node else {
            return Err(StoreError::WrongNodeKind {
                path: path.to_string(),
                expected: "dense dataset",
            });
        };
        check_slab(path, shape, slab)?;
        if values.len() != slab.len() {
            return Err(StoreError::LengthMismatch {
                path: path.to_string(),
                expected: slab.len(),
                actual: values.len(),
            });
        }
        let indices = slab_indices(shape, slab);
        if !data.scatter(&indices, values) {
            return Err(StoreError::WrongElementType {
                path: path.to_string(),
                expected: values.dtype().to_string(),
                actual: data.dtype().to_string(),
            });
        }
        Ok(())
    }

    fn read_slab(&self, path: &str, slab: &Hyperslab) -> Result<Values, StoreError> {
        match self.node(path)? {
            Node::Group { .. } => Err(StoreError::WrongNodeKind {
                path: path.to_string(),
                expected: "dataset",
            }),
            Node::Dataset { shape, data, .. } => {
                check_slab(path, shape, slab)?;
                Ok(data.gather(&slab_indices(shape, slab)))
            }
            Node::Virtual {
                shape,
                dtype,
                sources,
                ..
            } => {
                check_slab(path, shape, slab)?;
                let full = self.resolve_virtual(shape, *dtype, sources)?;
                Ok(full.gather(&slab_indices(shape, slab)))
            }
        }
    }

    fn resolve_virtual(
        &self,
        shape: &[usize],
        dtype: DataType,
        sources: &[VirtualSource],
    ) -> Result<Values, StoreError> {
        let mut full = Values::zeros(dtype, shape.iter().product());
        for src in sources {
            let src_shape = self.node(&src.source)?.info().shape;
            let data = self.read_slab(&src.source, &Hyperslab::full(&src_shape))?;
            let indices = slab_indices(shape, &src.region);
            if !full.scatter(&indices, &data) {
                return Err(StoreError::WrongElementType {
                    path: src.source.clone(),
                    expected: dtype.to_string(),
                    actual: data.dtype().to_string(),
                });
            }
        }
        Ok(full)
    }
}

fn check_slab(path: &str, shape: &[usize], slab: &Hyperslab) -> Result<(), StoreError> {
    if slab.fits(shape) {
        Ok(())
    } else {
        Err(StoreError::OutOfBounds {
            path: path.to_string(),
            offset: slab.offset.clone(),
            extent: slab.extent.clone(),
            shape: shape.to_vec(),
        })
    }
}

/// Container held entirely in memory.
#[derive(Debug, Default)]
pub struct MemoryContainer {
    tree: RwLock<Tree>,
}

impl MemoryContainer {
    /// Creates an empty container holding only the root group.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn from_tree(tree: Tree) -> Self {
        Self {
            tree: RwLock::new(tree),
        }
    }

    pub(crate) fn snapshot(&self) -> Result<Tree, StoreError> {
        let tree = self.tree.read().map_err(|_| lock_err("memory.snapshot"))?;
        Ok(tree.clone())
    }
}

impl Container for MemoryContainer {
    fn create_group(&self, path: &str) -> Result<(), StoreError> {
        let mut tree = self.tree.write().map_err(|_| lock_err("memory.create_group"))?;
        tree.create_group(normalize(path))
    }

    fn create_dataset(&self, path: &str, shape: &[usize], dtype: DataType) -> Result<(), StoreError> {
        let mut tree = self.tree.write().map_err(|_| lock_err("memory.create_dataset"))?;
        tree.create_dataset(normalize(path), shape, dtype)
    }

    fn create_virtual(
        &self,
        path: &str,
        shape: &[usize],
        dtype: DataType,
        sources: Vec<VirtualSource>,
    ) -> Result<(), StoreError> {
        let sources = sources
            .into_iter()
            .map(|s| VirtualSource {
                source: normalize(&s.source).to_string(),
                region: s.region,
            })
            .collect();
        let mut tree = self.tree.write().map_err(|_| lock_err("memory.create_virtual"))?;
        tree.create_virtual(normalize(path), shape, dtype, sources)
    }

    fn set_attr(&self, path: &str, name: &str, value: AttrValue) -> Result<(), StoreError> {
        let mut tree = self.tree.write().map_err(|_| lock_err("memory.set_attr"))?;
        tree.set_attr(normalize(path), name, value)
    }

    fn attrs(&self, path: &str) -> Result<BTreeMap<String, AttrValue>, StoreError> {
        let tree = self.tree.read().map_err(|_| lock_err("memory.attrs"))?;
        Ok(tree.node(normalize(path))?.attrs().clone())
    }

    fn info(&self, path: &str) -> Result<NodeInfo, StoreError> {
        let tree = self.tree.read().map_err(|_| lock_err("memory.info"))?;
        Ok(tree.node(normalize(path))?.info())
    }

    fn children(&self, path: &str) -> Result<Vec<String>, StoreError> {
        let tree = self.tree.read().map_err(|_| lock_err("memory.children"))?;
        tree.children(normalize(path))
    }

    fn exists(&self, path: &str) -> Result<bool, StoreError> {
        let tree = self.tree.read().map_err(|_| lock_err("memory.exists"))?;
        Ok(tree.nodes.contains_key(normalize(path)))
    }

    fn write_slab(&self, path: &str, slab: &Hyperslab, values: Values) -> Result<(), StoreError> {
        let mut tree = self.tree.write().map_err(|_| lock_err("memory.write_slab"))?;
        tree.write_slab(normalize(path), slab, &values)
    }

    fn read_slab(&self, path: &str, slab: &Hyperslab) -> Result<Values, StoreError> {
        let tree = self.tree.read().map_err(|_| lock_err("memory.read_slab"))?;
        tree.read_slab(normalize(path), slab)
    }

    fn flush(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

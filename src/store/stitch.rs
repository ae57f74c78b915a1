//! Virtual-dataset stitching.
//!
//! Stitching merges N same-shaped datasets into one virtual dataset with
//! extra trailing axes. Each source fills a one-element slab along every new
//! axis at its index tuple; no data is copied. Supergroups wrap a stitched
//! dataset with the exemplar's dimension scales plus `sgdimN` scales for the
//! new axes.

use std::collections::HashMap;

use regex::Regex;
use tracing::{debug, info, warn};

use crate::error::{SchemaMismatchError, StemError, StemResult, StoreError};

use super::container::{AttrValue, DataType, Hyperslab, VirtualSource};
use super::schema::{
    write_axis_scale, AxisDescriptor, DatasetKind, GROUP_TYPE_SUPERGROUP, REALSLICES, SUPERGROUPS,
};
use super::StructuredStore;

/// Name of the depth-series supergroup.
pub const DEPTH_SERIES: &str = "vd_depth_series";

/// What to do when two sources map to the same index tuple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CollisionPolicy {
    /// Fail with `SchemaMismatchError::IndexCollision`.
    #[default]
    Reject,
    /// Keep the later source and drop the earlier mapping.
    LastWins,
}

/// A stitched virtual dataset.
#[derive(Debug, Clone, PartialEq)]
pub struct VirtualMapping {
    /// Path of the virtual dataset.
    pub path: String,
    /// Shape: source shape followed by the new axes.
    pub shape: Vec<usize>,
    /// Element type shared by all sources.
    pub dtype: DataType,
    /// `(source, index tuple)` pairs in source order, after collision handling.
    pub entries: Vec<(String, Vec<usize>)>,
}

impl VirtualMapping {
    /// Rank of the source datasets.
    #[must_use]
    pub fn source_rank(&self) -> usize {
        self.shape.len() - self.new_axes()
    }

    /// Number of added axes.
    #[must_use]
    pub fn new_axes(&self) -> usize {
        self.entries.first().map_or(0, |(_, idx)| idx.len())
    }
}

fn indexed_pattern(prefix: &str, digits: &str) -> StemResult<Regex> {
    Regex::new(&format!("^{}({digits})$", regex::escape(prefix)))
        .map_err(|e| StemError::internal(format!("group pattern: {e}")))
}

/// A validated stitch, ready to be written.
struct StitchPlan {
    shape: Vec<usize>,
    dtype: DataType,
    entries: Vec<(String, Vec<usize>)>,
    mapped: Vec<VirtualSource>,
}

fn contiguous_from(mut found: Vec<usize>, start: usize) -> usize {
    found.sort_unstable();
    found.dedup();
    found
        .iter()
        .enumerate()
        .take_while(|&(i, &n)| n == start + i)
        .count()
}

impl StructuredStore {
    /// Number of contiguous `basenameNNNN` groups under `parent`, counting
    /// from `0000`.
    ///
    /// # Errors
    /// Returns a container error if `parent` is not a group.
    pub fn count_groups(&self, parent: &str, basename: &str) -> StemResult<usize> {
        let re = indexed_pattern(basename, r"\d{4}")?;
        let found = self
            .container
            .children(parent)?
            .iter()
            .filter_map(|name| re.captures(name)?.get(1)?.as_str().parse().ok())
            .collect();
        Ok(contiguous_from(found, 0))
    }

    /// Number of contiguous `prefixN` scale datasets in `group`, counting
    /// from 1.
    ///
    /// # Errors
    /// Returns a container error if `group` is not a group.
    pub fn count_dimensions(&self, group: &str, prefix: &str) -> StemResult<usize> {
        let re = indexed_pattern(prefix, r"\d+")?;
        let found = self
            .container
            .children(group)?
            .iter()
            .filter_map(|name| re.captures(name)?.get(1)?.as_str().parse().ok())
            .collect();
        Ok(contiguous_from(found, 1))
    }

    /// Builds a virtual dataset at `target` from `sources`.
    ///
    /// `indices[k]` is the position of `sources[k]` along the new axes. Each
    /// new axis has extent one plus the largest index seen on it.
    ///
    /// # Errors
    /// Returns a `SchemaMismatchError` if the sources differ in shape or
    /// element type, if the index tuples are inconsistent, or if two sources
    /// collide under `CollisionPolicy::Reject`.
    pub fn stitch(
        &self,
        target: &str,
        sources: &[String],
        indices: &[Vec<usize>],
        policy: CollisionPolicy,
    ) -> StemResult<VirtualMapping> {
        let plan = self.plan_stitch(sources, indices, policy)?;
        self.write_stitched(target, plan)
    }

    /// Validates sources and indices without writing anything.
    fn plan_stitch(
        &self,
        sources: &[String],
        indices: &[Vec<usize>],
        policy: CollisionPolicy,
    ) -> StemResult<StitchPlan> {
        let Some(first) = sources.first() else {
            return Err(SchemaMismatchError::NoSources.into());
        };
        if sources.len() != indices.len() {
            return Err(SchemaMismatchError::IndexCountMismatch {
                sources: sources.len(),
                indices: indices.len(),
            }
            .into());
        }

        let arity = indices[0].len().max(1);
        for (path, idx) in sources.iter().zip(indices) {
            if idx.len() != arity {
                return Err(SchemaMismatchError::IndexArity {
                    path: path.clone(),
                    expected: arity,
                    actual: idx.len(),
                }
                .into());
            }
        }

        let exemplar = self.container.info(first)?;
        let dtype = exemplar.dtype.ok_or_else(|| StoreError::WrongNodeKind {
            path: first.clone(),
            expected: "dataset",
        })?;
        for path in &sources[1..] {
            let info = self.container.info(path)?;
            if info.shape != exemplar.shape {
                return Err(SchemaMismatchError::ShapeMismatch {
                    path: path.clone(),
                    expected: exemplar.shape.clone(),
                    actual: info.shape,
                }
                .into());
            }
            if info.dtype != Some(dtype) {
                return Err(SchemaMismatchError::TypeMismatch {
                    path: path.clone(),
                    expected: dtype.to_string(),
                    actual: info.dtype.map_or_else(|| "group".to_string(), |d| d.to_string()),
                }
                .into());
            }
        }

        let mut entries: Vec<Option<(String, Vec<usize>)>> = Vec::with_capacity(sources.len());
        let mut seen: HashMap<&[usize], usize> = HashMap::new();
        for (k, (path, idx)) in sources.iter().zip(indices).enumerate() {
            if let Some(&prior) = seen.get(idx.as_slice()) {
                let first_path = entries[prior]
                    .as_ref()
                    .map_or_else(String::new, |(p, _)| p.clone());
                match policy {
                    CollisionPolicy::Reject => {
                        return Err(SchemaMismatchError::IndexCollision {
                            index: idx.clone(),
                            first: first_path,
                            second: path.clone(),
                        }
                        .into());
                    }
                    CollisionPolicy::LastWins => {
                        warn!(index = ?idx, dropped = %first_path, kept = %path, "stitch index collision");
                        entries[prior] = None;
                    }
                }
            }
            seen.insert(idx.as_slice(), k);
            entries.push(Some((path.clone(), idx.clone())));
        }
        let entries: Vec<(String, Vec<usize>)> = entries.into_iter().flatten().collect();

        let mut new_extents = vec![0usize; arity];
        for (_, idx) in &entries {
            for (extent, &i) in new_extents.iter_mut().zip(idx) {
                *extent = (*extent).max(i + 1);
            }
        }

        let source_rank = exemplar.shape.len();
        let mut shape = exemplar.shape.clone();
        shape.extend_from_slice(&new_extents);

        let mapped = entries
            .iter()
            .map(|(path, idx)| {
                let mut offset = vec![0; source_rank];
                offset.extend_from_slice(idx);
                let mut extent = exemplar.shape.clone();
                extent.extend(std::iter::repeat(1).take(arity));
                VirtualSource {
                    source: path.clone(),
                    region: Hyperslab::new(offset, extent),
                }
            })
            .collect();

        Ok(StitchPlan {
            shape,
            dtype,
            entries,
            mapped,
        })
    }

    fn write_stitched(&self, target: &str, plan: StitchPlan) -> StemResult<VirtualMapping> {
        let StitchPlan {
            shape,
            dtype,
            entries,
            mapped,
        } = plan;
        {
            let _guard = self.lock_writes("store.stitch")?;
            self.container.create_virtual(target, &shape, dtype, mapped)?;
            self.container.flush()?;
        }
        debug!(target, ?shape, sources = entries.len(), "stitched virtual dataset");

        Ok(VirtualMapping {
            path: target.to_string(),
            shape,
            dtype,
            entries,
        })
    }

    /// Tags `group` as a supergroup, copies the `dimN` scales of
    /// `exemplar_group` and appends one `sgdimN` scale per new axis.
    ///
    /// # Errors
    /// Returns a container error if a scale cannot be copied.
    pub fn configure_supergroup(
        &self,
        group: &str,
        exemplar_group: &str,
        new_axes: &[AxisDescriptor],
    ) -> StemResult<()> {
        let dims = self.count_dimensions(exemplar_group, "dim")?;

        let _guard = self.lock_writes("store.configure_supergroup")?;
        let c = &self.container;
        c.set_attr(group, "emd_group_type", AttrValue::Int(GROUP_TYPE_SUPERGROUP))?;
        c.set_attr(group, "metadata", AttrValue::Int(0))?;

        for n in 1..=dims {
            let src = format!("{exemplar_group}/dim{n}");
            let dst = format!("{group}/dim{n}");
            let info = c.info(&src)?;
            let dtype = info.dtype.ok_or_else(|| StoreError::WrongNodeKind {
                path: src.clone(),
                expected: "dataset",
            })?;
            c.create_dataset(&dst, &info.shape, dtype)?;
            c.write_all(&dst, c.read_all(&src)?)?;
            for (name, value) in c.attrs(&src)? {
                c.set_attr(&dst, &name, value)?;
            }
        }

        for (n, axis) in new_axes.iter().enumerate() {
            write_axis_scale(&**c, &format!("{group}/sgdim{}", n + 1), axis)?;
        }
        c.flush()?;
        Ok(())
    }

    /// Stitches every `virtual_detector_depthNNNN` realslice into
    /// `supergroups/vd_depth_series/supergroup` with a trailing `Depth` axis.
    ///
    /// Returns `None` when there are no detector cubes.
    ///
    /// # Errors
    /// Returns a stitching or container error.
    pub fn depth_series(&self) -> StemResult<Option<VirtualMapping>> {
        let kind = DatasetKind::DetectorCube;
        let count = self.count_groups(REALSLICES, kind.base_name())?;
        if count == 0 {
            return Ok(None);
        }

        let mut sources = Vec::with_capacity(count);
        let mut indices = Vec::with_capacity(count);
        let mut depths = Vec::with_capacity(count);
        for n in 0..count {
            let group = kind.group_path(n);
            let depth = self
                .container
                .attr(&group, "output_depth")?
                .and_then(|v| v.as_float())
                .ok_or_else(|| StoreError::NotFound(format!("{group}@output_depth")))?;
            #[allow(clippy::cast_possible_truncation)]
            depths.push(depth as f32);
            sources.push(format!("{group}/{}", kind.dataset_name()));
            indices.push(vec![n]);
        }

        // A failed plan must not leave an empty supergroup.
        let plan = self.plan_stitch(&sources, &indices, CollisionPolicy::Reject)?;
        let group = format!("{SUPERGROUPS}/{DEPTH_SERIES}");
        {
            let _guard = self.lock_writes("store.depth_series")?;
            self.container.create_group(&group)?;
        }
        let mapping = self.write_stitched(&format!("{group}/supergroup"), plan)?;
        self.configure_supergroup(
            &group,
            &kind.group_path(0),
            &[AxisDescriptor::values("Depth", "[Å]", depths)],
        )?;
        info!(slices = count, "built depth series");
        Ok(Some(mapping))
    }
}

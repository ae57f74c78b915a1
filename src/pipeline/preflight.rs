//! Output-path pre-flight.
//!
//! Runs before any lock is taken. A declined overwrite leaves the existing
//! target untouched.

use std::fs::{self, OpenOptions};
use std::io::ErrorKind;
use std::path::Path;

use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::OutputPathError;

/// State of the output path before a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathStatus {
    /// Nothing exists at the path and its directory is writable.
    Absent,
    /// A file already exists at the path.
    Exists,
}

/// Asks whether an existing output may be replaced.
pub trait OverwriteConfirm: Send + Sync {
    /// Returns true to delete `path` and proceed.
    fn confirm_overwrite(&self, path: &Path) -> bool;
}

impl<F> OverwriteConfirm for F
where
    F: Fn(&Path) -> bool + Send + Sync,
{
    fn confirm_overwrite(&self, path: &Path) -> bool {
        self(path)
    }
}

/// Always replaces existing output.
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysOverwrite;

impl OverwriteConfirm for AlwaysOverwrite {
    fn confirm_overwrite(&self, _path: &Path) -> bool {
        true
    }
}

/// Never replaces existing output.
#[derive(Debug, Default, Clone, Copy)]
pub struct NeverOverwrite;

impl OverwriteConfirm for NeverOverwrite {
    fn confirm_overwrite(&self, _path: &Path) -> bool {
        false
    }
}

/// Classifies the output path.
///
/// # Errors
/// Returns `OutputPathError::Inaccessible` if the path cannot be inspected,
/// and `OutputPathError::NotWritable` if it names a directory or its parent
/// directory is missing or read-only.
pub fn check_output_path(path: &Path) -> Result<PathStatus, OutputPathError> {
    match fs::metadata(path) {
        Ok(meta) if meta.is_dir() => Err(OutputPathError::NotWritable {
            path: path.to_path_buf(),
            reason: "path is a directory".to_string(),
        }),
        Ok(_) => Ok(PathStatus::Exists),
        Err(e) if e.kind() == ErrorKind::NotFound => {
            let parent = match path.parent() {
                Some(p) if !p.as_os_str().is_empty() => p,
                _ => Path::new("."),
            };
            let dir = fs::metadata(parent).map_err(|e| OutputPathError::NotWritable {
                path: path.to_path_buf(),
                reason: format!("parent directory unavailable: {e}"),
            })?;
            if !dir.is_dir() {
                return Err(OutputPathError::NotWritable {
                    path: path.to_path_buf(),
                    reason: "parent is not a directory".to_string(),
                });
            }
            try_create_in(parent).map_err(|e| OutputPathError::NotWritable {
                path: path.to_path_buf(),
                reason: format!("parent directory rejects new files: {e}"),
            })?;
            Ok(PathStatus::Absent)
        }
        Err(e) => Err(OutputPathError::Inaccessible {
            path: path.to_path_buf(),
            reason: e.to_string(),
        }),
    }
}

/// Creates and removes a scratch file in `dir`, so ownership and ACLs are
/// honoured as well as permission bits.
fn try_create_in(dir: &Path) -> std::io::Result<()> {
    let scratch = dir.join(format!(".stemflow-write-check-{}", Uuid::new_v4()));
    OpenOptions::new().write(true).create_new(true).open(&scratch)?;
    fs::remove_file(&scratch)
}

/// Makes `path` ready to receive a new output.
///
/// An existing file is deleted only if `confirm` accepts.
///
/// # Errors
/// Returns `OutputPathError::ExistsNeedsConfirmation` on a declined
/// overwrite, `OutputPathError::NotWritable` if the existing file cannot be
/// removed, and any error from [`check_output_path`].
pub fn prepare_output(path: &Path, confirm: &dyn OverwriteConfirm) -> Result<(), OutputPathError> {
    match check_output_path(path)? {
        PathStatus::Absent => {
            debug!(path = %path.display(), "output path is free");
            Ok(())
        }
        PathStatus::Exists => {
            if !confirm.confirm_overwrite(path) {
                return Err(OutputPathError::ExistsNeedsConfirmation {
                    path: path.to_path_buf(),
                });
            }
            warn!(path = %path.display(), "deleting existing output");
            fs::remove_file(path).map_err(|e| OutputPathError::NotWritable {
                path: path.to_path_buf(),
                reason: format!("failed to delete existing output: {e}"),
            })
        }
    }
}

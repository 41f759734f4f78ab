//! Base directory resolution for client-supplied paths.
//!
//! # Design
//! - Every client path is interpreted relative to one serving root.
//! - Resolution is lexical: `..` is rejected outright rather than normalised away, empty and
//!   `.` segments are skipped and both separators are accepted.
//! - Symlinks inside the root are not resolved; anything reachable through them is served.

use std::ffi::OsStr;
use std::path::{Component, Path, PathBuf};

use crate::error::{FsOpsError, FsOpsResult};

/// Suffix carried by in-progress upload files.
pub const PARTIAL_SUFFIX: &str = ".partial";

/// Serving root that every client path resolves against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BaseDir {
    root: PathBuf,
}

impl BaseDir {
    /// Wrap an explicit root directory.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Use the process working directory as the root.
    ///
    /// # Errors
    ///
    /// Returns an IO error when the working directory cannot be read.
    pub fn current() -> FsOpsResult<Self> {
        std::env::current_dir()
            .map(Self::new)
            .map_err(|source| FsOpsError::io("base_dir.current", ".", source))
    }

    /// Root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a client path to an absolute path under the root.
    ///
    /// # Errors
    ///
    /// Returns [`FsOpsError::PathTraversal`] when the path contains `..` or a platform prefix.
    pub fn resolve(&self, requested: &str) -> FsOpsResult<PathBuf> {
        Ok(self.root.join(relative_path(requested)?))
    }

    /// Client-facing form of a path under the root, `/`-separated without a leading slash.
    #[must_use]
    pub fn display_relative(&self, path: &Path) -> String {
        path.strip_prefix(&self.root)
            .unwrap_or(path)
            .components()
            .filter_map(|component| match component {
                Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("/")
    }
}

/// Lexically convert a client path into a relative path.
///
/// # Errors
///
/// Returns [`FsOpsError::PathTraversal`] for `..` segments or segments the platform parses as
/// roots or prefixes, and [`FsOpsError::InvalidInput`] for NUL bytes.
pub fn relative_path(requested: &str) -> FsOpsResult<PathBuf> {
    if requested.contains('\0') {
        return Err(FsOpsError::invalid("path", "nul_byte", requested));
    }
    let mut relative = PathBuf::new();
    for segment in requested.split(['/', '\\']) {
        match segment {
            "" | "." => {}
            ".." => return Err(FsOpsError::traversal(requested)),
            part => {
                let mut components = Path::new(part).components();
                match (components.next(), components.next()) {
                    (Some(Component::Normal(normal)), None) => relative.push(normal),
                    _ => return Err(FsOpsError::traversal(requested)),
                }
            }
        }
    }
    Ok(relative)
}

/// Temporary path used while `destination` is being uploaded: `.<name>.partial` beside it.
///
/// # Errors
///
/// Returns [`FsOpsError::InvalidInput`] when the destination has no file name.
pub fn partial_path_for(destination: &Path) -> FsOpsResult<PathBuf> {
    let name = destination.file_name().ok_or_else(|| {
        FsOpsError::invalid("file_name", "empty", destination.display().to_string())
    })?;
    let mut partial = std::ffi::OsString::from(".");
    partial.push(name);
    partial.push(PARTIAL_SUFFIX);
    Ok(destination.with_file_name(partial))
}

/// Whether a directory entry name is an upload temp file.
#[must_use]
pub fn is_partial_name(name: &OsStr) -> bool {
    name.to_str()
        .is_some_and(|name| name.starts_with('.') && name.ends_with(PARTIAL_SUFFIX))
}

/// Whether a directory entry should be hidden from listings.
#[must_use]
pub fn is_hidden_name(name: &str) -> bool {
    name.starts_with('.') || name.ends_with(PARTIAL_SUFFIX)
}

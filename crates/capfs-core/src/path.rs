//! Name validation and request path handling
//!
//! Capabilities are narrowed one name at a time, so the only thing a caller
//! can ever hand to a backend is a single path component. Everything that
//! could step outside the current directory is rejected here.

use std::path::{Component, Path};

use crate::error::{FsError, FsResult};

/// Check whether `name` is a legal single path component.
pub fn is_valid_filename(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains(['/', '\0'])
}

/// Validate a filename (single path component)
pub fn validate_filename(name: &str) -> FsResult<()> {
    if is_valid_filename(name) {
        Ok(())
    } else {
        Err(FsError::IllegalFileName)
    }
}

/// Split a slash-delimited request path into walkable components.
///
/// Empty components (the leading one of an absolute path, doubled or
/// trailing slashes) are stripped. `.` and `..` are kept so that the walk
/// rejects them.
pub fn split_path(path: &str) -> Vec<&str> {
    path.split('/').filter(|c| !c.is_empty()).collect()
}

/// Check that `path` lies inside `base` without following symlinks.
///
/// Rejects any `..` component outright rather than trying to normalize it.
pub fn is_confined(base: &Path, path: &Path) -> bool {
    if path
        .components()
        .any(|c| matches!(c, Component::ParentDir | Component::Prefix(_)))
    {
        return false;
    }
    path.starts_with(base)
}

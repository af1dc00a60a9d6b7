//! Lexical path confinement.

use std::ffi::OsStr;
use std::path::{Component, Path, PathBuf};

/// Join `relative` onto `root`, refusing anything that would leave `root`.
///
/// `.` components are dropped and `..` pops the previous component.
/// Absolute paths, paths that climb above `root`, and paths that
/// normalize to `root` itself yield `None`. Symlinks are not resolved
/// here; callers that read through the result must still canonicalize.
pub fn confine(root: &Path, relative: &Path) -> Option<PathBuf> {
    let mut parts: Vec<&OsStr> = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => parts.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                parts.pop()?;
            }
            Component::RootDir | Component::Prefix(_) => return None,
        }
    }

    if parts.is_empty() {
        return None;
    }
    Some(parts.iter().fold(root.to_path_buf(), |acc, part| acc.join(part)))
}

//! Source store archive carried by `POST /populate`.
//!
//! The manager packs a local directory into an uncompressed tar stream;
//! the builder unpacks it into `<build-dir>/store`. Only directories and
//! regular files travel. Anything else is skipped when packing and
//! rejected when unpacking.

use std::fs::{self, DirBuilder, File};
use std::io::{self, Cursor};
use std::os::unix::fs::DirBuilderExt;
use std::path::{Component, Path};

use tracing::{debug, warn};

use crate::errors::StoreError;
use crate::paths::confine;

/// Pack the tree under `root` into a tar archive, root-relative names.
pub fn pack(root: &Path) -> io::Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    builder.follow_symlinks(false);
    append_tree(&mut builder, root, Path::new(""))?;
    builder.into_inner()
}

fn append_tree(builder: &mut tar::Builder<Vec<u8>>, dir: &Path, prefix: &Path) -> io::Result<()> {
    let mut entries: Vec<_> = fs::read_dir(dir)?.collect::<Result<_, _>>()?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let path = entry.path();
        let name = prefix.join(entry.file_name());
        let file_type = fs::symlink_metadata(&path)?.file_type();
        if file_type.is_dir() {
            builder.append_dir(&name, &path)?;
            append_tree(builder, &path, &name)?;
        } else if file_type.is_file() {
            builder.append_path_with_name(&path, &name)?;
        } else {
            debug!(path = %path.display(), "skipping non-regular store entry");
        }
    }
    Ok(())
}

/// Unpack `archive` into `dest`, which must not exist yet.
///
/// Every entry is confined to `dest`. On any failure the partially
/// written tree is removed. Returns the number of entries written.
pub fn unpack(archive: &[u8], dest: &Path) -> Result<usize, StoreError> {
    DirBuilder::new()
        .mode(0o755)
        .create(dest)
        .map_err(|source| StoreError::Io {
            path: dest.to_path_buf(),
            source,
        })?;

    let result = unpack_entries(archive, dest);
    if result.is_err() {
        if let Err(e) = fs::remove_dir_all(dest) {
            warn!(path = %dest.display(), error = %e, "failed to remove partial store");
        }
    }
    result
}

fn unpack_entries(archive: &[u8], dest: &Path) -> Result<usize, StoreError> {
    let mut archive = tar::Archive::new(Cursor::new(archive));
    let mut written = 0;

    for entry in archive.entries().map_err(StoreError::Malformed)? {
        let mut entry = entry.map_err(StoreError::Malformed)?;
        let name = entry.path().map_err(StoreError::Malformed)?.into_owned();
        let display = name.display().to_string();
        let kind = entry.header().entry_type();

        if is_root(&name) && kind.is_dir() {
            continue;
        }
        let target = confine(dest, &name).ok_or_else(|| StoreError::Escape(display.clone()))?;
        let io_err = |source| StoreError::Io {
            path: target.clone(),
            source,
        };

        if kind.is_dir() {
            DirBuilder::new()
                .recursive(true)
                .mode(0o755)
                .create(&target)
                .map_err(io_err)?;
        } else if kind.is_file() {
            if let Some(parent) = target.parent() {
                DirBuilder::new()
                    .recursive(true)
                    .mode(0o755)
                    .create(parent)
                    .map_err(io_err)?;
            }
            let mut file = File::create(&target).map_err(io_err)?;
            io::copy(&mut entry, &mut file).map_err(|source| {
                if source.kind() == io::ErrorKind::UnexpectedEof {
                    StoreError::Malformed(source)
                } else {
                    io_err(source)
                }
            })?;
        } else {
            return Err(StoreError::Unsupported {
                path: display,
                kind: format!("{:?}", kind),
            });
        }
        written += 1;
    }

    debug!(entries = written, dest = %dest.display(), "store unpacked");
    Ok(written)
}

fn is_root(name: &Path) -> bool {
    name.components().all(|c| matches!(c, Component::CurDir))
}

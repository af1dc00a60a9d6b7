//! Writes exported artifacts under the output directory.
//!
//! Files are created exclusively with mode 0400 and removed again unless
//! the whole body arrived, so an interrupted export never leaves a
//! truncated artifact behind.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use reqwest::Response;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use crate::errors::ManagerError;

/// Removes the file on drop unless committed.
struct PartialFile {
    path: PathBuf,
    committed: bool,
}

impl PartialFile {
    fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            committed: false,
        }
    }

    fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for PartialFile {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "failed to remove partial export");
            }
        }
    }
}

fn io_error(path: &Path) -> impl Fn(std::io::Error) -> ManagerError + '_ {
    move |source| ManagerError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Stream `response` into a new file at `dest`. Returns the bytes written.
pub async fn write_artifact(mut response: Response, dest: &Path) -> Result<u64, ManagerError> {
    if let Some(parent) = dest.parent() {
        tokio::fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(parent)
            .await
            .map_err(io_error(parent))?;
    }

    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o400)
        .open(dest)
        .await
        .map_err(|source| {
            if source.kind() == ErrorKind::AlreadyExists {
                ManagerError::Exists {
                    path: dest.to_path_buf(),
                }
            } else {
                io_error(dest)(source)
            }
        })?;
    let partial = PartialFile::new(dest);

    let expected = response.content_length();
    let mut written = 0u64;
    while let Some(chunk) = response.chunk().await.map_err(ManagerError::Transport)? {
        file.write_all(&chunk).await.map_err(io_error(dest))?;
        written += chunk.len() as u64;
    }
    if let Some(expected) = expected {
        if expected != written {
            return Err(io_error(dest)(std::io::Error::new(
                ErrorKind::UnexpectedEof,
                format!("received {} of {} bytes", written, expected),
            )));
        }
    }
    file.sync_all().await.map_err(io_error(dest))?;

    partial.commit();
    info!(path = %dest.display(), bytes = written, "export written");
    Ok(written)
}

//! Scratch Space: one isolated, uniquely named working directory per operation.
//!
//! Directory names are `<prefix><owner-uuid>`; the owner id is a fresh v4 UUID
//! (122 bits from the OS RNG), and creation fails rather than reuses an existing
//! path, so concurrent allocations never observe the same directory.
//!
//! `ScratchDirectory::release` is the normal exit. If a directory is dropped
//! without being released (early return, panic, cancelled future) the `Drop`
//! impl removes it synchronously. Removal errors are logged, never returned.

use std::path::{Path, PathBuf};

use tempfile::TempDir;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::outcome::{Classified, ErrorKind};

#[derive(Debug, Error)]
pub enum ScratchError {
    #[error("failed to allocate scratch directory under {root}: {source}")]
    Allocation {
        root: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid scratch file name '{0}'")]
    InvalidFileName(String),

    #[error("failed to write scratch file {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl Classified for ScratchError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::ScratchAllocationFailed
    }

    fn public_message(&self) -> String {
        match self {
            ScratchError::Allocation { .. } => "Could not allocate a working directory".to_string(),
            ScratchError::InvalidFileName(name) => format!("Invalid working file name '{name}'"),
            ScratchError::Write { .. } => "Could not write to the working directory".to_string(),
        }
    }
}

/// Allocator for scratch directories under a fixed root.
#[derive(Debug, Clone)]
pub struct ScratchSpace {
    root: PathBuf,
    prefix: String,
}

impl ScratchSpace {
    pub fn new(root: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            prefix: prefix.into(),
        }
    }

    /// Creates a fresh directory owned by `owner`.
    pub async fn allocate(&self, owner: Uuid) -> Result<ScratchDirectory, ScratchError> {
        let root = self.root.clone();
        let name = format!("{}{}", self.prefix, owner.simple());

        let created = tokio::task::spawn_blocking({
            let root = root.clone();
            move || {
                tempfile::Builder::new()
                    .prefix(&name)
                    .rand_bytes(0)
                    .tempdir_in(&root)
            }
        })
        .await
        .map_err(|e| ScratchError::Allocation {
            root: root.clone(),
            source: std::io::Error::new(std::io::ErrorKind::Other, e),
        })?;

        let dir = created.map_err(|source| ScratchError::Allocation { root, source })?;
        debug!("Allocated scratch directory {}", dir.path().display());

        Ok(ScratchDirectory {
            owner,
            path: dir.path().to_path_buf(),
            files: Vec::new(),
            inner: Some(dir),
        })
    }
}

/// An allocated scratch directory. Exactly one in-flight operation owns it.
#[derive(Debug)]
pub struct ScratchDirectory {
    owner: Uuid,
    path: PathBuf,
    files: Vec<PathBuf>,
    inner: Option<TempDir>,
}

impl ScratchDirectory {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes `contents` to a file directly inside the directory.
    /// `name` must be a bare file name: no separators, no `..`.
    pub async fn write_file(&mut self, name: &str, contents: &[u8]) -> Result<PathBuf, ScratchError> {
        if !is_bare_file_name(name) {
            return Err(ScratchError::InvalidFileName(name.to_string()));
        }

        let path = self.path.join(name);
        tokio::fs::write(&path, contents)
            .await
            .map_err(|source| ScratchError::Write {
                path: path.clone(),
                source,
            })?;
        self.files.push(path.clone());
        Ok(path)
    }

    /// Deletes the directory and everything in it. Never fails; errors are logged.
    pub async fn release(mut self) {
        let Some(dir) = self.inner.take() else {
            return;
        };
        let path = self.path.clone();

        match tokio::task::spawn_blocking(move || dir.close()).await {
            Ok(Ok(())) => debug!(
                "Released scratch directory {} of {} ({} files written)",
                path.display(),
                self.owner,
                self.files.len()
            ),
            Ok(Err(e)) => warn!("Failed to remove scratch directory {}: {e}", path.display()),
            Err(e) => warn!("Scratch cleanup task for {} failed: {e}", path.display()),
        }
    }
}

impl Drop for ScratchDirectory {
    fn drop(&mut self) {
        if let Some(dir) = self.inner.take() {
            warn!(
                "Scratch directory {} dropped without release; removing",
                self.path.display()
            );
            if let Err(e) = dir.close() {
                warn!("Failed to remove scratch directory {}: {e}", self.path.display());
            }
        }
    }
}

fn is_bare_file_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\', '\0'])
}

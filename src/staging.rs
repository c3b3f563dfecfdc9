//! Upload staging: write request bytes to a scoped temporary file.
//!
//! The external converter needs a file-system path, so every accepted upload
//! is written to a uniquely named file in the staging directory. The file is
//! owned by a [`StagedUpload`] guard and removed when the guard is closed or
//! dropped, whichever comes first, on success, error, timeout and unwinding
//! alike. Removal failures are logged, never returned to the caller.

use std::io;
use std::path::{Path, PathBuf};
use tempfile::{NamedTempFile, TempPath};
use tracing::{debug, warn};

/// A request's staged upload. Deleted on drop.
#[derive(Debug)]
pub struct StagedUpload {
    path: PathBuf,
    guard: Option<TempPath>,
}

impl StagedUpload {
    /// Create a fresh file in `dir` ending in `suffix` and write `bytes` to it.
    ///
    /// If writing fails the half-written file is removed before returning.
    pub async fn write(dir: &Path, suffix: &str, bytes: &[u8]) -> io::Result<Self> {
        let dir = dir.to_path_buf();
        let suffix = suffix.to_string();
        // Creating the file is blocking I/O.
        let guard = tokio::task::spawn_blocking(move || {
            tempfile::Builder::new()
                .prefix("upload-")
                .suffix(&suffix)
                .tempfile_in(&dir)
                .map(NamedTempFile::into_temp_path)
        })
        .await
        .map_err(io::Error::other)??;
        let staged = Self {
            path: guard.to_path_buf(),
            guard: Some(guard),
        };

        tokio::fs::write(&staged.path, bytes).await?;
        debug!("Staged {} bytes at {}", bytes.len(), staged.path.display());
        Ok(staged)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove the file now, reporting any error.
    pub fn close(mut self) -> io::Result<()> {
        match self.guard.take() {
            Some(guard) => guard.close(),
            None => Ok(()),
        }
    }
}

impl Drop for StagedUpload {
    fn drop(&mut self) {
        if let Some(guard) = self.guard.take() {
            if let Err(e) = guard.close() {
                warn!("Failed to remove staged upload {}: {}", self.path.display(), e);
            }
        }
    }
}

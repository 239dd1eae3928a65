use crate::error::ToolError;
use crate::utils::RefLease;
use std::fs::File;
use std::path::{Path, PathBuf};

/// A claim on one cached version of a tool.
///
/// The executable at [`ToolLease::file_path`] stays in place until the lease is disposed
/// or dropped, even if a purge or an update runs meanwhile.
pub struct ToolLease {
    version: String,
    path: PathBuf,
    lease: RefLease<File>,
}

impl ToolLease {
    pub(crate) fn new(version: String, path: PathBuf, lease: RefLease<File>) -> Self {
        debug_assert!(path.is_absolute());
        Self {
            version,
            path,
            lease,
        }
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn file_path(&self) -> Result<&Path, ToolError> {
        if self.lease.is_released() {
            return Err(ToolError::Closed("tool lease"));
        }
        Ok(&self.path)
    }

    /// Directory holding the executable; handy for `--ffmpeg-location`.
    pub fn directory(&self) -> Result<&Path, ToolError> {
        let path = self.file_path()?;
        Ok(path.parent().unwrap_or(path))
    }

    /// Releases the lease. Calling this more than once does nothing.
    pub fn dispose(&self) {
        if let Err(e) = self.lease.release() {
            tracing::warn!("Failed to release lease on {}: {}", self.path.display(), e);
        }
    }
}

impl std::fmt::Debug for ToolLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolLease")
            .field("version", &self.version)
            .field("path", &self.path)
            .field("released", &self.lease.is_released())
            .finish()
    }
}

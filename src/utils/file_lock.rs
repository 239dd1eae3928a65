use super::ref_count::{RefCounted, RefLease};
use crate::error::ToolError;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// A shared-read handle on a cached executable.
///
/// While the handle is open the file carries a shared advisory lock, so a purge running
/// in this or any other process leaves it alone. The handle closes once every reference
/// has been released.
pub struct FileLock {
    path: PathBuf,
    handle: Arc<RefCounted<File>>,
}

impl FileLock {
    /// Opens `path` if it exists.
    ///
    /// Returns `None` when the file or its directory is missing, or when a purge holds the
    /// exclusive lock on it and is about to delete it. The returned lock starts with one
    /// reference that belongs to the caller.
    pub fn create_if_exists(path: &Path) -> io::Result<Option<Arc<FileLock>>> {
        let file = match File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };

        if let Err(e) = fs2::FileExt::try_lock_shared(&file) {
            if e.kind() == fs2::lock_contended_error().kind() {
                debug!("{} is locked for deletion", path.display());
                return Ok(None);
            }
            return Err(e);
        }

        let path = std::path::absolute(path)?;

        Ok(Some(Arc::new(FileLock {
            path,
            handle: RefCounted::new("file lock", file),
        })))
    }

    pub fn file_path(&self) -> Result<&Path, ToolError> {
        if self.handle.is_closed() {
            return Err(ToolError::Closed("file lock"));
        }
        Ok(&self.path)
    }

    pub fn lease(&self) -> Result<RefLease<File>, ToolError> {
        self.handle.lease()
    }

    /// Releases the reference the lock was created with.
    pub fn release(&self) -> Result<(), ToolError> {
        self.handle.release()
    }

    #[cfg(test)]
    pub fn reference_count(&self) -> usize {
        self.handle.reference_count()
    }
}

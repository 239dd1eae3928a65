use super::source::ByteStream;
use crate::utils::{format_size, FileLock};
use anyhow::{Context, Result};
use futures::StreamExt;
use std::future::Future;
use std::io;
use std::path::Path;
use std::sync::Arc;
use tempfile::NamedTempFile;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

/// Returns a lock on `path`, downloading the file first if it isn't there yet.
///
/// The bytes are written in full to a temporary file next to the cache before being moved
/// into place without overwriting. When several resolvers (possibly in different processes)
/// race for the same path, exactly one rename wins and every racer ends up holding a lock
/// on the winner's file.
pub async fn get_or_download_file<F, Fut>(path: &Path, fetch: F) -> Result<Arc<FileLock>>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<ByteStream>>,
{
    if let Some(lock) = FileLock::create_if_exists(path)? {
        debug!("{} is already downloaded", path.display());
        return Ok(lock);
    }

    let version_dir = path
        .parent()
        .with_context(|| format!("{} has no parent directory", path.display()))?;
    let staging_dir = version_dir.parent().unwrap_or(version_dir);

    let mut stream = fetch().await?;

    tokio::fs::create_dir_all(staging_dir)
        .await
        .with_context(|| format!("Failed to create {}", staging_dir.display()))?;
    let temp = NamedTempFile::new_in(staging_dir)
        .with_context(|| format!("Failed to create temporary file in {}", staging_dir.display()))?;

    let mut file = tokio::fs::File::from_std(temp.reopen()?);
    let mut written: u64 = 0;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        file.write_all(&chunk)
            .await
            .context("Failed to write download to temporary file")?;
        written += chunk.len() as u64;
    }
    file.flush().await.context("Failed to flush temporary file")?;
    file.sync_all().await.context("Failed to sync temporary file")?;
    drop(file);

    make_executable(temp.path())?;

    let mut temp = Some(temp);
    loop {
        let Some(pending) = temp.take() else {
            anyhow::bail!(
                "{} was removed before it could be opened",
                path.display()
            );
        };

        tokio::fs::create_dir_all(version_dir)
            .await
            .with_context(|| format!("Failed to create {}", version_dir.display()))?;

        match pending.persist_noclobber(path) {
            Ok(_) => info!("Installed {} ({})", path.display(), format_size(written)),
            Err(e) if e.error.kind() == io::ErrorKind::AlreadyExists => {
                debug!("{} was installed concurrently", path.display());
                temp = Some(e.file);
            }
            Err(e) => {
                return Err(e.error)
                    .with_context(|| format!("Failed to move download to {}", path.display()));
            }
        }

        if let Some(lock) = FileLock::create_if_exists(path)? {
            return Ok(lock);
        }

        tokio::task::yield_now().await;
    }
}

#[cfg(unix)]
pub(crate) fn make_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let mut perms = std::fs::metadata(path)?.permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(path, perms)
        .with_context(|| format!("Failed to make {} executable", path.display()))
}

#[cfg(not(unix))]
pub(crate) fn make_executable(_path: &Path) -> Result<()> {
    Ok(())
}

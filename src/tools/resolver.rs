use super::install::get_or_download_file;
use super::lease::ToolLease;
use super::source::DownloadSource;
use super::version::{self, ToolVersion};
use crate::error::ToolError;
use crate::utils::{Deduplicator, FileLock};
use anyhow::{bail, Context, Result};
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A resolved version bound to its file lock.
///
/// Owns the reference the lock was created with and gives it back when dropped, i.e. once
/// the resolver has moved on to a newer version and nobody else holds this source.
struct LeaseSource {
    version: String,
    lock: Arc<FileLock>,
}

impl LeaseSource {
    fn new(version: String, lock: Arc<FileLock>) -> Self {
        Self { version, lock }
    }

    fn create_lease(&self) -> Result<ToolLease, ToolError> {
        let lease = self.lock.lease()?;
        let path = self.lock.file_path()?.to_path_buf();
        Ok(ToolLease::new(self.version.clone(), path, lease))
    }
}

impl Drop for LeaseSource {
    fn drop(&mut self) {
        if let Err(e) = self.lock.release() {
            warn!("Failed to release file lock for {}: {}", self.version, e);
        }
    }
}

/// Keeps a cached copy of one external tool up to date and hands out leases on it.
///
/// Versions live in `{cache_dir}/v{version}/{file_name}`. Concurrent update checks are
/// merged into a single call to the [`DownloadSource`].
pub struct ToolResolver {
    inner: Arc<Inner>,
}

struct Inner {
    name: String,
    cache_dir: PathBuf,
    file_name: String,
    source: Box<dyn DownloadSource>,
    current: Mutex<Option<Arc<LeaseSource>>>,
    resolves: Deduplicator<Arc<LeaseSource>>,
    disposed: AtomicBool,
}

impl ToolResolver {
    pub fn new(
        cache_dir: impl Into<PathBuf>,
        file_name: impl Into<String>,
        source: impl DownloadSource + 'static,
    ) -> Self {
        let cache_dir = cache_dir.into();
        let file_name = file_name.into();
        let name = source.name().to_string();

        let current = find_cached_tool(&cache_dir, &file_name).map(Arc::new);
        match &current {
            Some(cached) => info!("Using cached {} {}", name, cached.version),
            None => info!("No cached {} in {}", name, cache_dir.display()),
        }

        Self {
            inner: Arc::new(Inner {
                name,
                cache_dir,
                file_name,
                source: Box::new(source),
                current: Mutex::new(current),
                resolves: Deduplicator::new(),
                disposed: AtomicBool::new(false),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Version that new leases would currently get, if any.
    pub fn current_version(&self) -> Option<String> {
        self.inner.current().map(|source| source.version.clone())
    }

    /// Leases the current tool, downloading it first if nothing is cached yet.
    ///
    /// With a cached tool this never touches the network. Cancelling `cancel` only stops
    /// this caller from waiting; a download already in progress keeps going.
    pub async fn lease_tool(&self, cancel: &CancellationToken) -> Result<ToolLease, ToolError> {
        self.ensure_not_disposed()?;

        if let Some(current) = self.inner.current() {
            return current.create_lease();
        }

        self.join_resolve(cancel).await?.create_lease()
    }

    /// Checks upstream for a newer version and downloads it if there is one.
    pub async fn check_for_updates(&self, cancel: &CancellationToken) -> Result<(), ToolError> {
        self.ensure_not_disposed()?;
        self.join_resolve(cancel).await.map(|_| ())
    }

    /// Deletes every cached version except the newest one.
    ///
    /// Versions that are leased anywhere, in this process or another, are left in place.
    /// Failures are logged and otherwise ignored.
    pub fn purge_old_versions(&self) {
        let mut versions = version_directories(&self.inner.cache_dir);
        versions.sort_by(|a, b| a.0.cmp(&b.0));
        versions.pop();

        for (version, directory) in versions {
            debug!("Purging {} {}", self.inner.name, version);
            purge_directory(&directory, &self.inner.file_name);
        }
    }

    /// Gives up the resolver's own reference to the current version.
    ///
    /// Leases already handed out stay valid until they are dropped.
    pub fn dispose(&self) {
        self.inner.disposed.store(true, Ordering::Release);
        let previous = self.inner.replace_current(None);
        self.inner.resolves.clear();
        drop(previous);
    }

    fn ensure_not_disposed(&self) -> Result<(), ToolError> {
        if self.inner.disposed.load(Ordering::Acquire) {
            return Err(ToolError::Closed("tool resolver"));
        }
        Ok(())
    }

    async fn join_resolve(&self, cancel: &CancellationToken) -> Result<Arc<LeaseSource>, ToolError> {
        let inner = Arc::clone(&self.inner);
        let pending = self
            .inner
            .resolves
            .start_or_join(move || inner.resolve_latest());

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ToolError::Cancelled),
            result = pending => result.map_err(ToolError::Resolve),
        }
    }
}

impl Drop for ToolResolver {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl Inner {
    fn current(&self) -> Option<Arc<LeaseSource>> {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Swaps in `source` and returns the previous one for the caller to drop.
    fn replace_current(&self, source: Option<Arc<LeaseSource>>) -> Option<Arc<LeaseSource>> {
        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        if source.is_some() && self.disposed.load(Ordering::Acquire) {
            return source;
        }
        std::mem::replace(&mut *current, source)
    }

    async fn resolve_latest(self: Arc<Self>) -> Result<Arc<LeaseSource>> {
        let download = self
            .source
            .latest()
            .await
            .with_context(|| format!("Failed to look up the latest {}", self.name))?;

        if let Some(current) = self.current() {
            if version::same_version(&current.version, download.version()) {
                debug!("{} {} is up to date", self.name, current.version);
                return Ok(current);
            }
        }

        let new_version = download.version().to_string();
        if !version::is_safe_directory_component(&new_version) {
            bail!(
                "{} reported version {:?}, which cannot be used as a directory name",
                self.name,
                new_version
            );
        }

        let path = self
            .cache_dir
            .join(version::directory_name(&new_version))
            .join(&self.file_name);
        debug!("Fetching {} {} from {}", self.name, new_version, download.url());
        let lock = get_or_download_file(&path, move || download.open()).await?;

        let source = Arc::new(LeaseSource::new(new_version, lock));
        let previous = self.replace_current(Some(Arc::clone(&source)));
        match &previous {
            Some(previous) if Arc::ptr_eq(previous, &source) => {
                debug!("Resolver for {} was disposed during update", self.name);
            }
            Some(previous) => info!(
                "Updated {} from {} to {}",
                self.name, previous.version, source.version
            ),
            None => info!("Installed {} {}", self.name, source.version),
        }
        drop(previous);

        Ok(source)
    }
}

fn find_cached_tool(cache_dir: &Path, file_name: &str) -> Option<LeaseSource> {
    let mut versions = version_directories(cache_dir);
    versions.sort_by(|a, b| b.0.cmp(&a.0));

    for (version, directory) in versions {
        match FileLock::create_if_exists(&directory.join(file_name)) {
            Ok(Some(lock)) => return Some(LeaseSource::new(version.raw().to_string(), lock)),
            Ok(None) => debug!("Skipping incomplete cache entry {}", directory.display()),
            Err(e) => warn!("Skipping unreadable cache entry {}: {}", directory.display(), e),
        }
    }

    None
}

fn version_directories(cache_dir: &Path) -> Vec<(ToolVersion, PathBuf)> {
    let entries = match std::fs::read_dir(cache_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Vec::new(),
        Err(e) => {
            warn!("Failed to list {}: {}", cache_dir.display(), e);
            return Vec::new();
        }
    };

    entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|t| t.is_dir()).unwrap_or(false))
        .filter_map(|entry| {
            let path = entry.path();
            ToolVersion::from_directory(&path).map(|version| (version, path))
        })
        .collect()
}

fn purge_directory(directory: &Path, file_name: &str) {
    let executable = directory.join(file_name);

    // The executable goes first: while it is leased it carries a shared lock, and without
    // it the directory is just an empty shell.
    match File::open(&executable) {
        Ok(file) => {
            if let Err(e) = fs2::FileExt::try_lock_exclusive(&file) {
                debug!("{} is in use, keeping it: {}", executable.display(), e);
                return;
            }
            if let Err(e) = std::fs::remove_file(&executable) {
                debug!("Failed to delete {}: {}", executable.display(), e);
                return;
            }
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => {
            debug!("Failed to open {}: {}", executable.display(), e);
            return;
        }
    }

    if let Err(e) = std::fs::remove_dir_all(directory) {
        debug!("Failed to delete {}: {}", directory.display(), e);
    }
}

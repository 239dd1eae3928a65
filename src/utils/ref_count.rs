use crate::error::ToolError;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::warn;

/// Tracks how many references there are to a resource and drops it when none remain.
///
/// The count starts at `1`, representing the constructor's implicit reference. Whoever
/// created the handle owns that reference and must eventually call [`RefCounted::release`]
/// once for it. Every [`RefCounted::add_reference`] needs a matching release, which
/// [`RefLease`] takes care of.
///
/// Once the count reaches zero the resource is gone for good: adding or releasing a
/// reference afterwards fails with [`ToolError::Closed`] instead of resurrecting it.
pub struct RefCounted<R> {
    name: &'static str,
    count: AtomicUsize,
    resource: Mutex<Option<R>>,
}

impl<R> RefCounted<R> {
    pub fn new(name: &'static str, resource: R) -> Arc<Self> {
        Arc::new(Self {
            name,
            count: AtomicUsize::new(1),
            resource: Mutex::new(Some(resource)),
        })
    }

    pub fn add_reference(&self) -> Result<(), ToolError> {
        self.count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                if count == 0 {
                    None
                } else {
                    Some(count + 1)
                }
            })
            .map(|_| ())
            .map_err(|_| ToolError::Closed(self.name))
    }

    pub fn release(&self) -> Result<(), ToolError> {
        let previous = self
            .count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                count.checked_sub(1)
            })
            .map_err(|_| ToolError::Closed(self.name))?;

        if previous == 1 {
            let resource = self
                .resource
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            drop(resource);
        }

        Ok(())
    }

    /// Adds a reference and returns a token that releases it exactly once.
    pub fn lease(self: &Arc<Self>) -> Result<RefLease<R>, ToolError> {
        self.add_reference()?;
        Ok(RefLease {
            target: Arc::clone(self),
            released: AtomicBool::new(false),
        })
    }

    /// Whether all references have been released.
    ///
    /// A `false` answer can be stale by the time the caller acts on it; another thread
    /// may release the last reference in between. Never rely on it for correctness.
    pub fn is_closed(&self) -> bool {
        self.count.load(Ordering::Acquire) == 0
    }

    /// Snapshot of the current count.
    #[cfg(test)]
    pub fn reference_count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }
}

/// A claim on a [`RefCounted`] resource.
///
/// Releasing is idempotent and thread-safe. Dropping the lease releases it.
pub struct RefLease<R> {
    target: Arc<RefCounted<R>>,
    released: AtomicBool,
}

impl<R> RefLease<R> {
    pub fn release(&self) -> Result<(), ToolError> {
        if self.released.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.target.release()
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }
}

impl<R> Drop for RefLease<R> {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!("Unbalanced release of {}: {}", self.target.name, e);
        }
    }
}
